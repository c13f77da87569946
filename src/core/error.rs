use thiserror::Error;

/// SQLSTATE reported when a transaction could not be serialized against
/// concurrently committed transactions. Retrying the whole transaction is safe.
pub const SERIALIZATION_FAILURE: &str = "40001";

/// Access to the machine-readable PostgreSQL error code carried by an error.
///
/// Retry classification is driven by this code only, never by message text.
pub trait SqlState {
    fn sqlstate(&self) -> Option<&str>;
}

impl<T: SqlState + ?Sized> SqlState for &T {
    fn sqlstate(&self) -> Option<&str> {
        (**self).sqlstate()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Table '{0}' already exists")]
    TableExists(String),

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Column '{0}' not found in table '{1}'")]
    ColumnNotFound(String, String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Column '{0}' cannot be NULL")]
    NotNullViolation(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Could not serialize access due to concurrent update: {0}")]
    SerializationFailure(String),

    #[error("Current transaction is aborted, commands ignored until end of transaction block")]
    InFailedTransaction,

    #[error("No active transaction")]
    NoActiveTransaction,

    #[error("Savepoint '{0}' does not exist")]
    SavepointNotFound(String),

    #[error("Savepoint '{0}' was taken after the snapshot; a serialization failure cannot be retried from it")]
    StaleSavepoint(String),

    #[error("Connection pool timeout: no connections available")]
    PoolTimeout,

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Execution error: {0}")]
    ExecutionError(String),
}

impl DbError {
    /// PostgreSQL error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ParseError(_) => "42601",
            Self::TableExists(_) => "42P07",
            Self::TableNotFound(_) => "42P01",
            Self::ColumnNotFound(..) => "42703",
            Self::TypeMismatch(_) => "42804",
            Self::NotNullViolation(_) => "23502",
            Self::UnsupportedOperation(_) => "0A000",
            Self::SerializationFailure(_) => SERIALIZATION_FAILURE,
            Self::InFailedTransaction => "25P02",
            Self::NoActiveTransaction => "25000",
            Self::SavepointNotFound(_) => "3B001",
            Self::StaleSavepoint(_) => "3B001",
            Self::PoolTimeout => "08001",
            Self::ConnectionClosed => "08003",
            Self::ExecutionError(_) => "XX000",
        }
    }

    pub fn is_serialization_failure(&self) -> bool {
        self.code() == SERIALIZATION_FAILURE
    }
}

impl SqlState for DbError {
    fn sqlstate(&self) -> Option<&str> {
        Some(self.code())
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
