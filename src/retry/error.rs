use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Transaction-control step performed by the executor itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOp {
    Begin,
    Savepoint,
    ReleaseSavepoint,
    RollbackToSavepoint,
    Commit,
}

impl fmt::Display for TxOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Begin => "begin",
            Self::Savepoint => "savepoint",
            Self::ReleaseSavepoint => "release savepoint",
            Self::RollbackToSavepoint => "rollback to savepoint",
            Self::Commit => "commit",
        };
        write!(f, "{label}")
    }
}

/// Terminal failure of a retried transaction.
///
/// Whatever the variant, the transaction has been rolled back and nothing was
/// committed, except possibly for [`TxError::is_ambiguous`] cases.
#[derive(Debug, Error)]
pub enum TxError<E> {
    /// The work function failed with a non-retryable error. Passed through untouched.
    #[error(transparent)]
    Work(E),

    /// The retry budget ran out while the work kept conflicting.
    #[error("transaction retry limit exceeded after {attempts} attempts in {elapsed:?}: {last}")]
    RetryLimitExceeded {
        attempts: u32,
        elapsed: Duration,
        #[source]
        last: E,
    },

    #[error("transaction cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },

    /// A transaction-control step failed with a non-retryable error.
    #[error("{op} failed: {source}")]
    Infrastructure {
        op: TxOp,
        #[source]
        source: E,
    },
}

impl<E> TxError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn is_retry_limit_exceeded(&self) -> bool {
        matches!(self, Self::RetryLimitExceeded { .. })
    }

    /// True when the failure hit release or commit, so the server may have
    /// committed before the error was reported.
    pub fn is_ambiguous(&self) -> bool {
        matches!(
            self,
            Self::Infrastructure {
                op: TxOp::ReleaseSavepoint | TxOp::Commit,
                ..
            }
        )
    }

    /// The underlying database or work error, if any.
    pub fn inner(&self) -> Option<&E> {
        match self {
            Self::Work(err) => Some(err),
            Self::RetryLimitExceeded { last, .. } => Some(last),
            Self::Infrastructure { source, .. } => Some(source),
            Self::Cancelled { .. } => None,
        }
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Work(err) => Some(err),
            Self::RetryLimitExceeded { last, .. } => Some(last),
            Self::Infrastructure { source, .. } => Some(source),
            Self::Cancelled { .. } => None,
        }
    }
}
