// ============================================================================
// PostgreSQL adapter (feature = "postgres")
// ============================================================================

use crate::connection::config::{Backend, ConfigError, ConnectionConfig};
use crate::connection::{ConnectionSource, TransactionHandle};
use crate::core::{Row, SERIALIZATION_FAILURE, SqlState, Value};
use crate::result::QueryResult;
use async_trait::async_trait;
use bytes::BytesMut;
use log::{error, info, warn};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};
use tokio_postgres::{Client, NoTls};

#[derive(Error, Debug)]
pub enum PgError {
    #[error(transparent)]
    Driver(#[from] tokio_postgres::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Connection pool timeout: no connections available")]
    PoolTimeout,

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Unsupported column type '{0}'")]
    UnsupportedType(String),

    #[error("Savepoint '{0}' was taken after the snapshot; a serialization failure cannot be retried from it")]
    StaleSavepoint(String),
}

impl SqlState for PgError {
    fn sqlstate(&self) -> Option<&str> {
        match self {
            Self::Driver(err) => err.code().map(|code| code.code()),
            Self::PoolTimeout => Some("08001"),
            Self::PoolClosed => Some("08003"),
            Self::StaleSavepoint(_) => Some("3B001"),
            Self::Config(_) | Self::UnsupportedType(_) => None,
        }
    }
}

const BEGIN: &str = "BEGIN ISOLATION LEVEL SERIALIZABLE";

/// Opens SERIALIZABLE transactions on a PostgreSQL-compatible server,
/// one connection per transaction.
pub struct PgSource {
    config: tokio_postgres::Config,
    connect_timeout: std::time::Duration,
    slots: Arc<Semaphore>,
}

impl PgSource {
    pub fn new(config: &ConnectionConfig) -> Result<Self, PgError> {
        config.validate()?;
        if config.backend != Backend::Postgres {
            return Err(ConfigError::Invalid(format!(
                "{} is not a PostgreSQL URL",
                config.to_url()
            ))
            .into());
        }

        let mut pg = tokio_postgres::Config::new();
        pg.host(&config.host)
            .port(config.port)
            .dbname(&config.database)
            .user(&config.username)
            .connect_timeout(config.connect_timeout);
        if !config.password.is_empty() {
            pg.password(&config.password);
        }

        info!(
            "PostgreSQL source {} (max {} connections)",
            config.to_url(),
            config.max_connections
        );
        Ok(Self {
            config: pg,
            connect_timeout: config.connect_timeout,
            slots: Arc::new(Semaphore::new(config.max_connections)),
        })
    }

    pub fn from_url(url: &str) -> Result<Self, PgError> {
        Self::new(&ConnectionConfig::from_url(url)?)
    }
}

#[async_trait]
impl ConnectionSource for PgSource {
    type Transaction = PgTransaction;

    async fn begin(&self) -> Result<PgTransaction, PgError> {
        let acquire = self.slots.clone().acquire_owned();
        let permit = tokio::time::timeout(self.connect_timeout, acquire)
            .await
            .map_err(|_| PgError::PoolTimeout)?
            .map_err(|_| PgError::PoolClosed)?;

        let (client, connection) = self.config.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Postgres connection error: {}", e);
            }
        });

        client.batch_execute(BEGIN).await?;

        Ok(PgTransaction {
            client,
            open: true,
            boundary: Boundary::default(),
            _permit: permit,
        })
    }
}

/// Restart bookkeeping for one connection.
///
/// PostgreSQL fixes the snapshot at the first statement and
/// `ROLLBACK TO SAVEPOINT` keeps it, so a replay from a plain savepoint hits
/// the same serialization failure again. A savepoint taken before any
/// statement is instead treated as a restart point: rolling back to it ends
/// the server transaction and opens a fresh one on the same connection.
#[derive(Debug, Default)]
struct Boundary {
    statements: usize,
    restart: Option<String>,
    conflicted: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Rollback {
    /// `ROLLBACK`, `BEGIN` and the savepoint again, as one batch.
    Reopen(String),
    Savepoint(String),
}

impl Boundary {
    fn statement(&mut self) {
        self.statements += 1;
    }

    fn savepoint(&mut self, name: &str) {
        if self.statements == 0 && self.restart.is_none() {
            self.restart = Some(name.to_string());
        }
    }

    fn observe<T>(&mut self, result: Result<T, PgError>) -> Result<T, PgError> {
        if matches!(&result, Err(err) if err.sqlstate() == Some(SERIALIZATION_FAILURE)) {
            self.conflicted = true;
        }
        result
    }

    fn rollback_to(&mut self, name: &str) -> Result<Rollback, PgError> {
        let savepoint = quote_ident(name);
        if self.restart.as_deref() == Some(name) {
            self.statements = 0;
            self.conflicted = false;
            return Ok(Rollback::Reopen(format!(
                "ROLLBACK; {BEGIN}; SAVEPOINT {savepoint}"
            )));
        }
        if self.conflicted {
            return Err(PgError::StaleSavepoint(name.to_string()));
        }
        Ok(Rollback::Savepoint(format!("ROLLBACK TO SAVEPOINT {savepoint}")))
    }
}

/// An open SERIALIZABLE transaction. Dropping it closes the connection,
/// which makes the server roll back.
pub struct PgTransaction {
    client: Client,
    open: bool,
    boundary: Boundary,
    _permit: OwnedSemaphorePermit,
}

impl PgTransaction {
    async fn control(&mut self, sql: &str) -> Result<(), PgError> {
        let result = self.client.batch_execute(sql).await.map_err(PgError::from);
        self.boundary.observe(result)
    }

    async fn run_query(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult, PgError> {
        let statement = self.client.prepare(sql).await?;
        let columns = statement
            .columns()
            .iter()
            .map(|col| col.name().to_string())
            .collect();

        let rows = self.client.query(&statement, &bind(params)).await?;
        let rows = rows.iter().map(convert_row).collect::<Result<Vec<_>, _>>()?;

        Ok(QueryResult::new(columns, rows))
    }
}

fn bind(params: &[Value]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[async_trait]
impl TransactionHandle for PgTransaction {
    type Error = PgError;

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, PgError> {
        self.boundary.statement();
        let result = self.client.execute(sql, &bind(params)).await.map_err(PgError::from);
        self.boundary.observe(result)
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult, PgError> {
        self.boundary.statement();
        let result = self.run_query(sql, params).await;
        self.boundary.observe(result)
    }

    async fn savepoint(&mut self, name: &str) -> Result<(), PgError> {
        self.control(&format!("SAVEPOINT {}", quote_ident(name))).await?;
        self.boundary.savepoint(name);
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<(), PgError> {
        self.control(&format!("RELEASE SAVEPOINT {}", quote_ident(name)))
            .await
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), PgError> {
        match self.boundary.rollback_to(name)? {
            Rollback::Savepoint(sql) => self.control(&sql).await,
            Rollback::Reopen(sql) => {
                // a conflict at COMMIT already ended the server transaction
                self.open = true;
                self.control(&sql).await
            }
        }
    }

    async fn commit(&mut self) -> Result<(), PgError> {
        self.open = false;
        self.control("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<(), PgError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.control("ROLLBACK").await
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if self.open {
            warn!("PgTransaction dropped while open; closing its connection");
        }
    }
}

fn convert_row(row: &tokio_postgres::Row) -> Result<Row, PgError> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| column_value(row, idx, col.type_()))
        .collect()
}

fn column_value(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> Result<Value, PgError> {
    let value = if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)?
            .map(|v| Value::Integer(v.into()))
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)?
            .map(|v| Value::Integer(v.into()))
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx)?.map(Value::Integer)
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(idx)?
            .map(|v| Value::Float(v.into()))
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx)?.map(Value::Float)
    } else if *ty == Type::TEXT || *ty == Type::VARCHAR || *ty == Type::BPCHAR || *ty == Type::NAME
    {
        row.try_get::<_, Option<String>>(idx)?.map(Value::Text)
    } else if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx)?.map(Value::Boolean)
    } else if *ty == Type::TIMESTAMPTZ {
        row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)?
            .map(Value::Timestamp)
    } else if *ty == Type::TIMESTAMP {
        row.try_get::<_, Option<chrono::NaiveDateTime>>(idx)?
            .map(|v| Value::Timestamp(v.and_utc()))
    } else {
        return Err(PgError::UnsupportedType(ty.name().to_string()));
    };
    Ok(value.unwrap_or(Value::Null))
}

impl ToSql for Value {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Integer(i) if *ty == Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
            Value::Integer(i) if *ty == Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
            Value::Integer(i) if *ty == Type::FLOAT8 => (*i as f64).to_sql(ty, out),
            Value::Integer(i) => i.to_sql(ty, out),
            Value::Float(f) if *ty == Type::FLOAT4 => (*f as f32).to_sql(ty, out),
            Value::Float(f) => f.to_sql(ty, out),
            Value::Text(s) => s.to_sql(ty, out),
            Value::Boolean(b) => b.to_sql(ty, out),
            Value::Timestamp(ts) if *ty == Type::TIMESTAMP => ts.naive_utc().to_sql(ty, out),
            Value::Timestamp(ts) => ts.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}
