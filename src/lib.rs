// ============================================================================
// txretry Library
// ============================================================================

pub mod connection;
pub mod core;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod result;
pub mod retry;

// Re-export main types for convenience
pub use core::{DataType, DbError, Result, SERIALIZATION_FAILURE, SqlState, Value};
pub use result::QueryResult;

// Re-export connection API
pub use connection::{
    ConnectionSource, TransactionHandle,
    config::{Backend, ConfigError, ConnectionConfig, RetrySettings, Settings},
};

// Re-export retry API
pub use retry::{
    Classification, Classifier, RetryExecutor, RetryPolicy, SqlStateClassifier, TxContext,
    TxError, TxOp,
};

use futures::future::BoxFuture;
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Begin a transaction on `source` and run `work` in it with the default
/// policy: serialization failures are retried until the work commits, fails
/// with another error, or `cancel` fires.
///
/// # Examples
///
/// ```
/// use txretry::memory::MemoryPool;
/// use txretry::{ConnectionConfig, Value, execute_tx};
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = MemoryPool::open(ConnectionConfig::memory("saver"))?;
/// let cancel = CancellationToken::new();
///
/// let inserted = execute_tx(&cancel, &pool, |tx| {
///     Box::pin(async move {
///         tx.execute("CREATE TABLE IF NOT EXISTS beacon (duration_ms INTEGER)", &[])
///             .await?;
///         tx.execute("INSERT INTO beacon VALUES ($1)", &[Value::from(42)])
///             .await
///     })
/// })
/// .await?;
///
/// assert_eq!(inserted, 1);
/// assert_eq!(pool.database().table_rows("beacon").await?.row_count(), 1);
/// # Ok(())
/// # }
/// ```
pub async fn execute_tx<S, T, E, F>(
    cancel: &CancellationToken,
    source: &S,
    work: F,
) -> std::result::Result<T, TxError<E>>
where
    S: ConnectionSource + ?Sized,
    E: From<<S::Transaction as TransactionHandle>::Error> + SqlState + fmt::Display + Send,
    F: for<'a> FnMut(&'a mut TxContext<S::Transaction>) -> BoxFuture<'a, std::result::Result<T, E>>
        + Send,
    T: Send,
{
    RetryExecutor::new().execute_in(cancel, source, work).await
}
