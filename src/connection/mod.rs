pub mod config;

use crate::core::Value;
use crate::result::QueryResult;
use async_trait::async_trait;

/// An open database transaction.
///
/// Each method may block on I/O. Implementations decide what an error means
/// for the transaction; the retry executor only relies on the SQLSTATE carried
/// by the error (see [`crate::core::SqlState`]).
#[async_trait]
pub trait TransactionHandle: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Execute a statement that modifies data or schema. Returns affected rows.
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, Self::Error>;

    /// Execute a statement that returns rows.
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult, Self::Error>;

    async fn savepoint(&mut self, name: &str) -> Result<(), Self::Error>;

    async fn release_savepoint(&mut self, name: &str) -> Result<(), Self::Error>;

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), Self::Error>;

    async fn commit(&mut self) -> Result<(), Self::Error>;

    async fn rollback(&mut self) -> Result<(), Self::Error>;
}

/// Hands out fresh transactions. Shared between concurrent callers.
#[async_trait]
pub trait ConnectionSource: Send + Sync {
    type Transaction: TransactionHandle;

    async fn begin(
        &self,
    ) -> Result<Self::Transaction, <Self::Transaction as TransactionHandle>::Error>;
}

#[async_trait]
impl<S: ConnectionSource + ?Sized> ConnectionSource for std::sync::Arc<S> {
    type Transaction = S::Transaction;

    async fn begin(
        &self,
    ) -> Result<Self::Transaction, <Self::Transaction as TransactionHandle>::Error> {
        (**self).begin().await
    }
}
