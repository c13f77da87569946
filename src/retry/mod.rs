// ============================================================================
// Retryable Transactions
// ============================================================================
//
// Client-side optimistic retry for engines that detect serialization
// conflicts at commit time. The whole unit of work is replayed from a
// savepoint taken at the start of the transaction, so the transaction and its
// connection stay valid across attempts.
//
// ============================================================================

pub mod classify;
pub mod context;
pub mod error;
pub mod executor;
pub mod policy;

pub use classify::{Classification, Classifier, SqlStateClassifier, classify};
pub use context::TxContext;
pub use error::{TxError, TxOp};
pub use executor::RetryExecutor;
pub use policy::{Backoff, DEFAULT_SAVEPOINT, RetryPolicy};
