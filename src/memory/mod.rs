// ============================================================================
// In-memory engine
// ============================================================================
//
// A small SQL engine with optimistic snapshot transactions. Concurrent
// writers to the same table produce genuine serialization failures
// (SQLSTATE 40001), which makes it a faithful stand-in for a
// SERIALIZABLE server when exercising retry logic.

mod database;
mod pool;
mod statement;
mod transaction;

pub use database::MemoryDatabase;
pub use pool::{MemoryPool, PoolStats};
pub use transaction::MemoryTransaction;
