use super::transaction::MemoryTransaction;
use crate::core::{DbError, Result, Row, Schema};
use crate::result::QueryResult;
use log::debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, RwLock};

/// A table as seen by one snapshot.
#[derive(Debug, Clone)]
pub(crate) struct Table {
    pub schema: Schema,
    pub rows: im::Vector<Row>,
    /// Commit version that last wrote the table. 0 while uncommitted.
    pub version: u64,
}

impl Table {
    pub(crate) fn new(schema: Schema) -> Self {
        Self {
            schema,
            rows: im::Vector::new(),
            version: 0,
        }
    }
}

pub(crate) type Tables = im::HashMap<String, Table>;

/// Point-in-time view handed to a new transaction. Cloning is O(1).
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    pub tables: Tables,
    pub version: u64,
}

#[derive(Debug, Default)]
struct Committed {
    tables: Tables,
    version: u64,
}

#[derive(Debug, Default)]
struct Shared {
    committed: RwLock<Committed>,
    injected_conflicts: AtomicUsize,
    next_tx_id: AtomicU64,
}

/// In-process database with optimistic, snapshot-based transactions.
///
/// Concurrent transactions never block each other. A transaction that writes
/// a table modified by another transaction committed after its snapshot fails
/// with a serialization failure (SQLSTATE 40001), either on the offending
/// write or when it commits. Handles are cheap to clone and share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    shared: Arc<Shared>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a transaction outside of any pool.
    pub async fn begin(&self) -> MemoryTransaction {
        self.begin_with_permit(None).await
    }

    pub(crate) async fn begin_with_permit(
        &self,
        permit: Option<OwnedSemaphorePermit>,
    ) -> MemoryTransaction {
        let id = self.shared.next_tx_id.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot = self.snapshot().await;
        debug!(
            "Transaction {} started at version {}",
            id, snapshot.version
        );
        MemoryTransaction::new(id, self.clone(), snapshot, permit)
    }

    /// Make the next `count` commit validations fail with a serialization
    /// failure, as if another transaction had won the race.
    pub fn inject_commit_conflicts(&self, count: usize) {
        self.shared
            .injected_conflicts
            .fetch_add(count, Ordering::SeqCst);
    }

    /// Injected conflicts not yet consumed.
    pub fn pending_injected_conflicts(&self) -> usize {
        self.shared.injected_conflicts.load(Ordering::SeqCst)
    }

    /// Committed contents of `name`, in insertion order.
    pub async fn table_rows(&self, name: &str) -> Result<QueryResult> {
        let committed = self.shared.committed.read().await;
        let table = committed
            .tables
            .get(name)
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))?;

        Ok(QueryResult::new(
            table.schema.column_names(),
            table.rows.iter().cloned().collect(),
        ))
    }

    pub async fn table_names(&self) -> Vec<String> {
        let committed = self.shared.committed.read().await;
        let mut names: Vec<String> = committed.tables.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of commits that changed data.
    pub async fn version(&self) -> u64 {
        self.shared.committed.read().await.version
    }

    pub(crate) async fn snapshot(&self) -> Snapshot {
        let committed = self.shared.committed.read().await;
        Snapshot {
            tables: committed.tables.clone(),
            version: committed.version,
        }
    }

    /// Fail if `table` was committed by someone else after `snapshot_version`.
    pub(crate) async fn check_write(&self, table: &str, snapshot_version: u64) -> Result<()> {
        let committed = self.shared.committed.read().await;
        check_table(&committed, table, snapshot_version)
    }

    /// Validate and publish the tables in `written`. First committer wins.
    ///
    /// Returns the new commit version, or `None` for a read-only transaction.
    pub(crate) async fn publish(
        &self,
        tx_id: u64,
        snapshot_version: u64,
        tables: &Tables,
        written: &im::HashSet<String>,
    ) -> Result<Option<u64>> {
        if written.is_empty() {
            return Ok(None);
        }

        let mut committed = self.shared.committed.write().await;

        if self.take_injected_conflict() {
            return Err(DbError::SerializationFailure(format!(
                "transaction {} lost a commit race",
                tx_id
            )));
        }
        for name in written.iter() {
            check_table(&committed, name, snapshot_version)?;
        }

        committed.version += 1;
        let version = committed.version;
        for name in written.iter() {
            match tables.get(name) {
                Some(table) => {
                    let mut table = table.clone();
                    table.version = version;
                    committed.tables.insert(name.clone(), table);
                }
                None => {
                    committed.tables.remove(name);
                }
            }
        }

        debug!(
            "Transaction {} committed version {} ({} tables)",
            tx_id,
            version,
            written.len()
        );
        Ok(Some(version))
    }

    fn take_injected_conflict(&self) -> bool {
        self.shared
            .injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn check_table(committed: &Committed, name: &str, snapshot_version: u64) -> Result<()> {
    match committed.tables.get(name) {
        Some(table) if table.version > snapshot_version => Err(DbError::SerializationFailure(
            format!("table '{}' was modified by a concurrent transaction", name),
        )),
        _ => Ok(()),
    }
}
