use super::database::MemoryDatabase;
use super::transaction::MemoryTransaction;
use crate::connection::ConnectionSource;
use crate::connection::config::{Backend, ConnectionConfig};
use crate::core::{DbError, Result};
use async_trait::async_trait;
use log::info;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Connection pool over a [`MemoryDatabase`]
///
/// Bounds the number of concurrently open transactions to
/// `max_connections`. `begin` waits up to `connect_timeout` for a free slot;
/// the slot is returned when the transaction commits, rolls back, or is
/// dropped.
#[derive(Debug, Clone)]
pub struct MemoryPool {
    config: ConnectionConfig,
    db: MemoryDatabase,
    slots: Arc<Semaphore>,
}

impl MemoryPool {
    /// Create a pool on an existing database.
    pub fn new(db: MemoryDatabase, config: ConnectionConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| DbError::ExecutionError(e.to_string()))?;
        if config.backend != Backend::Memory {
            return Err(DbError::ExecutionError(format!(
                "Cannot open {} with the in-memory backend",
                config.to_url()
            )));
        }

        info!(
            "Opened in-memory pool {} (max {} connections)",
            config.to_url(),
            config.max_connections
        );
        let slots = Arc::new(Semaphore::new(config.max_connections));
        Ok(Self { config, db, slots })
    }

    /// Create a pool with a fresh, isolated database.
    pub fn open(config: ConnectionConfig) -> Result<Self> {
        Self::new(MemoryDatabase::new(), config)
    }

    pub fn database(&self) -> &MemoryDatabase {
        &self.db
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn stats(&self) -> PoolStats {
        let available = self.slots.available_permits();
        PoolStats {
            active_connections: self.config.max_connections.saturating_sub(available),
            available_connections: available,
            max_connections: self.config.max_connections,
        }
    }

    /// Refuse new transactions. Open ones run to completion.
    pub fn close(&self) {
        self.slots.close();
    }

    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }
}

#[async_trait]
impl ConnectionSource for MemoryPool {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction> {
        let acquire = self.slots.clone().acquire_owned();
        let permit = tokio::time::timeout(self.config.connect_timeout, acquire)
            .await
            .map_err(|_| DbError::PoolTimeout)?
            .map_err(|_| DbError::ConnectionClosed)?;

        Ok(self.db.begin_with_permit(Some(permit)).await)
    }
}

/// Connection pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub active_connections: usize,
    pub available_connections: usize,
    pub max_connections: usize,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} active, {} available",
            self.active_connections, self.max_connections, self.available_connections
        )
    }
}
