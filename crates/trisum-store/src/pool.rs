//! Bounded SQLite connection pool with health-checked leases.
//!
//! The registry file is opened by the façade and by every node, so each
//! handle keeps a small pool of connections. Leases are probed with a
//! trivial query on recycle; a connection that fails the probe is discarded
//! and replaced.

use crate::error::StoreError;
use deadpool::managed::{self, Metrics, RecycleError, RecycleResult};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use trisum_core::StoreConfig;

/// Open a connection with the pragmas every trisum database uses: WAL
/// journal, full synchronous writes, and a generous busy timeout.
pub(crate) fn open_connection(path: &Path, config: &StoreConfig) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(config.busy_timeout())?;
    // rusqlite is finicky about this pragma; it must go through query_row.
    conn.query_row("PRAGMA journal_mode=WAL", [], |_row| Ok(()))?;
    conn.execute_batch("PRAGMA synchronous=FULL;")?;
    Ok(conn)
}

/// Pool manager creating and probing registry connections.
#[derive(Debug)]
pub(crate) struct ConnectionManager {
    path: PathBuf,
    config: StoreConfig,
}

impl ConnectionManager {
    pub(crate) fn new(path: impl Into<PathBuf>, config: StoreConfig) -> Self {
        Self {
            path: path.into(),
            config,
        }
    }
}

impl managed::Manager for ConnectionManager {
    type Type = Connection;
    type Error = rusqlite::Error;

    async fn create(&self) -> Result<Connection, rusqlite::Error> {
        open_connection(&self.path, &self.config)
    }

    async fn recycle(&self, conn: &mut Connection, _metrics: &Metrics) -> RecycleResult<rusqlite::Error> {
        conn.query_row("SELECT 1", [], |_row| Ok(()))
            .map_err(RecycleError::Backend)
    }
}

pub(crate) type ConnectionPool = managed::Pool<ConnectionManager>;

/// Build the bounded pool for a registry file.
pub(crate) fn build_pool(path: &Path, config: &StoreConfig) -> Result<ConnectionPool, StoreError> {
    let manager = ConnectionManager::new(path, config.clone());
    ConnectionPool::builder(manager)
        .max_size(config.pool_size.max(1) as usize)
        .build()
        .map_err(|e| StoreError::Pool(e.to_string()))
}
