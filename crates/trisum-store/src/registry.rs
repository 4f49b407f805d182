//! Shared registry store: node and computation records.
//!
//! One SQLite file accessed concurrently by the façade and every local node.
//! Read-modify-write sections run under `BEGIN IMMEDIATE` so concurrent
//! writers from other processes serialize at the database, and every
//! operation goes through the retry wrapper for busy/locked contention.

use crate::error::StoreError;
use crate::pool::{build_pool, ConnectionPool};
use crate::retry;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use trisum_core::{
    ComputationId, ComputationRecord, ComputationStatus, FailureReason, NodeId, NodeRecord,
    NodeRole, NodeStatus, StoreConfig,
};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS nodes (
        id         TEXT PRIMARY KEY,
        role       TEXT NOT NULL,
        endpoint   TEXT NOT NULL,
        status     TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    -- Endpoint uniqueness applies to nodes that may still be reachable.
    CREATE UNIQUE INDEX IF NOT EXISTS nodes_active_endpoint
        ON nodes(endpoint) WHERE status != 'stopped';

    CREATE TABLE IF NOT EXISTS computations (
        id                 TEXT PRIMARY KEY,
        proposer_id        TEXT NOT NULL,
        coordinator_ids    TEXT NOT NULL,
        prompt             TEXT NOT NULL,
        schema_tag         TEXT NOT NULL,
        deadline           TEXT NOT NULL,
        min_participants   INTEGER NOT NULL,
        status             TEXT NOT NULL,
        result             INTEGER,
        participants_count INTEGER,
        failure            TEXT,
        created_at         TEXT NOT NULL
    );
"#;

/// Handle to the shared registry store. Cheap to clone; clones share the
/// connection pool.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    pool: ConnectionPool,
    config: StoreConfig,
}

impl RegistryStore {
    /// Open (and bootstrap, if necessary) the registry at `path`.
    pub async fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
        let pool = build_pool(path.as_ref(), &config)?;
        let store = Self { pool, config };
        store
            .call(|conn| conn.execute_batch(SCHEMA).map_err(StoreError::from))
            .await?;
        Ok(store)
    }

    async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: Fn(&mut Connection) -> Result<T, StoreError> + Clone + Send + 'static,
        T: Send + 'static,
    {
        retry::with_retries(&self.config, || {
            let f = f.clone();
            async move {
                let mut lease = self
                    .pool
                    .get()
                    .await
                    .map_err(|e| StoreError::Pool(e.to_string()))?;
                tokio::task::spawn_blocking(move || f(&mut lease))
                    .await
                    .map_err(|e| StoreError::Pool(format!("store task failed: {e}")))?
            }
        })
        .await
    }

    // ---- nodes ----

    /// Insert a fresh node record. Duplicate ids and endpoints already
    /// claimed by a non-stopped node are rejected.
    pub async fn register_node(&self, record: &NodeRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let id_taken: Option<String> = tx
                .query_row(
                    "SELECT id FROM nodes WHERE id = ?1",
                    params![record.id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            if id_taken.is_some() {
                return Err(StoreError::DuplicateNode(record.id));
            }
            let endpoint = record.endpoint.to_string();
            let endpoint_taken: Option<String> = tx
                .query_row(
                    "SELECT id FROM nodes WHERE endpoint = ?1 AND status != 'stopped'",
                    params![endpoint],
                    |row| row.get(0),
                )
                .optional()?;
            if endpoint_taken.is_some() {
                return Err(StoreError::EndpointInUse(endpoint));
            }
            tx.execute(
                "INSERT INTO nodes (id, role, endpoint, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.id.to_string(),
                    record.role.to_string(),
                    endpoint,
                    record.status.to_string(),
                    record.created_at,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Update a node's lifecycle status.
    pub async fn set_node_status(&self, id: NodeId, status: NodeStatus) -> Result<(), StoreError> {
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE nodes SET status = ?1 WHERE id = ?2",
                params![status.to_string(), id.to_string()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("node {id}")));
            }
            Ok(())
        })
        .await
    }

    /// Remove a node row once the node confirmed teardown.
    pub async fn remove_node(&self, id: NodeId) -> Result<(), StoreError> {
        self.call(move |conn| {
            conn.execute("DELETE FROM nodes WHERE id = ?1", params![id.to_string()])?;
            Ok(())
        })
        .await
    }

    /// Load one node record.
    pub async fn get_node(&self, id: NodeId) -> Result<Option<NodeRecord>, StoreError> {
        self.call(move |conn| {
            let row = conn
                .query_row(
                    "SELECT id, role, endpoint, status, created_at FROM nodes WHERE id = ?1",
                    params![id.to_string()],
                    raw_node,
                )
                .optional()?;
            row.map(parse_node).transpose()
        })
        .await
    }

    /// All node records, oldest first.
    pub async fn list_nodes(&self) -> Result<Vec<NodeRecord>, StoreError> {
        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, role, endpoint, status, created_at FROM nodes
                 ORDER BY created_at, id",
            )?;
            let rows = stmt.query_map([], raw_node)?;
            rows.map(|row| parse_node(row?))
                .collect::<Result<Vec<_>, _>>()
        })
        .await
    }

    /// Active nodes of one role, oldest first. The first three active
    /// coordinators returned here are a computation's C₁, C₂, C₃.
    pub async fn list_active(&self, role: NodeRole) -> Result<Vec<NodeRecord>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, role, endpoint, status, created_at FROM nodes
                 WHERE role = ?1 AND status = 'active'
                 ORDER BY created_at, id",
            )?;
            let rows = stmt.query_map(params![role.to_string()], raw_node)?;
            rows.map(|row| parse_node(row?))
                .collect::<Result<Vec<_>, _>>()
        })
        .await
    }

    // ---- computations ----

    /// Insert a new computation record. A duplicate id is rejected, which
    /// makes `propose` idempotent at the registry.
    pub async fn insert_computation(&self, record: &ComputationRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let exists: Option<String> = tx
                .query_row(
                    "SELECT id FROM computations WHERE id = ?1",
                    params![record.id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(StoreError::DuplicateComputation(record.id));
            }
            let coordinator_ids = serde_json::to_string(&record.coordinators)
                .map_err(|e| StoreError::corrupt(e.to_string()))?;
            tx.execute(
                "INSERT INTO computations
                   (id, proposer_id, coordinator_ids, prompt, schema_tag, deadline,
                    min_participants, status, result, participants_count, failure, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    record.id.to_string(),
                    record.proposer_id.to_string(),
                    coordinator_ids,
                    record.prompt,
                    record.schema_tag,
                    record.deadline,
                    record.min_participants,
                    record.status.to_string(),
                    record.result.map(i64::from),
                    record.participants_count,
                    record.failure.map(|f| f.to_string()),
                    record.created_at,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Load one computation record.
    pub async fn load_computation(
        &self,
        id: ComputationId,
    ) -> Result<Option<ComputationRecord>, StoreError> {
        self.call(move |conn| {
            let row = conn
                .query_row(
                    "SELECT id, proposer_id, coordinator_ids, prompt, schema_tag, deadline,
                            min_participants, status, result, participants_count, failure,
                            created_at
                     FROM computations WHERE id = ?1",
                    params![id.to_string()],
                    raw_computation,
                )
                .optional()?;
            row.map(parse_computation).transpose()
        })
        .await
    }

    /// All computations that have not reached a terminal status, oldest
    /// first. Used by coordinators to resume in-flight computations after a
    /// restart.
    pub async fn list_unfinished(&self) -> Result<Vec<ComputationRecord>, StoreError> {
        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, proposer_id, coordinator_ids, prompt, schema_tag, deadline,
                        min_participants, status, result, participants_count, failure,
                        created_at
                 FROM computations
                 WHERE status NOT IN ('completed', 'failed')
                 ORDER BY created_at, id",
            )?;
            let rows = stmt.query_map([], raw_computation)?;
            rows.map(|row| parse_computation(row?))
                .collect::<Result<Vec<_>, _>>()
        })
        .await
    }

    /// Advance a computation's status. Monotonic: re-asserting the current
    /// status is a no-op; moving backwards or out of a terminal state is an
    /// [`StoreError::InvalidTransition`].
    pub async fn set_computation_status(
        &self,
        id: ComputationId,
        status: ComputationStatus,
    ) -> Result<(), StoreError> {
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = current_status(&tx, id)?;
            if current == status {
                return Ok(());
            }
            if !current.allows_transition_to(status) {
                return Err(StoreError::InvalidTransition {
                    from: current,
                    to: status,
                });
            }
            tx.execute(
                "UPDATE computations SET status = ?1 WHERE id = ?2",
                params![status.to_string(), id.to_string()],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Finalize a computation with its revealed result.
    pub async fn complete_computation(
        &self,
        id: ComputationId,
        result: u32,
        participants_count: u32,
    ) -> Result<(), StoreError> {
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = current_status(&tx, id)?;
            if !current.allows_transition_to(ComputationStatus::Completed) {
                return Err(StoreError::InvalidTransition {
                    from: current,
                    to: ComputationStatus::Completed,
                });
            }
            tx.execute(
                "UPDATE computations
                 SET status = 'completed', result = ?1, participants_count = ?2, failure = NULL
                 WHERE id = ?3",
                params![i64::from(result), participants_count, id.to_string()],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Finalize a computation as failed. No result is written. If the
    /// computation already reached a terminal status the first outcome wins
    /// and this call is a no-op.
    pub async fn fail_computation(
        &self,
        id: ComputationId,
        reason: FailureReason,
        participants_count: Option<u32>,
    ) -> Result<(), StoreError> {
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = current_status(&tx, id)?;
            if current.is_terminal() {
                return Ok(());
            }
            tx.execute(
                "UPDATE computations
                 SET status = 'failed', failure = ?1, participants_count = ?2, result = NULL
                 WHERE id = ?3",
                params![reason.to_string(), participants_count, id.to_string()],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

fn current_status(conn: &Connection, id: ComputationId) -> Result<ComputationStatus, StoreError> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM computations WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    let status = status.ok_or_else(|| StoreError::NotFound(format!("computation {id}")))?;
    status.parse().map_err(StoreError::Corrupt)
}

// Raw row tuples are read inside rusqlite closures and parsed into typed
// records afterwards, so decode failures surface as Corrupt rather than
// panics.

type RawNode = (String, String, String, String, DateTime<Utc>);

fn raw_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawNode> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn parse_node(raw: RawNode) -> Result<NodeRecord, StoreError> {
    let (id, role, endpoint, status, created_at) = raw;
    Ok(NodeRecord {
        id: id.parse().map_err(|e| StoreError::corrupt(format!("{e}")))?,
        role: role.parse().map_err(StoreError::Corrupt)?,
        endpoint: endpoint
            .parse()
            .map_err(|e| StoreError::corrupt(format!("node endpoint: {e}")))?,
        status: status.parse().map_err(StoreError::Corrupt)?,
        created_at,
    })
}

type RawComputation = (
    String,
    String,
    String,
    String,
    String,
    DateTime<Utc>,
    u32,
    String,
    Option<i64>,
    Option<u32>,
    Option<String>,
    DateTime<Utc>,
);

fn raw_computation(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawComputation> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
    ))
}

fn parse_computation(raw: RawComputation) -> Result<ComputationRecord, StoreError> {
    let (
        id,
        proposer_id,
        coordinator_ids,
        prompt,
        schema_tag,
        deadline,
        min_participants,
        status,
        result,
        participants_count,
        failure,
        created_at,
    ) = raw;
    let coordinators: [NodeId; 3] = serde_json::from_str(&coordinator_ids)
        .map_err(|e| StoreError::corrupt(format!("coordinator ids: {e}")))?;
    let result = result
        .map(|v| u32::try_from(v).map_err(|_| StoreError::corrupt(format!("result {v} out of range"))))
        .transpose()?;
    Ok(ComputationRecord {
        id: id.parse().map_err(|e| StoreError::corrupt(format!("{e}")))?,
        proposer_id: proposer_id
            .parse()
            .map_err(|e| StoreError::corrupt(format!("{e}")))?,
        coordinators,
        prompt,
        schema_tag,
        deadline,
        min_participants,
        status: status.parse().map_err(StoreError::Corrupt)?,
        result,
        participants_count,
        failure: failure
            .map(|f| f.parse().map_err(StoreError::Corrupt))
            .transpose()?,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::net::SocketAddr;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    async fn open_temp() -> (tempfile::TempDir, RegistryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::open(dir.path().join("registry.db"), StoreConfig::default())
            .await
            .unwrap();
        (dir, store)
    }

    fn computation(coordinators: [NodeId; 3]) -> ComputationRecord {
        ComputationRecord::new(
            ComputationId::new(),
            NodeId::new(),
            coordinators,
            "what is your value",
            Utc::now() + Duration::seconds(30),
            2,
        )
    }

    #[tokio::test]
    async fn node_records_round_trip() {
        let (_dir, store) = open_temp().await;
        let record = NodeRecord::new(NodeId::new(), NodeRole::Coordinator, addr(4101));
        store.register_node(&record).await.unwrap();

        let loaded = store.get_node(record.id).await.unwrap().unwrap();
        assert_eq!(loaded, record);

        store
            .set_node_status(record.id, NodeStatus::Stopping)
            .await
            .unwrap();
        let loaded = store.get_node(record.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, NodeStatus::Stopping);

        store.remove_node(record.id).await.unwrap();
        assert!(store.get_node(record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_node_id_is_rejected() {
        let (_dir, store) = open_temp().await;
        let record = NodeRecord::new(NodeId::new(), NodeRole::Contributor, addr(4102));
        store.register_node(&record).await.unwrap();
        let err = store.register_node(&record).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateNode(id) if id == record.id));
    }

    #[tokio::test]
    async fn endpoint_unique_among_non_stopped_nodes() {
        let (_dir, store) = open_temp().await;
        let first = NodeRecord::new(NodeId::new(), NodeRole::Contributor, addr(4103));
        store.register_node(&first).await.unwrap();

        let second = NodeRecord::new(NodeId::new(), NodeRole::Contributor, addr(4103));
        let err = store.register_node(&second).await.unwrap_err();
        assert!(matches!(err, StoreError::EndpointInUse(_)));

        // Once the first node is fully stopped its endpoint may be reused.
        store
            .set_node_status(first.id, NodeStatus::Stopped)
            .await
            .unwrap();
        store.register_node(&second).await.unwrap();
    }

    #[tokio::test]
    async fn active_listing_orders_by_creation() {
        let (_dir, store) = open_temp().await;
        let mut ids = Vec::new();
        for port in 4110..4113 {
            let record = NodeRecord::new(NodeId::new(), NodeRole::Coordinator, addr(port));
            store.register_node(&record).await.unwrap();
            ids.push(record.id);
        }
        let active = store.list_active(NodeRole::Coordinator).await.unwrap();
        assert_eq!(active.iter().map(|n| n.id).collect::<Vec<_>>(), ids);
        assert!(store
            .list_active(NodeRole::Contributor)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn computation_records_round_trip() {
        let (_dir, store) = open_temp().await;
        let record = computation([NodeId::new(), NodeId::new(), NodeId::new()]);
        store.insert_computation(&record).await.unwrap();
        let loaded = store.load_computation(record.id).await.unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn duplicate_computation_id_is_rejected() {
        let (_dir, store) = open_temp().await;
        let record = computation([NodeId::new(), NodeId::new(), NodeId::new()]);
        store.insert_computation(&record).await.unwrap();
        let err = store.insert_computation(&record).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateComputation(id) if id == record.id));
    }

    #[tokio::test]
    async fn status_guard_rejects_regression() {
        let (_dir, store) = open_temp().await;
        let record = computation([NodeId::new(), NodeId::new(), NodeId::new()]);
        store.insert_computation(&record).await.unwrap();

        store
            .set_computation_status(record.id, ComputationStatus::Collecting)
            .await
            .unwrap();
        // Same status again is a no-op.
        store
            .set_computation_status(record.id, ComputationStatus::Collecting)
            .await
            .unwrap();
        let err = store
            .set_computation_status(record.id, ComputationStatus::Pending)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn completion_writes_result_and_count() {
        let (_dir, store) = open_temp().await;
        let record = computation([NodeId::new(), NodeId::new(), NodeId::new()]);
        store.insert_computation(&record).await.unwrap();
        store
            .complete_computation(record.id, 103, 3)
            .await
            .unwrap();

        let loaded = store.load_computation(record.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ComputationStatus::Completed);
        assert_eq!(loaded.result, Some(103));
        assert_eq!(loaded.participants_count, Some(3));
        assert!(loaded.failure.is_none());
    }

    #[tokio::test]
    async fn failure_is_terminal_and_first_outcome_wins() {
        let (_dir, store) = open_temp().await;
        let record = computation([NodeId::new(), NodeId::new(), NodeId::new()]);
        store.insert_computation(&record).await.unwrap();

        store
            .fail_computation(record.id, FailureReason::ThresholdNotMet, Some(1))
            .await
            .unwrap();
        let loaded = store.load_computation(record.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ComputationStatus::Failed);
        assert_eq!(loaded.failure, Some(FailureReason::ThresholdNotMet));
        assert_eq!(loaded.result, None);

        // Completing afterwards is rejected; failing again is a no-op.
        assert!(store.complete_computation(record.id, 1, 1).await.is_err());
        store
            .fail_computation(record.id, FailureReason::InitTimeout, None)
            .await
            .unwrap();
        let loaded = store.load_computation(record.id).await.unwrap().unwrap();
        assert_eq!(loaded.failure, Some(FailureReason::ThresholdNotMet));
    }

    #[tokio::test]
    async fn concurrent_handles_share_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");
        let a = RegistryStore::open(&path, StoreConfig::default()).await.unwrap();
        let b = RegistryStore::open(&path, StoreConfig::default()).await.unwrap();

        let record = NodeRecord::new(NodeId::new(), NodeRole::Coordinator, addr(4120));
        a.register_node(&record).await.unwrap();
        let seen = b.get_node(record.id).await.unwrap().unwrap();
        assert_eq!(seen.endpoint, record.endpoint);
    }
}
