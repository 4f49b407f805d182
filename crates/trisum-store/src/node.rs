//! Per-node stores.
//!
//! Each node owns one SQLite file nobody else opens: coordinators keep their
//! share column and derived partial sums, contributors keep their response
//! journal and pending-actions log. Single-writer discipline; the handle
//! serializes access behind a mutex and runs statements off the node's
//! cooperative scheduler.

use crate::error::StoreError;
use crate::pool::open_connection;
use crate::retry;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use trisum_core::{sharing, ComputationId, DeliveryState, NodeId, StoreConfig};

const COORDINATOR_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS shares (
        comp_id        TEXT NOT NULL,
        contributor_id TEXT NOT NULL,
        share_value    INTEGER NOT NULL,
        received_at    TEXT NOT NULL,
        PRIMARY KEY (comp_id, contributor_id)
    );

    CREATE TABLE IF NOT EXISTS partial_sums (
        comp_id         TEXT PRIMARY KEY,
        partial_sum     INTEGER NOT NULL,
        participant_ids TEXT NOT NULL
    );
"#;

const CONTRIBUTOR_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS responses (
        comp_id         TEXT PRIMARY KEY,
        raw_value       INTEGER NOT NULL,
        shares          TEXT NOT NULL,
        targets         TEXT NOT NULL,
        delivery_status TEXT NOT NULL,
        created_at      TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS actions (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        comp_id    TEXT NOT NULL,
        kind       TEXT NOT NULL,
        payload    TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
"#;

/// Shared plumbing for both store flavours.
#[derive(Clone)]
struct SqliteHandle {
    conn: Arc<Mutex<Connection>>,
    config: StoreConfig,
}

impl SqliteHandle {
    async fn open(path: &Path, config: StoreConfig, schema: &str) -> Result<Self, StoreError> {
        let conn = open_connection(path, &config)?;
        conn.execute_batch(schema)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: Fn(&Connection) -> Result<T, StoreError> + Clone + Send + 'static,
        T: Send + 'static,
    {
        retry::with_retries(&self.config, || {
            let f = f.clone();
            let conn = Arc::clone(&self.conn);
            async move {
                tokio::task::spawn_blocking(move || f(&conn.lock()))
                    .await
                    .map_err(|e| StoreError::Pool(format!("store task failed: {e}")))?
            }
        })
        .await
    }
}

/// Outcome of recording an inbound share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareUpsert {
    /// First share from this contributor for this computation.
    Inserted,
    /// Exact re-send of the already recorded share; state unchanged.
    DuplicateIdentical,
    /// A different value from a contributor that already has a share;
    /// state unchanged, the first share is retained.
    DuplicateConflicting,
}

/// A coordinator's private share ledger and derived partial sums.
#[derive(Clone)]
pub struct CoordinatorStore {
    handle: SqliteHandle,
}

impl CoordinatorStore {
    pub async fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
        Ok(Self {
            handle: SqliteHandle::open(path.as_ref(), config, COORDINATOR_SCHEMA).await?,
        })
    }

    /// Record one share. At most one share per (computation, contributor)
    /// is retained; re-sends of the identical value are no-ops.
    pub async fn record_share(
        &self,
        comp_id: ComputationId,
        contributor_id: NodeId,
        share_value: u32,
        received_at: DateTime<Utc>,
    ) -> Result<ShareUpsert, StoreError> {
        self.handle
            .call(move |conn| {
                let existing: Option<i64> = conn
                    .query_row(
                        "SELECT share_value FROM shares
                         WHERE comp_id = ?1 AND contributor_id = ?2",
                        params![comp_id.to_string(), contributor_id.to_string()],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(existing) = existing {
                    return Ok(if existing == i64::from(share_value) {
                        ShareUpsert::DuplicateIdentical
                    } else {
                        ShareUpsert::DuplicateConflicting
                    });
                }
                conn.execute(
                    "INSERT INTO shares (comp_id, contributor_id, share_value, received_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        comp_id.to_string(),
                        contributor_id.to_string(),
                        i64::from(share_value),
                        received_at,
                    ],
                )?;
                Ok(ShareUpsert::Inserted)
            })
            .await
    }

    /// Contributor ids from which this coordinator holds a valid share.
    pub async fn participants(
        &self,
        comp_id: ComputationId,
    ) -> Result<BTreeSet<NodeId>, StoreError> {
        self.handle
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT contributor_id FROM shares WHERE comp_id = ?1",
                )?;
                let rows = stmt.query_map(params![comp_id.to_string()], |row| {
                    row.get::<_, String>(0)
                })?;
                rows.map(|row| {
                    row?.parse()
                        .map_err(|e| StoreError::corrupt(format!("{e}")))
                })
                .collect()
            })
            .await
    }

    /// Modular sum of this coordinator's share column restricted to
    /// `participants`. Derived state; always recomputed from the ledger.
    pub async fn partial_sum_over(
        &self,
        comp_id: ComputationId,
        participants: &BTreeSet<NodeId>,
    ) -> Result<u32, StoreError> {
        let participants = participants.clone();
        self.handle
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT contributor_id, share_value FROM shares WHERE comp_id = ?1",
                )?;
                let rows = stmt.query_map(params![comp_id.to_string()], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                let mut column = Vec::new();
                for row in rows {
                    let (contributor, value) = row?;
                    let contributor: NodeId = contributor
                        .parse()
                        .map_err(|e| StoreError::corrupt(format!("{e}")))?;
                    if !participants.contains(&contributor) {
                        continue;
                    }
                    let value = u32::try_from(value)
                        .map_err(|_| StoreError::corrupt(format!("share {value} out of range")))?;
                    column.push(value);
                }
                Ok(sharing::column_sum(column))
            })
            .await
    }

    /// Persist the partial sum this coordinator contributed to a reveal.
    pub async fn record_partial_sum(
        &self,
        comp_id: ComputationId,
        partial_sum: u32,
        participants: &BTreeSet<NodeId>,
    ) -> Result<(), StoreError> {
        let participants = serde_json::to_string(participants)
            .map_err(|e| StoreError::corrupt(e.to_string()))?;
        self.handle
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO partial_sums (comp_id, partial_sum, participant_ids)
                     VALUES (?1, ?2, ?3)",
                    params![
                        comp_id.to_string(),
                        i64::from(partial_sum),
                        participants.clone(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Load the persisted partial sum for a computation, if any.
    pub async fn load_partial_sum(
        &self,
        comp_id: ComputationId,
    ) -> Result<Option<(u32, BTreeSet<NodeId>)>, StoreError> {
        self.handle
            .call(move |conn| {
                let raw: Option<(i64, String)> = conn
                    .query_row(
                        "SELECT partial_sum, participant_ids FROM partial_sums
                         WHERE comp_id = ?1",
                        params![comp_id.to_string()],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                let Some((sum, participants)) = raw else {
                    return Ok(None);
                };
                let sum = u32::try_from(sum)
                    .map_err(|_| StoreError::corrupt(format!("partial sum {sum} out of range")))?;
                let participants: BTreeSet<NodeId> = serde_json::from_str(&participants)
                    .map_err(|e| StoreError::corrupt(format!("participant ids: {e}")))?;
                Ok(Some((sum, participants)))
            })
            .await
    }

    /// Number of shares held for a computation.
    pub async fn share_count(&self, comp_id: ComputationId) -> Result<u32, StoreError> {
        self.handle
            .call(move |conn| {
                let count: u32 = conn.query_row(
                    "SELECT COUNT(*) FROM shares WHERE comp_id = ?1",
                    params![comp_id.to_string()],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await
    }
}

/// A contributor's response record: the private value, its shares, and the
/// per-target delivery state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseRecord {
    pub comp_id: ComputationId,
    pub raw_value: u32,
    pub shares: [u32; 3],
    pub targets: [NodeId; 3],
    pub delivery: [DeliveryState; 3],
    pub created_at: DateTime<Utc>,
}

/// One row of the contributor's pending-actions log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRecord {
    pub comp_id: ComputationId,
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A contributor's private response journal. The raw value recorded here
/// never leaves the node.
#[derive(Clone)]
pub struct ContributorStore {
    handle: SqliteHandle,
}

impl ContributorStore {
    pub async fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
        Ok(Self {
            handle: SqliteHandle::open(path.as_ref(), config, CONTRIBUTOR_SCHEMA).await?,
        })
    }

    /// Persist the response produced for a computation, before any share is
    /// sent. All three deliveries start out pending.
    pub async fn record_response(
        &self,
        comp_id: ComputationId,
        raw_value: u32,
        shares: [u32; 3],
        targets: [NodeId; 3],
    ) -> Result<(), StoreError> {
        let shares_json = serde_json::to_string(&shares)
            .map_err(|e| StoreError::corrupt(e.to_string()))?;
        let targets_json = serde_json::to_string(&targets)
            .map_err(|e| StoreError::corrupt(e.to_string()))?;
        let delivery_json = serde_json::to_string(&[DeliveryState::Pending; 3])
            .map_err(|e| StoreError::corrupt(e.to_string()))?;
        self.handle
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO responses
                       (comp_id, raw_value, shares, targets, delivery_status, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        comp_id.to_string(),
                        i64::from(raw_value),
                        shares_json.clone(),
                        targets_json.clone(),
                        delivery_json.clone(),
                        Utc::now(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Load the response record for a computation, if one exists.
    pub async fn load_response(
        &self,
        comp_id: ComputationId,
    ) -> Result<Option<ResponseRecord>, StoreError> {
        self.handle
            .call(move |conn| {
                let raw: Option<(i64, String, String, String, DateTime<Utc>)> = conn
                    .query_row(
                        "SELECT raw_value, shares, targets, delivery_status, created_at
                         FROM responses WHERE comp_id = ?1",
                        params![comp_id.to_string()],
                        |row| {
                            Ok((
                                row.get(0)?,
                                row.get(1)?,
                                row.get(2)?,
                                row.get(3)?,
                                row.get(4)?,
                            ))
                        },
                    )
                    .optional()?;
                let Some((raw_value, shares, targets, delivery, created_at)) = raw else {
                    return Ok(None);
                };
                let raw_value = u32::try_from(raw_value)
                    .map_err(|_| StoreError::corrupt(format!("raw value {raw_value} out of range")))?;
                let shares: [u32; 3] = serde_json::from_str(&shares)
                    .map_err(|e| StoreError::corrupt(format!("shares: {e}")))?;
                let targets: [NodeId; 3] = serde_json::from_str(&targets)
                    .map_err(|e| StoreError::corrupt(format!("targets: {e}")))?;
                let delivery: [DeliveryState; 3] = serde_json::from_str(&delivery)
                    .map_err(|e| StoreError::corrupt(format!("delivery status: {e}")))?;
                Ok(Some(ResponseRecord {
                    comp_id,
                    raw_value,
                    shares,
                    targets,
                    delivery,
                    created_at,
                }))
            })
            .await
    }

    /// Update the delivery state of the share destined for coordinator
    /// `target_index` (0-based).
    pub async fn set_delivery_state(
        &self,
        comp_id: ComputationId,
        target_index: usize,
        state: DeliveryState,
    ) -> Result<(), StoreError> {
        self.handle
            .call(move |conn| {
                let delivery: String = conn
                    .query_row(
                        "SELECT delivery_status FROM responses WHERE comp_id = ?1",
                        params![comp_id.to_string()],
                        |row| row.get(0),
                    )
                    .optional()?
                    .ok_or_else(|| StoreError::NotFound(format!("response for {comp_id}")))?;
                let mut delivery: [DeliveryState; 3] = serde_json::from_str(&delivery)
                    .map_err(|e| StoreError::corrupt(format!("delivery status: {e}")))?;
                let slot = delivery
                    .get_mut(target_index)
                    .ok_or_else(|| StoreError::corrupt(format!("target index {target_index}")))?;
                *slot = state;
                let delivery = serde_json::to_string(&delivery)
                    .map_err(|e| StoreError::corrupt(e.to_string()))?;
                conn.execute(
                    "UPDATE responses SET delivery_status = ?1 WHERE comp_id = ?2",
                    params![delivery, comp_id.to_string()],
                )?;
                Ok(())
            })
            .await
    }

    /// Append one row to the pending-actions log.
    pub async fn append_action(
        &self,
        comp_id: ComputationId,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<(), StoreError> {
        let kind = kind.to_string();
        let payload = payload.to_string();
        self.handle
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO actions (comp_id, kind, payload, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![comp_id.to_string(), kind.clone(), payload.clone(), Utc::now()],
                )?;
                Ok(())
            })
            .await
    }

    /// The action log for one computation, in append order.
    pub async fn actions(&self, comp_id: ComputationId) -> Result<Vec<ActionRecord>, StoreError> {
        self.handle
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT kind, payload, created_at FROM actions
                     WHERE comp_id = ?1 ORDER BY id",
                )?;
                let rows = stmt.query_map(params![comp_id.to_string()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, DateTime<Utc>>(2)?,
                    ))
                })?;
                rows.map(|row| {
                    let (kind, payload, created_at) = row?;
                    let payload = serde_json::from_str(&payload)
                        .map_err(|e| StoreError::corrupt(format!("action payload: {e}")))?;
                    Ok(ActionRecord {
                        comp_id,
                        kind,
                        payload,
                        created_at,
                    })
                })
                .collect()
            })
            .await
    }
}
