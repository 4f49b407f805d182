//! Contributor-side lifecycle and response policy.
//!
//! Per computation a contributor moves through
//! `idle → responding → sharing → done | failed`. The private value is
//! produced locally, persisted, split into three shares, and the shares are
//! delivered concurrently, one to each designated coordinator. The raw value
//! never leaves the node; a contributor whose deliveries do not all succeed
//! is silently excluded from the result by participant alignment.

use crate::runtime::{FatalSignal, TaskSet};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use trisum_core::{
    sharing, ComputationId, ComputationRecord, DeliveryState, Envelope, Message, NodeConfig,
    NodeId, RejectKind, Reply, SCHEMA_TAG,
};
use trisum_store::ContributorStore;
use trisum_transport::Messenger;

/// Produces a contributor's private value for a computation.
///
/// Policies are local by contract: the produced value is secret-shared
/// before anything leaves the node.
#[async_trait]
pub trait ResponsePolicy: Send + Sync + 'static {
    async fn produce(&self, computation: &ComputationRecord) -> u32;
}

/// Reference policy: a uniform draw from `[0, max_inclusive]`.
#[derive(Debug, Clone)]
pub struct UniformResponsePolicy {
    pub max_inclusive: u32,
}

impl Default for UniformResponsePolicy {
    fn default() -> Self {
        Self { max_inclusive: 100 }
    }
}

#[async_trait]
impl ResponsePolicy for UniformResponsePolicy {
    async fn produce(&self, _computation: &ComputationRecord) -> u32 {
        rand::thread_rng().gen_range(0..=self.max_inclusive)
    }
}

/// Test and experiment policy answering every computation with one value.
#[derive(Debug, Clone)]
pub struct FixedResponsePolicy(pub u32);

#[async_trait]
impl ResponsePolicy for FixedResponsePolicy {
    async fn produce(&self, _computation: &ComputationRecord) -> u32 {
        self.0
    }
}

/// The contributor role of a node.
pub struct ContributorRole {
    id: NodeId,
    store: ContributorStore,
    messenger: Messenger,
    policy: Arc<dyn ResponsePolicy>,
    in_flight: Mutex<HashSet<ComputationId>>,
    tasks: Arc<TaskSet>,
    fatal: FatalSignal,
    _config: NodeConfig,
}

impl ContributorRole {
    pub fn new(
        id: NodeId,
        store: ContributorStore,
        messenger: Messenger,
        policy: Arc<dyn ResponsePolicy>,
        config: NodeConfig,
        tasks: Arc<TaskSet>,
        fatal: FatalSignal,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            store,
            messenger,
            policy,
            in_flight: Mutex::new(HashSet::new()),
            tasks,
            fatal,
            _config: config,
        })
    }

    /// Dispatch one inbound envelope.
    pub async fn handle(self: &Arc<Self>, envelope: Envelope) -> Reply {
        match envelope.message {
            Message::Announce { computation } => self.handle_announce(computation).await,
            Message::Health => Reply::Accepted,
            other => {
                tracing::warn!(message = other.kind(), "message not valid for a contributor");
                Reply::Rejected {
                    kind: RejectKind::InvalidMessage,
                }
            }
        }
    }

    async fn handle_announce(self: &Arc<Self>, computation: ComputationRecord) -> Reply {
        if computation.schema_tag != SCHEMA_TAG {
            tracing::warn!(
                computation = %computation.id,
                schema_tag = %computation.schema_tag,
                "announcement with an unsupported response schema"
            );
            return Reply::Rejected {
                kind: RejectKind::InvalidMessage,
            };
        }

        // Re-announcements are no-ops: the response journal is the durable
        // record of having contributed.
        match self.store.load_response(computation.id).await {
            Ok(Some(_)) => return Reply::Accepted,
            Ok(None) => {}
            Err(err) => {
                tracing::error!(computation = %computation.id, %err, "response journal lookup failed");
                self.fatal.raise_if_fatal(&err);
                return Reply::Rejected {
                    kind: RejectKind::InvalidMessage,
                };
            }
        }
        if !self.in_flight.lock().insert(computation.id) {
            return Reply::Accepted;
        }

        tracing::info!(computation = %computation.id, "announcement accepted, contributing");
        let role = Arc::clone(self);
        self.tasks.spawn(async move {
            let comp_id = computation.id;
            role.contribute(computation).await;
            role.in_flight.lock().remove(&comp_id);
        });
        Reply::Accepted
    }

    /// Produce the response, persist it, and scatter the shares.
    async fn contribute(&self, computation: ComputationRecord) {
        let comp_id = computation.id;

        // responding: the value is produced locally and recorded before any
        // share leaves the node.
        let value = self.policy.produce(&computation).await;
        let triple = sharing::split(value);
        let targets = computation.coordinators;
        if let Err(err) = self
            .store
            .record_response(comp_id, value, triple.as_array(), targets)
            .await
        {
            tracing::error!(computation = %comp_id, %err, "failed to persist response");
            self.fatal.raise_if_fatal(&err);
            return;
        }
        self.log_action(comp_id, "respond", serde_json::json!({ "state": "recorded" }))
            .await;

        // sharing: one share to each coordinator, concurrently, each with
        // its own retry budget.
        let shares = triple.as_array();
        let deliveries = futures::future::join_all((0..3).map(|index| {
            let target = targets[index];
            let share_value = shares[index];
            async move {
                let delivery = self
                    .messenger
                    .send(
                        target,
                        Message::Share {
                            comp_id,
                            share_value,
                            share_index: index as u8,
                        },
                    )
                    .await;
                (index, target, delivery)
            }
        }))
        .await;

        let mut all_delivered = true;
        for (index, target, delivery) in deliveries {
            let state = if delivery.is_delivered() {
                DeliveryState::Delivered
            } else {
                all_delivered = false;
                tracing::warn!(
                    computation = %comp_id,
                    coordinator = %target,
                    share_index = index,
                    ?delivery,
                    "share delivery failed permanently"
                );
                DeliveryState::Failed
            };
            if let Err(err) = self.store.set_delivery_state(comp_id, index, state).await {
                tracing::error!(computation = %comp_id, %err, "failed to persist delivery state");
                self.fatal.raise_if_fatal(&err);
            }
            self.log_action(
                comp_id,
                "share",
                serde_json::json!({ "target_index": index, "state": state.to_string() }),
            )
            .await;
        }

        // done | failed. Delivered shares are never recalled; a partial
        // delivery simply leaves this contributor outside the aligned set.
        if all_delivered {
            tracing::info!(computation = %comp_id, contributor = %self.id, "contribution complete");
            self.log_action(comp_id, "done", serde_json::json!({})).await;
        } else {
            tracing::warn!(computation = %comp_id, contributor = %self.id, "contribution incomplete");
            self.log_action(comp_id, "failed", serde_json::json!({})).await;
        }
    }

    async fn log_action(&self, comp_id: ComputationId, kind: &str, payload: serde_json::Value) {
        if let Err(err) = self.store.append_action(comp_id, kind, payload).await {
            tracing::debug!(computation = %comp_id, %err, "action log append failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use trisum_core::{NodeRecord, NodeRole, StoreConfig};
    use trisum_store::RegistryStore;

    struct Fixture {
        _dir: tempfile::TempDir,
        role: Arc<ContributorRole>,
        store: ContributorStore,
        registry: RegistryStore,
    }

    async fn fixture(policy: Arc<dyn ResponsePolicy>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry =
            RegistryStore::open(dir.path().join("registry.db"), StoreConfig::default())
                .await
                .unwrap();
        let store = ContributorStore::open(dir.path().join("node.db"), StoreConfig::default())
            .await
            .unwrap();
        let id = NodeId::new();
        let config = NodeConfig {
            data_dir: dir.path().to_path_buf(),
            reliability: trisum_core::ReliabilityConfig {
                max_attempts: 1,
                base_backoff_ms: 1,
                max_backoff_ms: 1,
                attempt_timeout_ms: 200,
            },
            ..NodeConfig::default()
        };
        let messenger = Messenger::new(id, registry.clone(), config.reliability.clone());
        let (fatal, _fatal_rx) = FatalSignal::new();
        let role = ContributorRole::new(
            id,
            store.clone(),
            messenger,
            policy,
            config,
            Arc::new(TaskSet::new()),
            fatal,
        );
        Fixture {
            _dir: dir,
            role,
            store,
            registry,
        }
    }

    fn announcement() -> ComputationRecord {
        ComputationRecord::new(
            ComputationId::new(),
            NodeId::new(),
            [NodeId::new(), NodeId::new(), NodeId::new()],
            "test prompt",
            Utc::now() + Duration::seconds(30),
            1,
        )
    }

    async fn wait_for_response(
        store: &ContributorStore,
        comp_id: ComputationId,
    ) -> trisum_store::ResponseRecord {
        for _ in 0..100 {
            if let Some(record) = store.load_response(comp_id).await.unwrap() {
                return record;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("no response recorded for {comp_id}");
    }

    #[tokio::test]
    async fn announce_produces_and_persists_a_split_response() {
        let fixture = fixture(Arc::new(FixedResponsePolicy(54))).await;
        let computation = announcement();
        let comp_id = computation.id;

        let reply = fixture
            .role
            .handle(Envelope::new(computation.primary(), Message::Announce {
                computation: computation.clone(),
            }))
            .await;
        assert_eq!(reply, Reply::Accepted);

        let record = wait_for_response(&fixture.store, comp_id).await;
        assert_eq!(record.raw_value, 54);
        assert_eq!(record.targets, computation.coordinators);
        let [s1, s2, s3] = record.shares;
        assert_eq!(sharing::reconstruct(s1, s2, s3), 54);
        let _ = fixture.registry;
    }

    #[tokio::test]
    async fn unreachable_coordinators_mark_deliveries_failed() {
        let fixture = fixture(Arc::new(FixedResponsePolicy(7))).await;
        let computation = announcement();
        let comp_id = computation.id;

        // None of the coordinators exist in the registry, so every delivery
        // fails and the contribution ends in the failed state.
        fixture
            .role
            .handle(Envelope::new(computation.primary(), Message::Announce {
                computation,
            }))
            .await;

        let record = wait_for_response(&fixture.store, comp_id).await;
        for _ in 0..100 {
            let actions = fixture.store.actions(comp_id).await.unwrap();
            if actions.iter().any(|a| a.kind == "failed") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let loaded = fixture.store.load_response(comp_id).await.unwrap().unwrap();
        assert_eq!(loaded.raw_value, record.raw_value);
        assert_eq!(loaded.delivery, [DeliveryState::Failed; 3]);
    }

    #[tokio::test]
    async fn re_announce_is_a_no_op() {
        let fixture = fixture(Arc::new(FixedResponsePolicy(3))).await;
        let computation = announcement();
        let comp_id = computation.id;

        for _ in 0..2 {
            let reply = fixture
                .role
                .handle(Envelope::new(computation.primary(), Message::Announce {
                    computation: computation.clone(),
                }))
                .await;
            assert_eq!(reply, Reply::Accepted);
        }
        wait_for_response(&fixture.store, comp_id).await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        // One respond action, not two.
        let actions = fixture.store.actions(comp_id).await.unwrap();
        assert_eq!(actions.iter().filter(|a| a.kind == "respond").count(), 1);
    }

    #[tokio::test]
    async fn share_messages_are_invalid_for_contributors() {
        let fixture = fixture(Arc::new(UniformResponsePolicy::default())).await;
        let reply = fixture
            .role
            .handle(Envelope::new(NodeId::new(), Message::Share {
                comp_id: ComputationId::new(),
                share_value: 1,
                share_index: 0,
            }))
            .await;
        assert_eq!(
            reply,
            Reply::Rejected {
                kind: RejectKind::InvalidMessage
            }
        );
    }

    #[tokio::test]
    async fn uniform_policy_stays_in_range() {
        let policy = UniformResponsePolicy::default();
        let computation = announcement();
        for _ in 0..50 {
            assert!(policy.produce(&computation).await <= 100);
        }
    }
}
