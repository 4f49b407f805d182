//! Coordinator-side computation lifecycle.
//!
//! Per computation a coordinator moves through
//! `ready → broadcasting → collecting → revealing → finalized`, with `failed`
//! absorbing from any non-terminal phase. The primary (C₁) drives init,
//! announce fan-out, the deadline timer, and the reveal; non-primary
//! coordinators collect shares and answer reveal requests. Transitions for
//! one computation are serialized by its state lock; distinct computations
//! interleave freely.

use crate::aggregator::{restrict, RevealTracker};
use crate::runtime::{FatalSignal, TaskSet};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use trisum_core::{
    ComputationId, ComputationRecord, ComputationStatus, Envelope, FailureReason, Message,
    NodeConfig, NodeId, NodeRole, RejectKind, Reply, TrisumError,
};
use trisum_store::{CoordinatorStore, RegistryStore, ShareUpsert};
use trisum_transport::Messenger;

/// Coordinator-side phase of one computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Ready,
    Broadcasting,
    Collecting,
    Revealing,
    Finalized,
    Failed,
}

impl Phase {
    fn accepts_shares(self) -> bool {
        matches!(self, Self::Ready | Self::Broadcasting | Self::Collecting)
    }
}

struct CompState {
    record: ComputationRecord,
    phase: Phase,
    /// Present on the primary while revealing: the current reveal round.
    reveal: Option<RevealTracker>,
}

/// The coordinator role of a node.
pub struct CoordinatorRole {
    id: NodeId,
    registry: RegistryStore,
    store: CoordinatorStore,
    messenger: Messenger,
    config: NodeConfig,
    computations: Mutex<HashMap<ComputationId, Arc<AsyncMutex<CompState>>>>,
    tasks: Arc<TaskSet>,
    fatal: FatalSignal,
}

impl CoordinatorRole {
    pub fn new(
        id: NodeId,
        registry: RegistryStore,
        store: CoordinatorStore,
        messenger: Messenger,
        config: NodeConfig,
        tasks: Arc<TaskSet>,
        fatal: FatalSignal,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            registry,
            store,
            messenger,
            config,
            computations: Mutex::new(HashMap::new()),
            tasks,
            fatal,
        })
    }

    /// Resume in-flight computations from the registry after a restart.
    ///
    /// Collection state is rebuilt from the share ledger; the primary
    /// re-arms the deadline timer (firing immediately for past deadlines),
    /// which re-runs the reveal where one was interrupted.
    pub async fn recover(self: &Arc<Self>) -> Result<(), TrisumError> {
        let unfinished = self
            .registry
            .list_unfinished()
            .await
            .map_err(TrisumError::from)?;
        for record in unfinished {
            if record.coordinator_index(&self.id).is_none() {
                continue;
            }
            let comp_id = record.id;
            let is_primary = record.is_primary(&self.id);
            let inserted = self.insert_computation(record, Phase::Collecting);
            if !inserted {
                continue;
            }
            tracing::info!(computation = %comp_id, is_primary, "resuming computation");
            if is_primary {
                let role = Arc::clone(self);
                self.tasks.spawn(async move {
                    role.await_deadline_and_reveal(comp_id).await;
                });
            }
        }
        Ok(())
    }

    /// Dispatch one inbound envelope.
    pub async fn handle(self: &Arc<Self>, envelope: Envelope) -> Reply {
        let sender = envelope.sender_id;
        match envelope.message {
            Message::Propose { computation } => self.handle_propose(computation).await,
            Message::Init { computation } => self.handle_init(computation).await,
            Message::Share {
                comp_id,
                share_value,
                share_index,
            } => {
                self.handle_share(sender, comp_id, share_value, share_index)
                    .await
            }
            Message::RevealRequest {
                comp_id,
                participants,
            } => self.handle_reveal_request(sender, comp_id, participants).await,
            Message::PartialSum {
                comp_id,
                partial_sum,
                participants,
            } => {
                self.handle_partial_sum(sender, comp_id, partial_sum, participants)
                    .await
            }
            Message::Health => Reply::Accepted,
            Message::Announce { .. } => Reply::Rejected {
                kind: RejectKind::InvalidMessage,
            },
        }
    }

    async fn handle_propose(self: &Arc<Self>, computation: ComputationRecord) -> Reply {
        if !computation.is_primary(&self.id) {
            tracing::warn!(
                computation = %computation.id,
                "propose routed to a non-primary coordinator"
            );
            return Reply::Rejected {
                kind: RejectKind::InvalidMessage,
            };
        }
        let comp_id = computation.id;
        if !self.insert_computation(computation, Phase::Ready) {
            tracing::warn!(computation = %comp_id, "re-issued propose rejected");
            return Reply::Rejected {
                kind: RejectKind::InvalidMessage,
            };
        }
        tracing::info!(computation = %comp_id, "computation accepted, driving lifecycle");
        let role = Arc::clone(self);
        self.tasks.spawn(async move {
            role.drive_primary(comp_id).await;
        });
        Reply::Accepted
    }

    async fn handle_init(self: &Arc<Self>, computation: ComputationRecord) -> Reply {
        match computation.coordinator_index(&self.id) {
            Some(1) | Some(2) => {}
            _ => {
                tracing::warn!(computation = %computation.id, "init for a foreign computation");
                return Reply::Rejected {
                    kind: RejectKind::InvalidMessage,
                };
            }
        }
        let comp_id = computation.id;
        // Idempotent: a retried init finds the computation adopted and acks
        // again. Non-primary coordinators collect from adoption onwards.
        self.insert_computation(computation, Phase::Collecting);
        tracing::debug!(computation = %comp_id, "computation adopted");
        Reply::InitAck {
            comp_id,
            ready: true,
        }
    }

    async fn handle_share(
        self: &Arc<Self>,
        sender: NodeId,
        comp_id: ComputationId,
        share_value: u32,
        share_index: u8,
    ) -> Reply {
        let Some(entry) = self.entry_or_wait(comp_id).await else {
            tracing::warn!(computation = %comp_id, contributor = %sender, "share for unknown computation dropped");
            return Reply::Rejected {
                kind: RejectKind::UnknownComputation,
            };
        };
        let state = entry.lock().await;
        if !state.phase.accepts_shares() || Utc::now() > state.record.deadline {
            tracing::info!(
                computation = %comp_id,
                contributor = %sender,
                phase = ?state.phase,
                "late share dropped"
            );
            return Reply::Rejected {
                kind: RejectKind::LateShare,
            };
        }
        if state.record.coordinator_index(&self.id) != Some(usize::from(share_index)) {
            tracing::warn!(
                computation = %comp_id,
                contributor = %sender,
                share_index,
                "share index does not match this coordinator"
            );
            return Reply::Rejected {
                kind: RejectKind::InvalidMessage,
            };
        }

        match self
            .store
            .record_share(comp_id, sender, share_value, Utc::now())
            .await
        {
            Ok(ShareUpsert::Inserted) => {
                tracing::debug!(computation = %comp_id, contributor = %sender, "share recorded");
                Reply::Accepted
            }
            Ok(ShareUpsert::DuplicateIdentical) => {
                // Re-send of the recorded share: no-op on coordinator state.
                tracing::debug!(computation = %comp_id, contributor = %sender, "duplicate share re-send ignored");
                Reply::Accepted
            }
            Ok(ShareUpsert::DuplicateConflicting) => {
                tracing::warn!(
                    computation = %comp_id,
                    contributor = %sender,
                    "conflicting duplicate share dropped, first share retained"
                );
                Reply::Rejected {
                    kind: RejectKind::DuplicateShare,
                }
            }
            Err(err) => {
                tracing::error!(computation = %comp_id, %err, "failed to record share");
                self.fatal.raise_if_fatal(&err);
                Reply::Rejected {
                    kind: RejectKind::InvalidMessage,
                }
            }
        }
    }

    async fn handle_reveal_request(
        self: &Arc<Self>,
        sender: NodeId,
        comp_id: ComputationId,
        proposed: BTreeSet<NodeId>,
    ) -> Reply {
        let Some(entry) = self.entry_or_wait(comp_id).await else {
            tracing::warn!(computation = %comp_id, "reveal request for unknown computation");
            return Reply::Rejected {
                kind: RejectKind::UnknownComputation,
            };
        };
        let mut state = entry.lock().await;
        if state.record.primary() != sender || state.record.is_primary(&self.id) {
            tracing::warn!(computation = %comp_id, %sender, "reveal request from a non-primary sender");
            return Reply::Rejected {
                kind: RejectKind::InvalidMessage,
            };
        }
        if matches!(state.phase, Phase::Finalized | Phase::Failed) {
            return Reply::Rejected {
                kind: RejectKind::InvalidMessage,
            };
        }
        state.phase = Phase::Revealing;

        let local = match self.store.participants(comp_id).await {
            Ok(local) => local,
            Err(err) => {
                tracing::error!(computation = %comp_id, %err, "failed to load participant set");
                self.fatal.raise_if_fatal(&err);
                return Reply::Rejected {
                    kind: RejectKind::InvalidMessage,
                };
            }
        };
        let restricted = restrict(&local, &proposed);
        let partial = match self.store.partial_sum_over(comp_id, &restricted).await {
            Ok(sum) => sum,
            Err(err) => {
                tracing::error!(computation = %comp_id, %err, "failed to compute partial sum");
                self.fatal.raise_if_fatal(&err);
                return Reply::Rejected {
                    kind: RejectKind::InvalidMessage,
                };
            }
        };
        if let Err(err) = self
            .store
            .record_partial_sum(comp_id, partial, &restricted)
            .await
        {
            tracing::error!(computation = %comp_id, %err, "failed to persist partial sum");
            self.fatal.raise_if_fatal(&err);
        }
        tracing::info!(
            computation = %comp_id,
            local = local.len(),
            restricted = restricted.len(),
            "answering reveal request with restricted partial sum"
        );

        let role = Arc::clone(self);
        self.tasks.spawn(async move {
            let delivery = role
                .messenger
                .send(
                    sender,
                    Message::PartialSum {
                        comp_id,
                        partial_sum: partial,
                        participants: restricted,
                    },
                )
                .await;
            if !delivery.is_delivered() {
                tracing::warn!(computation = %comp_id, ?delivery, "partial sum delivery failed");
            }
        });
        Reply::Accepted
    }

    async fn handle_partial_sum(
        self: &Arc<Self>,
        sender: NodeId,
        comp_id: ComputationId,
        partial_sum: u32,
        participants: BTreeSet<NodeId>,
    ) -> Reply {
        let entry = { self.computations.lock().get(&comp_id).cloned() };
        let Some(entry) = entry else {
            return Reply::Rejected {
                kind: RejectKind::UnknownComputation,
            };
        };
        let mut state = entry.lock().await;
        if !state.record.is_primary(&self.id) {
            return Reply::Rejected {
                kind: RejectKind::InvalidMessage,
            };
        }
        match state.phase {
            Phase::Revealing => {}
            // A stale re-send after finalization changes nothing.
            Phase::Finalized | Phase::Failed => return Reply::Accepted,
            _ => {
                tracing::warn!(computation = %comp_id, %sender, "partial sum outside the revealing phase");
                return Reply::Rejected {
                    kind: RejectKind::InvalidMessage,
                };
            }
        }
        let Some(tracker) = state.reveal.as_mut() else {
            return Reply::Rejected {
                kind: RejectKind::InvalidMessage,
            };
        };
        let Some(round) = tracker.record(sender, partial_sum, participants) else {
            return Reply::Accepted;
        };

        let aligned = round.aligned();
        let threshold = state.record.min_participants;
        if (aligned.len() as u32) < threshold {
            // The aligned set only shrinks across rounds; below the
            // threshold there is nothing left to reveal.
            tracing::info!(
                computation = %comp_id,
                aligned = aligned.len(),
                threshold,
                "threshold not met at reveal"
            );
            self.finalize_failed(
                &mut state,
                comp_id,
                FailureReason::ThresholdNotMet,
                Some(aligned.len() as u32),
            )
            .await;
            return Reply::Accepted;
        }

        if !round.is_converged() {
            // At least one responder still counts a contributor outside the
            // aligned set; re-request over the shrunken set.
            tracing::debug!(
                computation = %comp_id,
                aligned = aligned.len(),
                "participant sets diverge, starting another reveal round"
            );
            let responders = self.responders(&state.record);
            state.reveal = Some(RevealTracker::new(responders));
            drop(state);
            let role = Arc::clone(self);
            self.tasks.spawn(async move {
                role.send_reveal_request(comp_id, aligned).await;
            });
            return Reply::Accepted;
        }

        let own_sum = match self.store.partial_sum_over(comp_id, &aligned).await {
            Ok(sum) => sum,
            Err(err) => {
                tracing::error!(computation = %comp_id, %err, "failed to compute own partial sum");
                self.fatal.raise_if_fatal(&err);
                return Reply::Rejected {
                    kind: RejectKind::InvalidMessage,
                };
            }
        };
        if let Err(err) = self.store.record_partial_sum(comp_id, own_sum, &aligned).await {
            tracing::error!(computation = %comp_id, %err, "failed to persist own partial sum");
            self.fatal.raise_if_fatal(&err);
        }
        let result = round.reconstruct_with(own_sum);
        let participants_count = aligned.len() as u32;

        match self
            .registry
            .complete_computation(comp_id, result, participants_count)
            .await
        {
            Ok(()) => {
                state.phase = Phase::Finalized;
                state.reveal = None;
                tracing::info!(
                    computation = %comp_id,
                    result,
                    participants = participants_count,
                    "computation completed"
                );
            }
            Err(err) => {
                tracing::error!(computation = %comp_id, %err, "failed to finalize computation");
                self.fatal.raise_if_fatal(&err);
            }
        }
        Reply::Accepted
    }

    /// Primary lifecycle: init the peer coordinators, announce to the
    /// contributors, then wait out the deadline and reveal.
    async fn drive_primary(self: Arc<Self>, comp_id: ComputationId) {
        let Some(entry) = self.entry(comp_id) else {
            return;
        };
        let record = entry.lock().await.record.clone();
        let responders = self.responders(&record);

        // Init both peers; missing acks inside the window fail the
        // computation.
        let init = tokio::time::timeout(
            self.config.timing.init_window(),
            self.messenger.broadcast(&responders, |_| Message::Init {
                computation: record.clone(),
            }),
        )
        .await;
        let acked = match init {
            Ok(outcomes) => outcomes.values().all(|delivery| {
                matches!(
                    delivery.reply(),
                    Some(Reply::InitAck { ready: true, .. })
                )
            }),
            Err(_elapsed) => false,
        };
        if !acked {
            tracing::warn!(computation = %comp_id, "init acks missing within the init window");
            let mut state = entry.lock().await;
            self.finalize_failed(&mut state, comp_id, FailureReason::InitTimeout, None)
                .await;
            return;
        }

        // Fan out the announcement to every currently active contributor.
        // Best effort: collection runs until the deadline regardless.
        entry.lock().await.phase = Phase::Broadcasting;
        self.set_registry_status(comp_id, ComputationStatus::Broadcasting)
            .await;
        let contributors: Vec<NodeId> = match self.registry.list_active(NodeRole::Contributor).await
        {
            Ok(records) => records.into_iter().map(|r| r.id).collect(),
            Err(err) => {
                tracing::error!(computation = %comp_id, %err, "failed to list contributors");
                self.fatal.raise_if_fatal(&err);
                Vec::new()
            }
        };
        let outcomes = self
            .messenger
            .broadcast(&contributors, |_| Message::Announce {
                computation: record.clone(),
            })
            .await;
        let reached = outcomes.values().filter(|d| d.is_delivered()).count();
        tracing::info!(
            computation = %comp_id,
            contributors = contributors.len(),
            reached,
            "announcement fan-out complete"
        );

        entry.lock().await.phase = Phase::Collecting;
        self.set_registry_status(comp_id, ComputationStatus::Collecting)
            .await;

        self.await_deadline_and_reveal(comp_id).await;
    }

    /// Sleep until the computation deadline, then start the reveal.
    async fn await_deadline_and_reveal(self: &Arc<Self>, comp_id: ComputationId) {
        let Some(entry) = self.entry(comp_id) else {
            return;
        };
        let deadline = entry.lock().await.record.deadline;
        let wait = (deadline - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        tokio::time::sleep(wait).await;

        let mut state = entry.lock().await;
        if state.phase != Phase::Collecting {
            return;
        }
        state.phase = Phase::Revealing;
        let responders = self.responders(&state.record);
        state.reveal = Some(RevealTracker::new(responders));
        drop(state);

        self.set_registry_status(comp_id, ComputationStatus::Revealing)
            .await;
        let proposed = match self.store.participants(comp_id).await {
            Ok(participants) => participants,
            Err(err) => {
                tracing::error!(computation = %comp_id, %err, "failed to load participant set at deadline");
                self.fatal.raise_if_fatal(&err);
                let mut state = entry.lock().await;
                self.finalize_failed(&mut state, comp_id, FailureReason::Transient, None)
                    .await;
                return;
            }
        };
        tracing::info!(
            computation = %comp_id,
            participants = proposed.len(),
            "deadline reached, revealing"
        );
        self.send_reveal_request(comp_id, proposed).await;
    }

    /// Deliver a reveal request carrying `proposed` to both responders. A
    /// permanent delivery failure fails the computation: without both
    /// partial sums the result can never be reconstructed.
    async fn send_reveal_request(self: &Arc<Self>, comp_id: ComputationId, proposed: BTreeSet<NodeId>) {
        let Some(entry) = self.entry(comp_id) else {
            return;
        };
        let responders = {
            let state = entry.lock().await;
            self.responders(&state.record)
        };
        let outcomes = self
            .messenger
            .broadcast(&responders, |_| Message::RevealRequest {
                comp_id,
                participants: proposed.clone(),
            })
            .await;
        if outcomes.values().any(|delivery| !delivery.is_delivered()) {
            tracing::warn!(computation = %comp_id, "reveal request delivery failed");
            let mut state = entry.lock().await;
            self.finalize_failed(&mut state, comp_id, FailureReason::Transient, None)
                .await;
        }
    }

    async fn finalize_failed(
        &self,
        state: &mut CompState,
        comp_id: ComputationId,
        reason: FailureReason,
        participants_count: Option<u32>,
    ) {
        if matches!(state.phase, Phase::Finalized | Phase::Failed) {
            return;
        }
        state.phase = Phase::Failed;
        state.reveal = None;
        if let Err(err) = self
            .registry
            .fail_computation(comp_id, reason, participants_count)
            .await
        {
            tracing::error!(computation = %comp_id, %err, "failed to record computation failure");
            self.fatal.raise_if_fatal(&err);
        }
    }

    async fn set_registry_status(&self, comp_id: ComputationId, status: ComputationStatus) {
        if let Err(err) = self.registry.set_computation_status(comp_id, status).await {
            tracing::warn!(computation = %comp_id, %status, %err, "registry status update failed");
            self.fatal.raise_if_fatal(&err);
        }
    }

    fn responders(&self, record: &ComputationRecord) -> [NodeId; 2] {
        [record.coordinators[1], record.coordinators[2]]
    }

    fn entry(&self, comp_id: ComputationId) -> Option<Arc<AsyncMutex<CompState>>> {
        self.computations.lock().get(&comp_id).cloned()
    }

    fn insert_computation(&self, record: ComputationRecord, phase: Phase) -> bool {
        let mut computations = self.computations.lock();
        if computations.contains_key(&record.id) {
            return false;
        }
        computations.insert(
            record.id,
            Arc::new(AsyncMutex::new(CompState {
                record,
                phase,
                reveal: None,
            })),
        );
        true
    }

    /// Look up a computation, parking briefly to absorb init/share races.
    /// Messages still unknown after the pending window are dropped.
    async fn entry_or_wait(&self, comp_id: ComputationId) -> Option<Arc<AsyncMutex<CompState>>> {
        let deadline =
            tokio::time::Instant::now() + self.config.timing.pending_window();
        loop {
            if let Some(entry) = self.entry(comp_id) {
                return Some(entry);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use trisum_core::{ReliabilityConfig, StoreConfig, TimingConfig};

    struct Fixture {
        _dir: tempfile::TempDir,
        role: Arc<CoordinatorRole>,
        registry: RegistryStore,
    }

    async fn fixture(id: NodeId) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry =
            RegistryStore::open(dir.path().join("registry.db"), StoreConfig::default())
                .await
                .unwrap();
        let store = CoordinatorStore::open(dir.path().join("node.db"), StoreConfig::default())
            .await
            .unwrap();
        let config = NodeConfig {
            data_dir: dir.path().to_path_buf(),
            reliability: ReliabilityConfig {
                max_attempts: 1,
                base_backoff_ms: 1,
                max_backoff_ms: 1,
                attempt_timeout_ms: 100,
            },
            timing: TimingConfig {
                pending_window_ms: 200,
                ..TimingConfig::default()
            },
            ..NodeConfig::default()
        };
        let messenger = Messenger::new(id, registry.clone(), config.reliability.clone());
        let (fatal, _fatal_rx) = FatalSignal::new();
        let role = CoordinatorRole::new(
            id,
            registry.clone(),
            store,
            messenger,
            config,
            Arc::new(TaskSet::new()),
            fatal,
        );
        Fixture {
            _dir: dir,
            role,
            registry,
        }
    }

    fn record_with(coordinators: [NodeId; 3], deadline_secs: i64) -> ComputationRecord {
        ComputationRecord::new(
            ComputationId::new(),
            NodeId::new(),
            coordinators,
            "test prompt",
            Utc::now() + Duration::seconds(deadline_secs),
            1,
        )
    }

    #[tokio::test]
    async fn init_adopts_and_shares_are_collected() {
        let me = NodeId::new();
        let fixture = fixture(me).await;
        let record = record_with([NodeId::new(), me, NodeId::new()], 30);
        let comp_id = record.id;

        let reply = fixture
            .role
            .handle(Envelope::new(record.primary(), Message::Init {
                computation: record.clone(),
            }))
            .await;
        assert_eq!(
            reply,
            Reply::InitAck {
                comp_id,
                ready: true
            }
        );

        let contributor = NodeId::new();
        let reply = fixture
            .role
            .handle(Envelope::new(contributor, Message::Share {
                comp_id,
                share_value: 17,
                share_index: 1,
            }))
            .await;
        assert_eq!(reply, Reply::Accepted);

        // Identical re-send is a no-op; a conflicting value is rejected.
        let reply = fixture
            .role
            .handle(Envelope::new(contributor, Message::Share {
                comp_id,
                share_value: 17,
                share_index: 1,
            }))
            .await;
        assert_eq!(reply, Reply::Accepted);
        let reply = fixture
            .role
            .handle(Envelope::new(contributor, Message::Share {
                comp_id,
                share_value: 18,
                share_index: 1,
            }))
            .await;
        assert_eq!(
            reply,
            Reply::Rejected {
                kind: RejectKind::DuplicateShare
            }
        );
    }

    #[tokio::test]
    async fn share_with_wrong_index_is_invalid() {
        let me = NodeId::new();
        let fixture = fixture(me).await;
        let record = record_with([NodeId::new(), me, NodeId::new()], 30);
        let comp_id = record.id;

        fixture
            .role
            .handle(Envelope::new(record.primary(), Message::Init {
                computation: record,
            }))
            .await;

        let reply = fixture
            .role
            .handle(Envelope::new(NodeId::new(), Message::Share {
                comp_id,
                share_value: 5,
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
    async fn late_share_is_rejected() {
        let me = NodeId::new();
        let fixture = fixture(me).await;
        // Deadline already in the past.
        let record = record_with([NodeId::new(), me, NodeId::new()], -5);
        let comp_id = record.id;

        fixture
            .role
            .handle(Envelope::new(record.primary(), Message::Init {
                computation: record,
            }))
            .await;

        let reply = fixture
            .role
            .handle(Envelope::new(NodeId::new(), Message::Share {
                comp_id,
                share_value: 5,
                share_index: 1,
            }))
            .await;
        assert_eq!(
            reply,
            Reply::Rejected {
                kind: RejectKind::LateShare
            }
        );
    }

    #[tokio::test]
    async fn unknown_computation_is_dropped_after_the_pending_window() {
        let me = NodeId::new();
        let fixture = fixture(me).await;

        let started = std::time::Instant::now();
        let reply = fixture
            .role
            .handle(Envelope::new(NodeId::new(), Message::Share {
                comp_id: ComputationId::new(),
                share_value: 5,
                share_index: 1,
            }))
            .await;
        assert_eq!(
            reply,
            Reply::Rejected {
                kind: RejectKind::UnknownComputation
            }
        );
        // The pending queue parked the message for the configured window.
        assert!(started.elapsed() >= std::time::Duration::from_millis(200));
    }

    #[tokio::test]
    async fn share_parked_during_init_race_is_absorbed() {
        let me = NodeId::new();
        let fixture = fixture(me).await;
        let record = record_with([NodeId::new(), me, NodeId::new()], 30);
        let comp_id = record.id;

        // The share arrives before init; the pending queue holds it until
        // the computation is adopted.
        let role = Arc::clone(&fixture.role);
        let contributor = NodeId::new();
        let share = tokio::spawn(async move {
            role.handle(Envelope::new(contributor, Message::Share {
                comp_id,
                share_value: 9,
                share_index: 1,
            }))
            .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        fixture
            .role
            .handle(Envelope::new(record.primary(), Message::Init {
                computation: record,
            }))
            .await;

        assert_eq!(share.await.unwrap(), Reply::Accepted);
    }

    #[tokio::test]
    async fn reveal_request_restricts_to_the_proposed_set() {
        let me = NodeId::new();
        let fixture = fixture(me).await;
        let primary = NodeId::new();
        let record = record_with([primary, me, NodeId::new()], 30);
        let comp_id = record.id;

        fixture
            .role
            .handle(Envelope::new(primary, Message::Init {
                computation: record,
            }))
            .await;

        let kept = NodeId::new();
        let dropped = NodeId::new();
        for (contributor, value) in [(kept, 11u32), (dropped, 70)] {
            let reply = fixture
                .role
                .handle(Envelope::new(contributor, Message::Share {
                    comp_id,
                    share_value: value,
                    share_index: 1,
                }))
                .await;
            assert_eq!(reply, Reply::Accepted);
        }

        // The primary proposes a set missing one local contributor.
        let reply = fixture
            .role
            .handle(Envelope::new(primary, Message::RevealRequest {
                comp_id,
                participants: BTreeSet::from([kept]),
            }))
            .await;
        assert_eq!(reply, Reply::Accepted);

        // Late shares are rejected once revealing.
        let reply = fixture
            .role
            .handle(Envelope::new(NodeId::new(), Message::Share {
                comp_id,
                share_value: 1,
                share_index: 1,
            }))
            .await;
        assert_eq!(
            reply,
            Reply::Rejected {
                kind: RejectKind::LateShare
            }
        );
        let _ = fixture.registry;
    }

    #[tokio::test]
    async fn reveal_request_from_non_primary_is_rejected() {
        let me = NodeId::new();
        let fixture = fixture(me).await;
        let record = record_with([NodeId::new(), me, NodeId::new()], 30);
        let comp_id = record.id;

        fixture
            .role
            .handle(Envelope::new(record.primary(), Message::Init {
                computation: record,
            }))
            .await;

        let reply = fixture
            .role
            .handle(Envelope::new(NodeId::new(), Message::RevealRequest {
                comp_id,
                participants: BTreeSet::new(),
            }))
            .await;
        assert_eq!(
            reply,
            Reply::Rejected {
                kind: RejectKind::InvalidMessage
            }
        );
    }
}
