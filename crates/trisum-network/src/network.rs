//! The network façade.

use crate::error::NetworkError;
use crate::spawn::{bind_endpoint, launch, NodeHandle};
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use trisum_core::{
    ComputationId, ComputationRecord, ComputationStatus, FailureReason, Message, NodeConfig,
    NodeId, NodeRecord, NodeRole, NodeStatus, ReliabilityConfig, Reply, StoreConfig, TimingConfig,
    TrisumError,
};
use trisum_node::{NodeSpec, ResponsePolicy, UniformResponsePolicy};
use trisum_store::RegistryStore;
use trisum_transport::{Delivery, Messenger};

/// Node inventory snapshot returned by [`Network::status_of_network`].
#[derive(Debug, Clone, Serialize)]
pub struct NetworkStatus {
    pub nodes: Vec<NodeRecord>,
    pub coordinator_count: usize,
    pub contributor_count: usize,
}

/// Configures and starts a [`Network`].
pub struct NetworkBuilder {
    coordinators: u32,
    contributor_policies: Vec<Arc<dyn ResponsePolicy>>,
    default_policy: Arc<dyn ResponsePolicy>,
    data_dir: Option<PathBuf>,
    reliability: ReliabilityConfig,
    timing: TimingConfig,
    store: StoreConfig,
}

impl NetworkBuilder {
    pub fn new() -> Self {
        Self {
            coordinators: 3,
            contributor_policies: Vec::new(),
            default_policy: Arc::new(UniformResponsePolicy::default()),
            data_dir: None,
            reliability: ReliabilityConfig::default(),
            timing: TimingConfig::default(),
            store: StoreConfig::default(),
        }
    }

    /// Number of coordinators to spawn. The three-party reveal requires
    /// exactly three; larger values are rejected at start.
    pub fn coordinators(mut self, count: u32) -> Self {
        self.coordinators = count;
        self
    }

    /// Append `count` contributors using the default response policy.
    pub fn contributors(mut self, count: u32) -> Self {
        for _ in 0..count {
            self.contributor_policies.push(self.default_policy.clone());
        }
        self
    }

    /// Append one contributor with a specific response policy.
    pub fn contributor_with_policy(mut self, policy: Arc<dyn ResponsePolicy>) -> Self {
        self.contributor_policies.push(policy);
        self
    }

    /// Response policy used by contributors added after this call via
    /// [`Self::contributors`].
    pub fn default_policy(mut self, policy: Arc<dyn ResponsePolicy>) -> Self {
        self.default_policy = policy;
        self
    }

    /// Root directory for the registry and per-node stores. Defaults to a
    /// temporary directory owned by the network.
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(path.into());
        self
    }

    pub fn reliability(mut self, config: ReliabilityConfig) -> Self {
        self.reliability = config;
        self
    }

    pub fn timing(mut self, config: TimingConfig) -> Self {
        self.timing = config;
        self
    }

    pub fn store(mut self, config: StoreConfig) -> Self {
        self.store = config;
        self
    }

    /// Spawn every node, wait for the whole network to become reachable,
    /// and return the running façade.
    pub async fn start(self) -> Result<Network, NetworkError> {
        if self.coordinators > 3 {
            return Err(NetworkError::precondition(format!(
                "the three-party reveal runs on exactly three coordinators, {} requested",
                self.coordinators
            )));
        }

        let (scratch, base_dir) = match self.data_dir {
            Some(dir) => (None, dir),
            None => {
                let scratch = TempDir::new()
                    .map_err(|e| NetworkError::startup(format!("scratch directory: {e}")))?;
                let dir = scratch.path().to_path_buf();
                (Some(scratch), dir)
            }
        };
        let nodes_dir = base_dir.join("nodes");
        std::fs::create_dir_all(&nodes_dir)
            .map_err(|e| NetworkError::startup(format!("create {}: {e}", nodes_dir.display())))?;
        let registry_path = base_dir.join("registry.db");
        let registry = RegistryStore::open(&registry_path, self.store.clone()).await?;

        let node_config = NodeConfig {
            data_dir: nodes_dir,
            network: trisum_core::NetworkConfig::default(),
            reliability: self.reliability.clone(),
            timing: self.timing.clone(),
            store: self.store.clone(),
        };

        let client_id = NodeId::new();
        let messenger = Messenger::new(client_id, registry.clone(), self.reliability.clone());

        let mut network = Network {
            client_id,
            registry,
            registry_path,
            messenger,
            config: node_config,
            nodes: Vec::new(),
            _scratch: scratch,
            base_dir,
        };

        let mut planned: Vec<(NodeRole, Arc<dyn ResponsePolicy>)> = Vec::new();
        for _ in 0..self.coordinators {
            planned.push((NodeRole::Coordinator, self.default_policy.clone()));
        }
        for policy in self.contributor_policies {
            planned.push((NodeRole::Contributor, policy));
        }
        for (role, policy) in planned {
            if let Err(err) = network.spawn(role, policy).await {
                network.abort_startup().await;
                return Err(err);
            }
        }

        if let Err(err) = network.await_reachable().await {
            network.abort_startup().await;
            return Err(err);
        }
        tracing::info!(
            coordinators = self.coordinators,
            contributors = network
                .nodes
                .iter()
                .filter(|n| n.role == NodeRole::Contributor)
                .count(),
            "network started"
        );
        Ok(network)
    }
}

impl Default for NetworkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running local aggregation network.
#[derive(Debug)]
pub struct Network {
    client_id: NodeId,
    registry: RegistryStore,
    registry_path: PathBuf,
    messenger: Messenger,
    config: NodeConfig,
    nodes: Vec<NodeHandle>,
    _scratch: Option<TempDir>,
    base_dir: PathBuf,
}

impl Network {
    /// Start a network with `num_coordinators` coordinators and
    /// `num_contributors` contributors using default settings.
    pub async fn start(
        num_coordinators: u32,
        num_contributors: u32,
    ) -> Result<Self, NetworkError> {
        NetworkBuilder::new()
            .coordinators(num_coordinators)
            .contributors(num_contributors)
            .start()
            .await
    }

    /// Builder with full control over policies, timings, and storage.
    pub fn builder() -> NetworkBuilder {
        NetworkBuilder::new()
    }

    async fn spawn(
        &mut self,
        role: NodeRole,
        policy: Arc<dyn ResponsePolicy>,
    ) -> Result<(), NetworkError> {
        let listener = bind_endpoint(&self.config.network.bind_address)?;
        let endpoint = listener
            .local_addr()
            .map_err(|e| NetworkError::startup(format!("local address: {e}")))?;
        let id = NodeId::new();
        self.registry
            .register_node(&NodeRecord::new(id, role, endpoint))
            .await?;
        let spec = NodeSpec {
            id,
            role,
            listener,
            registry_path: self.registry_path.clone(),
            config: self.config.clone(),
            policy,
        };
        let handle = launch(spec, endpoint)?;
        tracing::debug!(node = %id, %role, %endpoint, "node spawned");
        self.nodes.push(handle);
        Ok(())
    }

    /// Block until every spawned node answers a health probe, bounded by
    /// the startup window.
    async fn await_reachable(&self) -> Result<(), NetworkError> {
        let deadline = tokio::time::Instant::now() + self.config.timing.startup_window();
        for node in &self.nodes {
            loop {
                if self
                    .messenger
                    .probe(node.endpoint, self.config.timing.health_timeout())
                    .await
                {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(NetworkError::startup(format!(
                        "node {} did not become reachable within the startup window",
                        node.id
                    )));
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
        Ok(())
    }

    async fn abort_startup(&mut self) {
        for node in &self.nodes {
            node.signal_shutdown();
        }
        let mut nodes = std::mem::take(&mut self.nodes);
        let _ = tokio::task::spawn_blocking(move || {
            for node in &mut nodes {
                let _ = node.join();
            }
        })
        .await;
    }

    /// Propose a new computation: select C₁–C₃, write the registry record,
    /// and route `propose` to the primary. Returns once the primary
    /// acknowledges acceptance.
    pub async fn propose_computation(
        &self,
        prompt: &str,
        deadline_seconds: u64,
        min_participants: u32,
    ) -> Result<ComputationId, NetworkError> {
        if deadline_seconds == 0 {
            return Err(NetworkError::precondition("deadline_seconds must be > 0"));
        }
        if min_participants == 0 {
            return Err(NetworkError::precondition("min_participants must be >= 1"));
        }
        let coordinators = self.registry.list_active(NodeRole::Coordinator).await?;
        if coordinators.len() < 3 {
            return Err(NetworkError::precondition(format!(
                "propose requires three active coordinators, found {}",
                coordinators.len()
            )));
        }
        let chosen = [
            coordinators[0].id,
            coordinators[1].id,
            coordinators[2].id,
        ];

        let record = ComputationRecord::new(
            ComputationId::new(),
            self.client_id,
            chosen,
            prompt,
            Utc::now() + ChronoDuration::seconds(deadline_seconds as i64),
            min_participants,
        );
        self.registry.insert_computation(&record).await?;
        tracing::info!(
            computation = %record.id,
            primary = %record.primary(),
            deadline_seconds,
            min_participants,
            "computation proposed"
        );

        let delivery = self
            .messenger
            .send(
                record.primary(),
                Message::Propose {
                    computation: record.clone(),
                },
            )
            .await;
        match delivery {
            Delivery::Delivered(Reply::Accepted) => Ok(record.id),
            other => {
                // Without an accepted propose the lifecycle never starts;
                // fail the record so await_result callers are not stranded.
                let _ = self
                    .registry
                    .fail_computation(record.id, FailureReason::Transient, None)
                    .await;
                Err(NetworkError::Core(TrisumError::transport(format!(
                    "primary did not accept propose: {other:?}"
                ))))
            }
        }
    }

    /// Poll the registry until the computation reaches a terminal status or
    /// `timeout` elapses. The timeout only affects this caller, never the
    /// computation.
    pub async fn await_result(
        &self,
        comp_id: ComputationId,
        timeout: Duration,
    ) -> Result<ComputationRecord, NetworkError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let record = self
                .registry
                .load_computation(comp_id)
                .await?
                .ok_or(NetworkError::UnknownComputation(comp_id))?;
            match record.status {
                ComputationStatus::Completed => return Ok(record),
                ComputationStatus::Failed => {
                    return Err(NetworkError::ComputationFailed {
                        reason: record.failure.unwrap_or(FailureReason::Transient),
                    })
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(NetworkError::Timeout(format!("computation {comp_id}")));
            }
            tokio::time::sleep(self.config.timing.result_poll_interval()).await;
        }
    }

    /// The current registry record of a computation.
    pub async fn status(&self, comp_id: ComputationId) -> Result<ComputationRecord, NetworkError> {
        self.registry
            .load_computation(comp_id)
            .await?
            .ok_or(NetworkError::UnknownComputation(comp_id))
    }

    /// Node inventory with per-role counts of active nodes.
    pub async fn status_of_network(&self) -> Result<NetworkStatus, NetworkError> {
        let nodes = self.registry.list_nodes().await?;
        let coordinator_count = nodes
            .iter()
            .filter(|n| n.role == NodeRole::Coordinator && n.status == NodeStatus::Active)
            .count();
        let contributor_count = nodes
            .iter()
            .filter(|n| n.role == NodeRole::Contributor && n.status == NodeStatus::Active)
            .count();
        Ok(NetworkStatus {
            nodes,
            coordinator_count,
            contributor_count,
        })
    }

    /// Handle to the shared registry store.
    pub fn registry(&self) -> &RegistryStore {
        &self.registry
    }

    /// Root data directory (registry and per-node stores live below it).
    pub fn data_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of one node's private store file.
    pub fn node_store_path(&self, id: NodeId) -> PathBuf {
        self.config.data_dir.join(format!("{id}.db"))
    }

    /// Gracefully tear down every owned node: signal cancellation, wait for
    /// teardown confirmation, and clear remaining registry rows.
    pub async fn shutdown(mut self) -> Result<(), NetworkError> {
        for node in &self.nodes {
            node.signal_shutdown();
        }
        let node_ids: Vec<NodeId> = self.nodes.iter().map(|n| n.id).collect();
        let mut nodes = std::mem::take(&mut self.nodes);

        let drain = self.config.timing.drain_window();
        let join = tokio::task::spawn_blocking(move || {
            for node in &mut nodes {
                if let Err(err) = node.join() {
                    tracing::warn!(node = %node.id, %err, "node teardown failed");
                }
            }
        });
        if tokio::time::timeout(drain * 2 + Duration::from_secs(2), join)
            .await
            .is_err()
        {
            tracing::warn!("node teardown exceeded the drain window");
        }

        // Nodes remove their own rows on clean teardown; sweep whatever is
        // left so the registry never lists dead endpoints.
        for id in node_ids {
            let _ = self.registry.remove_node(id).await;
        }
        tracing::info!("network shut down");
        Ok(())
    }
}
