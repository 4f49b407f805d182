//! Node runtime: endpoint serving, role dispatch, and teardown.
//!
//! The façade spawns each node on its own thread with a single-threaded
//! runtime, so work within a node interleaves cooperatively while nodes run
//! genuinely in parallel. The node owns its per-node store, opens its own
//! registry handle, and confirms teardown by removing its registry row.

use crate::contributor::{ContributorRole, ResponsePolicy};
use crate::coordinator::CoordinatorRole;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use trisum_core::{
    Envelope, Message, NodeConfig, NodeId, NodeRole, NodeStatus, RejectKind, Reply, TrisumError,
};
use trisum_store::{ContributorStore, CoordinatorStore, RegistryStore};
use trisum_transport::{serve, MessageHandler, Messenger};

/// Background task registry. Tasks are aborted on shutdown and when the set
/// drops.
pub struct TaskSet {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut handles = self.handles.lock();
        handles.retain(|handle| !handle.is_finished());
        handles.push(tokio::spawn(fut));
    }

    pub fn abort_all(&self) {
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        self.abort_all();
    }
}

/// Raised by role handlers when the node hits an unrecoverable failure,
/// such as a per-node store that no longer decodes. The runtime observes
/// the signal and terminates the node; the first raised reason wins.
#[derive(Clone)]
pub struct FatalSignal {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl FatalSignal {
    pub fn new() -> (Self, watch::Receiver<Option<String>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Record the failure and wake the runtime. Later raises are ignored.
    pub fn raise(&self, message: impl Into<String>) {
        let message = message.into();
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            tracing::error!(%message, "fatal failure, terminating node");
            *slot = Some(message);
            true
        });
    }

    /// Raise only when `err` is classified as unrecoverable.
    pub fn raise_if_fatal(&self, err: &trisum_store::StoreError) {
        if err.is_fatal() {
            self.raise(err.to_string());
        }
    }
}

/// Everything a node needs to run. The listener is bound by the façade
/// (endpoint allocation is its critical section) and handed over here.
pub struct NodeSpec {
    pub id: NodeId,
    pub role: NodeRole,
    pub listener: std::net::TcpListener,
    pub registry_path: PathBuf,
    pub config: NodeConfig,
    /// Response policy; only consulted by contributors.
    pub policy: Arc<dyn ResponsePolicy>,
}

enum RoleHandler {
    Coordinator(Arc<CoordinatorRole>),
    Contributor(Arc<ContributorRole>),
}

struct NodeHandler {
    role: RoleHandler,
    shutdown: watch::Receiver<bool>,
}

#[async_trait]
impl MessageHandler for NodeHandler {
    async fn handle(&self, envelope: Envelope) -> Reply {
        if *self.shutdown.borrow() && !matches!(envelope.message, Message::Health) {
            return Reply::Rejected {
                kind: RejectKind::ShutdownInProgress,
            };
        }
        match &self.role {
            RoleHandler::Coordinator(role) => role.handle(envelope).await,
            RoleHandler::Contributor(role) => role.handle(envelope).await,
        }
    }
}

/// Run one node until the shutdown signal fires (or its sender drops), then
/// drain, close the endpoint, and confirm teardown in the registry.
pub async fn run_node(spec: NodeSpec, mut shutdown: watch::Receiver<bool>) -> Result<(), TrisumError> {
    let NodeSpec {
        id,
        role,
        listener,
        registry_path,
        config,
        policy,
    } = spec;

    let registry = RegistryStore::open(&registry_path, config.store.clone())
        .await
        .map_err(TrisumError::from)?;
    let messenger = Messenger::new(id, registry.clone(), config.reliability.clone());
    let tasks = Arc::new(TaskSet::new());
    let (fatal, mut fatal_rx) = FatalSignal::new();
    let store_path = config.data_dir.join(format!("{id}.db"));

    listener
        .set_nonblocking(true)
        .map_err(|e| TrisumError::transport(format!("listener nonblocking: {e}")))?;
    let listener = tokio::net::TcpListener::from_std(listener)
        .map_err(|e| TrisumError::transport(format!("adopt listener: {e}")))?;
    let endpoint = listener
        .local_addr()
        .map_err(|e| TrisumError::transport(format!("listener address: {e}")))?;

    let role_handler = match role {
        NodeRole::Coordinator => {
            let store = CoordinatorStore::open(&store_path, config.store.clone())
                .await
                .map_err(TrisumError::from)?;
            let coordinator = CoordinatorRole::new(
                id,
                registry.clone(),
                store,
                messenger,
                config.clone(),
                Arc::clone(&tasks),
                fatal.clone(),
            );
            RoleHandler::Coordinator(coordinator)
        }
        NodeRole::Contributor => {
            let store = ContributorStore::open(&store_path, config.store.clone())
                .await
                .map_err(TrisumError::from)?;
            let contributor = ContributorRole::new(
                id,
                store,
                messenger,
                policy,
                config.clone(),
                Arc::clone(&tasks),
                fatal.clone(),
            );
            RoleHandler::Contributor(contributor)
        }
    };

    let recover_target = match &role_handler {
        RoleHandler::Coordinator(coordinator) => Some(Arc::clone(coordinator)),
        RoleHandler::Contributor(_) => None,
    };
    let handler = Arc::new(NodeHandler {
        role: role_handler,
        shutdown: shutdown.clone(),
    });
    let server = serve(
        listener,
        handler,
        config.network.max_inflight_requests,
        config.timing.drain_window(),
    )?;
    tracing::info!(node = %id, %role, %endpoint, "node serving");

    // Resume any in-flight computations once the endpoint is reachable.
    if let Some(coordinator) = recover_target {
        coordinator.recover().await?;
    }

    // Park until shutdown (a dropped sender counts) or a fatal failure
    // raised by a handler; either way the node tears down, but a fatal
    // reason terminates the node with an error.
    let fatal_reason = tokio::select! {
        _ = shutdown.changed() => {
            tracing::info!(node = %id, "shutdown signalled, draining");
            None
        }
        _ = fatal_rx.changed() => fatal_rx.borrow().clone(),
    };

    if let Err(err) = registry.set_node_status(id, NodeStatus::Stopping).await {
        tracing::warn!(node = %id, %err, "failed to mark node stopping");
    }
    server.shutdown(config.timing.drain_window()).await;
    tasks.abort_all();
    if let Err(err) = registry.remove_node(id).await {
        tracing::warn!(node = %id, %err, "failed to remove node registration");
    }
    tracing::info!(node = %id, "teardown confirmed");
    match fatal_reason {
        Some(reason) => Err(TrisumError::fatal(reason)),
        None => Ok(()),
    }
}
