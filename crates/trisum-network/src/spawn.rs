//! Node process spawning.
//!
//! Each node runs on a dedicated OS thread hosting a single-threaded tokio
//! runtime: nodes are genuinely parallel to each other while work inside a
//! node interleaves cooperatively. The façade binds the endpoint itself
//! (endpoint allocation is its critical section), registers the node, and
//! only then hands the listener to the node thread.

use crate::error::NetworkError;
use std::net::SocketAddr;
use std::thread;
use tokio::sync::watch;
use trisum_core::{NodeId, NodeRole, TrisumError};
use trisum_node::{run_node, NodeSpec};

/// A spawned node owned by the façade.
#[derive(Debug)]
pub(crate) struct NodeHandle {
    pub id: NodeId,
    pub role: NodeRole,
    pub endpoint: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    thread: Option<thread::JoinHandle<Result<(), TrisumError>>>,
}

impl NodeHandle {
    /// Signal the node's cancellation token.
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for the node thread to confirm teardown. Blocking; call it off
    /// the async scheduler.
    pub fn join(&mut self) -> Result<(), TrisumError> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| TrisumError::fatal("node thread panicked"))?,
            None => Ok(()),
        }
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        // Best effort: a dropped façade must not leave node threads parked
        // forever.
        let _ = self.shutdown_tx.send(true);
    }
}

/// Bind a fresh node endpoint.
pub(crate) fn bind_endpoint(bind_address: &str) -> Result<std::net::TcpListener, NetworkError> {
    std::net::TcpListener::bind(bind_address)
        .map_err(|e| NetworkError::startup(format!("bind {bind_address}: {e}")))
}

/// Launch the node thread for an already bound and registered endpoint.
pub(crate) fn launch(spec: NodeSpec, endpoint: SocketAddr) -> Result<NodeHandle, NetworkError> {
    let id = spec.id;
    let role = spec.role;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let thread = thread::Builder::new()
        .name(id.to_string())
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| TrisumError::fatal(format!("node runtime: {e}")))?;
            runtime.block_on(run_node(spec, shutdown_rx))
        })
        .map_err(|e| NetworkError::startup(format!("spawn node thread: {e}")))?;

    Ok(NodeHandle {
        id,
        role,
        endpoint,
        shutdown_tx,
        thread: Some(thread),
    })
}
