//! Inbound message serving.
//!
//! One accept loop per node. Each connection carries a single request/reply
//! exchange; handling concurrency is bounded by a semaphore. Shutdown stops
//! accepting immediately, drains in-flight handlers up to the drain window,
//! then aborts whatever remains.

use crate::wire::{read_frame, write_frame};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use trisum_core::{Envelope, Reply, TrisumError};

/// Dispatches one inbound envelope to role-specific handling.
///
/// Implementations must reply promptly; long-running protocol work belongs
/// in tasks the handler spawns for itself.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: Envelope) -> Reply;
}

/// Running server for one node endpoint.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// The bound endpoint address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, drain in-flight handlers up to `drain_window`, then
    /// abort the rest and close the endpoint.
    pub async fn shutdown(mut self, drain_window: Duration) {
        let _ = self.shutdown_tx.send(true);
        // The accept loop applies the drain window itself; the slack here
        // only covers its own teardown.
        let grace = drain_window + Duration::from_millis(500);
        if tokio::time::timeout(grace, &mut self.task).await.is_err() {
            tracing::warn!(endpoint = %self.local_addr, "server drain window elapsed, aborting");
            self.task.abort();
        }
    }
}

/// Start serving `listener` with `handler`, handling at most `max_inflight`
/// requests concurrently.
pub fn serve(
    listener: TcpListener,
    handler: Arc<dyn MessageHandler>,
    max_inflight: u32,
    drain_window: Duration,
) -> Result<ServerHandle, TrisumError> {
    let local_addr = listener
        .local_addr()
        .map_err(|e| TrisumError::transport(format!("listener address: {e}")))?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(accept_loop(
        listener,
        handler,
        max_inflight,
        shutdown_rx,
        drain_window,
    ));
    Ok(ServerHandle {
        local_addr,
        shutdown_tx,
        task,
    })
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn MessageHandler>,
    max_inflight: u32,
    mut shutdown_rx: watch::Receiver<bool>,
    drain_window: Duration,
) {
    let limiter = Arc::new(Semaphore::new(max_inflight.max(1) as usize));
    let mut connections = JoinSet::new();

    loop {
        // Reap finished connection tasks without blocking the accept path.
        while connections.try_join_next().is_some() {}

        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::debug!(%err, "accept failed");
                        continue;
                    }
                };
                let permit = match Arc::clone(&limiter).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_closed) => break,
                };
                let handler = Arc::clone(&handler);
                connections.spawn(async move {
                    let _permit = permit;
                    if let Err(err) = handle_connection(stream, handler).await {
                        tracing::debug!(%peer, %err, "connection handling failed");
                    }
                });
            }
        }
    }

    // Drain: give in-flight handlers the drain window, then abort.
    let deadline = tokio::time::Instant::now() + drain_window;
    loop {
        match tokio::time::timeout_at(deadline, connections.join_next()).await {
            Ok(Some(_result)) => continue,
            Ok(None) => break,
            Err(_elapsed) => {
                tracing::debug!(
                    outstanding = connections.len(),
                    "aborting handlers still in flight at shutdown"
                );
                connections.shutdown().await;
                break;
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    handler: Arc<dyn MessageHandler>,
) -> Result<(), TrisumError> {
    let envelope: Envelope = read_frame(&mut stream).await?;
    let reply: Reply = handler.handle(envelope).await;
    write_frame(&mut stream, &reply).await
}
