//! Outbound delivery with endpoint resolution and bounded retries.

use crate::wire::{read_frame, write_frame};
use futures::future::join_all;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use trisum_core::{Envelope, Message, NodeId, RejectKind, ReliabilityConfig, Reply};
use trisum_store::RegistryStore;

/// Terminal outcome of a delivery attempt series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// The target endpoint could not be resolved or connected to.
    Unreachable,
    /// Every attempt timed out.
    Timeout,
    /// The target answered with a rejection; the payload must not be
    /// retried.
    Rejected(RejectKind),
}

/// Result of [`Messenger::send`]. Individual failures are data, not errors:
/// broadcast fan-outs report them per target.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Delivered(Reply),
    Failed(DeliveryFailure),
}

impl Delivery {
    /// Whether the message reached the target and was not rejected.
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered(_))
    }

    /// The reply frame, when delivered.
    pub fn reply(&self) -> Option<&Reply> {
        match self {
            Self::Delivered(reply) => Some(reply),
            Self::Failed(_) => None,
        }
    }
}

/// What a single attempt produced, before retry classification.
enum Attempt {
    Replied(Reply),
    Unreachable,
    TimedOut,
}

/// Point-to-point sender. Resolves targets through the registry on every
/// send; holds no long-lived references to peer state.
#[derive(Debug, Clone)]
pub struct Messenger {
    self_id: NodeId,
    registry: RegistryStore,
    reliability: ReliabilityConfig,
}

impl Messenger {
    pub fn new(self_id: NodeId, registry: RegistryStore, reliability: ReliabilityConfig) -> Self {
        Self {
            self_id,
            registry,
            reliability,
        }
    }

    /// The node id stamped on outgoing envelopes.
    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    /// Deliver `message` to the node registered as `target`.
    ///
    /// Retries connection failures and timeouts with exponential backoff up
    /// to the configured attempt budget. A rejection reply ends the series
    /// immediately. Successive sends to the same target from one task are
    /// serialized, which yields per-pair FIFO for delivered messages.
    pub async fn send(&self, target: NodeId, message: Message) -> Delivery {
        let endpoint = match self.registry.get_node(target).await {
            Ok(Some(record)) => record.endpoint,
            Ok(None) => {
                tracing::debug!(%target, "send target not in registry");
                return Delivery::Failed(DeliveryFailure::Unreachable);
            }
            Err(err) => {
                tracing::warn!(%target, %err, "registry lookup failed for send");
                return Delivery::Failed(DeliveryFailure::Unreachable);
            }
        };
        self.send_to_endpoint(endpoint, message).await
    }

    /// Deliver `message` to an explicit endpoint with the full retry budget.
    pub async fn send_to_endpoint(&self, endpoint: SocketAddr, message: Message) -> Delivery {
        // The envelope is built once so every retry carries the identical
        // payload and timestamp.
        let envelope = Envelope::new(self.self_id, message);
        let max_attempts = self.reliability.max_attempts.max(1);
        let mut last_failure = DeliveryFailure::Unreachable;

        for attempt in 1..=max_attempts {
            match self.attempt(endpoint, &envelope).await {
                Attempt::Replied(Reply::Rejected { kind }) => {
                    tracing::debug!(
                        kind = %kind,
                        message = envelope.message.kind(),
                        %endpoint,
                        "delivery rejected by target"
                    );
                    return Delivery::Failed(DeliveryFailure::Rejected(kind));
                }
                Attempt::Replied(reply) => return Delivery::Delivered(reply),
                Attempt::Unreachable => last_failure = DeliveryFailure::Unreachable,
                Attempt::TimedOut => last_failure = DeliveryFailure::Timeout,
            }
            if attempt < max_attempts {
                tokio::time::sleep(self.reliability.backoff_for(attempt)).await;
            }
        }

        tracing::debug!(
            message = envelope.message.kind(),
            %endpoint,
            attempts = max_attempts,
            failure = ?last_failure,
            "delivery failed after retries"
        );
        Delivery::Failed(last_failure)
    }

    /// One health probe with a single attempt and a caller-chosen timeout.
    pub async fn probe(&self, endpoint: SocketAddr, timeout: Duration) -> bool {
        let envelope = Envelope::new(self.self_id, Message::Health);
        matches!(
            tokio::time::timeout(timeout, request(endpoint, &envelope)).await,
            Ok(Ok(reply)) if reply.is_accepted()
        )
    }

    /// Concurrent fan-out. Builds one message per target, launches all sends
    /// at once, and reports the per-target outcomes; individual failures
    /// never fail the broadcast.
    pub async fn broadcast<F>(&self, targets: &[NodeId], builder: F) -> HashMap<NodeId, Delivery>
    where
        F: Fn(&NodeId) -> Message,
    {
        let sends = targets.iter().map(|target| {
            let message = builder(target);
            let target = *target;
            async move { (target, self.send(target, message).await) }
        });
        join_all(sends).await.into_iter().collect()
    }

    async fn attempt(&self, endpoint: SocketAddr, envelope: &Envelope) -> Attempt {
        match tokio::time::timeout(self.reliability.attempt_timeout(), request(endpoint, envelope))
            .await
        {
            Ok(Ok(reply)) => Attempt::Replied(reply),
            Ok(Err(err)) => {
                tracing::debug!(%endpoint, %err, "delivery attempt failed");
                Attempt::Unreachable
            }
            Err(_elapsed) => Attempt::TimedOut,
        }
    }
}

async fn request(endpoint: SocketAddr, envelope: &Envelope) -> Result<Reply, trisum_core::TrisumError> {
    let mut stream = TcpStream::connect(endpoint)
        .await
        .map_err(|e| trisum_core::TrisumError::transport(format!("connect {endpoint}: {e}")))?;
    write_frame(&mut stream, envelope).await?;
    read_frame(&mut stream).await
}
