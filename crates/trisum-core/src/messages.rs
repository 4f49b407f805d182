//! Wire message types.
//!
//! Every message travels inside an [`Envelope`] carrying the sender id and a
//! timestamp; the message itself serializes as a self-describing
//! `{type, payload}` pair. Each delivered message receives exactly one
//! [`Reply`] frame.

use crate::error::RejectKind;
use crate::identifiers::{ComputationId, NodeId};
use crate::records::ComputationRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Envelope wrapping every wire message.
///
/// Serializes to `{type, payload, sender_id, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender_id: NodeId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    /// Wrap `message` with the sender id and the current time.
    pub fn new(sender_id: NodeId, message: Message) -> Self {
        Self {
            sender_id,
            timestamp: Utc::now(),
            message,
        }
    }
}

/// The protocol messages exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Message {
    /// Façade → C₁: start the lifecycle of a newly registered computation.
    Propose { computation: ComputationRecord },

    /// C₁ → C₂, C₃: adopt the computation before any share can arrive.
    /// The receiver's readiness travels back as [`Reply::InitAck`].
    Init { computation: ComputationRecord },

    /// C₁ → every active contributor: invitation to contribute.
    Announce { computation: ComputationRecord },

    /// Contributor → Cᵢ: one share column entry.
    /// `share_index` is the 0-based coordinator position the share targets.
    Share {
        comp_id: ComputationId,
        share_value: u32,
        share_index: u8,
    },

    /// C₁ → C₂, C₃ at deadline: the primary's proposed participant set.
    RevealRequest {
        comp_id: ComputationId,
        participants: BTreeSet<NodeId>,
    },

    /// C₂, C₃ → C₁: modular partial sum restricted to the intersection of
    /// the local and proposed participant sets, plus that intersection.
    PartialSum {
        comp_id: ComputationId,
        partial_sum: u32,
        participants: BTreeSet<NodeId>,
    },

    /// Liveness probe; any node answers.
    Health,
}

impl Message {
    /// Short name of the message type, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Propose { .. } => "propose",
            Self::Init { .. } => "init",
            Self::Announce { .. } => "announce",
            Self::Share { .. } => "share",
            Self::RevealRequest { .. } => "reveal_request",
            Self::PartialSum { .. } => "partial_sum",
            Self::Health => "health",
        }
    }

    /// The computation this message belongs to, when it has one.
    pub fn computation_id(&self) -> Option<ComputationId> {
        match self {
            Self::Propose { computation }
            | Self::Init { computation }
            | Self::Announce { computation } => Some(computation.id),
            Self::Share { comp_id, .. }
            | Self::RevealRequest { comp_id, .. }
            | Self::PartialSum { comp_id, .. } => Some(*comp_id),
            Self::Health => None,
        }
    }
}

/// The single reply frame answering a delivered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Reply {
    /// The message was accepted and processed (or is being processed).
    Accepted,

    /// Reply to `init`: the coordinator adopted the computation.
    InitAck { comp_id: ComputationId, ready: bool },

    /// The message was rejected; the sender must not retry the same payload.
    Rejected { kind: RejectKind },
}

impl Reply {
    /// Whether this reply acknowledges the message.
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_shape_is_self_describing() {
        let sender = NodeId::new();
        let envelope = Envelope::new(
            sender,
            Message::Share {
                comp_id: ComputationId::new(),
                share_value: 7,
                share_index: 2,
            },
        );
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "share");
        assert_eq!(value["payload"]["share_index"], 2);
        assert_eq!(value["sender_id"], sender.to_string());
        assert!(value["timestamp"].is_string());

        let back: Envelope = serde_json::from_value(value).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn health_has_no_computation() {
        assert_eq!(Message::Health.computation_id(), None);
        assert_eq!(Message::Health.kind(), "health");
    }

    #[test]
    fn replies_classify_acceptance() {
        assert!(Reply::Accepted.is_accepted());
        assert!(Reply::InitAck {
            comp_id: ComputationId::new(),
            ready: true
        }
        .is_accepted());
        assert!(!Reply::Rejected {
            kind: RejectKind::LateShare
        }
        .is_accepted());
    }
}
