//! Registry record types.
//!
//! The registry is the single source of truth for node endpoints and
//! computation status; these records are its rows. Per-node stores only ever
//! cache or derive from them.

use crate::error::FailureReason;
use crate::identifiers::{ComputationId, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Response schema tag carried by every computation record. The network
/// supports exactly one response schema.
pub const SCHEMA_TAG: &str = "single non-negative integer in [0, 2^32)";

/// Role of a node in the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    /// Orchestrates computations, aggregates shares, joins the reveal.
    Coordinator,
    /// Holds private data and emits shares.
    Contributor,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Coordinator => f.write_str("coordinator"),
            Self::Contributor => f.write_str("contributor"),
        }
    }
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coordinator" => Ok(Self::Coordinator),
            "contributor" => Ok(Self::Contributor),
            other => Err(format!("unknown node role: {other}")),
        }
    }
}

/// Lifecycle status of a node record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Active,
    Stopping,
    Stopped,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Stopping => f.write_str("stopping"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown node status: {other}")),
        }
    }
}

/// One registry row per node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub role: NodeRole,
    pub endpoint: SocketAddr,
    pub status: NodeStatus,
    pub created_at: DateTime<Utc>,
}

impl NodeRecord {
    /// A fresh active record for a node that just bound its endpoint.
    pub fn new(id: NodeId, role: NodeRole, endpoint: SocketAddr) -> Self {
        Self {
            id,
            role,
            endpoint,
            status: NodeStatus::Active,
            created_at: Utc::now(),
        }
    }
}

/// Lifecycle status of a computation.
///
/// Progresses monotonically forward; `Failed` is terminal from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComputationStatus {
    Pending,
    Broadcasting,
    Collecting,
    Revealing,
    Completed,
    Failed,
}

impl ComputationStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Broadcasting => 1,
            Self::Collecting => 2,
            Self::Revealing => 3,
            Self::Completed => 4,
            Self::Failed => 5,
        }
    }

    /// Whether the computation has reached a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether a transition from `self` to `next` respects monotonic
    /// progression. Re-asserting the current status is allowed.
    pub fn allows_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        if next == Self::Failed {
            return true;
        }
        next.rank() > self.rank() && next != Self::Failed
    }
}

impl fmt::Display for ComputationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Broadcasting => "broadcasting",
            Self::Collecting => "collecting",
            Self::Revealing => "revealing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for ComputationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "broadcasting" => Ok(Self::Broadcasting),
            "collecting" => Ok(Self::Collecting),
            "revealing" => Ok(Self::Revealing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown computation status: {other}")),
        }
    }
}

/// One registry row per computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputationRecord {
    pub id: ComputationId,
    pub proposer_id: NodeId,
    /// Exactly three coordinators; the first is the primary (C₁).
    pub coordinators: [NodeId; 3],
    pub prompt: String,
    pub schema_tag: String,
    pub deadline: DateTime<Utc>,
    pub min_participants: u32,
    pub status: ComputationStatus,
    pub result: Option<u32>,
    pub participants_count: Option<u32>,
    pub failure: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
}

impl ComputationRecord {
    /// A fresh pending record for a newly proposed computation.
    pub fn new(
        id: ComputationId,
        proposer_id: NodeId,
        coordinators: [NodeId; 3],
        prompt: impl Into<String>,
        deadline: DateTime<Utc>,
        min_participants: u32,
    ) -> Self {
        Self {
            id,
            proposer_id,
            coordinators,
            prompt: prompt.into(),
            schema_tag: SCHEMA_TAG.to_string(),
            deadline,
            min_participants,
            status: ComputationStatus::Pending,
            result: None,
            participants_count: None,
            failure: None,
            created_at: Utc::now(),
        }
    }

    /// The primary coordinator (C₁).
    pub fn primary(&self) -> NodeId {
        self.coordinators[0]
    }

    /// 0-based position of `node` among the three coordinators.
    pub fn coordinator_index(&self, node: &NodeId) -> Option<usize> {
        self.coordinators.iter().position(|c| c == node)
    }

    /// Whether `node` is the primary coordinator.
    pub fn is_primary(&self, node: &NodeId) -> bool {
        self.primary() == *node
    }

    /// Mean of the revealed sum over the aligned participants, once
    /// completed with at least one participant.
    pub fn mean(&self) -> Option<f64> {
        match (self.result, self.participants_count) {
            (Some(sum), Some(count)) if count > 0 => Some(f64::from(sum) / f64::from(count)),
            _ => None,
        }
    }
}

/// Per-target delivery status of a contributor's share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    Pending,
    Delivered,
    Failed,
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Delivered => f.write_str("delivered"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

impl FromStr for DeliveryState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown delivery state: {other}")),
        }
    }
}
