//! Participant alignment and reveal bookkeeping.
//!
//! Each coordinator observes its own participant set Pᵢ (the contributors it
//! holds a share from). The revealed result may only cover the aligned set
//! A = P₁ ∩ P₂ ∩ P₃: a contributor whose share reached just two coordinators
//! would otherwise corrupt the reconstructed sum, so partially delivered
//! contributions are silently dropped by intersection.
//!
//! Alignment is a fixpoint: a responder's partial sum is only usable when it
//! was computed over exactly the aligned set. The primary re-requests with
//! the shrunken set until both responders report over it; each round strictly
//! shrinks the proposed set, so the loop terminates.

use std::collections::{BTreeSet, HashMap};
use trisum_core::{sharing, NodeId};

/// Intersection of a responder's local participant set with the primary's
/// proposed set. The responder's partial sum is restricted to this.
pub fn restrict(local: &BTreeSet<NodeId>, proposed: &BTreeSet<NodeId>) -> BTreeSet<NodeId> {
    local.intersection(proposed).copied().collect()
}

/// Both responders' reports for one reveal round.
#[derive(Debug, Clone)]
pub struct RevealRound {
    /// (partial sum, restricted participant set) for C₂ and C₃.
    pub responses: [(u32, BTreeSet<NodeId>); 2],
}

impl RevealRound {
    /// A = A'₂ ∩ A'₃ for this round.
    pub fn aligned(&self) -> BTreeSet<NodeId> {
        restrict(&self.responses[0].1, &self.responses[1].1)
    }

    /// Whether both responders already computed their sums over exactly the
    /// aligned set. Only then are the reported sums usable; otherwise the
    /// primary must re-request over [`Self::aligned`].
    pub fn is_converged(&self) -> bool {
        let aligned = self.aligned();
        self.responses[0].1 == aligned && self.responses[1].1 == aligned
    }

    /// Reconstruct the network sum from the primary's partial sum over the
    /// aligned set and the two responder sums. Meaningful only once
    /// [`Self::is_converged`] holds.
    pub fn reconstruct_with(&self, primary_sum: u32) -> u32 {
        sharing::reconstruct(primary_sum, self.responses[0].0, self.responses[1].0)
    }
}

/// Collects the two `partial_sum` messages of the current reveal round.
#[derive(Debug)]
pub struct RevealTracker {
    expected: [NodeId; 2],
    received: HashMap<NodeId, (u32, BTreeSet<NodeId>)>,
}

impl RevealTracker {
    /// Track a reveal round awaiting reports from the two non-primary
    /// coordinators.
    pub fn new(responders: [NodeId; 2]) -> Self {
        Self {
            expected: responders,
            received: HashMap::new(),
        }
    }

    /// Record one responder's partial sum. Returns the completed round once
    /// both responders have reported. A sum from an unexpected sender is
    /// ignored; a re-send from a known sender replaces its previous report.
    pub fn record(
        &mut self,
        sender: NodeId,
        partial_sum: u32,
        participants: BTreeSet<NodeId>,
    ) -> Option<RevealRound> {
        if !self.expected.contains(&sender) {
            return None;
        }
        self.received.insert(sender, (partial_sum, participants));
        let a2 = self.received.get(&self.expected[0])?;
        let a3 = self.received.get(&self.expected[1])?;
        Some(RevealRound {
            responses: [a2.clone(), a3.clone()],
        })
    }
}
