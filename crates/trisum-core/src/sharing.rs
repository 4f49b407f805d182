//! Three-party additive secret sharing over ℤ / 2³² ℤ.
//!
//! A private value is split into three shares that sum, modulo 2³², back to
//! the value. Any two shares are statistically independent of the value, so a
//! single coordinator (holding one share column) learns nothing. Column sums
//! of shares reconstruct to the sum of the underlying values, which is the
//! additivity the reveal protocol relies on.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Bit width of the share modulus. All share arithmetic is mod 2³².
pub const MODULUS_BITS: u32 = 32;

/// The three shares of one private value, in coordinator order (C₁, C₂, C₃).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareTriple {
    pub s1: u32,
    pub s2: u32,
    pub s3: u32,
}

impl ShareTriple {
    /// The share destined for the coordinator at `index` (0-based).
    pub fn share(&self, index: usize) -> Option<u32> {
        match index {
            0 => Some(self.s1),
            1 => Some(self.s2),
            2 => Some(self.s3),
            _ => None,
        }
    }

    /// Shares in coordinator order.
    pub fn as_array(&self) -> [u32; 3] {
        [self.s1, self.s2, self.s3]
    }
}

/// Split `value` into three additive shares.
///
/// The first two shares are drawn uniformly from the OS entropy source; the
/// third is the modular difference. Pairwise, any two shares carry no
/// information about `value`.
pub fn split(value: u32) -> ShareTriple {
    let s1 = OsRng.next_u32();
    let s2 = OsRng.next_u32();
    let s3 = value.wrapping_sub(s1).wrapping_sub(s2);
    ShareTriple { s1, s2, s3 }
}

/// Reconstruct a value from its three shares: (s₁ + s₂ + s₃) mod 2³².
///
/// This is the only defined operation on shares; shares are never compared
/// by value.
pub fn reconstruct(s1: u32, s2: u32, s3: u32) -> u32 {
    s1.wrapping_add(s2).wrapping_add(s3)
}

/// Modular sum of one coordinator's share column.
///
/// For contributors j with shares (s₁ʲ, s₂ʲ, s₃ʲ), the three column sums
/// Sᵢ = Σⱼ sᵢʲ satisfy reconstruct(S₁, S₂, S₃) = Σⱼ vⱼ mod 2³².
pub fn column_sum(shares: impl IntoIterator<Item = u32>) -> u32 {
    shares.into_iter().fold(0u32, |acc, s| acc.wrapping_add(s))
}
