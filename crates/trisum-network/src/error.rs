//! Façade error type.

use trisum_core::{ComputationId, FailureReason, TrisumError};
use trisum_store::StoreError;

/// Errors surfaced to façade callers.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Caller violated an API contract.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// A spawned node failed to bind or become reachable within the
    /// startup window.
    #[error("network startup failed: {0}")]
    NetworkStartupFailed(String),

    /// `await_result` ran out of the caller-supplied time.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The computation reached the `failed` terminal status.
    #[error("computation failed: {reason}")]
    ComputationFailed { reason: FailureReason },

    /// No computation with this id exists.
    #[error("unknown computation {0}")]
    UnknownComputation(ComputationId),

    /// Underlying store or transport failure.
    #[error(transparent)]
    Core(#[from] TrisumError),
}

impl NetworkError {
    pub(crate) fn precondition(message: impl Into<String>) -> Self {
        Self::PreconditionFailed(message.into())
    }

    pub(crate) fn startup(message: impl Into<String>) -> Self {
        Self::NetworkStartupFailed(message.into())
    }
}

impl From<StoreError> for NetworkError {
    fn from(err: StoreError) -> Self {
        Self::Core(TrisumError::from(err))
    }
}
