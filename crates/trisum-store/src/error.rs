//! Store error type and transient-failure classification.

use rusqlite::ffi::ErrorCode;
use trisum_core::{ComputationId, ComputationStatus, NodeId, TrisumError};

/// Errors surfaced by the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A node with this id is already registered.
    #[error("node {0} is already registered")]
    DuplicateNode(NodeId),

    /// Another active node already claims this endpoint.
    #[error("endpoint {0} is already claimed by an active node")]
    EndpointInUse(String),

    /// A computation with this id already exists.
    #[error("computation {0} already exists")]
    DuplicateComputation(ComputationId),

    /// The requested row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A status update would move a computation backwards or out of a
    /// terminal state.
    #[error("computation status may not move from {from} to {to}")]
    InvalidTransition {
        from: ComputationStatus,
        to: ComputationStatus,
    },

    /// A persisted row failed to decode.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// The connection pool could not produce a healthy lease.
    #[error("connection pool: {0}")]
    Pool(String),

    /// Underlying SQLite failure.
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

impl StoreError {
    /// Whether retrying the operation may succeed (lock contention).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            Self::Pool(_) => true,
            _ => false,
        }
    }

    /// Whether the failure is unrecoverable for the owning node. A row that
    /// no longer decodes means the store itself can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corrupt(_))
    }

    pub(crate) fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt(message.into())
    }
}

impl From<StoreError> for TrisumError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateNode(_)
            | StoreError::EndpointInUse(_)
            | StoreError::DuplicateComputation(_) => TrisumError::precondition(err.to_string()),
            StoreError::Corrupt(_) => TrisumError::fatal(err.to_string()),
            other => TrisumError::storage(other.to_string()),
        }
    }
}
