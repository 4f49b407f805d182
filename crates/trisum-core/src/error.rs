//! Unified error and failure vocabulary for the trisum network.
//!
//! `TrisumError` is the error type shared by the store, transport, and node
//! layers. Protocol-level outcomes that are not errors in the Rust sense (a
//! rejected message, a failed computation) have their own small enums so they
//! can travel over the wire and into the registry.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unified error type for trisum operations.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
pub enum TrisumError {
    /// Caller violated an API contract.
    #[error("precondition failed: {message}")]
    Precondition { message: String },

    /// Storage operation failed after retries.
    #[error("storage error: {message}")]
    Storage { message: String },

    /// Transport operation failed after retries.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Serialization or deserialization failed.
    #[error("serialization error: {message}")]
    Serialization { message: String },

    /// An operation ran out of time.
    #[error("timed out: {message}")]
    Timeout { message: String },

    /// New work rejected because shutdown is in progress.
    #[error("shutdown in progress: {message}")]
    Shutdown { message: String },

    /// Unrecoverable failure, such as store corruption. The affected node
    /// terminates.
    #[error("fatal: {message}")]
    Fatal { message: String },
}

impl TrisumError {
    /// Create a precondition-failed error.
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition {
            message: message.into(),
        }
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a shutdown-in-progress error.
    pub fn shutdown(message: impl Into<String>) -> Self {
        Self::Shutdown {
            message: message.into(),
        }
    }

    /// Create a fatal error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Whether this error is unrecoverable for the node that hit it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

/// Result alias for operations returning [`TrisumError`].
pub type TrisumResult<T> = std::result::Result<T, TrisumError>;

/// Why a computation moved to the `failed` status.
///
/// Persisted on the computation record and surfaced to `await_result` callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// A coordinator failed to acknowledge `init` within the init window.
    InitTimeout,
    /// The aligned participant set was smaller than the minimum threshold.
    ThresholdNotMet,
    /// A protocol message could not be delivered after retries.
    Transient,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InitTimeout => "InitTimeout",
            Self::ThresholdNotMet => "ThresholdNotMet",
            Self::Transient => "Transient",
        };
        f.write_str(s)
    }
}

impl FromStr for FailureReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "InitTimeout" => Ok(Self::InitTimeout),
            "ThresholdNotMet" => Ok(Self::ThresholdNotMet),
            "Transient" => Ok(Self::Transient),
            other => Err(format!("unknown failure reason: {other}")),
        }
    }
}

/// Why an inbound message was rejected by a node.
///
/// Rejections are terminal for the message (the sender must not retry the
/// same payload) but never fail the computation by themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectKind {
    /// A second share from the same contributor for the same computation.
    DuplicateShare,
    /// A share arriving after the computation deadline.
    LateShare,
    /// The referenced computation is unknown after the pending window.
    UnknownComputation,
    /// The node is shutting down and accepts no new work.
    ShutdownInProgress,
    /// The message is not valid for the receiving node or state.
    InvalidMessage,
}

impl fmt::Display for RejectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::DuplicateShare => "DuplicateShare",
            Self::LateShare => "LateShare",
            Self::UnknownComputation => "UnknownComputation",
            Self::ShutdownInProgress => "ShutdownInProgress",
            Self::InvalidMessage => "InvalidMessage",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_reason_round_trips_through_display() {
        for reason in [
            FailureReason::InitTimeout,
            FailureReason::ThresholdNotMet,
            FailureReason::Transient,
        ] {
            let parsed: FailureReason = reason.to_string().parse().unwrap();
            assert_eq!(reason, parsed);
        }
    }

    #[test]
    fn helper_constructors_carry_the_message() {
        let err = TrisumError::precondition("fewer than three coordinators");
        assert!(err.to_string().contains("fewer than three coordinators"));
    }

    #[test]
    fn only_fatal_errors_classify_as_fatal() {
        assert!(TrisumError::fatal("registry corrupt").is_fatal());
        assert!(!TrisumError::storage("busy").is_fatal());
        assert!(!TrisumError::transport("refused").is_fatal());
    }
}
