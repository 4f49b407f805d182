//! Core types for the trisum aggregation network.
//!
//! This crate holds everything the other layers agree on: identifiers,
//! registry records, the wire message envelope, shared configuration, and the
//! three-party additive secret-sharing primitive. It has no I/O of its own.

pub mod config;
pub mod error;
pub mod identifiers;
pub mod messages;
pub mod records;
pub mod sharing;

pub use config::{NetworkConfig, NodeConfig, ReliabilityConfig, StoreConfig, TimingConfig};
pub use error::{FailureReason, RejectKind, TrisumError, TrisumResult};
pub use identifiers::{ComputationId, NodeId};
pub use messages::{Envelope, Message, Reply};
pub use records::{
    ComputationRecord, ComputationStatus, DeliveryState, NodeRecord, NodeRole, NodeStatus,
    SCHEMA_TAG,
};
pub use sharing::{reconstruct, split, ShareTriple, MODULUS_BITS};
