//! Node runtimes for the trisum network.
//!
//! A node is a long-lived event loop hosting one endpoint. The two roles are
//! closed variants sharing the messaging envelope: coordinators run the
//! computation lifecycle and the three-party reveal, contributors produce a
//! private response and scatter its shares. All state a node must not lose
//! lives in its per-node store or in the shared registry.

pub mod aggregator;
pub mod contributor;
pub mod coordinator;
pub mod runtime;

pub use contributor::{FixedResponsePolicy, ResponsePolicy, UniformResponsePolicy};
pub use runtime::{run_node, NodeSpec};
