//! Network façade for the trisum aggregation network.
//!
//! The single entry point for external collaborators: spawn a local network
//! of coordinator and contributor nodes, propose computations, await their
//! results, and tear everything down. The façade owns the shared registry,
//! the process-wide node table, and the lifecycle of every node it spawns.
//!
//! ```no_run
//! # async fn demo() -> Result<(), trisum_network::NetworkError> {
//! use std::time::Duration;
//! use trisum_network::Network;
//!
//! let network = Network::start(3, 5).await?;
//! let comp_id = network.propose_computation("what is your value?", 30, 1).await?;
//! let outcome = network.await_result(comp_id, Duration::from_secs(60)).await?;
//! println!("sum = {:?} over {:?} participants", outcome.result, outcome.participants_count);
//! network.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod network;
mod spawn;

pub use error::NetworkError;
pub use network::{Network, NetworkBuilder, NetworkStatus};
