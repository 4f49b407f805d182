//! Messaging substrate for the trisum network.
//!
//! Nodes talk over plain TCP on localhost: one length-prefixed JSON request
//! frame, one length-prefixed JSON reply frame, connection closed. The
//! [`Messenger`] resolves endpoints through the registry on every send and
//! retries transient failures with bounded exponential backoff; [`serve`]
//! runs a node's accept loop with a bounded in-flight limit and drains on
//! shutdown. Per-pair FIFO for delivered messages follows from sends being
//! serialized per target; there is no global ordering.

mod client;
mod server;
mod wire;

pub use client::{Delivery, DeliveryFailure, Messenger};
pub use server::{serve, MessageHandler, ServerHandle};
pub use wire::{read_frame, write_frame, MAX_FRAME_BYTES};
