//! # Agora
//! Rust implementation of a Kademlia distributed hash table node.
//!
//! The [Dht] facade runs an [Engine](rpc::Engine) on a dedicated thread and
//! exposes blocking `put`/`get`. The engine itself is a single-threaded state
//! machine advanced by `tick()`; embedders that already own an event loop can
//! drive it directly.

mod common;
mod error;

pub mod dht;
pub mod messages;
pub mod rpc;

pub use crate::common::{Id, Peer, RoutingTable};
pub use dht::Dht;
pub use error::Error;
pub use rpc::{Config, Engine};

// Alias Result to be the crate Result.
pub type Result<T, E = error::Error> = core::result::Result<T, E>;
