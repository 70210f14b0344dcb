//! Coordination-service client core.
//!
//! - [`Client`]: session management with retry and resumption, blocking and background
//!   node operations, watch registrations
//! - [`Mirror`]: watch-driven local cache of a node, its children or a whole subtree
//! - [`MemoryEnsemble`] / [`Server`]: single-process reference service reachable
//!   in-process or over TCP

mod client;
mod config;
pub mod constants;
mod errors;
pub mod metrics;
mod mirror;
mod network;
pub mod path;
mod proto;
mod server;
mod service;
pub(crate) mod utils;

pub use client::*;
pub use config::*;
pub use errors::*;
pub use mirror::*;
pub use network::*;
pub use proto::*;
pub use server::*;
pub use service::ConnectionId;
pub use service::CoordinationService;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
