//! Transport abstraction between the session task and the coordination service.
//!
//! A [`Connector`] opens one [`Connection`] per attempt; the session task owns the
//! connection exclusively and drops it on loss. Two implementations ship with the crate:
//! an in-process one over a [`MemoryEnsemble`] and a length-delimited TCP one.

mod memory;
mod tcp;

pub use memory::*;
pub use tcp::*;


use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::ClientFrame;
use crate::Result;
use crate::ServerFrame;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Opens a transport connection to `address` (`host:port`).
    ///
    /// # Errors
    /// - [`crate::SystemError::Unreachable`] when the endpoint refuses the connection
    /// - [`crate::SystemError::Io`] for socket failures
    async fn connect(
        &self,
        address: &str,
    ) -> Result<Box<dyn Connection>>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connection: Send + 'static {
    async fn send(
        &mut self,
        frame: ClientFrame,
    ) -> Result<()>;

    /// Next inbound frame, `Ok(None)` once the peer has closed the connection.
    ///
    /// Must be cancel safe: the session task polls it inside `select!`.
    async fn recv(&mut self) -> Result<Option<ServerFrame>>;
}
