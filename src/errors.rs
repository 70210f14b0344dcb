//! Coordination Client Error Hierarchy
//!
//! Errors are grouped by the layer that raises them: infrastructure (I/O, codec, tasks),
//! session lifecycle, and node preconditions evaluated by the coordination service.
//! Node errors travel over the wire unchanged, so they are serializable.

use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;
use tokio::task::JoinError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Infrastructure-level failures (network, serialization, background tasks)
    #[error(transparent)]
    System(#[from] SystemError),

    /// Configuration loading or validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Session lifecycle failures
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Node precondition failures reported by the coordination service
    #[error(transparent)]
    Node(#[from] NodeError),

    /// Mirror content is not trustworthy until the next successful `start`
    #[error("Mirror rooted at {0} was invalidated by session expiry")]
    MirrorInvalidated(String),

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Frame encode/decode failures
    #[error(transparent)]
    Codec(#[from] bincode::Error),

    /// Peer closed the connection
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// Endpoint refused or unreachable
    #[error("Endpoint {0} unreachable")]
    Unreachable(String),

    /// Malformed `host:port` address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// The peer sent a frame that is not valid at this point of the protocol
    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(String),

    #[error("Background task failed: {0}")]
    TaskFailed(#[from] JoinError),

    #[error("{0}")]
    SignalSendFailed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Retry policy exhausted without establishing a session
    #[error("Failed to connect after {attempts} attempts: {last_error}")]
    Connection { attempts: usize, last_error: String },

    /// Operation issued after (or pending during) `close()`
    #[error("Session closed")]
    Closed,

    /// The session the operation belonged to has expired
    #[error("Session {0:#x} expired")]
    Expired(u64),

    /// The service did not answer within the per-operation timeout
    #[error("Operation timed out after {0:?}")]
    OperationTimeout(Duration),
}

/// Precondition failures evaluated by the coordination service.
///
/// Never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum NodeError {
    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Node has children: {0}")]
    NotEmpty(String),

    #[error("Version conflict on {path}: expected {expected}, actual {actual}")]
    VersionConflict {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("Invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    /// Ephemeral nodes cannot have children
    #[error("Ephemeral node cannot have children: {0}")]
    NoChildrenForEphemerals(String),
}

impl Error {
    /// Node precondition failure carried by this error, if any
    pub fn node_error(&self) -> Option<&NodeError> {
        match self {
            Error::Node(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_no_node(&self) -> bool {
        matches!(self, Error::Node(NodeError::NoNode(_)))
    }

    pub fn is_node_exists(&self) -> bool {
        matches!(self, Error::Node(NodeError::NodeExists(_)))
    }

    pub fn is_session_closed(&self) -> bool {
        matches!(self, Error::Session(SessionError::Closed))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::System(SystemError::Io(e))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::System(SystemError::Codec(e))
    }
}
