//! Wire model shared by the client, the transports and the reference service.
//!
//! A connection carries `ClientFrame`s upstream and `ServerFrame`s downstream. Over TCP
//! each frame is bincode-encoded inside a length-delimited envelope; the in-process
//! transport moves the values directly.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use crate::NodeError;
use crate::Result;

/// Lifetime and naming of a created node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CreateMode {
    #[default]
    Persistent,
    /// Removed when the owning session expires or closes
    Ephemeral,
    /// Name suffixed with a monotonically increasing counter of the parent
    PersistentSequential,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// Scope and lifetime of a watch registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WatchMode {
    /// Fires once for the node or its direct children, then deactivates
    OneShot,
    /// Fires for the node and its direct children until removed
    Persistent,
    /// Fires for the node and every descendant until removed
    Recursive,
}

/// Node metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Stat {
    /// Data version, 0 on creation, +1 per write
    pub version: u64,
    /// Child version, +1 per child created or removed
    pub cversion: u64,
    /// Transaction id that created the node
    pub czxid: u64,
    /// Transaction id of the last modification
    pub mzxid: u64,
    pub num_children: u32,
    /// Owning session for ephemeral nodes
    pub ephemeral_owner: Option<u64>,
}

/// Node operations and watch management requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Create {
        path: String,
        payload: Bytes,
        mode: CreateMode,
        create_parents: bool,
    },
    Delete {
        path: String,
        recursive: bool,
    },
    Read {
        path: String,
    },
    Write {
        path: String,
        payload: Bytes,
        expected_version: Option<u64>,
    },
    ListChildren {
        path: String,
    },
    Exists {
        path: String,
    },
    AddWatch {
        watch_id: u64,
        path: String,
        mode: WatchMode,
    },
    RemoveWatch {
        watch_id: u64,
    },
}

impl Operation {
    /// Short operation name used in logs and metrics labels
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Create { .. } => "create",
            Operation::Delete { .. } => "delete",
            Operation::Read { .. } => "read",
            Operation::Write { .. } => "write",
            Operation::ListChildren { .. } => "list_children",
            Operation::Exists { .. } => "exists",
            Operation::AddWatch { .. } => "add_watch",
            Operation::RemoveWatch { .. } => "remove_watch",
        }
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            Operation::Create { path, .. }
            | Operation::Delete { path, .. }
            | Operation::Read { path }
            | Operation::Write { path, .. }
            | Operation::ListChildren { path }
            | Operation::Exists { path }
            | Operation::AddWatch { path, .. } => Some(path),
            Operation::RemoveWatch { .. } => None,
        }
    }
}

/// Successful outcome of an [`Operation`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpResult {
    /// Actual path of the created node (differs from the request for sequential nodes)
    Created(String),
    Deleted,
    Data { payload: Bytes, stat: Stat },
    Written(Stat),
    Children(Vec<String>),
    Exists(Option<Stat>),
    WatchAdded,
    WatchRemoved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
    ChildAdded,
    ChildRemoved,
}

/// A change notification routed to one watch registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    /// Registration the event is addressed to
    pub watch_id: u64,
    /// Node that changed (the child for `ChildAdded`/`ChildRemoved`)
    pub path: String,
    pub kind: EventKind,
    /// New payload for `Created`, `Updated` and `ChildAdded`
    pub payload: Option<Bytes>,
    /// Node version after the change, absent for removals
    pub version: Option<u64>,
    /// Transaction id of the change
    pub zxid: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Handshake; `session_id` is set when resuming after a connection loss
    Connect {
        session_id: Option<u64>,
        session_timeout_ms: u64,
    },
    Request {
        xid: u64,
        op: Operation,
    },
    Ping,
    /// Ends the session; ephemeral nodes and watches are dropped
    Close,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    Connected {
        session_id: u64,
        session_timeout_ms: u64,
    },
    /// Handshake refused: the session to resume no longer exists
    SessionExpired {
        session_id: u64,
    },
    Reply {
        xid: u64,
        result: std::result::Result<OpResult, NodeError>,
    },
    Event(WatchEvent),
    Pong,
    Closed,
}

pub fn encode<T: Serialize>(frame: &T) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(frame)?))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}
