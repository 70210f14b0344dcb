//! Single-process reference coordination service.
//!
//! The service owns the namespace, the sessions and their server-side watches. It is
//! transport agnostic: transports attach a connection with an outbound channel, feed it
//! the decoded [`ClientFrame`]s and forward whatever lands in that channel. Everything
//! runs under the caller's lock, so request execution is serialized.
//!
//! There is no replication here; this is what the client talks to in tests and in the
//! standalone binary.

mod data_tree;

pub(crate) use data_tree::*;


use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::constants::PARKED_EVENT_CAPACITY;
use crate::constants::REPLY_CACHE_CAPACITY;
use crate::metrics;
use crate::path;
use crate::ClientFrame;
use crate::EventKind;
use crate::NodeError;
use crate::OpResult;
use crate::Operation;
use crate::ServerFrame;
use crate::ServerSettings;
use crate::WatchEvent;
use crate::WatchMode;

pub type ConnectionId = u64;

type Reply = std::result::Result<OpResult, NodeError>;

#[derive(Debug, Clone)]
struct ServerWatch {
    id: u64,
    path: String,
    mode: WatchMode,
}

impl ServerWatch {
    /// Event kind this watch observes for `change`, if any
    fn matches(
        &self,
        change: &Change,
    ) -> Option<EventKind> {
        let own_kind = match change.kind {
            ChangeKind::Created => EventKind::Created,
            ChangeKind::Updated => EventKind::Updated,
            ChangeKind::Deleted => EventKind::Deleted,
        };
        match self.mode {
            WatchMode::Recursive => {
                path::is_ancestor_or_self(&self.path, &change.path).then_some(own_kind)
            }
            WatchMode::OneShot | WatchMode::Persistent => {
                if self.path == change.path {
                    return Some(own_kind);
                }
                if path::parent(&change.path) != Some(self.path.as_str()) {
                    return None;
                }
                match change.kind {
                    ChangeKind::Created => Some(EventKind::ChildAdded),
                    ChangeKind::Deleted => Some(EventKind::ChildRemoved),
                    ChangeKind::Updated => None,
                }
            }
        }
    }
}

#[derive(Debug)]
struct Session {
    id: u64,
    timeout: Duration,
    last_seen: Instant,
    connection: Option<ConnectionId>,
    watches: Vec<ServerWatch>,
    /// Highest request id executed for this session
    last_xid: u64,
    replies: VecDeque<(u64, Reply)>,
    /// Events produced while no connection was bound
    parked: VecDeque<ServerFrame>,
}

impl Session {
    fn cached_reply(
        &self,
        xid: u64,
    ) -> Option<Reply> {
        self.replies
            .iter()
            .find(|(id, _)| *id == xid)
            .map(|(_, r)| r.clone())
    }

    fn remember(
        &mut self,
        xid: u64,
        reply: Reply,
    ) {
        self.last_xid = xid;
        self.replies.push_back((xid, reply));
        while self.replies.len() > REPLY_CACHE_CAPACITY {
            self.replies.pop_front();
        }
    }
}

#[derive(Debug)]
struct Attached {
    sender: mpsc::UnboundedSender<ServerFrame>,
    session_id: Option<u64>,
}

#[derive(Debug)]
pub struct CoordinationService {
    tree: DataTree,
    sessions: HashMap<u64, Session>,
    connections: HashMap<ConnectionId, Attached>,
    next_session_id: u64,
    next_connection_id: ConnectionId,
    min_session_timeout_ms: u64,
    max_session_timeout_ms: u64,
}

impl Default for CoordinationService {
    fn default() -> Self {
        Self::new(&ServerSettings::default())
    }
}

impl CoordinationService {
    pub fn new(settings: &ServerSettings) -> Self {
        Self {
            tree: DataTree::default(),
            sessions: HashMap::new(),
            connections: HashMap::new(),
            next_session_id: 0x1000,
            next_connection_id: 1,
            min_session_timeout_ms: settings.min_session_timeout_ms,
            max_session_timeout_ms: settings.max_session_timeout_ms,
        }
    }

    /// Registers a transport connection; frames for it are pushed to `sender`
    pub fn attach(
        &mut self,
        sender: mpsc::UnboundedSender<ServerFrame>,
    ) -> ConnectionId {
        let id = self.next_connection_id;
        self.next_connection_id += 1;
        self.connections.insert(
            id,
            Attached {
                sender,
                session_id: None,
            },
        );
        trace!(connection_id = id, "connection attached");
        id
    }

    /// Forgets a transport connection. Its session survives until it times out.
    pub fn detach(
        &mut self,
        connection: ConnectionId,
    ) {
        if let Some(attached) = self.connections.remove(&connection) {
            if let Some(session) = attached.session_id.and_then(|id| self.sessions.get_mut(&id)) {
                if session.connection == Some(connection) {
                    session.connection = None;
                }
            }
            debug!(
                connection_id = connection,
                session_id = ?attached.session_id,
                "connection detached"
            );
        }
    }

    /// Processes one inbound frame
    pub fn handle(
        &mut self,
        connection: ConnectionId,
        frame: ClientFrame,
    ) {
        if !self.is_attached(connection) {
            trace!(connection_id = connection, "frame for detached connection ignored");
            return;
        }
        let now = Instant::now();
        self.reap(now);

        match frame {
            ClientFrame::Connect {
                session_id,
                session_timeout_ms,
            } => self.handshake(connection, session_id, session_timeout_ms, now),
            ClientFrame::Request { xid, op } => self.request(connection, xid, op, now),
            ClientFrame::Ping => {
                if self.touch(connection, now).is_some() {
                    self.send(connection, ServerFrame::Pong);
                }
            }
            ClientFrame::Close => {
                if let Some(session_id) = self.touch(connection, now) {
                    self.close_session(session_id);
                    self.send(connection, ServerFrame::Closed);
                    info!(session_id, "session closed by client");
                }
            }
        }
    }

    /// Expires every session silent for longer than its timeout
    pub fn reap(
        &mut self,
        now: Instant,
    ) -> usize {
        let expired: Vec<u64> = self
            .sessions
            .values()
            .filter(|s| now.saturating_duration_since(s.last_seen) > s.timeout)
            .map(|s| s.id)
            .collect();
        for session_id in &expired {
            self.expire_session(*session_id);
        }
        expired.len()
    }

    /// Ends a session as if it timed out: its connection is told and ephemerals go away
    pub fn expire_session(
        &mut self,
        session_id: u64,
    ) -> bool {
        let connection = match self.sessions.get(&session_id) {
            Some(session) => session.connection,
            None => return false,
        };
        info!(session_id, "session expired");
        if let Some(connection) = connection {
            self.send(connection, ServerFrame::SessionExpired { session_id });
            if let Some(attached) = self.connections.get_mut(&connection) {
                attached.session_id = None;
            }
        }
        self.close_session(session_id);
        metrics::SESSIONS_EXPIRED.inc();
        true
    }

    /// Drops every attached connection; the transport sees its outbound channel close
    pub fn drop_connections(&mut self) -> usize {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in &ids {
            self.detach(*id);
        }
        ids.len()
    }

    pub fn is_attached(
        &self,
        connection: ConnectionId,
    ) -> bool {
        self.connections.contains_key(&connection)
    }

    pub fn session_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn watch_count(&self) -> usize {
        self.sessions.values().map(|s| s.watches.len()).sum()
    }

    pub fn node_count(&self) -> usize {
        self.tree.node_count()
    }

    pub fn last_zxid(&self) -> u64 {
        self.tree.last_zxid()
    }

    fn handshake(
        &mut self,
        connection: ConnectionId,
        session_id: Option<u64>,
        requested_timeout_ms: u64,
        now: Instant,
    ) {
        let timeout_ms =
            requested_timeout_ms.clamp(self.min_session_timeout_ms, self.max_session_timeout_ms);

        let session_id = match session_id {
            Some(id) if self.sessions.contains_key(&id) => id,
            Some(id) => {
                debug!(session_id = id, "handshake for unknown session");
                self.send(connection, ServerFrame::SessionExpired { session_id: id });
                return;
            }
            None => {
                let id = self.next_session_id;
                self.next_session_id += 1;
                self.sessions.insert(
                    id,
                    Session {
                        id,
                        timeout: Duration::from_millis(timeout_ms),
                        last_seen: now,
                        connection: None,
                        watches: Vec::new(),
                        last_xid: 0,
                        replies: VecDeque::new(),
                        parked: VecDeque::new(),
                    },
                );
                info!(session_id = id, timeout_ms, "session created");
                id
            }
        };

        // A resumed session may still be bound to a stale connection
        let previous = self.sessions.get(&session_id).and_then(|s| s.connection);
        if let Some(previous) = previous.filter(|p| *p != connection) {
            if let Some(attached) = self.connections.get_mut(&previous) {
                attached.session_id = None;
            }
        }
        if let Some(attached) = self.connections.get_mut(&connection) {
            attached.session_id = Some(session_id);
        }

        let (timeout_ms, parked) = match self.sessions.get_mut(&session_id) {
            Some(session) => {
                session.connection = Some(connection);
                session.last_seen = now;
                (
                    session.timeout.as_millis() as u64,
                    std::mem::take(&mut session.parked),
                )
            }
            None => return,
        };

        self.send(
            connection,
            ServerFrame::Connected {
                session_id,
                session_timeout_ms: timeout_ms,
            },
        );
        for frame in parked {
            self.send(connection, frame);
        }
    }

    fn request(
        &mut self,
        connection: ConnectionId,
        xid: u64,
        op: Operation,
        now: Instant,
    ) {
        let Some(session_id) = self.touch(connection, now) else {
            warn!(connection_id = connection, xid, "request without session, dropped");
            return;
        };

        if let Some(session) = self.sessions.get(&session_id) {
            if xid <= session.last_xid {
                match session.cached_reply(xid) {
                    Some(result) => {
                        debug!(session_id, xid, "answering resent request from cache");
                        self.send(connection, ServerFrame::Reply { xid, result });
                    }
                    None => warn!(session_id, xid, "resent request fell out of reply cache"),
                }
                return;
            }
        }

        let op_name = op.name();
        let (result, changes) = self.execute(session_id, op);
        trace!(session_id, xid, op = op_name, ok = result.is_ok(), "request executed");

        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.remember(xid, result.clone());
        }
        // watchers observe the change before the writer sees its reply
        self.trigger(&changes);
        self.send(connection, ServerFrame::Reply { xid, result });
    }

    fn execute(
        &mut self,
        session_id: u64,
        op: Operation,
    ) -> (Reply, Vec<Change>) {
        match op {
            Operation::Create {
                path,
                payload,
                mode,
                create_parents,
            } => match self
                .tree
                .create(&path, payload, mode, create_parents, session_id)
            {
                Ok((actual, changes)) => (Ok(OpResult::Created(actual)), changes),
                Err(e) => (Err(e), Vec::new()),
            },
            Operation::Delete { path, recursive } => match self.tree.delete(&path, recursive) {
                Ok(changes) => (Ok(OpResult::Deleted), changes),
                Err(e) => (Err(e), Vec::new()),
            },
            Operation::Read { path } => (
                self.tree
                    .read(&path)
                    .map(|(payload, stat)| OpResult::Data { payload, stat }),
                Vec::new(),
            ),
            Operation::Write {
                path,
                payload,
                expected_version,
            } => match self.tree.write(&path, payload, expected_version) {
                Ok((stat, change)) => (Ok(OpResult::Written(stat)), vec![change]),
                Err(e) => (Err(e), Vec::new()),
            },
            Operation::ListChildren { path } => {
                (self.tree.children(&path).map(OpResult::Children), Vec::new())
            }
            Operation::Exists { path } => {
                (self.tree.exists(&path).map(OpResult::Exists), Vec::new())
            }
            Operation::AddWatch {
                watch_id,
                path,
                mode,
            } => {
                if let Err(e) = path::validate_path(&path) {
                    return (Err(e), Vec::new());
                }
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.watches.retain(|w| w.id != watch_id);
                    session.watches.push(ServerWatch {
                        id: watch_id,
                        path,
                        mode,
                    });
                }
                (Ok(OpResult::WatchAdded), Vec::new())
            }
            Operation::RemoveWatch { watch_id } => {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.watches.retain(|w| w.id != watch_id);
                }
                (Ok(OpResult::WatchRemoved), Vec::new())
            }
        }
    }

    /// Routes the events produced by `changes` to every matching watch
    fn trigger(
        &mut self,
        changes: &[Change],
    ) {
        if changes.is_empty() {
            return;
        }
        let Self {
            sessions,
            connections,
            ..
        } = self;

        for session in sessions.values_mut() {
            for change in changes {
                let mut fired_once = Vec::new();
                for watch in &session.watches {
                    let Some(kind) = watch.matches(change) else {
                        continue;
                    };
                    if watch.mode == WatchMode::OneShot {
                        fired_once.push(watch.id);
                    }
                    let carries_data = matches!(
                        kind,
                        EventKind::Created | EventKind::Updated | EventKind::ChildAdded
                    );
                    let frame = ServerFrame::Event(WatchEvent {
                        watch_id: watch.id,
                        path: change.path.clone(),
                        kind,
                        payload: if carries_data {
                            change.payload.clone()
                        } else {
                            None
                        },
                        version: change.version,
                        zxid: change.zxid,
                    });

                    let delivered = session
                        .connection
                        .and_then(|c| connections.get(&c))
                        .map(|attached| attached.sender.send(frame.clone()).is_ok())
                        .unwrap_or(false);
                    if !delivered {
                        park(&mut session.parked, session.id, frame);
                    }
                }
                if !fired_once.is_empty() {
                    session.watches.retain(|w| !fired_once.contains(&w.id));
                }
            }
        }
    }

    /// Removes the session, its watches and its ephemeral nodes
    fn close_session(
        &mut self,
        session_id: u64,
    ) {
        if let Some(session) = self.sessions.remove(&session_id) {
            if let Some(attached) = session.connection.and_then(|c| self.connections.get_mut(&c)) {
                attached.session_id = None;
            }
        }
        let changes = self.tree.remove_ephemerals(session_id);
        self.trigger(&changes);
    }

    /// Refreshes the session bound to `connection`, returning its id
    fn touch(
        &mut self,
        connection: ConnectionId,
        now: Instant,
    ) -> Option<u64> {
        let session_id = self.connections.get(&connection)?.session_id?;
        let session = self.sessions.get_mut(&session_id)?;
        session.last_seen = now;
        Some(session_id)
    }

    fn send(
        &mut self,
        connection: ConnectionId,
        frame: ServerFrame,
    ) {
        let alive = self
            .connections
            .get(&connection)
            .map(|attached| attached.sender.send(frame).is_ok())
            .unwrap_or(false);
        if !alive {
            trace!(connection_id = connection, "outbound channel closed");
        }
    }
}

fn park(
    parked: &mut VecDeque<ServerFrame>,
    session_id: u64,
    frame: ServerFrame,
) {
    if parked.len() >= PARKED_EVENT_CAPACITY {
        warn!(session_id, "parked event buffer full, dropping oldest");
        parked.pop_front();
    }
    parked.push_back(frame);
}
