//! Session task.
//!
//! A single task owns the transport connection for the lifetime of the client. It moves
//! the session through its states, multiplexes queued requests onto the connection,
//! routes replies and watch events, and keeps the session alive with heartbeats.
//!
//! ```text
//! Disconnected -> Connecting -> Connected <-> Suspended
//!                      ^                         |
//!                      +------ Expired <---------+
//! any -> Closed
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Notify;
use tokio::time::interval_at;
use tokio::time::sleep;
use tokio::time::sleep_until;
use tokio::time::timeout;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::Command;
use super::Completions;
use super::WatchRegistry;
use crate::constants::HEARTBEAT_DIVISOR;
use crate::metrics::SESSION_TRANSITIONS;
use crate::network::Connection;
use crate::network::Connector;
use crate::utils::async_task::task_with_timeout_and_backoff;
use crate::ClientConfig;
use crate::ClientFrame;
use crate::Error;
use crate::Operation;
use crate::Result;
use crate::ServerFrame;
use crate::SessionError;
use crate::SystemError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// Connection lost; requests stay queued while the session is being resumed
    Suspended,
    /// The session is gone; in-flight requests and watches were dropped with it
    Expired,
    /// Terminal, reached through `close()`
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Suspended => "suspended",
            SessionState::Expired => "expired",
            SessionState::Closed => "closed",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) enum Handshake {
    Established {
        connection: Box<dyn Connection>,
        session_id: u64,
        session_timeout_ms: u64,
    },
    /// The service no longer knows the session
    Rejected(u64),
}

/// Opens a connection to `endpoint` and negotiates (or resumes) a session on it
pub(crate) async fn handshake(
    connector: Arc<dyn Connector>,
    endpoint: String,
    session_id: Option<u64>,
    session_timeout_ms: u64,
) -> Result<Handshake> {
    let mut connection = connector.connect(&endpoint).await?;
    connection
        .send(ClientFrame::Connect {
            session_id,
            session_timeout_ms,
        })
        .await?;

    match connection.recv().await? {
        Some(ServerFrame::Connected {
            session_id,
            session_timeout_ms,
        }) => {
            debug!(%endpoint, session_id, session_timeout_ms, "handshake accepted");
            Ok(Handshake::Established {
                connection,
                session_id,
                session_timeout_ms,
            })
        }
        Some(ServerFrame::SessionExpired { session_id }) => Ok(Handshake::Rejected(session_id)),
        Some(other) => Err(SystemError::UnexpectedFrame(format!("{other:?}")).into()),
        None => Err(SystemError::ConnectionClosed.into()),
    }
}

struct InFlight {
    op: Operation,
    responder: super::Responder,
}

enum Served {
    Lost,
    Expired,
    Closed,
}

enum Resumed {
    Connection(Box<dyn Connection>),
    Expired,
    Closed,
}

pub(crate) struct SessionTask {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    endpoints: Arc<ArcSwap<Vec<String>>>,
    /// Rotates the endpoint tried first on every (re)connection
    cursor: usize,
    commands: mpsc::UnboundedReceiver<Command>,
    closing: Arc<Notify>,
    state: watch::Sender<SessionState>,
    transitions: broadcast::Sender<SessionState>,
    watches: WatchRegistry,
    completions: Completions,
    session_id: Arc<AtomicU64>,
    session_timeout: Duration,
    next_xid: u64,
    in_flight: BTreeMap<u64, InFlight>,
    close_acks: Vec<oneshot::Sender<()>>,
}

/// Handles the client keeps on the state owned by a [`SessionTask`]
pub(crate) struct SessionHandles {
    pub(crate) commands: mpsc::UnboundedSender<Command>,
    pub(crate) closing: Arc<Notify>,
    pub(crate) state: watch::Receiver<SessionState>,
    pub(crate) transitions: broadcast::Sender<SessionState>,
    pub(crate) session_id: Arc<AtomicU64>,
}

impl SessionTask {
    pub(crate) fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        endpoints: Arc<ArcSwap<Vec<String>>>,
        watches: WatchRegistry,
        completions: Completions,
        transitions: broadcast::Sender<SessionState>,
    ) -> (Self, SessionHandles) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(SessionState::Disconnected);
        let closing = Arc::new(Notify::new());
        let session_id = Arc::new(AtomicU64::new(0));
        let session_timeout = config.session_timeout();

        let handles = SessionHandles {
            commands: commands_tx,
            closing: closing.clone(),
            state: state_rx,
            transitions: transitions.clone(),
            session_id: session_id.clone(),
        };
        let task = Self {
            config,
            connector,
            endpoints,
            cursor: 0,
            commands,
            closing,
            state,
            transitions,
            watches,
            completions,
            session_id,
            session_timeout,
            next_xid: 1,
            in_flight: BTreeMap::new(),
            close_acks: Vec::new(),
        };
        (task, handles)
    }

    /// Negotiates a brand-new session, retrying per the configured policy
    ///
    /// # Errors
    /// [`SessionError::Connection`] once every attempt has failed.
    pub(crate) async fn establish(&mut self) -> Result<Box<dyn Connection>> {
        self.transition(SessionState::Connecting);

        let endpoints = self.endpoints.load_full();
        let cursor = self.cursor;
        let connector = self.connector.clone();
        let session_timeout_ms = self.config.session_timeout_ms;
        let outcome = task_with_timeout_and_backoff(
            &self.config.retry,
            self.config.connect_timeout(),
            |attempt| {
                let endpoint = endpoints[(cursor + attempt) % endpoints.len()].clone();
                handshake(connector.clone(), endpoint, None, session_timeout_ms)
            },
        )
        .await;
        self.cursor = self.cursor.wrapping_add(1);

        match outcome? {
            Handshake::Established {
                connection,
                session_id,
                session_timeout_ms,
            } => {
                self.session_id.store(session_id, Ordering::SeqCst);
                self.session_timeout = Duration::from_millis(session_timeout_ms);
                self.transition(SessionState::Connected);
                Ok(connection)
            }
            Handshake::Rejected(session_id) => Err(SystemError::UnexpectedFrame(format!(
                "new session rejected as expired session {session_id:#x}"
            ))
            .into()),
        }
    }

    /// Drives the session until it is closed
    pub(crate) async fn run(
        mut self,
        mut connection: Box<dyn Connection>,
    ) -> Result<()> {
        loop {
            match self.serve(&mut connection).await {
                Served::Closed => break,
                Served::Expired => self.expire(),
                Served::Lost => {
                    self.transition(SessionState::Suspended);
                    match self.resume().await {
                        Resumed::Connection(resumed) => {
                            connection = resumed;
                            self.transition(SessionState::Connected);
                            continue;
                        }
                        Resumed::Expired => self.expire(),
                        Resumed::Closed => break,
                    }
                }
            }

            match self.renew().await {
                Some(renewed) => connection = renewed,
                None => break,
            }
        }

        self.shutdown();
        Ok(())
    }

    fn transition(
        &self,
        state: SessionState,
    ) {
        let previous = self.state.send_replace(state);
        if previous == state {
            return;
        }
        info!(
            session_id = self.session_id.load(Ordering::SeqCst),
            from = %previous,
            to = %state,
            "session state changed"
        );
        SESSION_TRANSITIONS
            .with_label_values(&[state.as_str()])
            .inc();
        let _ = self.transitions.send(state);
    }

    /// Serves a connected session until the connection is lost, the session expires or
    /// the client closes it
    async fn serve(
        &mut self,
        connection: &mut Box<dyn Connection>,
    ) -> Served {
        // requests sent on a previous connection may not have been answered
        let resend: Vec<ClientFrame> = self
            .in_flight
            .iter()
            .map(|(xid, in_flight)| ClientFrame::Request {
                xid: *xid,
                op: in_flight.op.clone(),
            })
            .collect();
        if !resend.is_empty() {
            debug!(resent = resend.len(), "resending in-flight requests");
        }
        for frame in resend {
            if let Err(e) = connection.send(frame).await {
                warn!("resending request failed: {}", e);
                return Served::Lost;
            }
        }

        let ping_every = self.session_timeout / HEARTBEAT_DIVISOR;
        let read_timeout = ping_every * 2;
        let mut heartbeat = interval_at(Instant::now() + ping_every, ping_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_heard = Instant::now();

        loop {
            tokio::select! {
                inbound = connection.recv() => match inbound {
                    Ok(Some(frame)) => {
                        last_heard = Instant::now();
                        if let Some(outcome) = self.on_frame(frame) {
                            return outcome;
                        }
                    }
                    Ok(None) => {
                        info!("connection closed by the service");
                        return Served::Lost;
                    }
                    Err(e) => {
                        warn!("connection failed: {}", e);
                        return Served::Lost;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(Command::Request { op, responder }) => {
                        let xid = self.next_xid;
                        self.next_xid += 1;
                        trace!(xid, op = op.name(), path = ?op.path(), "sending request");
                        let frame = ClientFrame::Request { xid, op: op.clone() };
                        self.in_flight.insert(xid, InFlight { op, responder });
                        if let Err(e) = connection.send(frame).await {
                            warn!(xid, "sending request failed: {}", e);
                            return Served::Lost;
                        }
                    }
                    Some(Command::Close { done }) => {
                        self.close_acks.push(done);
                        self.close_connected(connection).await;
                        return Served::Closed;
                    }
                    None => {
                        debug!("every client handle dropped, closing session");
                        self.close_connected(connection).await;
                        return Served::Closed;
                    }
                },
                _ = heartbeat.tick() => {
                    if last_heard.elapsed() > read_timeout {
                        warn!("nothing heard from the service for {:?}", last_heard.elapsed());
                        return Served::Lost;
                    }
                    if let Err(e) = connection.send(ClientFrame::Ping).await {
                        warn!("heartbeat failed: {}", e);
                        return Served::Lost;
                    }
                }
            }
        }
    }

    fn on_frame(
        &mut self,
        frame: ServerFrame,
    ) -> Option<Served> {
        match frame {
            ServerFrame::Reply { xid, result } => match self.in_flight.remove(&xid) {
                Some(in_flight) => {
                    trace!(xid, ok = result.is_ok(), "reply received");
                    self.completions
                        .deliver(&in_flight.op, in_flight.responder, result.map_err(Error::from));
                }
                None => debug!(xid, "reply for unknown request ignored"),
            },
            ServerFrame::Event(event) => {
                trace!(watch_id = event.watch_id, path = %event.path, kind = ?event.kind, "watch event");
                self.watches.deliver(event);
            }
            ServerFrame::Pong => {}
            ServerFrame::SessionExpired { session_id } => {
                warn!(session_id, "service expired the session");
                return Some(Served::Expired);
            }
            ServerFrame::Closed => {
                warn!("service closed the session unexpectedly");
                return Some(Served::Expired);
            }
            ServerFrame::Connected { .. } => warn!("unexpected handshake frame ignored"),
        }
        None
    }

    /// Tries to resume the current session until its timeout elapses
    async fn resume(&mut self) -> Resumed {
        let session_id = self.session_id.load(Ordering::SeqCst);
        let deadline = Instant::now() + self.session_timeout;
        let endpoints = self.endpoints.load_full();
        let closing = self.closing.clone();
        let mut attempt = 0usize;

        loop {
            let endpoint = endpoints[(self.cursor + attempt) % endpoints.len()].clone();
            let reconnect = timeout(
                self.config.connect_timeout(),
                handshake(
                    self.connector.clone(),
                    endpoint.clone(),
                    Some(session_id),
                    self.config.session_timeout_ms,
                ),
            );

            tokio::select! {
                _ = closing.notified() => return Resumed::Closed,
                _ = sleep_until(deadline) => {
                    info!("session timeout elapsed while suspended");
                    return Resumed::Expired;
                }
                outcome = reconnect => match outcome {
                    Ok(Ok(Handshake::Established { connection, session_timeout_ms, .. })) => {
                        self.session_timeout = Duration::from_millis(session_timeout_ms);
                        info!(%endpoint, attempt, "session resumed");
                        return Resumed::Connection(connection);
                    }
                    Ok(Ok(Handshake::Rejected(_))) => return Resumed::Expired,
                    Ok(Err(e)) => debug!(%endpoint, attempt, "reconnect failed: {}", e),
                    Err(_) => debug!(%endpoint, attempt, "reconnect timed out"),
                }
            }

            let delay = self.config.retry.delay_after(attempt);
            attempt += 1;
            tokio::select! {
                _ = closing.notified() => return Resumed::Closed,
                _ = sleep_until(deadline) => {
                    info!("session timeout elapsed while suspended");
                    return Resumed::Expired;
                }
                _ = sleep(delay) => {}
            }
        }
    }

    /// Drops everything tied to the expired session
    fn expire(&mut self) {
        let session_id = self.session_id.swap(0, Ordering::SeqCst);
        self.transition(SessionState::Expired);
        for (_, in_flight) in std::mem::take(&mut self.in_flight) {
            self.completions.deliver(
                &in_flight.op,
                in_flight.responder,
                Err(SessionError::Expired(session_id).into()),
            );
        }
        let dropped = self.watches.invalidate();
        info!(session_id, dropped_watches = dropped, "session expired");
    }

    /// Negotiates a new session after expiry. `None` once the client is closed.
    async fn renew(&mut self) -> Option<Box<dyn Connection>> {
        let closing = self.closing.clone();
        loop {
            tokio::select! {
                _ = closing.notified() => return None,
                established = self.establish() => match established {
                    Ok(connection) => return Some(connection),
                    Err(e) => warn!("could not establish a new session: {}", e),
                }
            }

            self.transition(SessionState::Disconnected);
            tokio::select! {
                _ = closing.notified() => return None,
                _ = sleep(self.config.retry.max_delay()) => {}
            }
        }
    }

    /// Sends `Close` and settles the replies that are still on their way
    async fn close_connected(
        &mut self,
        connection: &mut Box<dyn Connection>,
    ) {
        if let Err(e) = connection.send(ClientFrame::Close).await {
            debug!("close frame not sent: {}", e);
            return;
        }
        let deadline = Instant::now() + self.config.request_timeout();
        loop {
            match tokio::time::timeout_at(deadline, connection.recv()).await {
                Ok(Ok(Some(ServerFrame::Closed))) => {
                    debug!("service acknowledged close");
                    return;
                }
                Ok(Ok(Some(frame))) => {
                    self.on_frame(frame);
                }
                Ok(Ok(None)) | Ok(Err(_)) => return,
                Err(_) => {
                    warn!("close not acknowledged within {:?}", self.config.request_timeout());
                    return;
                }
            }
        }
    }

    fn shutdown(&mut self) {
        self.transition(SessionState::Closed);
        self.session_id.store(0, Ordering::SeqCst);

        for (_, in_flight) in std::mem::take(&mut self.in_flight) {
            self.completions
                .deliver(&in_flight.op, in_flight.responder, Err(SessionError::Closed.into()));
        }
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Request { op, responder } => {
                    self.completions
                        .deliver(&op, responder, Err(SessionError::Closed.into()))
                }
                Command::Close { done } => self.close_acks.push(done),
            }
        }
        self.watches.invalidate();
        for done in self.close_acks.drain(..) {
            let _ = done.send(());
        }
    }
}
