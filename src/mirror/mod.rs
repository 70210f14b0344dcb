//! Watch-driven local mirror of remote state.
//!
//! A [`Mirror`] is rooted at a path and follows one of three scopes:
//!
//! - [`MirrorScope::Node`]: the root node itself, through a persistent watch
//! - [`MirrorScope::Children`]: the direct children of the root, through a recursive watch
//!   filtered to one level below the root
//! - [`MirrorScope::Subtree`]: the root and every descendant, through a recursive watch
//!
//! The watch is installed before the initial load so no change is missed; events that
//! arrive while loading are applied afterwards. Entries are written only by the mirror's
//! delivery task and can be read from anywhere without blocking.

#[cfg(test)]
mod mirror_test;

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::metrics::MIRROR_EVENTS_APPLIED;
use crate::path;
use crate::Client;
use crate::Error;
use crate::EventKind;
use crate::NodeData;
use crate::Result;
use crate::SessionError;
use crate::SystemError;
use crate::WatchEvent;
use crate::WatchMode;
use crate::WatchRegistration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MirrorScope {
    Node,
    Children,
    Subtree,
}

impl MirrorScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            MirrorScope::Node => "node",
            MirrorScope::Children => "children",
            MirrorScope::Subtree => "subtree",
        }
    }

    fn watch_mode(&self) -> WatchMode {
        match self {
            MirrorScope::Node => WatchMode::Persistent,
            MirrorScope::Children | MirrorScope::Subtree => WatchMode::Recursive,
        }
    }

    /// Kind under which `event` is mirrored, `None` if it is out of scope
    fn classify(
        &self,
        root: &str,
        event: &WatchEvent,
    ) -> Option<EventKind> {
        match self {
            MirrorScope::Node => (event.path == root
                && matches!(
                    event.kind,
                    EventKind::Created | EventKind::Updated | EventKind::Deleted
                ))
            .then_some(event.kind),
            MirrorScope::Children => {
                if path::parent(&event.path) != Some(root) {
                    return None;
                }
                match event.kind {
                    EventKind::Created | EventKind::ChildAdded => Some(EventKind::ChildAdded),
                    EventKind::Deleted | EventKind::ChildRemoved => Some(EventKind::ChildRemoved),
                    EventKind::Updated => Some(EventKind::Updated),
                }
            }
            MirrorScope::Subtree => Some(event.kind),
        }
    }
}

/// Last known state of one mirrored node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub path: String,
    pub payload: Bytes,
    pub version: u64,
    /// Transaction id of the change this entry reflects
    pub zxid: u64,
    /// `None` when the entry comes from the initial load
    pub last_event: Option<EventKind>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorEvent {
    /// `start` completed; the mirror holds `entries` nodes
    Loaded { entries: usize },
    /// An entry was added, replaced or (with `entry == None`) removed
    Changed {
        path: String,
        kind: EventKind,
        entry: Option<CacheEntry>,
    },
    /// The session expired or closed; reads fail until the mirror is started again
    Invalidated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorStatus {
    Stopped,
    Starting,
    Live,
    Invalidated,
}

#[derive(Debug)]
struct MirrorShared {
    root: String,
    scope: MirrorScope,
    entries: RwLock<BTreeMap<String, CacheEntry>>,
    status: RwLock<MirrorStatus>,
    /// Set by session loss, cleared only when a later `start` goes live
    invalidated: AtomicBool,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<MirrorEvent>>>,
}

impl MirrorShared {
    fn set_status(
        &self,
        status: MirrorStatus,
    ) {
        *self.status.write() = status;
    }

    fn notify(
        &self,
        event: MirrorEvent,
    ) {
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    fn insert_loaded(
        &self,
        path: &str,
        data: NodeData,
    ) {
        let entry = CacheEntry {
            path: path.to_string(),
            payload: data.payload,
            version: data.stat.version,
            zxid: data.stat.mzxid,
            last_event: None,
        };
        self.entries.write().insert(path.to_string(), entry);
    }

    /// Applies one watch event; stale events (older than the entry) are skipped
    fn apply(
        &self,
        event: WatchEvent,
    ) {
        let Some(kind) = self.scope.classify(&self.root, &event) else {
            trace!(path = %event.path, kind = ?event.kind, "event outside mirror scope");
            return;
        };

        let removal = matches!(kind, EventKind::Deleted | EventKind::ChildRemoved);
        let changed = {
            let mut entries = self.entries.write();
            let current_zxid = entries.get(&event.path).map(|e| e.zxid);
            if removal {
                match current_zxid {
                    Some(zxid) if zxid < event.zxid => {
                        entries.remove(&event.path);
                        Some(None)
                    }
                    _ => None,
                }
            } else if current_zxid.is_some_and(|zxid| zxid >= event.zxid) {
                None
            } else {
                let entry = CacheEntry {
                    path: event.path.clone(),
                    payload: event.payload.clone().unwrap_or_default(),
                    version: event.version.unwrap_or_default(),
                    zxid: event.zxid,
                    last_event: Some(kind),
                };
                entries.insert(event.path.clone(), entry.clone());
                Some(Some(entry))
            }
        };

        match changed {
            Some(entry) => {
                MIRROR_EVENTS_APPLIED
                    .with_label_values(&[self.scope.as_str()])
                    .inc();
                self.notify(MirrorEvent::Changed {
                    path: event.path,
                    kind,
                    entry,
                });
            }
            None => trace!(path = %event.path, zxid = event.zxid, "stale event skipped"),
        }
    }

    fn invalidate(&self) {
        self.entries.write().clear();
        self.invalidated.store(true, Ordering::SeqCst);
        self.set_status(MirrorStatus::Invalidated);
        info!(root = %self.root, scope = self.scope.as_str(), "mirror invalidated");
        self.notify(MirrorEvent::Invalidated);
    }

    fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    /// Releases every entry; an invalidated mirror stays invalidated
    fn reset(&self) {
        self.entries.write().clear();
        if self.is_invalidated() {
            self.set_status(MirrorStatus::Invalidated);
        } else {
            self.set_status(MirrorStatus::Stopped);
        }
    }

    fn go_live(&self) {
        self.invalidated.store(false, Ordering::SeqCst);
        self.set_status(MirrorStatus::Live);
    }
}

struct Running {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Local cache of a node, its children or a subtree
pub struct Mirror {
    client: Client,
    shared: Arc<MirrorShared>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl std::fmt::Debug for Mirror {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Mirror")
            .field("root", &self.shared.root)
            .field("scope", &self.shared.scope)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Mirror {
    pub fn new(
        client: &Client,
        root: &str,
        scope: MirrorScope,
    ) -> Result<Self> {
        path::validate_path(root)?;
        Ok(Self {
            client: client.clone(),
            shared: Arc::new(MirrorShared {
                root: root.to_string(),
                scope,
                entries: RwLock::new(BTreeMap::new()),
                status: RwLock::new(MirrorStatus::Stopped),
                invalidated: AtomicBool::new(false),
                subscribers: Mutex::new(Vec::new()),
            }),
            running: tokio::sync::Mutex::new(None),
        })
    }

    pub fn node(
        client: &Client,
        path: &str,
    ) -> Result<Self> {
        Self::new(client, path, MirrorScope::Node)
    }

    pub fn children(
        client: &Client,
        path: &str,
    ) -> Result<Self> {
        Self::new(client, path, MirrorScope::Children)
    }

    pub fn subtree(
        client: &Client,
        path: &str,
    ) -> Result<Self> {
        Self::new(client, path, MirrorScope::Subtree)
    }

    pub fn root(&self) -> &str {
        &self.shared.root
    }

    pub fn scope(&self) -> MirrorScope {
        self.shared.scope
    }

    pub fn status(&self) -> MirrorStatus {
        *self.shared.status.read()
    }

    /// Installs the watch and, with `load_initial_state`, loads the current remote state.
    ///
    /// Restarts a running or invalidated mirror from scratch. Returns once buffered
    /// events have been applied and the mirror is live.
    pub async fn start(
        &self,
        load_initial_state: bool,
    ) -> Result<()> {
        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            previous.shutdown().await;
        }
        self.shared.reset();
        self.shared.set_status(MirrorStatus::Starting);

        let registration = match self
            .client
            .watch(&self.shared.root, self.shared.scope.watch_mode())
            .await
        {
            Ok(registration) => registration,
            Err(e) => {
                self.shared.reset();
                return Err(e);
            }
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(deliver(
            self.client.clone(),
            self.shared.clone(),
            registration,
            load_initial_state,
            ready_tx,
            stop_rx,
        ));

        match ready_rx.await {
            Ok(Ok(entries)) => {
                debug!(root = %self.shared.root, entries, "mirror started");
                *running = Some(Running { stop, task });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = task.await;
                Err(e)
            }
            Err(_) => {
                task.await.map_err(SystemError::from)?;
                Err(SessionError::Closed.into())
            }
        }
    }

    /// Unregisters the watch and releases every entry
    pub async fn stop(&self) {
        if let Some(running) = self.running.lock().await.take() {
            running.shutdown().await;
        }
        self.shared.reset();
    }

    /// Last known state of `path`
    ///
    /// # Errors
    /// [`Error::MirrorInvalidated`] after session expiry, until a later `start` completes.
    pub fn current_state(
        &self,
        path: &str,
    ) -> Result<Option<CacheEntry>> {
        self.ensure_valid()?;
        Ok(self.shared.entries.read().get(path).cloned())
    }

    /// Last known state of the root node
    pub fn current(&self) -> Result<Option<CacheEntry>> {
        self.current_state(&self.shared.root)
    }

    /// Every mirrored entry, ordered by path
    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        self.ensure_valid()?;
        Ok(self.shared.entries.read().values().cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.shared.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Changes applied from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<MirrorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.subscribers.lock().push(tx);
        rx
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.shared.is_invalidated() {
            return Err(Error::MirrorInvalidated(self.shared.root.clone()));
        }
        Ok(())
    }
}

impl Running {
    async fn shutdown(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.task.await {
            warn!("mirror task failed: {}", e);
        }
    }
}

impl Drop for Mirror {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            let _ = running.stop.send(());
        }
    }
}

/// Reads the remote state in scope into the entry set
async fn load(
    client: &Client,
    shared: &MirrorShared,
) -> Result<()> {
    let root = shared.root.as_str();
    match shared.scope {
        MirrorScope::Node => {
            if let Some(data) = read_if_present(client, root).await? {
                shared.insert_loaded(root, data);
            }
        }
        MirrorScope::Children => {
            for name in list_if_present(client, root).await? {
                let child = path::join(root, &name);
                if let Some(data) = read_if_present(client, &child).await? {
                    shared.insert_loaded(&child, data);
                }
            }
        }
        MirrorScope::Subtree => {
            let mut pending = vec![root.to_string()];
            while let Some(next) = pending.pop() {
                let Some(data) = read_if_present(client, &next).await? else {
                    continue;
                };
                shared.insert_loaded(&next, data);
                for name in list_if_present(client, &next).await? {
                    pending.push(path::join(&next, &name));
                }
            }
        }
    }
    Ok(())
}

async fn read_if_present(
    client: &Client,
    path: &str,
) -> Result<Option<NodeData>> {
    match client.read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.is_no_node() => Ok(None),
        Err(e) => Err(e),
    }
}

async fn list_if_present(
    client: &Client,
    path: &str,
) -> Result<Vec<String>> {
    match client.list_children(path).await {
        Ok(children) => Ok(children),
        Err(e) if e.is_no_node() => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// The mirror's delivery task: initial load, buffered events, then live events
async fn deliver(
    client: Client,
    shared: Arc<MirrorShared>,
    mut registration: WatchRegistration,
    load_initial_state: bool,
    ready: oneshot::Sender<Result<usize>>,
    mut stop: oneshot::Receiver<()>,
) {
    if load_initial_state {
        if let Err(e) = load(&client, &shared).await {
            warn!(root = %shared.root, "mirror initial load failed: {}", e);
            shared.reset();
            let _ = ready.send(Err(e));
            return;
        }
    }

    // changes that raced the initial load
    while let Some(event) = registration.try_recv() {
        shared.apply(event);
    }
    let entries = shared.entries.read().len();
    shared.go_live();
    shared.notify(MirrorEvent::Loaded { entries });
    if ready.send(Ok(entries)).is_err() {
        shared.reset();
        return;
    }

    loop {
        tokio::select! {
            _ = &mut stop => {
                debug!(root = %shared.root, "mirror stopped");
                shared.reset();
                return;
            }
            event = registration.recv() => match event {
                Some(event) => shared.apply(event),
                None => {
                    shared.invalidate();
                    return;
                }
            }
        }
    }
}
