//! Client-side watch registry.
//!
//! Every registration owns an unbounded channel. The session task pushes matching
//! [`WatchEvent`]s into it; the caller consumes them through a [`WatchRegistration`].
//! Dropping the handle unregisters it locally and asks the service to forget it.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::trace;

use super::Dispatch;
use super::Responder;
use crate::metrics::WATCH_EVENTS_DELIVERED;
use crate::Operation;
use crate::Result;
use crate::WatchEvent;
use crate::WatchMode;

#[derive(Debug)]
struct WatchEntry {
    path: String,
    mode: WatchMode,
    sender: mpsc::UnboundedSender<WatchEvent>,
    /// Cleared once a one-shot registration has fired
    armed: bool,
}

#[derive(Debug)]
struct RegistryInner {
    entries: DashMap<u64, WatchEntry>,
    next_id: AtomicU64,
}

#[derive(Clone, Debug)]
pub(crate) struct WatchRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for WatchRegistry {
    fn default() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }
}

impl WatchRegistry {
    pub(crate) fn register(
        &self,
        path: &str,
        mode: WatchMode,
    ) -> (u64, mpsc::UnboundedReceiver<WatchEvent>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner.entries.insert(
            id,
            WatchEntry {
                path: path.to_string(),
                mode,
                sender,
                armed: true,
            },
        );
        trace!(watch_id = id, path, ?mode, "watch registered");
        (id, receiver)
    }

    /// Routes one event to its registration. Returns `false` if it was dropped.
    pub(crate) fn deliver(
        &self,
        event: WatchEvent,
    ) -> bool {
        let watch_id = event.watch_id;
        let Some(mut entry) = self.inner.entries.get_mut(&watch_id) else {
            trace!(watch_id, "event for unknown watch dropped");
            return false;
        };
        if !entry.armed {
            trace!(watch_id, "one-shot watch already fired, event dropped");
            return false;
        }
        if entry.mode == WatchMode::OneShot {
            entry.armed = false;
        }
        if entry.sender.send(event).is_err() {
            drop(entry);
            self.inner.entries.remove(&watch_id);
            debug!(watch_id, "watch receiver gone, registration removed");
            return false;
        }
        WATCH_EVENTS_DELIVERED.inc();
        true
    }

    /// Re-enables a fired one-shot registration
    pub(crate) fn rearm(
        &self,
        watch_id: u64,
    ) -> bool {
        match self.inner.entries.get_mut(&watch_id) {
            Some(mut entry) => {
                entry.armed = true;
                true
            }
            None => false,
        }
    }

    pub(crate) fn unregister(
        &self,
        watch_id: u64,
    ) -> bool {
        self.inner.entries.remove(&watch_id).is_some()
    }

    pub(crate) fn contains(
        &self,
        watch_id: u64,
    ) -> bool {
        self.inner.entries.contains_key(&watch_id)
    }

    /// Drops every registration; their channels close
    pub(crate) fn invalidate(&self) -> usize {
        let dropped = self.inner.entries.len();
        self.inner.entries.clear();
        dropped
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Path of every live registration, for diagnostics
    pub(crate) fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .inner
            .entries
            .iter()
            .map(|e| e.value().path.clone())
            .collect();
        paths.sort();
        paths
    }
}

/// Handle to an active watch.
///
/// Events arrive in service order. The channel closes when the session expires or the
/// client is closed; the registration must then be re-established by the caller.
#[derive(Debug)]
pub struct WatchRegistration {
    id: u64,
    path: String,
    mode: WatchMode,
    events: mpsc::UnboundedReceiver<WatchEvent>,
    dispatch: Dispatch,
}

impl WatchRegistration {
    pub(crate) fn new(
        id: u64,
        path: String,
        mode: WatchMode,
        events: mpsc::UnboundedReceiver<WatchEvent>,
        dispatch: Dispatch,
    ) -> Self {
        Self {
            id,
            path,
            mode,
            events,
            dispatch,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn mode(&self) -> WatchMode {
        self.mode
    }

    /// `false` once the session expired or the registration was removed
    pub fn is_active(&self) -> bool {
        self.dispatch.watches.contains(self.id)
    }

    /// Next event; `None` once the registration has been invalidated
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<WatchEvent> {
        self.events.try_recv().ok()
    }

    /// Arms a fired one-shot registration again. No-op for the other modes.
    ///
    /// Fails with [`crate::SessionError::Closed`] once the registration was invalidated.
    pub async fn rearm(&mut self) -> Result<()> {
        if self.mode != WatchMode::OneShot {
            return Ok(());
        }
        if !self.dispatch.watches.rearm(self.id) {
            return Err(crate::SessionError::Closed.into());
        }
        self.dispatch
            .call(Operation::AddWatch {
                watch_id: self.id,
                path: self.path.clone(),
                mode: self.mode,
            })
            .await?;
        Ok(())
    }

    /// Removes the registration from the service and waits for the acknowledgement
    pub async fn unregister(self) -> Result<()> {
        if !self.dispatch.watches.unregister(self.id) {
            return Ok(());
        }
        self.dispatch
            .call(Operation::RemoveWatch { watch_id: self.id })
            .await?;
        Ok(())
    }
}

impl Drop for WatchRegistration {
    fn drop(&mut self) {
        if self.dispatch.watches.unregister(self.id) {
            self.dispatch.enqueue(
                Operation::RemoveWatch { watch_id: self.id },
                Responder::Discard,
            );
            trace!(watch_id = self.id, path = %self.path, "watch unregistered on drop");
        }
    }
}
