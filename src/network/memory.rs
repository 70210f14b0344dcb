use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use super::Connection;
use super::Connector;
use crate::service::ConnectionId;
use crate::service::CoordinationService;
use crate::ClientFrame;
use crate::Result;
use crate::ServerFrame;
use crate::ServerSettings;
use crate::SystemError;

/// Shared handle to an in-process coordination service.
///
/// Cloning is cheap; every clone drives the same service. Besides serving
/// [`MemoryConnector`] and the TCP server, it exposes fault injection used by tests:
/// dropping connections, making endpoints unreachable and expiring sessions.
#[derive(Clone, Debug)]
pub struct MemoryEnsemble {
    service: Arc<Mutex<CoordinationService>>,
    unreachable: Arc<DashSet<String>>,
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new(&ServerSettings::default())
    }
}

impl MemoryEnsemble {
    pub fn new(settings: &ServerSettings) -> Self {
        Self {
            service: Arc::new(Mutex::new(CoordinationService::new(settings))),
            unreachable: Arc::new(DashSet::new()),
        }
    }

    /// Connector resolving every address to this ensemble
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            ensemble: self.clone(),
        }
    }

    /// Refuse (or accept again) new connections to `address`
    pub fn set_reachable(
        &self,
        address: &str,
        reachable: bool,
    ) {
        if reachable {
            self.unreachable.remove(address);
        } else {
            self.unreachable.insert(address.to_string());
        }
    }

    /// Severs every open connection; sessions stay alive until they time out
    pub fn drop_connections(&self) -> usize {
        let dropped = self.service.lock().drop_connections();
        debug!(dropped, "memory ensemble dropped connections");
        dropped
    }

    pub fn expire_session(
        &self,
        session_id: u64,
    ) -> bool {
        self.service.lock().expire_session(session_id)
    }

    pub fn reap(&self) -> usize {
        self.service.lock().reap(Instant::now())
    }

    pub fn session_ids(&self) -> Vec<u64> {
        self.service.lock().session_ids()
    }

    pub fn watch_count(&self) -> usize {
        self.service.lock().watch_count()
    }

    pub fn node_count(&self) -> usize {
        self.service.lock().node_count()
    }

    pub(crate) fn attach(
        &self,
        sender: mpsc::UnboundedSender<ServerFrame>,
    ) -> ConnectionId {
        self.service.lock().attach(sender)
    }

    pub(crate) fn detach(
        &self,
        connection: ConnectionId,
    ) {
        self.service.lock().detach(connection)
    }

    /// Feeds one frame; fails once the connection has been dropped
    pub(crate) fn handle(
        &self,
        connection: ConnectionId,
        frame: ClientFrame,
    ) -> Result<()> {
        let mut service = self.service.lock();
        if !service.is_attached(connection) {
            return Err(SystemError::ConnectionClosed.into());
        }
        service.handle(connection, frame);
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct MemoryConnector {
    ensemble: MemoryEnsemble,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        address: &str,
    ) -> Result<Box<dyn Connection>> {
        if self.ensemble.unreachable.contains(address) {
            return Err(SystemError::Unreachable(address.to_string()).into());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.ensemble.attach(tx);
        Ok(Box::new(MemoryConnection {
            id,
            ensemble: self.ensemble.clone(),
            inbound: rx,
        }))
    }
}

pub struct MemoryConnection {
    id: ConnectionId,
    ensemble: MemoryEnsemble,
    inbound: mpsc::UnboundedReceiver<ServerFrame>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send(
        &mut self,
        frame: ClientFrame,
    ) -> Result<()> {
        self.ensemble.handle(self.id, frame)
    }

    async fn recv(&mut self) -> Result<Option<ServerFrame>> {
        Ok(self.inbound.recv().await)
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.ensemble.detach(self.id);
    }
}
