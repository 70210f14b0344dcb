//! Coordination client.
//!
//! - [`Client`] - session handle and node operations
//! - [`ClientBuilder`] - configurable client construction
//! - [`WatchRegistration`] - channel of change notifications for one watch
//!
//! # Basic Usage
//! ```no_run
//! use d_coord::Client;
//! use std::time::Duration;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let client = Client::builder(vec!["127.0.0.1:2181".into()])
//!         .session_timeout(Duration::from_secs(5))
//!         .connect_timeout(Duration::from_secs(1))
//!         .build()
//!         .await
//!         .unwrap();
//!
//!     client.create("/demo/node", "hello world", true).await.unwrap();
//!     let data = client.read("/demo/node").await.unwrap();
//!     println!("{:?} @ version {}", data.payload, data.version());
//!
//!     client.close().await.unwrap();
//! }
//! ```

mod builder;
mod dispatcher;
mod nodes;
mod session;
mod watch;

pub use builder::*;
pub use dispatcher::BackgroundEvent;
pub(crate) use dispatcher::*;
pub use session::SessionState;
pub(crate) use session::*;
pub use watch::WatchRegistration;
pub(crate) use watch::WatchRegistry;


use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use config::ConfigError;
use tokio::sync::broadcast;
use tokio::sync::watch as state_watch;
use tokio::sync::Notify;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::config::validate_endpoint;
use crate::ClientConfig;
use crate::Error;
use crate::Result;
use crate::Stat;

/// Payload and metadata of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData {
    pub payload: Bytes,
    pub stat: Stat,
}

impl NodeData {
    pub fn version(&self) -> u64 {
        self.stat.version
    }
}

/// Handle to one coordination session.
///
/// Cloning is cheap; every clone shares the session. The session is closed by
/// [`close`](Client::close) or once the last clone (and every watch registration) is
/// dropped.
#[derive(Clone, Debug)]
pub struct Client {
    pub(super) inner: Arc<ClientInner>,
}

#[derive(Debug)]
pub(crate) struct ClientInner {
    pub(super) config: ClientConfig,
    pub(super) dispatch: Dispatch,
    pub(super) endpoints: Arc<ArcSwap<Vec<String>>>,
    pub(super) closing: Arc<Notify>,
    pub(super) state: state_watch::Receiver<SessionState>,
    pub(super) transitions: broadcast::Sender<SessionState>,
    pub(super) session_id: Arc<AtomicU64>,
}

impl Client {
    /// Create a configured client builder
    ///
    /// # Arguments
    /// * `endpoints` - `host:port` addresses of the coordination service
    pub fn builder(endpoints: Vec<String>) -> ClientBuilder {
        ClientBuilder::new(endpoints)
    }

    /// Connects with a complete configuration
    ///
    /// # Errors
    /// [`crate::SessionError::Connection`] once the retry policy is exhausted.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        ClientBuilder::new(config.endpoints.clone())
            .set_config(config)
            .build()
            .await
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Current session id, `None` while no session is established
    pub fn session_id(&self) -> Option<u64> {
        match self.inner.session_id.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }

    /// Every state transition from now on
    pub fn state_changes(&self) -> impl Stream<Item = SessionState> + Send + Unpin {
        BroadcastStream::new(self.inner.transitions.subscribe()).filter_map(|r| r.ok())
    }

    /// Waits until the session reaches `state`, giving up after `within`
    pub async fn wait_for_state(
        &self,
        state: SessionState,
        within: Duration,
    ) -> bool {
        let mut receiver = self.inner.state.clone();
        let reached = matches!(
            tokio::time::timeout(within, receiver.wait_for(|s| *s == state)).await,
            Ok(Ok(_))
        );
        reached
    }

    /// Outcomes of background operations issued through [`submit`](Client::submit)
    pub fn listen(&self) -> broadcast::Receiver<BackgroundEvent> {
        self.inner.dispatch.completions().listen()
    }

    /// Replaces the endpoint list used by future (re)connections
    pub fn update_endpoints(
        &self,
        endpoints: Vec<String>,
    ) -> Result<()> {
        if endpoints.is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "at least one endpoint required".to_string(),
            )));
        }
        for endpoint in &endpoints {
            validate_endpoint(endpoint)?;
        }
        debug!(?endpoints, "endpoints updated");
        self.inner.endpoints.store(Arc::new(endpoints));
        Ok(())
    }

    /// Closes the session. Pending operations fail with `SessionClosed`,
    /// ephemeral nodes and watches are released.
    pub async fn close(&self) -> Result<()> {
        self.inner.closing.notify_one();
        if let Some(done) = self.inner.dispatch.close() {
            // a dropped acknowledgement means the session task already finished
            let _ = done.await;
        }
        Ok(())
    }

    pub(crate) fn dispatch(&self) -> &Dispatch {
        &self.inner.dispatch
    }

    /// Registered watches, for diagnostics
    pub fn watched_paths(&self) -> Vec<String> {
        self.inner.dispatch.watches.paths()
    }

    pub fn watch_count(&self) -> usize {
        self.inner.dispatch.watches.len()
    }
}
