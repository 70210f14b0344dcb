use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use rand::seq::SliceRandom;
use tokio::sync::broadcast;
use tracing::info;

use super::Client;
use super::ClientInner;
use super::Completions;
use super::Dispatch;
use super::SessionTask;
use super::WatchRegistry;
use crate::constants::STATE_CHANGE_CAPACITY;
use crate::network::Connector;
use crate::network::TcpConnector;
use crate::utils::async_task::spawn_task;
use crate::ClientConfig;
use crate::Result;
use crate::RetryPolicy;

pub struct ClientBuilder {
    config: ClientConfig,
    endpoints: Vec<String>,
    connector: Option<Arc<dyn Connector>>,
}

impl ClientBuilder {
    /// Create a new builder with default config and specified endpoints
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            config: ClientConfig::default(),
            endpoints,
            connector: None,
        }
    }

    /// Set session timeout (default: 5s)
    pub fn session_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.config.session_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set per-attempt connection timeout (default: 5s)
    pub fn connect_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.config.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set blocking operation timeout (default: 10s)
    pub fn request_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.config.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the connect retry policy (default: 10 attempts, fixed 1s delay)
    pub fn retry_policy(
        mut self,
        policy: RetryPolicy,
    ) -> Self {
        self.config.retry = policy;
        self
    }

    /// Transport used to reach the endpoints (default: TCP)
    pub fn connector(
        mut self,
        connector: impl Connector,
    ) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Completely replaces the default configuration
    ///
    /// # Warning: Configuration Override
    /// This will discard all previous settings configured through individual
    /// methods like [`session_timeout`](ClientBuilder::session_timeout) or
    /// [`retry_policy`](ClientBuilder::retry_policy). The endpoints given to
    /// [`new`](ClientBuilder::new) are kept.
    ///
    /// # Example: Full Configuration
    /// ```ignore
    /// use d_coord::{ClientBuilder, ClientConfig};
    ///
    /// let custom_config = ClientConfig {
    ///     session_timeout_ms: 10_000,
    ///     request_timeout_ms: 2_000,
    ///     ..ClientConfig::default()
    /// };
    ///
    /// let builder = ClientBuilder::new(vec!["zk1:2181".into()])
    ///     .set_config(custom_config);
    /// ```
    pub fn set_config(
        mut self,
        config: ClientConfig,
    ) -> Self {
        self.config = config;
        self
    }

    /// Establishes the session and starts the session task
    ///
    /// # Errors
    /// - [`crate::Error::Config`] for an invalid configuration
    /// - [`crate::SessionError::Connection`] once every connect attempt failed
    pub async fn build(self) -> Result<Client> {
        let mut config = self.config;
        config.endpoints = self.endpoints;
        config.validate()?;

        let mut endpoints = config.endpoints.clone();
        endpoints.shuffle(&mut rand::thread_rng());
        let endpoints = Arc::new(ArcSwap::from_pointee(endpoints));
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TcpConnector::default()));

        let watches = WatchRegistry::default();
        let completions = Completions::start();
        let (transitions, _) = broadcast::channel(STATE_CHANGE_CAPACITY);
        let (mut task, handles) = SessionTask::new(
            config.clone(),
            connector,
            endpoints.clone(),
            watches.clone(),
            completions.clone(),
            transitions,
        );

        let connection = task.establish().await?;
        info!(
            session_id = handles.session_id.load(Ordering::SeqCst),
            "coordination session established"
        );
        spawn_task("session", task.run(connection));

        let dispatch = Dispatch::new(
            handles.commands,
            completions,
            watches,
            config.request_timeout(),
        );
        Ok(Client {
            inner: Arc::new(ClientInner {
                config,
                dispatch,
                endpoints,
                closing: handles.closing,
                state: handles.state,
                transitions: handles.transitions,
                session_id: handles.session_id,
            }),
        })
    }
}
