use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use super::RetryPolicy;
use crate::Error;
use crate::Result;

/// Client-side session and request parameters
///
/// Everything the client needs is carried here and passed at construction; there is no
/// process-wide configuration state.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ClientConfig {
    /// Coordination service endpoints in `host:port` form
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// Requested session timeout; the service may clamp it
    /// Default: 5 seconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Bound for a single connection attempt, handshake included
    /// Default: 5 seconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Bound for a blocking operation, from issue to reply
    /// Default: 10 seconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Connect/reconnect retry policy
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            session_timeout_ms: default_session_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Validates endpoint syntax, timeouts and the retry policy
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "at least one endpoint required".to_string(),
            )));
        }
        for endpoint in &self.endpoints {
            validate_endpoint(endpoint)?;
        }
        if self.session_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "session_timeout_ms must be > 0".to_string(),
            )));
        }
        if self.connect_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "connect_timeout_ms must be > 0".to_string(),
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "request_timeout_ms must be > 0".to_string(),
            )));
        }
        self.retry.validate()
    }
}

/// Accepts `host:port` with a non-empty host and a non-zero port
pub(crate) fn validate_endpoint(endpoint: &str) -> Result<()> {
    let invalid = || {
        Error::Config(ConfigError::Message(format!(
            "invalid endpoint {endpoint:?}, expected host:port"
        )))
    };
    let (host, port) = endpoint.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() {
        return Err(invalid());
    }
    match port.parse::<u16>() {
        Ok(p) if p > 0 => Ok(()),
        _ => Err(invalid()),
    }
}

fn default_endpoints() -> Vec<String> {
    vec!["127.0.0.1:2181".to_string()]
}
fn default_session_timeout_ms() -> u64 {
    5000
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
