use std::path::PathBuf;
use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::DEFAULT_MAX_FRAME_SIZE;
use crate::Error;
use crate::Result;

/// Settings of the standalone reference service (`d-coord` binary)
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    /// TCP listen address in `host:port` form
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Prometheus `/metrics` port (0 disables the exporter)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// How often expired sessions are reaped
    #[serde(default = "default_reaper_interval_ms")]
    pub reaper_interval_ms: u64,

    /// Lower clamp applied to requested session timeouts
    #[serde(default = "default_min_session_timeout_ms")]
    pub min_session_timeout_ms: u64,

    /// Upper clamp applied to requested session timeouts
    #[serde(default = "default_max_session_timeout_ms")]
    pub max_session_timeout_ms: u64,

    /// Largest accepted frame in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Directory receiving `d-coord.log`
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            metrics_port: default_metrics_port(),
            reaper_interval_ms: default_reaper_interval_ms(),
            min_session_timeout_ms: default_min_session_timeout_ms(),
            max_session_timeout_ms: default_max_session_timeout_ms(),
            max_frame_size: default_max_frame_size(),
            log_dir: default_log_dir(),
        }
    }
}

impl ServerSettings {
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    /// Clamp a requested session timeout into the configured bounds
    pub fn negotiate_session_timeout(
        &self,
        requested_ms: u64,
    ) -> u64 {
        requested_ms.clamp(self.min_session_timeout_ms, self.max_session_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        // port 0 asks the OS for an ephemeral port
        let listen_addr_valid = self
            .listen_addr
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
        if !listen_addr_valid {
            return Err(Error::Config(ConfigError::Message(format!(
                "invalid listen_addr {:?}, expected host:port",
                self.listen_addr
            ))));
        }
        if self.reaper_interval_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "reaper_interval_ms must be > 0".to_string(),
            )));
        }
        if self.min_session_timeout_ms == 0
            || self.min_session_timeout_ms > self.max_session_timeout_ms
        {
            return Err(Error::Config(ConfigError::Message(format!(
                "session timeout bounds [{}, {}] are invalid",
                self.min_session_timeout_ms, self.max_session_timeout_ms
            ))));
        }
        if self.max_frame_size < 1024 {
            return Err(Error::Config(ConfigError::Message(format!(
                "max_frame_size {} too small, minimum 1024 bytes",
                self.max_frame_size
            ))));
        }
        Ok(())
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:2181".to_string()
}
fn default_metrics_port() -> u16 {
    9100
}
fn default_reaper_interval_ms() -> u64 {
    500
}
fn default_min_session_timeout_ms() -> u64 {
    100
}
fn default_max_session_timeout_ms() -> u64 {
    60_000
}
fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("./logs")
}
