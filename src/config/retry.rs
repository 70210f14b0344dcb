use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// How the delay between two connection attempts evolves
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Always wait `base_delay_ms`
    #[default]
    Fixed,
    /// Double the delay after every failed attempt, capped at `max_delay_ms`
    Exponential,
}

/// Connect/reconnect retry policy
///
/// The default mirrors the classic "retry N times" policy: 10 attempts, one second apart.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of attempts before giving up (must be > 0)
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Delay after the first failed attempt (unit: milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for any single delay (unit: milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(
        max_retries: usize,
        delay: Duration,
    ) -> Self {
        let delay_ms = delay.as_millis() as u64;
        Self {
            max_retries,
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            backoff: Backoff::Fixed,
        }
    }

    pub fn exponential(
        max_retries: usize,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_retries,
            base_delay_ms: base_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            backoff: Backoff::Exponential,
        }
    }

    /// Delay to wait after the failed attempt number `attempt` (0-based)
    pub fn delay_after(
        &self,
        attempt: usize,
    ) -> Duration {
        let ms = match self.backoff {
            Backoff::Fixed => self.base_delay_ms,
            Backoff::Exponential => {
                let shift = attempt.min(32) as u32;
                self.base_delay_ms.saturating_mul(1u64 << shift)
            }
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }

    /// Longest single delay this policy will produce
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(Error::Config(ConfigError::Message(
                "retry max_retries must be > 0".to_string(),
            )));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(Error::Config(ConfigError::Message(format!(
                "retry max_delay_ms {} must be >= base_delay_ms {}",
                self.max_delay_ms, self.base_delay_ms
            ))));
        }
        Ok(())
    }
}

fn default_max_retries() -> usize {
    10
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    1000
}
