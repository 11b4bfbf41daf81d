//! Lease policy for registrations
//!
//! Every `set`/`update` attaches a lease of `heartbeat_delay_in_secs`. A
//! [`crate::LeaseKeeper`] refreshes it every `heartbeat_interval_in_secs`, so the
//! interval must be shorter than the delay or registrations flap.
//!
//! ```toml
//! [lease]
//! heartbeat_delay_in_secs = 20
//! heartbeat_interval_in_secs = 10
//! max_failures = 3
//! ```

use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::HEARTBEAT_DELAY_IN_SECS;
use crate::constants::HEARTBEAT_INTERVAL_IN_SECS;
use crate::constants::HEARTBEAT_MAX_FAILURES;
use crate::Error;
use crate::Result;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LeaseConfig {
    /// TTL handed to the backend on every write
    #[serde(default = "default_heartbeat_delay")]
    pub heartbeat_delay_in_secs: u64,

    /// Time between two refreshes issued by a keeper
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_in_secs: u64,

    /// Consecutive refresh failures before a keeper gives up
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
}

fn default_heartbeat_delay() -> u64 {
    HEARTBEAT_DELAY_IN_SECS
}

fn default_heartbeat_interval() -> u64 {
    HEARTBEAT_INTERVAL_IN_SECS
}

fn default_max_failures() -> u32 {
    HEARTBEAT_MAX_FAILURES
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            heartbeat_delay_in_secs: default_heartbeat_delay(),
            heartbeat_interval_in_secs: default_heartbeat_interval(),
            max_failures: default_max_failures(),
        }
    }
}

impl LeaseConfig {
    /// Returns error if:
    /// - either duration is 0
    /// - `heartbeat_interval_in_secs` is not below `heartbeat_delay_in_secs`
    /// - `max_failures` is 0
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_delay_in_secs == 0 {
            return Err(Error::Config(ConfigError::Message(
                "heartbeat_delay_in_secs must be greater than 0".to_string(),
            )));
        }

        if self.heartbeat_interval_in_secs == 0 {
            return Err(Error::Config(ConfigError::Message(
                "heartbeat_interval_in_secs must be greater than 0".to_string(),
            )));
        }

        if self.heartbeat_interval_in_secs >= self.heartbeat_delay_in_secs {
            return Err(Error::Config(ConfigError::Message(format!(
                "heartbeat_interval_in_secs ({}) must be below heartbeat_delay_in_secs ({})",
                self.heartbeat_interval_in_secs, self.heartbeat_delay_in_secs
            ))));
        }

        if self.max_failures == 0 {
            return Err(Error::Config(ConfigError::Message(
                "max_failures must be greater than 0".to_string(),
            )));
        }

        Ok(())
    }

    pub fn heartbeat_delay(&self) -> Duration {
        Duration::from_secs(self.heartbeat_delay_in_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_in_secs)
    }
}
