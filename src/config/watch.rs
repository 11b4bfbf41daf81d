use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::WATCH_BUFFER_SIZE;
use crate::constants::WATCH_HISTORY_SIZE;
use crate::Error;
use crate::Result;

/// Watch queue sizing
///
/// A consumer that falls more than `buffer_size` events behind gets its watcher
/// closed and flagged as overflowed.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WatchConfig {
    /// Per-watcher delivery queue capacity
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Events retained by the in-memory backend for index based resume
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            history_size: default_history_size(),
        }
    }
}

impl WatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch buffer_size must be greater than 0".to_string(),
            )));
        }
        if self.history_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch history_size must be greater than 0".to_string(),
            )));
        }
        Ok(())
    }
}

fn default_buffer_size() -> usize {
    WATCH_BUFFER_SIZE
}
fn default_history_size() -> usize {
    WATCH_HISTORY_SIZE
}
