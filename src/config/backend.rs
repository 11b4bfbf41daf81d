use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::CONNECT_TIMEOUT_IN_MS;
use crate::constants::DEFAULT_ENDPOINT;
use crate::constants::REQUEST_TIMEOUT_IN_MS;
use crate::Error;
use crate::Result;

/// Where the coordination cluster lives and how long to wait for it
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BackendConfig {
    /// Cluster endpoints, e.g. `http://10.0.0.5:2379`
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// TCP connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_in_ms: u64,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_in_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            connect_timeout_in_ms: default_connect_timeout(),
            request_timeout_in_ms: default_request_timeout(),
        }
    }
}

impl BackendConfig {
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "backend endpoints cannot be empty".to_string(),
            )));
        }

        if let Some(blank) = self.endpoints.iter().find(|e| e.trim().is_empty()) {
            return Err(Error::Config(ConfigError::Message(format!(
                "backend endpoint {blank:?} is blank"
            ))));
        }

        if self.connect_timeout_in_ms == 0 || self.request_timeout_in_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "backend timeouts must be greater than 0".to_string(),
            )));
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_in_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_in_ms)
    }
}

fn default_endpoints() -> Vec<String> {
    vec![DEFAULT_ENDPOINT.to_string()]
}
fn default_connect_timeout() -> u64 {
    CONNECT_TIMEOUT_IN_MS
}
fn default_request_timeout() -> u64 {
    REQUEST_TIMEOUT_IN_MS
}
