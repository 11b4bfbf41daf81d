//! Configuration for storage backends, lease policy and watches.
//!
//! Provides hierarchical configuration loading and validation with:
//! - Default values as code base
//! - Environment variable overrides
//! - Configuration file support
//! - Section-wise validation
mod backend;
mod lease;
mod watch;
pub use backend::*;
pub use lease::*;
pub use watch::*;
#[cfg(test)]
mod config_test;

use std::env;
use std::fmt::Debug;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::CONFIG_ENV_PREFIX;
use crate::Result;

/// Main configuration container
///
/// Combines all section configurations with hierarchical override support:
/// 1. Default values from code implementation
/// 2. Configuration file specified by `CONFIG_PATH`
/// 3. Environment variables with `REGISTRY__` prefix (highest priority)
#[derive(Serialize, Deserialize, Clone, Default)]
pub struct StorageConfig {
    /// Coordination cluster endpoints and timeouts
    #[serde(default)]
    pub backend: BackendConfig,
    /// Lease duration and heartbeat cadence
    #[serde(default)]
    pub lease: LeaseConfig,
    /// Watch queue sizing
    #[serde(default)]
    pub watch: WatchConfig,
}

impl Debug for StorageConfig {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("StorageConfig")
            .field("endpoints", &self.backend.endpoints)
            .field("heartbeat_delay_in_secs", &self.lease.heartbeat_delay_in_secs)
            .finish_non_exhaustive()
    }
}

impl StorageConfig {
    /// Loads configuration from hierarchical sources without validation.
    ///
    /// Sources are merged in the following order (later sources override earlier):
    /// 1. Type defaults (lowest priority)
    /// 2. Configuration file from `CONFIG_PATH` environment variable (if set)
    /// 3. Environment variables with `REGISTRY__` prefix (highest priority)
    ///
    /// # Note
    /// Validation is deferred so callers can layer `with_override_config()` first.
    /// Call `validate()` before using the configuration.
    ///
    /// # Examples
    /// ```ignore
    /// std::env::set_var("REGISTRY__LEASE__HEARTBEAT_DELAY_IN_SECS", "30");
    /// let cfg = StorageConfig::new()?.validate()?;
    /// ```
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(env_source());

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Applies additional configuration overrides from file without validation.
    ///
    /// Merging order (later sources override earlier):
    /// 1. Current configuration values
    /// 2. New configuration file
    /// 3. Latest environment variables (highest priority)
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(env_source())
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Validates every section and returns the validated instance.
    pub fn validate(self) -> Result<Self> {
        self.backend.validate()?;
        self.lease.validate()?;
        self.watch.validate()?;
        Ok(self)
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(CONFIG_ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .ignore_empty(true)
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("backend.endpoints")
}
