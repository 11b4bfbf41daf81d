//! Heartbeat task that keeps one registration alive
//!
//! The keeper calls [`Storage::update`] every `heartbeat_interval`. It never
//! calls `set`: a registration that disappeared (deleted, or expired because
//! refreshes failed for longer than the lease) stays gone and the keeper exits
//! with [`KeeperExit::Removed`].

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::info_span;
use tracing::trace;
use tracing::warn;
use tracing::Instrument;

use super::Storage;
use crate::metrics::LEASE_REFRESHES;
use crate::LeaseConfig;
use crate::Result;

/// Why a keeper stopped refreshing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeeperExit {
    /// [`LeaseKeeper::stop`] was called or the keeper was dropped
    Stopped,
    /// The key no longer exists
    Removed,
    /// Too many consecutive refreshes failed
    Failed,
}

pub struct LeaseKeeper {
    key: String,
    cancel: CancellationToken,
    handle: Option<JoinHandle<KeeperExit>>,
    exit: Option<KeeperExit>,
}

impl LeaseKeeper {
    /// Sets `key` to `value` and starts refreshing it
    ///
    /// # Errors
    /// Whatever the initial `set` returns; no task is started in that case.
    pub async fn register(
        storage: Arc<dyn Storage>,
        key: impl Into<String>,
        value: impl Into<String>,
        config: &LeaseConfig,
    ) -> Result<Self> {
        let key = key.into();
        let value = value.into();
        storage.set(&key, &value).await?;
        info!(key = %key, "registered");
        Ok(Self::spawn(storage, key, value, config))
    }

    /// Starts refreshing an existing `key`
    ///
    /// The first refresh happens one `heartbeat_interval` from now.
    pub fn spawn(
        storage: Arc<dyn Storage>,
        key: impl Into<String>,
        value: impl Into<String>,
        config: &LeaseConfig,
    ) -> Self {
        let key = key.into();
        let cancel = CancellationToken::new();
        let span = info_span!("lease_keeper", key = %key);
        let handle = tokio::spawn(
            refresh_loop(
                storage,
                key.clone(),
                value.into(),
                config.heartbeat_interval(),
                config.max_failures,
                cancel.clone(),
            )
            .instrument(span),
        );

        Self {
            key,
            cancel,
            handle: Some(handle),
            exit: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Asks the task to stop; does not wait for it
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Waits for the task to end on its own or after [`Self::stop`]
    ///
    /// Cancel safe; waiting again after completion returns the same exit.
    pub async fn wait(&mut self) -> KeeperExit {
        let Some(handle) = self.handle.as_mut() else {
            return self.exit.unwrap_or(KeeperExit::Stopped);
        };
        let exit = match handle.await {
            Ok(exit) => exit,
            Err(e) => {
                error!(key = %self.key, "lease keeper task aborted: {:?}", e);
                KeeperExit::Failed
            }
        };
        self.handle = None;
        self.exit = Some(exit);
        exit
    }

    pub async fn join(mut self) -> KeeperExit {
        self.wait().await
    }

    /// [`Self::stop`] followed by [`Self::join`]
    pub async fn shutdown(self) -> KeeperExit {
        self.stop();
        self.join().await
    }
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for LeaseKeeper {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("LeaseKeeper")
            .field("key", &self.key)
            .field("finished", &self.is_finished())
            .finish()
    }
}

async fn refresh_loop(
    storage: Arc<dyn Storage>,
    key: String,
    value: String,
    period: Duration,
    max_failures: u32,
    cancel: CancellationToken,
) -> KeeperExit {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await; // Skip first immediate tick

    let mut failures = 0u32;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(key = %key, "lease keeper stopped");
                return KeeperExit::Stopped;
            }
            _ = interval.tick() => {}
        }

        match storage.update(&key, &value).await {
            Ok(()) => {
                LEASE_REFRESHES.with_label_values(&["ok"]).inc();
                trace!(key = %key, "lease refreshed");
                failures = 0;
            }
            Err(e) if e.is_not_found() => {
                LEASE_REFRESHES.with_label_values(&["removed"]).inc();
                warn!(key = %key, "registration is gone, not recreating it");
                return KeeperExit::Removed;
            }
            Err(e) => {
                LEASE_REFRESHES.with_label_values(&["error"]).inc();
                failures += 1;
                warn!(key = %key, failures, max_failures, "lease refresh failed: {}", e);
                if failures >= max_failures {
                    error!(key = %key, "giving up after {} failed refreshes", failures);
                    return KeeperExit::Failed;
                }
            }
        }
    }
}
