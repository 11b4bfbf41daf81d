use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use registry_store::StorageConfig;
use registry_store::WatchEvent;
use registry_store::Watcher;

/// Endpoint of a disposable etcd used by the live backend tests
pub const ETCD_ENDPOINT_ENV: &str = "REGISTRY_STORE_TEST_ETCD";

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration pointing at the test etcd, `None` when the variable is unset
pub fn etcd_config() -> Option<StorageConfig> {
    let endpoint = std::env::var(ETCD_ENDPOINT_ENV).ok()?;
    let mut config = StorageConfig::default();
    config.backend.endpoints = vec![endpoint];
    config.lease.heartbeat_delay_in_secs = 5;
    config.lease.heartbeat_interval_in_secs = 2;
    Some(config)
}

/// Key prefix no other test run shares
pub fn unique_prefix(name: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("/registry-store-test/{name}-{}-{nanos}", std::process::id())
}

pub async fn next_event(watcher: &mut Watcher) -> WatchEvent {
    tokio::time::timeout(EVENT_TIMEOUT, watcher.next())
        .await
        .expect("event should arrive in time")
        .expect("watcher should stay open")
}
