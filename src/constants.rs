// -
// Lease policy

/// Seconds a freshly set or refreshed registration stays alive.
///
/// Every `set`/`update` hands this TTL to the backend; the backend alone decides
/// when the key expires.
pub const HEARTBEAT_DELAY_IN_SECS: u64 = 20;

/// Seconds between two lease refreshes issued by a [`crate::LeaseKeeper`].
/// Must stay below [`HEARTBEAT_DELAY_IN_SECS`].
pub const HEARTBEAT_INTERVAL_IN_SECS: u64 = 10;

/// Consecutive refresh failures tolerated before a keeper gives up
pub const HEARTBEAT_MAX_FAILURES: u32 = 3;

// -
// Watch

/// Per-watcher delivery queue capacity
pub const WATCH_BUFFER_SIZE: usize = 1000;

/// Number of past events kept by the in-memory backend for index based resume
pub const WATCH_HISTORY_SIZE: usize = 1000;

// -
// Backend

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:2379";
pub const CONNECT_TIMEOUT_IN_MS: u64 = 3000;
pub const REQUEST_TIMEOUT_IN_MS: u64 = 5000;

/// Key separator of the hierarchical namespace
pub const KEY_SEPARATOR: char = '/';
pub const ROOT_KEY: &str = "/";

/// Environment variable prefix for configuration overrides
pub(crate) const CONFIG_ENV_PREFIX: &str = "REGISTRY";
