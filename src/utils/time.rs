use std::time::Duration;
use std::time::SystemTime;

/// Remaining whole seconds until `expiration`, rounded up and never negative
pub(crate) fn remaining_ttl(
    expiration: SystemTime,
    now: SystemTime,
) -> i64 {
    match expiration.duration_since(now) {
        Ok(left) => {
            let secs = left.as_secs();
            let rounded = if left.subsec_nanos() > 0 { secs + 1 } else { secs };
            i64::try_from(rounded).unwrap_or(i64::MAX)
        }
        Err(_) => 0,
    }
}

/// Absolute expiration for a lease with `ttl_secs` left at `now`
///
/// Non-positive TTLs mean the lease is gone or the key never had one.
pub(crate) fn expiration_from_ttl(
    ttl_secs: i64,
    now: SystemTime,
) -> Option<SystemTime> {
    if ttl_secs <= 0 {
        return None;
    }
    now.checked_add(Duration::from_secs(ttl_secs as u64))
}
