//! Staleness policy. No filesystem writes.

use std::time::{Duration, SystemTime};

/// Default staleness threshold (2 days).
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(2 * 24 * 60 * 60);

/// A slot last modified at `modified` is stale once it is older than
/// `max_age`. Timestamps in the future are treated as fresh.
pub(crate) fn is_stale_impl(modified: SystemTime, now: SystemTime, max_age: Duration) -> bool {
    match now.duration_since(modified) {
        Ok(age) => age > max_age,
        Err(_) => false,
    }
}
