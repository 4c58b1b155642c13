//! Time utility functions

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in nanoseconds since Unix epoch
pub fn now_unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_else(|_| {
            tracing::warn!("System clock before Unix epoch, using 0");
            0
        })
}

/// Convert nanoseconds since Unix epoch to milliseconds
pub fn nanos_to_millis(nanos: u64) -> u64 {
    nanos / 1_000_000
}
