//! Wall-clock marks recorded into envelopes.
//!
//! Marks are plain integers so they survive the JSON round trip through the
//! queues unchanged. A clock set before the epoch reads as 0.

use std::time::{SystemTime, UNIX_EPOCH};

/// Nanoseconds since the Unix epoch.
pub fn unix_nanos() -> i64 {
    // ---
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> i64 {
    // ---
    unix_nanos() / 1_000_000
}
