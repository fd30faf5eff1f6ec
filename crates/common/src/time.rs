//! Time utilities.
//!
//! Messages exchanged with PDPs carry Unix timestamps in milliseconds. The
//! helpers here produce those timestamps and measure message age against the
//! local clock.
//!
//! # Example
//!
//! ```rust
//! use pap_common::time::{current_timestamp_ms, message_age};
//! use std::time::Duration;
//!
//! let now = current_timestamp_ms();
//! assert!(message_age(now) < Duration::from_secs(5));
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Returns the current Unix timestamp in milliseconds.
///
/// If the system clock is before the Unix epoch, returns 0.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Returns how long ago `timestamp_ms` was.
///
/// Timestamps from the future (clock skew between hosts) have an age of zero.
pub fn message_age(timestamp_ms: u64) -> Duration {
    Duration::from_millis(current_timestamp_ms().saturating_sub(timestamp_ms))
}

/// Returns true if a message stamped `timestamp_ms` is older than `max_age`.
pub fn is_expired(timestamp_ms: u64, max_age: Duration) -> bool {
    message_age(timestamp_ms) > max_age
}
