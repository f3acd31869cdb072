//! Small time helpers shared across the core.
//!
//! The external collaborators (persistent store, metrics sinks) own wall
//! clock concerns in a full node; this module only centralizes the handful
//! of `SystemTime` conversions every component needs so they agree on units.

use std::time::{SystemTime, UNIX_EPOCH};

pub type TimestampSeconds = u64;
pub type TimestampMillis = u64;

/// Current UNIX time in seconds.
pub fn current_time_in_seconds() -> TimestampSeconds {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before unix epoch")
        .as_secs()
}

/// Current UNIX time in milliseconds.
pub fn current_time_in_millis() -> TimestampMillis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before unix epoch")
        .as_millis() as TimestampMillis
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_and_millis_agree() {
        let secs = current_time_in_seconds();
        let millis = current_time_in_millis();
        assert!(millis / 1000 >= secs.saturating_sub(1));
    }
}
