//! Sliding-window message/byte rate limiter for one session.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::{RATE_LIMIT_INTERVAL_MILLIS, RATE_LIMIT_MAX_BYTES, RATE_LIMIT_MAX_MESSAGES};
use crate::time::{current_time_in_millis, TimestampMillis};

/// Tracks (timestamp, byte count) records within a rolling window and
/// reports whether the next message would exceed either limit.
pub struct RateLimiter {
    interval_millis: u64,
    max_messages: usize,
    max_bytes: usize,
    records: Mutex<VecDeque<(TimestampMillis, usize)>>,
}

impl RateLimiter {
    pub fn new(interval: Duration, max_messages: usize, max_bytes: usize) -> Self {
        Self {
            interval_millis: interval.as_millis() as u64,
            max_messages,
            max_bytes,
            records: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(
            Duration::from_millis(RATE_LIMIT_INTERVAL_MILLIS),
            RATE_LIMIT_MAX_MESSAGES,
            RATE_LIMIT_MAX_BYTES,
        )
    }

    fn evict_expired_locked(&self, records: &mut VecDeque<(TimestampMillis, usize)>, now: TimestampMillis) {
        while let Some(&(ts, _)) = records.front() {
            if now.saturating_sub(ts) > self.interval_millis {
                records.pop_front();
            } else {
                break;
            }
        }
    }

    /// Returns `true` and records the message if it fits within both
    /// limits; returns `false` (and does not record it) if it would
    /// exceed either.
    pub fn try_acquire(&self, message_bytes: usize) -> bool {
        let now = current_time_in_millis();
        let mut records = self.records.lock().expect("rate limiter mutex poisoned");
        self.evict_expired_locked(&mut records, now);

        let total_bytes: usize = records.iter().map(|(_, bytes)| *bytes).sum::<usize>() + message_bytes;
        if records.len() + 1 > self.max_messages || total_bytes > self.max_bytes {
            return false;
        }

        records.push_back((now, message_bytes));
        true
    }
}
