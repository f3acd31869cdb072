//! Header type and the bounded, contiguous window a headers-phase run
//! builds up before the blocks phase consumes it.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

/// A block header as the synchronizer sees it: enough to validate chain
/// linkage, opaque otherwise. Block bodies are fetched separately in the
/// blocks phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub height: u64,
    pub hash: String,
    pub previous_hash: String,
    pub timestamp: u64,
}

/// Accumulates validated headers for one synchronize run. Created at the
/// start of a headers phase, cleared at the end; mutable only while the
/// synchronizer holds `sync.exclusive`.
#[derive(Debug, Default)]
pub struct HeaderSyncWindow {
    pub start_height: u64,
    pub current_height: u64,
    pub target_height: u64,
    pub headers: BTreeMap<u64, Header>,
    pub pending_requests: HashSet<u64>,
}

impl HeaderSyncWindow {
    pub fn new(start_height: u64, target_height: u64) -> Self {
        Self {
            start_height,
            current_height: start_height,
            target_height,
            headers: BTreeMap::new(),
            pending_requests: HashSet::new(),
        }
    }

    /// `headers.keys()` is a contiguous range `[start_height, current_height)`
    /// with no gaps.
    pub fn is_contiguous(&self) -> bool {
        let mut expected = self.start_height;
        for height in self.headers.keys() {
            if *height != expected {
                return false;
            }
            expected += 1;
        }
        expected == self.current_height
    }

    pub fn insert_batch(&mut self, batch: Vec<Header>) {
        for header in batch {
            self.current_height = self.current_height.max(header.height + 1);
            self.headers.insert(header.height, header);
        }
    }

    /// Discards the last `by` headers and rewinds `current_height`,
    /// clamped so it never drops below `start_height`. Matches the
    /// boundary property: a rewind of exactly `MAX_HEADERS_REWIND` resets
    /// `current_height` to `max(start_height, current_height - by)`.
    pub fn rewind(&mut self, by: u64) {
        let new_current = self.start_height.max(self.current_height.saturating_sub(by));
        self.headers.retain(|height, _| *height < new_current);
        self.current_height = new_current;
        self.pending_requests.clear();
    }

    pub fn percentage(&self) -> f64 {
        if self.target_height <= self.start_height {
            return 100.0;
        }
        let span = (self.target_height - self.start_height) as f64;
        let progress = (self.current_height.saturating_sub(self.start_height)) as f64;
        (progress / span * 100.0).min(100.0)
    }
}
