//! The coordinator's small, duplicated projection of each connected peer,
//! opportunistically persisted to a size/TTL-bounded cache.
//!
//! Shaped like `seed::cache::SeedCache` (an `lru::LruCache` behind a mutex,
//! with a `sweep_expired` pass and load/persist hooks), reused here for
//! `PeerState` instead of `SeedInfo` as the coordinator's own small cached
//! projection.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::config::{PEER_CACHE_MAX_SIZE, PEER_CACHE_TTL_SECS};
use crate::peer::PeerEndpoint;
use crate::time::{current_time_in_seconds, TimestampSeconds};

/// Duplicated, small projection of a session's state, for cheap reads by
/// callers that don't need to go through the session itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerState {
    pub endpoint: PeerEndpoint,
    pub version: u32,
    pub services: u64,
    pub last_seen: TimestampSeconds,
    pub ban_score: u32,
    pub synced: bool,
    pub height: u64,
}

impl PeerState {
    pub fn new(endpoint: PeerEndpoint) -> Self {
        Self {
            endpoint,
            version: 0,
            services: 0,
            last_seen: current_time_in_seconds(),
            ban_score: 0,
            synced: false,
            height: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = current_time_in_seconds();
    }
}

pub struct PeerStateCache {
    inner: Mutex<lru::LruCache<PeerEndpoint, PeerState>>,
    ttl_secs: u64,
}

impl PeerStateCache {
    pub fn new(max_size: usize, ttl_secs: u64) -> Self {
        let capacity = NonZeroUsize::new(max_size)
            .unwrap_or_else(|| NonZeroUsize::new(PEER_CACHE_MAX_SIZE).unwrap());
        Self {
            inner: Mutex::new(lru::LruCache::new(capacity)),
            ttl_secs,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(PEER_CACHE_MAX_SIZE, PEER_CACHE_TTL_SECS)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, lru::LruCache<PeerEndpoint, PeerState>> {
        self.inner.lock().expect("peer state cache mutex poisoned")
    }

    pub fn put(&self, state: PeerState) {
        self.lock().put(state.endpoint, state);
    }

    pub fn get(&self, endpoint: &PeerEndpoint) -> Option<PeerState> {
        self.lock().get(endpoint).cloned()
    }

    pub fn remove(&self, endpoint: &PeerEndpoint) {
        self.lock().pop(endpoint);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<PeerState> {
        self.lock().iter().map(|(_, state)| state.clone()).collect()
    }

    /// Evicts states whose `last_seen` is older than `max_age_secs` (the
    /// maintenance timer calls this with `2 * PEER_CONNECTION_TIMEOUT_SECS`).
    pub fn evict_stale(&self, now: TimestampSeconds, max_age_secs: u64) -> usize {
        let mut guard = self.lock();
        let stale: Vec<PeerEndpoint> = guard
            .iter()
            .filter(|(_, state)| now.saturating_sub(state.last_seen) >= max_age_secs)
            .map(|(endpoint, _)| *endpoint)
            .collect();
        let count = stale.len();
        for endpoint in stale {
            guard.pop(&endpoint);
        }
        count
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn endpoint(last: u8) -> PeerEndpoint {
        PeerEndpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), 8333)
    }

    #[test]
    fn respects_max_size() {
        let cache = PeerStateCache::new(2, 3600);
        cache.put(PeerState::new(endpoint(1)));
        cache.put(PeerState::new(endpoint(2)));
        cache.put(PeerState::new(endpoint(3)));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&endpoint(1)).is_none());
    }

    #[test]
    fn evicts_entries_older_than_max_age() {
        let cache = PeerStateCache::new(10, 3600);
        let mut stale = PeerState::new(endpoint(1));
        stale.last_seen = 0;
        cache.put(stale);
        cache.put(PeerState::new(endpoint(2)));

        let evicted = cache.evict_stale(10_000, 100);
        assert_eq!(evicted, 1);
        assert!(cache.get(&endpoint(1)).is_none());
        assert!(cache.get(&endpoint(2)).is_some());
    }
}
