//! In-memory, size/TTL-bounded seed cache with opportunistic persistence.
//!
//! Shaped like `peer_list::disk_cache::DiskCache` (a thin wrapper with
//! `get`/`put`/`remove`/`flush`), but the backing store here is an
//! `lru::LruCache` rather than RocksDB: the persistent key-value store is
//! an external collaborator this crate only reaches through an injected
//! `SeedCacheStore`, never owns directly.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::config::{SEED_CACHE_MAX_SIZE, SEED_CACHE_TTL_SECS};
use crate::peer::PeerEndpoint;
use crate::time::{current_time_in_seconds, TimestampSeconds};

const _: () = assert!(SEED_CACHE_MAX_SIZE > 0, "seed cache must hold at least one entry");

/// A seed's known address plus rolling reputation data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedInfo {
    pub address: PeerEndpoint,
    pub services: u64,
    pub last_seen: TimestampSeconds,
    pub attempts: u32,
    pub failures: u32,
    /// Rolling exponential average latency, in millis.
    pub latency_ms: f64,
    pub inserted_at: TimestampSeconds,
    /// Domain this address was last resolved from, so a resolution
    /// failure can penalize exactly the addresses it produced.
    pub source_domain: String,
}

impl SeedInfo {
    pub fn new(address: PeerEndpoint, services: u64, source_domain: impl Into<String>) -> Self {
        let now = current_time_in_seconds();
        Self {
            address,
            services,
            last_seen: now,
            attempts: 0,
            failures: 0,
            latency_ms: 0.0,
            inserted_at: now,
            source_domain: source_domain.into(),
        }
    }

    /// `new = (old + sample) / 2`.
    pub fn record_latency_sample(&mut self, sample_ms: f64) {
        self.latency_ms = if self.attempts == 0 {
            sample_ms
        } else {
            (self.latency_ms + sample_ms) / 2.0
        };
        self.attempts += 1;
        self.last_seen = current_time_in_seconds();
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
    }

    fn hours_since_last_seen(&self) -> f64 {
        let now = current_time_in_seconds();
        (now.saturating_sub(self.last_seen)) as f64 / 3600.0
    }

    /// `100 − failures·10 − floor(latency/100) − floor(hoursSinceLastSeen·2)`,
    /// floored at 0.
    pub fn score(&self) -> u32 {
        let raw = 100.0
            - (self.failures as f64 * 10.0)
            - (self.latency_ms / 100.0).floor()
            - (self.hours_since_last_seen() * 2.0).floor();
        if raw < 0.0 {
            0
        } else {
            raw as u32
        }
    }

    pub fn has_required_services(&self, required: u64) -> bool {
        self.services & required == required
    }
}

/// Opportunistic persistence hook for the seed cache. Implementations
/// typically wrap a [`crate::store::KvStore`]; failures are logged and do
/// not block discovery.
#[async_trait]
pub trait SeedCacheStore: Send + Sync {
    async fn load(&self) -> anyhow::Result<Vec<SeedInfo>>;
    async fn save(&self, seeds: &[SeedInfo]) -> anyhow::Result<()>;
}

/// A no-op store for callers that don't want seed persistence.
pub struct NullSeedCacheStore;

#[async_trait]
impl SeedCacheStore for NullSeedCacheStore {
    async fn load(&self) -> anyhow::Result<Vec<SeedInfo>> {
        Ok(Vec::new())
    }

    async fn save(&self, _seeds: &[SeedInfo]) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct SeedCache {
    inner: Mutex<LruCache<PeerEndpoint, SeedInfo>>,
    ttl_secs: u64,
}

impl SeedCache {
    pub fn new(max_size: usize, ttl_secs: u64) -> Self {
        let capacity = NonZeroUsize::new(max_size)
            .unwrap_or_else(|| NonZeroUsize::new(SEED_CACHE_MAX_SIZE).unwrap());
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl_secs,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SEED_CACHE_MAX_SIZE, SEED_CACHE_TTL_SECS)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<PeerEndpoint, SeedInfo>> {
        self.inner.lock().expect("seed cache mutex poisoned")
    }

    pub fn put(&self, info: SeedInfo) {
        self.lock().put(info.address, info);
    }

    pub fn get(&self, addr: &PeerEndpoint) -> Option<SeedInfo> {
        self.lock().get(addr).cloned()
    }

    pub fn remove(&self, addr: &PeerEndpoint) {
        self.lock().pop(addr);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evicts entries older than the cache TTL. Eviction is metrics-only,
    /// never blocking I/O, per the shared-resource policy for bounded LRUs.
    pub fn sweep_expired(&self) {
        let now = current_time_in_seconds();
        let ttl = self.ttl_secs;
        let mut guard = self.lock();
        let expired: Vec<PeerEndpoint> = guard
            .iter()
            .filter(|(_, info)| now.saturating_sub(info.inserted_at) > ttl)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in expired {
            guard.pop(&addr);
            metrics::counter!("seed_cache_expired_total").increment(1);
        }
    }

    /// All non-expired entries whose failure count is below `ban_threshold`
    /// and whose services mask satisfies `required_services`.
    pub fn eligible(&self, required_services: u64, ban_threshold: u32) -> Vec<SeedInfo> {
        self.lock()
            .iter()
            .filter(|(_, info)| {
                info.failures < ban_threshold && info.has_required_services(required_services)
            })
            .map(|(_, info)| info.clone())
            .collect()
    }

    pub async fn load_from(&self, store: &dyn SeedCacheStore) -> anyhow::Result<()> {
        let seeds = store.load().await?;
        let mut guard = self.lock();
        for seed in seeds {
            guard.put(seed.address, seed);
        }
        Ok(())
    }

    pub async fn persist_to(&self, store: &dyn SeedCacheStore) -> anyhow::Result<()> {
        let snapshot: Vec<SeedInfo> = {
            let guard = self.lock();
            guard.iter().map(|(_, info)| info.clone()).collect()
        };
        store.save(&snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::str::FromStr;

    fn endpoint(ip: &str) -> PeerEndpoint {
        PeerEndpoint::new(IpAddr::from_str(ip).unwrap(), 8333)
    }

    #[test]
    fn score_decreases_with_failures_and_latency() {
        let mut info = SeedInfo::new(endpoint("10.0.0.1"), 1, "seed.test");
        info.record_latency_sample(50.0);
        assert_eq!(info.score(), 100);

        info.record_latency_sample(250.0);
        assert!(info.score() < 100);

        info.record_failure();
        info.record_failure();
        assert!(info.score() <= 80);
    }

    #[test]
    fn score_floors_at_zero() {
        let mut info = SeedInfo::new(endpoint("10.0.0.1"), 1, "seed.test");
        for _ in 0..20 {
            info.record_failure();
        }
        assert_eq!(info.score(), 0);
    }

    #[test]
    fn ema_latency_matches_spec_formula() {
        let mut info = SeedInfo::new(endpoint("10.0.0.1"), 1, "seed.test");
        info.record_latency_sample(100.0);
        assert_eq!(info.latency_ms, 100.0);
        info.record_latency_sample(300.0);
        assert_eq!(info.latency_ms, 200.0);
    }

    #[test]
    fn cache_respects_max_size() {
        let cache = SeedCache::new(2, 3600);
        cache.put(SeedInfo::new(endpoint("10.0.0.1"), 1, "seed.test"));
        cache.put(SeedInfo::new(endpoint("10.0.0.2"), 1, "seed.test"));
        cache.put(SeedInfo::new(endpoint("10.0.0.3"), 1, "seed.test"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&endpoint("10.0.0.1")).is_none());
    }

    #[test]
    fn eligible_filters_by_services_and_failures() {
        let cache = SeedCache::new(10, 3600);
        let mut low_services = SeedInfo::new(endpoint("10.0.0.1"), 0, "seed.test");
        low_services.record_failure();
        cache.put(low_services);

        let mut banned = SeedInfo::new(endpoint("10.0.0.2"), 1, "seed.test");
        for _ in 0..5 {
            banned.record_failure();
        }
        cache.put(banned);

        cache.put(SeedInfo::new(endpoint("10.0.0.3"), 1, "seed.test"));

        let eligible = cache.eligible(1, 5);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].address, endpoint("10.0.0.3"));
    }

    #[tokio::test]
    async fn null_store_roundtrips_to_empty() {
        let cache = SeedCache::with_defaults();
        cache.put(SeedInfo::new(endpoint("10.0.0.1"), 1, "seed.test"));
        let store = NullSeedCacheStore;
        cache.persist_to(&store).await.unwrap();
        let reload = SeedCache::with_defaults();
        reload.load_from(&store).await.unwrap();
        assert!(reload.is_empty());
    }
}
