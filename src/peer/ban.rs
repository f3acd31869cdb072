//! Ban scoring, whitelist/blacklist enforcement, and ban persistence.
//!
//! The ban store is a key-value namespace `ban:<endpoint>` in the external
//! store; this module owns the in-memory fast path (score accumulation,
//! whitelist/blacklist checks) and talks to the injected [`KvStore`] only
//! for persistence and range listing.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::MAX_BAN_SCORE;
use crate::peer::endpoint::PeerEndpoint;
use crate::store::KvStore;
use crate::time::{current_time_in_seconds, TimestampSeconds};

#[derive(Error, Debug)]
pub enum BanError {
    #[error("{0} is not in the static whitelist and cannot be whitelisted manually")]
    NotInStaticWhitelist(PeerEndpoint),
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
    #[error("malformed ban record for {0}")]
    MalformedRecord(PeerEndpoint),
}

pub type BanResult<T> = Result<T, BanError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanRecord {
    pub address: PeerEndpoint,
    pub timestamp: TimestampSeconds,
    /// 0 means permanent.
    pub expiration: TimestampSeconds,
    pub reason: String,
    pub ban_score: u32,
}

impl BanRecord {
    pub fn is_permanent(&self) -> bool {
        self.expiration == 0
    }

    pub fn is_expired_at(&self, now: TimestampSeconds) -> bool {
        !self.is_permanent() && now >= self.expiration
    }

    pub fn time_remaining_at(&self, now: TimestampSeconds) -> Option<u64> {
        if self.is_permanent() {
            None
        } else {
            Some(self.expiration.saturating_sub(now))
        }
    }
}

fn ban_key(endpoint: &PeerEndpoint) -> String {
    format!("ban:{endpoint}")
}

/// Per-session ban score accumulator plus the whitelist/blacklist policy
/// and ban-store bridge. One `BanStore` is shared across all sessions in
/// a node.
pub struct BanStore {
    scores: Mutex<HashMap<PeerEndpoint, u32>>,
    active_bans: Mutex<HashMap<PeerEndpoint, BanRecord>>,
    whitelist: HashSet<PeerEndpoint>,
    blacklist: HashSet<PeerEndpoint>,
    max_ban_score: u32,
}

impl BanStore {
    pub fn new(whitelist: HashSet<PeerEndpoint>, blacklist: HashSet<PeerEndpoint>) -> Self {
        Self {
            scores: Mutex::new(HashMap::new()),
            active_bans: Mutex::new(HashMap::new()),
            whitelist,
            blacklist,
            max_ban_score: MAX_BAN_SCORE,
        }
    }

    pub fn is_blacklisted(&self, endpoint: &PeerEndpoint) -> bool {
        self.blacklist.contains(endpoint)
    }

    pub fn is_whitelisted(&self, endpoint: &PeerEndpoint) -> bool {
        self.whitelist.contains(endpoint)
    }

    /// Manually whitelisting an endpoint not already in the static list is
    /// rejected.
    pub fn whitelist_manually(&mut self, endpoint: PeerEndpoint) -> BanResult<()> {
        if self.whitelist.contains(&endpoint) {
            Ok(())
        } else {
            Err(BanError::NotInStaticWhitelist(endpoint))
        }
    }

    /// Adds `penalty` to the endpoint's ban score. Returns the endpoint's
    /// current score and whether it just crossed `maxBanScore`. Whitelisted
    /// endpoints are exempt from score-induced disconnect, but the score is
    /// still recorded for observability.
    pub fn add_score(&self, endpoint: PeerEndpoint, penalty: u32) -> (u32, bool) {
        let mut scores = self.scores.lock().expect("ban score mutex poisoned");
        let score = scores.entry(endpoint).or_insert(0);
        *score += penalty;
        let crossed = *score >= self.max_ban_score && !self.whitelist.contains(&endpoint);
        (*score, crossed)
    }

    pub fn score_of(&self, endpoint: &PeerEndpoint) -> u32 {
        *self
            .scores
            .lock()
            .expect("ban score mutex poisoned")
            .get(endpoint)
            .unwrap_or(&0)
    }

    /// Records a ban in memory and persists it via the store.
    pub async fn ban(
        &self,
        store: &dyn KvStore,
        endpoint: PeerEndpoint,
        reason: impl Into<String>,
        duration_secs: u64,
    ) -> BanResult<()> {
        let now = current_time_in_seconds();
        let score = self.score_of(&endpoint);
        let record = BanRecord {
            address: endpoint,
            timestamp: now,
            expiration: if duration_secs == 0 { 0 } else { now + duration_secs },
            reason: reason.into(),
            ban_score: score,
        };
        self.active_bans
            .lock()
            .expect("active bans mutex poisoned")
            .insert(endpoint, record.clone());
        let encoded = serde_json::to_vec(&record).map_err(|e| BanError::Store(e.into()))?;
        store.put(&ban_key(&endpoint), &encoded).await?;
        Ok(())
    }

    /// `checkBanStatus`: true if banned and not expired. Lazily removes
    /// expired bans from the in-memory map (and the store) as a side
    /// effect.
    pub async fn check_ban_status(&self, store: &dyn KvStore, endpoint: &PeerEndpoint) -> BanResult<bool> {
        let now = current_time_in_seconds();
        let record = {
            let mut bans = self.active_bans.lock().expect("active bans mutex poisoned");
            bans.get(endpoint).cloned()
        };

        let Some(record) = record else {
            return Ok(false);
        };

        if record.is_expired_at(now) {
            self.active_bans
                .lock()
                .expect("active bans mutex poisoned")
                .remove(endpoint);
            store.delete(&ban_key(endpoint)).await?;
            Ok(false)
        } else {
            Ok(true)
        }
    }

    /// `listBans`: all ban records from the store, sorted by timestamp
    /// descending, each with a computed `time_remaining`.
    pub async fn list_bans(&self, store: &dyn KvStore) -> BanResult<Vec<(BanRecord, Option<u64>)>> {
        let entries = store.scan_range("ban:", "ban:\u{10FFFF}").await?;
        let now = current_time_in_seconds();
        let mut records = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let record: BanRecord = serde_json::from_slice(&value).map_err(|_| {
                let endpoint = key
                    .strip_prefix("ban:")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(PeerEndpoint::new(std::net::Ipv4Addr::UNSPECIFIED.into(), 0));
                BanError::MalformedRecord(endpoint)
            })?;
            let remaining = record.time_remaining_at(now);
            records.push((record, remaining));
        }
        records.sort_by(|a, b| b.0.timestamp.cmp(&a.0.timestamp));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;
    use std::sync::Mutex as StdMutex;

    struct InMemoryStore {
        map: StdMutex<BTreeMap<String, Vec<u8>>>,
    }

    impl InMemoryStore {
        fn new() -> Self {
            Self {
                map: StdMutex::new(BTreeMap::new()),
            }
        }
    }

    #[async_trait]
    impl KvStore for InMemoryStore {
        async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
            Ok(self.map.lock().unwrap().get(key).cloned())
        }
        async fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
            self.map.lock().unwrap().insert(key.to_string(), value.to_vec());
            Ok(())
        }
        async fn delete(&self, key: &str) -> anyhow::Result<()> {
            self.map.lock().unwrap().remove(key);
            Ok(())
        }
        async fn scan_range(&self, start: &str, end: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
            Ok(self
                .map
                .lock()
                .unwrap()
                .range(start.to_string()..end.to_string())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
        }
    }

    fn endpoint(last_octet: u8) -> PeerEndpoint {
        PeerEndpoint::new(Ipv4Addr::new(10, 0, 0, last_octet).into(), 8333)
    }

    #[test]
    fn score_crosses_max_triggers_flag() {
        let store = BanStore::new(HashSet::new(), HashSet::new());
        let ep = endpoint(1);
        let (score, crossed) = store.add_score(ep, 50);
        assert_eq!(score, 50);
        assert!(!crossed);
        let (score, crossed) = store.add_score(ep, 60);
        assert_eq!(score, 110);
        assert!(crossed);
    }

    #[test]
    fn whitelisted_endpoint_never_crosses() {
        let mut whitelist = HashSet::new();
        let ep = endpoint(2);
        whitelist.insert(ep);
        let store = BanStore::new(whitelist, HashSet::new());
        let (_, crossed) = store.add_score(ep, 1000);
        assert!(!crossed);
    }

    #[test]
    fn manual_whitelist_rejects_unknown_endpoint() {
        let mut store = BanStore::new(HashSet::new(), HashSet::new());
        let result = store.whitelist_manually(endpoint(3));
        assert!(matches!(result, Err(BanError::NotInStaticWhitelist(_))));
    }

    #[tokio::test]
    async fn ban_persists_and_check_status_reports_active() {
        let store = BanStore::new(HashSet::new(), HashSet::new());
        let kv = InMemoryStore::new();
        let ep = endpoint(4);
        store.ban(&kv, ep, "test", 0).await.unwrap();
        assert!(store.check_ban_status(&kv, &ep).await.unwrap());
    }

    #[tokio::test]
    async fn expired_ban_is_lazily_removed() {
        let store = BanStore::new(HashSet::new(), HashSet::new());
        let kv = InMemoryStore::new();
        let ep = endpoint(5);
        // Ban with an expiration already in the past.
        let record = BanRecord {
            address: ep,
            timestamp: 0,
            expiration: 1,
            reason: "test".into(),
            ban_score: 100,
        };
        store
            .active_bans
            .lock()
            .unwrap()
            .insert(ep, record.clone());
        kv.put(&ban_key(&ep), &serde_json::to_vec(&record).unwrap())
            .await
            .unwrap();

        assert!(!store.check_ban_status(&kv, &ep).await.unwrap());
        assert!(kv.get(&ban_key(&ep)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_bans_sorted_descending_by_timestamp() {
        let store = BanStore::new(HashSet::new(), HashSet::new());
        let kv = InMemoryStore::new();
        store.ban(&kv, endpoint(6), "older", 0).await.unwrap();
        store.ban(&kv, endpoint(7), "newer", 0).await.unwrap();
        // Force a distinct, later timestamp on the second record.
        let mut newer = kv.get(&ban_key(&endpoint(7))).await.unwrap().unwrap();
        let mut record: BanRecord = serde_json::from_slice(&newer).unwrap();
        record.timestamp += 1000;
        newer = serde_json::to_vec(&record).unwrap();
        kv.put(&ban_key(&endpoint(7)), &newer).await.unwrap();

        let listed = store.list_bans(&kv).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0.address, endpoint(7));
    }
}
