//! Domain-to-endpoint resolution, gated by a circuit breaker and a
//! single-flight in-progress flag, per discovery cycle.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::lookup_host;
use tokio::time::timeout;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::config::{seed_domain_regex, SeedDiscoveryConfig};
use crate::peer::PeerEndpoint;
use crate::seed::cache::{SeedCache, SeedCacheStore, SeedInfo};

#[derive(Error, Debug)]
pub enum SeedDiscoveryError {
    #[error("invalid seed domain '{0}'")]
    InvalidDomain(String),
    #[error("dns timeout resolving '{0}'")]
    Timeout(String),
    #[error("dns resolution failed for '{domain}': {source}")]
    ResolutionFailed {
        domain: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    CircuitOpen(#[from] CircuitBreakerError),
    #[error("discovery cycle already in progress")]
    AlreadyInProgress,
}

pub type SeedDiscoveryResult<T> = Result<T, SeedDiscoveryError>;

/// Ranked peer endpoint returned from a discovery cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedPeer {
    pub endpoint: PeerEndpoint,
    pub score: u32,
}

pub struct SeedDiscovery {
    config: SeedDiscoveryConfig,
    cache: Arc<SeedCache>,
    breaker: Arc<CircuitBreaker>,
    in_progress: AtomicBool,
}

impl SeedDiscovery {
    pub fn new(config: SeedDiscoveryConfig, breaker: Arc<CircuitBreaker>) -> Self {
        let cache = Arc::new(SeedCache::new(
            crate::config::SEED_CACHE_MAX_SIZE,
            config.cache_expiry_secs,
        ));
        Self {
            config,
            cache,
            breaker,
            in_progress: AtomicBool::new(false),
        }
    }

    pub fn cache(&self) -> &Arc<SeedCache> {
        &self.cache
    }

    pub async fn load_cache(&self, store: &dyn SeedCacheStore) -> anyhow::Result<()> {
        self.cache.load_from(store).await
    }

    pub async fn persist_cache(&self, store: &dyn SeedCacheStore) -> anyhow::Result<()> {
        self.cache.persist_to(store).await
    }

    fn validate_domain(domain: &str) -> SeedDiscoveryResult<()> {
        if seed_domain_regex().is_match(domain) {
            Ok(())
        } else {
            Err(SeedDiscoveryError::InvalidDomain(domain.to_string()))
        }
    }

    /// Resolves A, AAAA, and a generic hostname lookup for `domain` in
    /// parallel, racing each against `self.config.timeout_millis`, and
    /// merges the unique resulting IPs.
    async fn resolve_domain_once(&self, domain: &str) -> SeedDiscoveryResult<Vec<IpAddr>> {
        let per_seed_timeout = Duration::from_millis(self.config.timeout_millis);
        let v4_host = format!("{domain}:0");
        let v6_host = format!("{domain}:0");
        let generic_host = format!("{domain}:0");

        let (v4, v6, generic) = tokio::join!(
            timeout(per_seed_timeout, lookup_host(v4_host)),
            timeout(per_seed_timeout, lookup_host(v6_host)),
            timeout(per_seed_timeout, lookup_host(generic_host)),
        );

        let mut ips = Vec::new();
        let mut any_timed_out = false;
        let mut last_error = None;

        for (result, want_v4, want_v6) in [
            (v4, true, false),
            (v6, false, true),
            (generic, true, true),
        ] {
            match result {
                Ok(Ok(addrs)) => {
                    for addr in addrs {
                        let ip = addr.ip();
                        let matches = (want_v4 && ip.is_ipv4()) || (want_v6 && ip.is_ipv6());
                        if matches && !ips.contains(&ip) {
                            ips.push(ip);
                        }
                    }
                }
                Ok(Err(e)) => last_error = Some(e),
                Err(_) => any_timed_out = true,
            }
        }

        if ips.is_empty() {
            if let Some(source) = last_error {
                return Err(SeedDiscoveryError::ResolutionFailed {
                    domain: domain.to_string(),
                    source,
                });
            }
            if any_timed_out {
                return Err(SeedDiscoveryError::Timeout(domain.to_string()));
            }
        }

        Ok(ips)
    }

    /// Resolves with up to `max_retries` retries at a fixed `retry_delay`.
    /// Only resolution errors (not timeouts alone, and never circuit-open)
    /// count toward the seed's failure counter — callers decide that from
    /// the returned error variant. Returns the wall-clock time of the
    /// successful lookup alongside the resolved IPs, for the seed's
    /// rolling latency sample.
    async fn resolve_domain_with_retry(&self, domain: &str) -> SeedDiscoveryResult<(Vec<IpAddr>, u64)> {
        let mut attempt = 0;
        loop {
            let started = std::time::Instant::now();
            match self.resolve_domain_once(domain).await {
                Ok(ips) => return Ok((ips, started.elapsed().as_millis() as u64)),
                Err(err) if attempt + 1 < self.config.max_retries => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(self.config.retry_delay_millis)).await;
                    log::debug!("retrying seed resolution for {domain} (attempt {attempt}): {err}");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Runs one discovery cycle over every configured seed domain, gated
    /// by the single-flight flag and the circuit breaker. Returns ranked
    /// peer addresses, at most `max_peers`.
    pub async fn run_cycle(&self) -> SeedDiscoveryResult<Vec<RankedPeer>> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SeedDiscoveryError::AlreadyInProgress);
        }

        let result = self.run_cycle_inner().await;
        self.in_progress.store(false, Ordering::SeqCst);
        result
    }

    async fn run_cycle_inner(&self) -> SeedDiscoveryResult<Vec<RankedPeer>> {
        for domain in &self.config.seed_domains {
            Self::validate_domain(domain)?;
        }

        for domain in &self.config.seed_domains {
            let domain = domain.clone();
            let breaker_result = self
                .breaker
                .run(|| async {
                    self.resolve_domain_with_retry(&domain)
                        .await
                        .map_err(anyhow::Error::from)
                })
                .await;

            match breaker_result {
                Ok((ips, latency_millis)) => {
                    for ip in ips {
                        let endpoint = PeerEndpoint::new(ip, self.config.port);
                        let mut info = self.cache.get(&endpoint).unwrap_or_else(|| {
                            SeedInfo::new(endpoint, self.config.required_services, domain.clone())
                        });
                        info.record_latency_sample(latency_millis as f64);
                        self.cache.put(info);
                    }
                }
                Err(CircuitBreakerError::ActionFailed(inner)) => {
                    if let Some(seed_err) = inner.downcast_ref::<SeedDiscoveryError>() {
                        if matches!(seed_err, SeedDiscoveryError::ResolutionFailed { .. }) {
                            self.penalize_domain(&domain);
                        }
                    }
                }
                Err(CircuitBreakerError::CircuitOpen) | Err(CircuitBreakerError::TrialInProgress) => {
                    log::debug!("seed discovery circuit open, skipping {domain}");
                }
            }
        }

        self.cache.sweep_expired();
        Ok(self.rank())
    }

    fn penalize_domain(&self, domain: &str) {
        let from_domain: Vec<SeedInfo> = self
            .cache
            .eligible(0, u32::MAX)
            .into_iter()
            .filter(|info| info.source_domain == domain)
            .collect();
        for mut info in from_domain {
            info.record_failure();
            if info.failures >= self.config.ban_threshold {
                self.cache.remove(&info.address);
            } else {
                self.cache.put(info);
            }
        }
    }

    /// Ranks cached, eligible seeds by score descending and returns at
    /// most `max_peers`, formatted as validated endpoints.
    fn rank(&self) -> Vec<RankedPeer> {
        let mut eligible = self
            .cache
            .eligible(self.config.required_services, self.config.ban_threshold);

        if self.config.seed_ranking {
            eligible.sort_by(|a, b| b.score().cmp(&a.score()));
        }

        eligible
            .into_iter()
            .take(self.config.max_peers)
            .map(|info| RankedPeer {
                endpoint: info.address,
                score: info.score(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use std::net::Ipv4Addr;

    fn discovery() -> SeedDiscovery {
        let breaker = Arc::new(CircuitBreaker::new("seed", CircuitBreakerConfig::default()));
        SeedDiscovery::new(SeedDiscoveryConfig::default(), breaker)
    }

    #[test]
    fn rank_orders_by_score_descending() {
        let d = discovery();
        let fast = PeerEndpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 8333);
        let slow = PeerEndpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 8333);

        let mut fast_info = SeedInfo::new(fast, 1, "seed.test");
        fast_info.record_latency_sample(50.0);
        d.cache.put(fast_info);

        let mut slow_info = SeedInfo::new(slow, 1, "seed.test");
        slow_info.record_latency_sample(200.0);
        d.cache.put(slow_info);

        let ranked = d.rank();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].endpoint, fast);
        assert_eq!(ranked[1].endpoint, slow);
    }

    #[test]
    fn rank_caps_at_max_peers() {
        let mut config = SeedDiscoveryConfig::default();
        config.max_peers = 1;
        let breaker = Arc::new(CircuitBreaker::new("seed", CircuitBreakerConfig::default()));
        let d = SeedDiscovery::new(config, breaker);

        for i in 0..3u8 {
            d.cache
                .put(SeedInfo::new(PeerEndpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, i)), 8333), 1, "seed.test"));
        }

        assert_eq!(d.rank().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_cycles_reject_with_already_in_progress() {
        let d = Arc::new(discovery());
        let d2 = d.clone();
        d.in_progress.store(true, Ordering::SeqCst);
        let result = d2.run_cycle().await;
        assert!(matches!(result, Err(SeedDiscoveryError::AlreadyInProgress)));
    }

    #[test]
    fn validate_domain_rejects_malformed() {
        assert!(SeedDiscovery::validate_domain("not a domain").is_err());
        assert!(SeedDiscovery::validate_domain("seed.tos.network").is_ok());
    }
}
