//! Tunables for the P2P core, grouped by component.
//!
//! A flat `pub const` constants module, plus a couple of `clap::Args` +
//! `serde` config structs for the pieces an operator actually needs to
//! override at startup (seed discovery, node limits). Everything else is
//! a compile-time constant: changing protocol timing is a deliberate,
//! reviewed change, not a runtime flag.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------
// Network / ports
// ---------------------------------------------------------------------

/// Default P2P port on mainnet.
pub const DEFAULT_P2P_PORT: u16 = 8333;

// ---------------------------------------------------------------------
// Peer session rules
// ---------------------------------------------------------------------

/// Millis until the handshake watchdog fires.
pub const PEER_HANDSHAKE_TIMEOUT_MILLIS: u64 = 5_000;
/// Seconds between outbound PING packets.
pub const PEER_MIN_PING_INTERVAL_SECS: u64 = 120;
/// Latency ring buffer capacity.
pub const PEER_LATENCY_SAMPLES: usize = 10;
/// Window within which latency samples remain valid.
pub const PEER_LATENCY_WINDOW_SECS: u64 = 60;
/// Millis until an outbound `request()` times out if unconfigured.
pub const PEER_DEFAULT_REQUEST_TIMEOUT_MILLIS: u64 = 15_000;
/// Size of the channel feeding the writer task.
pub const PEER_PACKET_CHANNEL_SIZE: usize = 1024;
/// Maximum packet size in bytes (5 MiB).
pub const PEER_MAX_PACKET_SIZE: usize = 5 * 1024 * 1024;

// Rate limiting
/// Sliding window length for the message rate limiter, in millis.
pub const RATE_LIMIT_INTERVAL_MILLIS: u64 = 60_000;
/// Maximum messages allowed within the window.
pub const RATE_LIMIT_MAX_MESSAGES: usize = 100;
/// Maximum bytes allowed within the window.
pub const RATE_LIMIT_MAX_BYTES: usize = 20 * 1024 * 1024;

// Ban scoring
/// Ban score at which a session is closed and the endpoint is banned.
pub const MAX_BAN_SCORE: u32 = 100;
/// Penalty for an invalid inventory item.
pub const BAN_SCORE_INVALID_INVENTORY: u32 = 1;
/// Penalty for tripping the rate limiter.
pub const BAN_SCORE_RATE_LIMIT: u32 = 1;
/// Penalty for a malformed or stale transaction.
pub const BAN_SCORE_INVALID_TX: u32 = 1;
/// Penalty for an invalid block.
pub const BAN_SCORE_INVALID_BLOCK: u32 = 20;
/// Penalty for failing peer verification at connect time.
pub const BAN_SCORE_VERIFICATION_FAILURE: u32 = 10;
/// Penalty for a message handler exception.
pub const BAN_SCORE_HANDLER_EXCEPTION: u32 = 1;
/// Default temp-ban duration in seconds (15 minutes).
pub const DEFAULT_BAN_TIME_SECS: u64 = 15 * 60;
/// Window after which the fail counter resets (30 minutes).
pub const PEER_FAIL_TIME_RESET_SECS: u64 = 30 * 60;

// Unsolicited push-message flood guard (independent 1s window)
/// Maximum unsolicited blocks/transactions accepted per second from one peer.
pub const MAX_UNSOLICITED_PER_SECOND: u32 = 5;

// ---------------------------------------------------------------------
// Seed discovery
// ---------------------------------------------------------------------

/// Default maximum seed cache size.
pub const SEED_CACHE_MAX_SIZE: usize = 1_000;
/// Default seed cache TTL in seconds (1 hour).
pub const SEED_CACHE_TTL_SECS: u64 = 60 * 60;
/// Default number of resolution retries per seed.
pub const SEED_DEFAULT_MAX_RETRIES: u32 = 3;
/// Default delay between resolution retries, in millis.
pub const SEED_DEFAULT_RETRY_DELAY_MILLIS: u64 = 1_000;
/// Default per-seed resolution timeout, in millis.
pub const SEED_DEFAULT_TIMEOUT_MILLIS: u64 = 5_000;
/// Failures at which a seed is evicted from the cache.
pub const SEED_DEFAULT_BAN_THRESHOLD: u32 = 5;

// ---------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------

/// Default consecutive-failure threshold before opening.
pub const CIRCUIT_DEFAULT_FAILURE_THRESHOLD: u32 = 5;
/// Default time the breaker stays open before trying half-open, in millis.
pub const CIRCUIT_DEFAULT_RESET_TIMEOUT_MILLIS: u64 = 30_000;
/// Default interval at which the breaker's monitor re-checks state, in millis.
pub const CIRCUIT_DEFAULT_MONITOR_INTERVAL_MILLIS: u64 = 1_000;

// ---------------------------------------------------------------------
// Synchronizer
// ---------------------------------------------------------------------

/// Headers requested per batch.
pub const HEADERS_BATCH_SIZE: u64 = 2_000;
/// Blocks downloaded per serial batch.
pub const BLOCKS_BATCH_SIZE: u64 = 100;
/// Blocks processed per parallel micro-batch within a blocks batch.
pub const MAX_PARALLEL_BLOCKS: usize = 10;
/// Retries for an individual block/header batch request.
pub const MAX_BLOCK_REQUEST_RETRIES: u32 = 3;
/// Maximum headers a single rewind may discard.
pub const MAX_HEADERS_REWIND: u64 = 100;
/// Retries for a whole `startSync` cycle before giving up.
pub const MAX_SYNC_RETRY_ATTEMPTS: u32 = 3;
/// Overall timeout for one synchronize pipeline run, in seconds.
pub const SYNC_PIPELINE_TIMEOUT_SECS: u64 = 30;
/// Timeout to pick a sync peer, in seconds.
pub const PEER_SELECTION_TIMEOUT_SECS: u64 = 10;
/// Periodic check interval that may trigger `startSync`, in seconds.
pub const SYNC_CHECK_INTERVAL_SECS: u64 = 60;
/// Minimum peer average bandwidth to be sync-eligible (bytes/sec).
pub const MIN_SYNC_PEER_BANDWIDTH_BYTES_PER_SEC: u64 = 1024 * 1024;

// ---------------------------------------------------------------------
// Node coordinator
// ---------------------------------------------------------------------

/// Default maximum number of orphan blocks held at once.
pub const DEFAULT_MAX_ORPHANS: usize = 100;
/// Maximum age of an orphan block before it is pruned.
pub const ORPHAN_MAX_AGE_SECS: u64 = 60 * 60;
/// Maintenance timer interval, in seconds (1 hour).
pub const DEFAULT_PRUNE_INTERVAL_SECS: u64 = 60 * 60;
/// Peer cache TTL, in seconds (1 hour).
pub const PEER_CACHE_TTL_SECS: u64 = 60 * 60;
/// Peer cache max size.
pub const PEER_CACHE_MAX_SIZE: usize = 1_000;
/// Fraction of connected peers that must accept a raw transaction broadcast.
pub const RAW_TX_BROADCAST_QUORUM: f64 = 0.51;
/// Baseline connection timeout; peer states older than twice this are
/// evicted by the maintenance timer.
pub const PEER_CONNECTION_TIMEOUT_SECS: u64 = 5 * 60;

/// Configuration for the seed discovery component.
///
/// Mirrors `daemon/src/discovery/config.rs`'s shape: a `clap::Args` +
/// `serde` struct with a hand-written `Default` impl so tests and
/// programmatic callers don't need to go through argument parsing.
#[derive(Debug, Clone, clap::Args, Serialize, Deserialize)]
pub struct SeedDiscoveryConfig {
    /// DNS seed domains to resolve on startup and on each discovery cycle.
    #[clap(name = "seed-domains", long)]
    #[serde(default)]
    pub seed_domains: Vec<String>,

    /// Port appended to resolved seed addresses.
    #[clap(name = "seed-port", long, default_value_t = DEFAULT_P2P_PORT)]
    #[serde(default = "default_p2p_port")]
    pub port: u16,

    /// Minimum number of peers to try to maintain.
    #[clap(name = "min-peers", long, default_value_t = 8)]
    #[serde(default = "default_min_peers")]
    pub min_peers: usize,

    /// Maximum number of peers returned by one discovery cycle.
    #[clap(name = "max-peers", long, default_value_t = 32)]
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,

    /// Per-seed resolution timeout, in millis.
    #[clap(name = "seed-timeout-ms", long, default_value_t = SEED_DEFAULT_TIMEOUT_MILLIS)]
    #[serde(default = "default_seed_timeout")]
    pub timeout_millis: u64,

    /// Maximum resolution retries per seed.
    #[clap(name = "seed-max-retries", long, default_value_t = SEED_DEFAULT_MAX_RETRIES)]
    #[serde(default = "default_seed_retries")]
    pub max_retries: u32,

    /// Delay between resolution retries, in millis.
    #[clap(name = "seed-retry-delay-ms", long, default_value_t = SEED_DEFAULT_RETRY_DELAY_MILLIS)]
    #[serde(default = "default_retry_delay")]
    pub retry_delay_millis: u64,

    /// Seed cache TTL, in seconds.
    #[clap(name = "seed-cache-expiry-secs", long, default_value_t = SEED_CACHE_TTL_SECS)]
    #[serde(default = "default_cache_expiry")]
    pub cache_expiry_secs: u64,

    /// Service bits a seed-provided peer must advertise to be returned.
    #[clap(name = "required-services", long, default_value_t = 0)]
    #[serde(default)]
    pub required_services: u64,

    /// Failures after which a seed is dropped from the cache.
    #[clap(name = "seed-ban-threshold", long, default_value_t = SEED_DEFAULT_BAN_THRESHOLD)]
    #[serde(default = "default_ban_threshold")]
    pub ban_threshold: u32,

    /// Whether to rank resolved peers by seed quality score.
    #[clap(name = "seed-ranking", long, default_value_t = true)]
    #[serde(default = "default_true")]
    pub seed_ranking: bool,
}

const fn default_p2p_port() -> u16 {
    DEFAULT_P2P_PORT
}
const fn default_min_peers() -> usize {
    8
}
const fn default_max_peers() -> usize {
    32
}
const fn default_seed_timeout() -> u64 {
    SEED_DEFAULT_TIMEOUT_MILLIS
}
const fn default_seed_retries() -> u32 {
    SEED_DEFAULT_MAX_RETRIES
}
const fn default_retry_delay() -> u64 {
    SEED_DEFAULT_RETRY_DELAY_MILLIS
}
const fn default_cache_expiry() -> u64 {
    SEED_CACHE_TTL_SECS
}
const fn default_ban_threshold() -> u32 {
    SEED_DEFAULT_BAN_THRESHOLD
}
const fn default_true() -> bool {
    true
}

impl Default for SeedDiscoveryConfig {
    fn default() -> Self {
        Self {
            seed_domains: Vec::new(),
            port: DEFAULT_P2P_PORT,
            min_peers: default_min_peers(),
            max_peers: default_max_peers(),
            timeout_millis: SEED_DEFAULT_TIMEOUT_MILLIS,
            max_retries: SEED_DEFAULT_MAX_RETRIES,
            retry_delay_millis: SEED_DEFAULT_RETRY_DELAY_MILLIS,
            cache_expiry_secs: SEED_CACHE_TTL_SECS,
            required_services: 0,
            ban_threshold: SEED_DEFAULT_BAN_THRESHOLD,
            seed_ranking: true,
        }
    }
}

/// Regex a seed domain name must satisfy (a DNS label sequence).
pub fn seed_domain_regex() -> &'static regex::Regex {
    lazy_static::lazy_static! {
        static ref SEED_DOMAIN_RE: regex::Regex = regex::Regex::new(
            r"^(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?\.)+[a-zA-Z]{2,}$"
        ).expect("valid regex");
    }
    &SEED_DOMAIN_RE
}
