//! Headers-then-blocks synchronizer: peer selection, the two-phase
//! pipeline, retry/backoff, and new-block gossip classification.
//!
//! Grounded on `p2p::chain_sync::mod`'s overall pipeline shape (a locked
//! request-then-validate-then-process loop, progress logging gated by
//! `log_enabled!`) and `p2p::chain_sync::sync_validator`'s deferred/retry
//! loop shape, reused here for the `MAX_SYNC_RETRY_ATTEMPTS` restart loop.

pub mod error;
pub mod header;
pub mod peer;
pub mod validator;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::config::{
    BLOCKS_BATCH_SIZE, HEADERS_BATCH_SIZE, MAX_BLOCK_REQUEST_RETRIES, MAX_HEADERS_REWIND,
    MAX_PARALLEL_BLOCKS, MAX_SYNC_RETRY_ATTEMPTS, MIN_SYNC_PEER_BANDWIDTH_BYTES_PER_SEC,
    PEER_SELECTION_TIMEOUT_SECS, SYNC_PIPELINE_TIMEOUT_SECS,
};
use crate::store::{Block, BlockchainClient, MempoolClient};

pub use error::{SyncError, SyncResult};
pub use header::{Header, HeaderSyncWindow};
pub use peer::{select_sync_peer, SyncPeer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing,
    Synced,
    Error,
}

#[derive(Debug, Clone)]
pub struct SyncProgress {
    pub current_height: u64,
    pub target_height: u64,
    pub percentage: f64,
    pub symbol: char,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GossipAction {
    AddDirect,
    RestartSync,
    Orphan,
}

/// Classifies a pushed block relative to the local tip while already
/// synced: one ahead adds directly, a larger gap restarts sync, otherwise
/// it's handled as an orphan by the coordinator.
pub fn classify_new_block(peer_reported_height: u64, local_tip: u64) -> GossipAction {
    if peer_reported_height == local_tip + 1 {
        GossipAction::AddDirect
    } else if peer_reported_height > local_tip + 1 {
        GossipAction::RestartSync
    } else {
        GossipAction::Orphan
    }
}

#[async_trait]
pub trait SyncProgressObserver: Send + Sync {
    async fn on_progress(&self, progress: SyncProgress);
    async fn on_sync_failed(&self);
}

pub struct NullProgressObserver;

#[async_trait]
impl SyncProgressObserver for NullProgressObserver {
    async fn on_progress(&self, _progress: SyncProgress) {}
    async fn on_sync_failed(&self) {}
}

/// Exponential backoff with jitter, floored at the linear baseline
/// `(attempt+1)*base` so default-timing tests still hold.
fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    let linear = base * (attempt + 1);
    let exp_millis = (base.as_millis() as u64).saturating_mul(1u64 << attempt.min(10));
    let jitter_ceiling = (exp_millis / 4).max(1);
    let jitter = rand::thread_rng().gen_range(0..=jitter_ceiling);
    Duration::from_millis(exp_millis + jitter).max(linear)
}

/// Drives the local chain to match the best available peer's tip.
/// Holds `sync.exclusive` for the duration of the headers phase only;
/// the blocks phase releases between batches.
pub struct Synchronizer {
    state: Mutex<SyncState>,
    exclusive: Mutex<()>,
    retry_attempts: AtomicU32,
    blockchain: Arc<dyn BlockchainClient>,
    mempool: Arc<dyn MempoolClient>,
    observer: Arc<dyn SyncProgressObserver>,
    verify_full_chain: bool,
}

impl Synchronizer {
    pub fn new(
        blockchain: Arc<dyn BlockchainClient>,
        mempool: Arc<dyn MempoolClient>,
        observer: Arc<dyn SyncProgressObserver>,
        verify_full_chain: bool,
    ) -> Self {
        Self {
            state: Mutex::new(SyncState::Idle),
            exclusive: Mutex::new(()),
            retry_attempts: AtomicU32::new(0),
            blockchain,
            mempool,
            observer,
            verify_full_chain,
        }
    }

    pub async fn state(&self) -> SyncState {
        *self.state.lock().await
    }

    async fn set_state(&self, state: SyncState) {
        *self.state.lock().await = state;
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts.load(Ordering::SeqCst)
    }

    /// Periodic checker (intended to run roughly every `SYNC_CHECK_INTERVAL_SECS`):
    /// triggers `start_sync` when not already syncing and at least one peer
    /// reports a height greater than local.
    pub async fn maybe_trigger(self: &Arc<Self>, peers: &[Arc<dyn SyncPeer>], local_height: u64) -> bool {
        if self.state().await == SyncState::Syncing {
            return false;
        }
        let mut ahead = false;
        for peer in peers {
            if peer.reported_height().await > local_height {
                ahead = true;
                break;
            }
        }
        if !ahead {
            return false;
        }
        self.start_sync(peers, local_height).await.is_ok()
    }

    /// `startSync`: a no-op if already syncing (state unchanged). Resets
    /// `retry_attempts` at the start of any fresh external call, then
    /// retries the pipeline internally up to `MAX_SYNC_RETRY_ATTEMPTS`.
    pub async fn start_sync(self: &Arc<Self>, peers: &[Arc<dyn SyncPeer>], local_height: u64) -> SyncResult<()> {
        {
            let mut state = self.state.lock().await;
            if *state == SyncState::Syncing {
                return Err(SyncError::AlreadySyncing);
            }
            *state = SyncState::Syncing;
        }
        self.retry_attempts.store(0, Ordering::SeqCst);

        let result = self.sync_with_retries(peers, local_height).await;

        match &result {
            Ok(()) => {
                self.retry_attempts.store(0, Ordering::SeqCst);
                self.set_state(SyncState::Synced).await;
            }
            Err(_) => {
                self.set_state(SyncState::Error).await;
                self.observer.on_sync_failed().await;
            }
        }
        result
    }

    async fn sync_with_retries(&self, peers: &[Arc<dyn SyncPeer>], local_height: u64) -> SyncResult<()> {
        loop {
            let peer = timeout(
                Duration::from_secs(PEER_SELECTION_TIMEOUT_SECS),
                select_sync_peer(peers, local_height, 0, MIN_SYNC_PEER_BANDWIDTH_BYTES_PER_SEC),
            )
            .await
            .map_err(|_| SyncError::SelectionTimeout)?
            .ok_or(SyncError::NoEligiblePeer)?;

            let outcome = match timeout(
                Duration::from_secs(SYNC_PIPELINE_TIMEOUT_SECS),
                self.run_pipeline(peer, local_height),
            )
            .await
            {
                Ok(inner) => inner,
                Err(_) => Err(SyncError::PipelineTimeout),
            };

            match outcome {
                Ok(()) => return Ok(()),
                Err(err) => {
                    let attempt = self.retry_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempt >= MAX_SYNC_RETRY_ATTEMPTS {
                        return Err(err);
                    }
                    log::warn!("sync attempt {attempt} failed: {err}, retrying");
                }
            }
        }
    }

    async fn run_pipeline(&self, peer: Arc<dyn SyncPeer>, local_height: u64) -> SyncResult<()> {
        let target_height = peer.reported_height().await;
        let window = self.headers_phase(peer.as_ref(), local_height, target_height).await?;
        self.blocks_phase(peer.as_ref(), &window).await?;
        if self.verify_full_chain {
            self.verify_chain(window.current_height).await?;
        }
        Ok(())
    }

    /// Headers phase: batched requests with retry/backoff, validated and
    /// rewound on conflict, held under the exclusive lock for its whole
    /// duration.
    async fn headers_phase(
        &self,
        peer: &dyn SyncPeer,
        local_height: u64,
        target_height: u64,
    ) -> SyncResult<HeaderSyncWindow> {
        let _exclusive = self.exclusive.lock().await;
        let mut window = HeaderSyncWindow::new(local_height, target_height);
        let mut prev_accepted: Option<Header> = None;

        while window.current_height < window.target_height {
            let batch_start = window.current_height;
            let batch_end = (batch_start + HEADERS_BATCH_SIZE).min(window.target_height);

            let batch = self.request_headers_with_retry(peer, batch_start, batch_end).await?;

            match validator::validate_batch(&batch, batch_start, prev_accepted.as_ref()) {
                Ok(()) => {
                    prev_accepted = batch.last().cloned();
                    window.insert_batch(batch);
                    if log::log_enabled!(log::Level::Debug) {
                        log::debug!(
                            "headers progress: {}/{} ({:.1}%)",
                            window.current_height,
                            window.target_height,
                            window.percentage()
                        );
                    }
                    self.observer
                        .on_progress(SyncProgress {
                            current_height: window.current_height,
                            target_height: window.target_height,
                            percentage: window.percentage(),
                            symbol: '#',
                        })
                        .await;
                }
                Err(err) => {
                    log::warn!("invalid header batch at {batch_start}..{batch_end}: {err}, rewinding");
                    window.rewind(MAX_HEADERS_REWIND);
                    prev_accepted = window
                        .current_height
                        .checked_sub(1)
                        .and_then(|h| window.headers.get(&h))
                        .cloned();
                }
            }
        }

        Ok(window)
    }

    async fn request_headers_with_retry(&self, peer: &dyn SyncPeer, start: u64, end: u64) -> SyncResult<Vec<Header>> {
        let mut attempt = 0;
        loop {
            match peer.request_headers(start, end).await {
                Ok(headers) => return Ok(headers),
                Err(err) if attempt + 1 < MAX_BLOCK_REQUEST_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(backoff_delay(attempt, Duration::from_secs(1))).await;
                    log::debug!("retrying header request {start}..{end} (attempt {attempt}): {err}");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Blocks phase: serial batches of `BLOCKS_BATCH_SIZE`, each batch's
    /// requests issued in parallel; releases the exclusive lock between
    /// batches so progress observers and other readers can make progress.
    async fn blocks_phase(&self, peer: &dyn SyncPeer, window: &HeaderSyncWindow) -> SyncResult<()> {
        let heights: Vec<u64> = window.headers.keys().copied().collect();

        for serial_batch in heights.chunks(BLOCKS_BATCH_SIZE as usize) {
            let blocks = self.download_batch(peer, serial_batch).await?;
            self.process_blocks_in_parallel(window, blocks).await?;
        }

        Ok(())
    }

    async fn download_batch(&self, peer: &dyn SyncPeer, heights: &[u64]) -> SyncResult<Vec<Block>> {
        let futures = heights.iter().map(|&height| self.request_block_with_retry(peer, height));
        futures::future::try_join_all(futures).await
    }

    async fn request_block_with_retry(&self, peer: &dyn SyncPeer, height: u64) -> SyncResult<Block> {
        let mut attempt = 0;
        loop {
            match peer.request_block(height).await {
                Ok(block) => return Ok(block),
                Err(err) if attempt + 1 < MAX_BLOCK_REQUEST_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(backoff_delay(attempt, Duration::from_secs(1))).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Partitions a downloaded batch into `MAX_PARALLEL_BLOCKS`
    /// micro-batches and awaits each before starting the next, to bound
    /// memory.
    async fn process_blocks_in_parallel(&self, window: &HeaderSyncWindow, blocks: Vec<Block>) -> SyncResult<()> {
        for micro_batch in blocks.chunks(MAX_PARALLEL_BLOCKS) {
            let futures = micro_batch.iter().map(|block| self.validate_and_process(window, block));
            futures::future::try_join_all(futures).await?;
        }
        Ok(())
    }

    /// Matches the block against its stored header (height + hash), hands
    /// it to the external blockchain, and best-effort prunes its
    /// transactions from the mempool.
    async fn validate_and_process(&self, window: &HeaderSyncWindow, block: &Block) -> SyncResult<()> {
        let header = window.headers.get(&block.height).ok_or_else(|| SyncError::BlockHeaderMismatch {
            height: block.height,
            expected: "<no header for height>".to_string(),
            got: block.hash.clone(),
        })?;
        if header.hash != block.hash {
            return Err(SyncError::BlockHeaderMismatch {
                height: block.height,
                expected: header.hash.clone(),
                got: block.hash.clone(),
            });
        }

        self.blockchain
            .add_block(block)
            .await
            .map_err(|source| SyncError::BlockRejected { height: block.height, source })?;

        if let Err(e) = self.mempool.remove_included(&block.transactions).await {
            log::warn!("failed to remove included transactions from mempool: {e}");
        }

        Ok(())
    }

    /// Optional full chain re-verification, gated by `verify_full_chain`
    /// since this is a heavier, likely dev-only check.
    async fn verify_chain(&self, up_to_height: u64) -> SyncResult<()> {
        for height in 1..up_to_height {
            self.blockchain
                .verify_block(height)
                .await
                .map_err(|_| SyncError::ChainVerificationFailed(height))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Block as StoreBlock, NodeAttributes};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex as TokioMutex;

    struct FakeBlockchain {
        added: TokioMutex<Vec<u64>>,
    }

    #[async_trait]
    impl BlockchainClient for FakeBlockchain {
        async fn local_height(&self) -> u64 {
            0
        }
        async fn header_at(&self, _height: u64) -> Option<Header> {
            None
        }
        async fn add_block(&self, block: &StoreBlock) -> anyhow::Result<()> {
            self.added.lock().await.push(block.height);
            Ok(())
        }
        async fn verify_block(&self, _height: u64) -> anyhow::Result<()> {
            Ok(())
        }
        async fn has_object(&self, _hash: &str) -> bool {
            false
        }
        async fn block_by_hash(&self, _hash: &str) -> Option<StoreBlock> {
            None
        }
    }

    struct FakeMempool;
    #[async_trait]
    impl MempoolClient for FakeMempool {
        async fn remove_included(&self, _tx_hashes: &[String]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn contains(&self, _tx_hash: &str) -> bool {
            false
        }
        async fn raw_tx(&self, _tx_hash: &str) -> Option<Vec<u8>> {
            None
        }
    }

    fn header(height: u64) -> Header {
        Header {
            height,
            hash: format!("h{height}"),
            previous_hash: if height == 0 { "genesis".to_string() } else { format!("h{}", height - 1) },
            timestamp: height + 1,
        }
    }

    struct FakePeer {
        endpoint: crate::peer::PeerEndpoint,
        target_height: u64,
        headers: StdMutex<HashMap<(u64, u64), Vec<Header>>>,
    }

    #[async_trait]
    impl SyncPeer for FakePeer {
        fn endpoint(&self) -> crate::peer::PeerEndpoint {
            self.endpoint
        }
        fn services(&self) -> u64 {
            1
        }
        fn is_banned(&self) -> bool {
            false
        }
        async fn reported_height(&self) -> u64 {
            self.target_height
        }
        async fn average_latency_millis(&self) -> Option<f64> {
            Some(10.0)
        }
        async fn average_bandwidth_bytes_per_sec(&self) -> u64 {
            10 * 1024 * 1024
        }
        async fn request_headers(&self, start: u64, end: u64) -> SyncResult<Vec<Header>> {
            Ok((start..end).map(header).collect())
        }
        async fn request_block(&self, height: u64) -> SyncResult<StoreBlock> {
            Ok(StoreBlock {
                height,
                hash: format!("h{height}"),
                header: header(height),
                transactions: Vec::new(),
                raw: Vec::new(),
            })
        }
    }

    fn synchronizer(verify: bool) -> (Arc<Synchronizer>, Arc<FakeBlockchain>) {
        let blockchain = Arc::new(FakeBlockchain { added: TokioMutex::new(Vec::new()) });
        let sync = Arc::new(Synchronizer::new(
            blockchain.clone(),
            Arc::new(FakeMempool),
            Arc::new(NullProgressObserver),
            verify,
        ));
        (sync, blockchain)
    }

    #[tokio::test]
    async fn full_sync_reaches_synced_and_resets_retries() {
        let (sync, blockchain) = synchronizer(false);
        let peer: Arc<dyn SyncPeer> = Arc::new(FakePeer {
            endpoint: crate::peer::PeerEndpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 8333),
            target_height: 5,
            headers: StdMutex::new(HashMap::new()),
        });

        let result = sync.start_sync(&[peer], 0).await;
        assert!(result.is_ok());
        assert_eq!(sync.state().await, SyncState::Synced);
        assert_eq!(sync.retry_attempts(), 0);
        assert_eq!(blockchain.added.lock().await.len(), 5);
    }

    #[tokio::test]
    async fn start_sync_while_syncing_is_a_no_op() {
        let (sync, _blockchain) = synchronizer(false);
        *sync.state.lock().await = SyncState::Syncing;
        let result = sync.start_sync(&[], 0).await;
        assert!(matches!(result, Err(SyncError::AlreadySyncing)));
        assert_eq!(sync.state().await, SyncState::Syncing);
    }

    #[test]
    fn new_block_classification_by_height_gap() {
        assert_eq!(classify_new_block(101, 100), GossipAction::AddDirect);
        assert_eq!(classify_new_block(105, 100), GossipAction::RestartSync);
        assert_eq!(classify_new_block(99, 100), GossipAction::Orphan);
    }

    #[test]
    fn backoff_never_drops_below_linear_baseline() {
        let base = Duration::from_secs(1);
        for attempt in 0..5 {
            let delay = backoff_delay(attempt, base);
            assert!(delay >= base * (attempt + 1));
        }
    }

    #[allow(dead_code)]
    fn _unused_attrs(_: NodeAttributes) {}
}
