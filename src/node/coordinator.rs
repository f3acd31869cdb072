//! Owns the peer table, bans, orphan pool, circuit breakers, and the
//! maintenance timer; implements [`SessionEventHandler`] to receive
//! session events without the sessions holding a pointer back.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::Mutex as TokioMutex;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::config::{DEFAULT_MAX_ORPHANS, DEFAULT_PRUNE_INTERVAL_SECS, ORPHAN_MAX_AGE_SECS, PEER_CONNECTION_TIMEOUT_SECS, RAW_TX_BROADCAST_QUORUM};
use crate::error::{NodeError, NodeResult};
use crate::peer::{
    BanStore, CloseCode, Connection, HandshakeInfo, InventoryItem, InventoryKind, MessageType,
    Payload, PeerEndpoint, PeerMessage, PeerSession, SessionEventHandler,
};
use crate::store::{Block, BlockchainClient, KvStore, MempoolClient, NodeAttributes, NodeVerifier};
use crate::sync::{classify_new_block, GossipAction};
use crate::time::current_time_in_seconds;

use super::orphan::OrphanPool;
use super::peer_state::{PeerState, PeerStateCache};

/// Owns every cross-peer concern: the peer table itself, per-endpoint
/// circuit breakers, the orphan pool, and the maintenance/broadcast
/// entry points. Peer sessions hold only a `Arc<dyn SessionEventHandler>`
/// pointing back here, never the reverse, to avoid a reference cycle.
pub struct NodeCoordinator {
    peers: DashMap<PeerEndpoint, Arc<PeerSession>>,
    breakers: DashMap<PeerEndpoint, Arc<CircuitBreaker>>,
    ban_store: Arc<BanStore>,
    kv_store: Arc<dyn KvStore>,
    blockchain: Arc<dyn BlockchainClient>,
    mempool: Arc<dyn MempoolClient>,
    verifier: Arc<dyn NodeVerifier>,
    peer_states: PeerStateCache,
    orphans: TokioMutex<OrphanPool>,
    global_lock: TokioMutex<()>,
}

impl NodeCoordinator {
    pub fn new(
        ban_store: Arc<BanStore>,
        kv_store: Arc<dyn KvStore>,
        blockchain: Arc<dyn BlockchainClient>,
        mempool: Arc<dyn MempoolClient>,
        verifier: Arc<dyn NodeVerifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            peers: DashMap::new(),
            breakers: DashMap::new(),
            ban_store,
            kv_store,
            blockchain,
            mempool,
            verifier,
            peer_states: PeerStateCache::with_defaults(),
            orphans: TokioMutex::new(OrphanPool::new(DEFAULT_MAX_ORPHANS, ORPHAN_MAX_AGE_SECS)),
            global_lock: TokioMutex::new(()),
        })
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_states(&self) -> Vec<PeerState> {
        self.peer_states.snapshot()
    }

    pub fn session(&self, endpoint: &PeerEndpoint) -> Option<Arc<PeerSession>> {
        self.peers.get(endpoint).map(|entry| entry.value().clone())
    }

    fn breaker_for(&self, endpoint: PeerEndpoint) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(endpoint)
            .or_insert_with(|| Arc::new(CircuitBreaker::new(endpoint.to_string(), CircuitBreakerConfig::default())))
            .clone()
    }

    /// Per-endpoint connect flow: skips already-connected or banned
    /// endpoints, drives the handshake, then runs external node
    /// verification over `attrs`. `attrs` is supplied by the caller rather
    /// than parsed off the wire: the VERSION/VERACK handshake carries no
    /// public key or signature, those being the external identity
    /// collaborator's concern, so a transport-level (e.g. TLS peer
    /// certificate) or side-channel source is expected to produce them
    /// ahead of this call.
    pub async fn connect(
        self: &Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        outgoing: bool,
        local_handshake: HandshakeInfo,
        attrs: NodeAttributes,
    ) -> NodeResult<Arc<PeerSession>> {
        let endpoint = PeerEndpoint::from(addr);
        let _global = self.global_lock.lock().await;

        if self.ban_store.is_blacklisted(&endpoint) {
            return Err(NodeError::VerificationFailed {
                endpoint: endpoint.to_string(),
                reason: "blacklisted".to_string(),
            });
        }
        if self.peers.contains_key(&endpoint) {
            return Err(NodeError::Store(format!("{endpoint} is already connected")));
        }
        let already_banned = self
            .ban_store
            .check_ban_status(self.kv_store.as_ref(), &endpoint)
            .await
            .map_err(|e| NodeError::Store(e.to_string()))?;
        if already_banned {
            return Err(NodeError::VerificationFailed {
                endpoint: endpoint.to_string(),
                reason: "banned".to_string(),
            });
        }

        let breaker = self.breaker_for(endpoint);
        let connection = Connection::new(stream, addr, outgoing);
        let (session, write_rx) = PeerSession::new(
            connection,
            endpoint,
            self.ban_store.clone(),
            self.kv_store.clone(),
            breaker.clone(),
            self.clone() as Arc<dyn SessionEventHandler>,
        );

        tokio::spawn(Arc::clone(&session).run_writer(write_rx));
        tokio::spawn(Arc::clone(&session).run_reader());

        if let Err(e) = session.perform_handshake(local_handshake, current_time_in_seconds()).await {
            breaker.on_failure();
            session.close(CloseCode::PolicyViolation).await;
            return Err(NodeError::P2p(e.into()));
        }

        if let Err(e) = self.verifier.verify(&attrs).await {
            session.record_verification_failure().await;
            breaker.on_failure();
            session.close(CloseCode::PolicyViolation).await;
            return Err(NodeError::VerificationFailed {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            });
        }

        self.peers.insert(endpoint, session.clone());
        self.peer_states.put(PeerState::new(endpoint));
        breaker.on_success();

        if log::log_enabled!(log::Level::Info) {
            log::info!("peer:connect {endpoint}");
        }

        Ok(session)
    }

    /// On INV, requests GETDATA for every item not already known locally.
    async fn handle_inv(&self, from: PeerEndpoint, items: Vec<InventoryItem>) {
        let Some(session) = self.session(&from) else { return };
        let mut missing = Vec::new();
        for item in items {
            let known = match item.kind {
                InventoryKind::Block => self.blockchain.has_object(&item.hash).await,
                InventoryKind::Tx => self.mempool.contains(&item.hash).await,
            };
            if !known {
                missing.push(item);
            }
        }
        if !missing.is_empty() {
            let _ = session.send(MessageType::GetData, Payload::GetData { items: missing }).await;
        }
    }

    /// On GETDATA, serves each item from the local store if available,
    /// otherwise reports it in a single NOTFOUND.
    async fn handle_get_data(&self, from: PeerEndpoint, items: Vec<InventoryItem>) {
        let Some(session) = self.session(&from) else { return };
        let mut not_found = Vec::new();

        for item in items {
            match item.kind {
                InventoryKind::Block => match self.blockchain.block_by_hash(&item.hash).await {
                    Some(block) => match bincode::serialize(&block) {
                        Ok(raw) => {
                            let _ = session
                                .send(MessageType::Block, Payload::Block { height: block.height, raw })
                                .await;
                        }
                        Err(_) => not_found.push(item),
                    },
                    None => not_found.push(item),
                },
                InventoryKind::Tx => match self.mempool.raw_tx(&item.hash).await {
                    Some(raw) => {
                        let _ = session.send(MessageType::Tx, Payload::Tx { raw }).await;
                    }
                    None => not_found.push(item),
                },
            }
        }

        if !not_found.is_empty() {
            let _ = session.send(MessageType::NotFound, Payload::NotFound { items: not_found }).await;
        }
    }

    /// New-block gossip while synced: one ahead of local tip adds directly
    /// and drains any orphans now reachable; a larger gap just logs (the
    /// periodic sync checker picks it up); otherwise it's held as an orphan.
    async fn handle_new_block_gossip(&self, from: PeerEndpoint, height: u64, raw: Vec<u8>) {
        let local_tip = self.blockchain.local_height().await;
        match classify_new_block(height, local_tip) {
            GossipAction::AddDirect => match bincode::deserialize::<Block>(&raw) {
                Ok(block) => {
                    let hash = block.hash.clone();
                    if let Err(e) = self.blockchain.add_block(&block).await {
                        log::warn!("rejected directly-gossiped block at height {height} from {from}: {e}");
                    } else {
                        self.drain_orphans(&hash).await;
                    }
                }
                Err(e) => log::warn!("malformed NEW_BLOCK payload from {from}: {e}"),
            },
            GossipAction::RestartSync => {
                log::info!("{from} reports height {height}, local tip {local_tip} is more than one behind");
            }
            GossipAction::Orphan => {
                if let Ok(block) = bincode::deserialize::<Block>(&raw) {
                    let parent_hash = block.header.previous_hash.clone();
                    let hash = block.hash.clone();
                    self.orphans.lock().await.insert(parent_hash, hash, block);
                }
            }
        }
    }

    async fn drain_orphans(&self, parent_hash: &str) {
        let drained = self.orphans.lock().await.drain_descendants(parent_hash);
        for orphan in drained {
            if let Err(e) = self.blockchain.add_block(&orphan.block).await {
                log::warn!("failed to apply drained orphan {}: {e}", orphan.hash);
                break;
            }
        }
    }

    /// Fans `message_type`/`payload` out to every connected peer, best
    /// effort.
    async fn broadcast_to_all(&self, message_type: MessageType, payload: Payload) {
        let sessions: Vec<Arc<PeerSession>> = self.peers.iter().map(|entry| entry.value().clone()).collect();
        for session in sessions {
            let _ = session.send(message_type, payload.clone()).await;
        }
    }

    pub async fn broadcast_block(&self, block: &Block) -> NodeResult<()> {
        let raw = bincode::serialize(block).map_err(|e| NodeError::Store(e.to_string()))?;
        self.broadcast_to_all(MessageType::NewBlock, Payload::NewBlock { height: block.height, raw }).await;
        Ok(())
    }

    /// Raw-transaction broadcast additionally requires `ceil(N·0.51)`
    /// sessions (or 1 if only one peer) to accept, otherwise fails.
    pub async fn broadcast_raw_tx(&self, raw: Vec<u8>) -> NodeResult<()> {
        let _global = self.global_lock.lock().await;
        let sessions: Vec<Arc<PeerSession>> = self.peers.iter().map(|entry| entry.value().clone()).collect();
        if sessions.is_empty() {
            return Err(NodeError::NoBootstrapPeers);
        }

        let required = ((sessions.len() as f64) * RAW_TX_BROADCAST_QUORUM).ceil() as usize;
        let required = required.max(1);

        let mut successes = 0;
        for session in &sessions {
            if session
                .send(MessageType::NewTransaction, Payload::NewTransaction { raw: raw.clone() })
                .await
                .is_ok()
            {
                successes += 1;
            }
        }

        if successes >= required {
            Ok(())
        } else {
            Err(NodeError::Store(format!(
                "raw tx broadcast reached {successes}/{required} required sessions"
            )))
        }
    }

    /// Drives the periodic maintenance pass: evicts stale peer states,
    /// prunes expired orphans. Intended to be spawned once per node, on a
    /// `tokio::time::interval(pruneInterval)` tick.
    pub async fn run_maintenance_loop(self: Arc<Self>, prune_interval: Duration) {
        let mut ticker = tokio::time::interval(prune_interval);
        loop {
            ticker.tick().await;
            self.run_maintenance_once().await;
        }
    }

    pub fn default_prune_interval() -> Duration {
        Duration::from_secs(DEFAULT_PRUNE_INTERVAL_SECS)
    }

    async fn run_maintenance_once(&self) {
        let _global = self.global_lock.lock().await;
        let now = current_time_in_seconds();
        let evicted = self.peer_states.evict_stale(now, 2 * PEER_CONNECTION_TIMEOUT_SECS);
        let pruned = self.orphans.lock().await.prune_expired();
        if log::log_enabled!(log::Level::Debug) && (evicted > 0 || pruned > 0) {
            log::debug!("maintenance: evicted {evicted} stale peer states, pruned {pruned} orphans");
        }
    }
}

#[async_trait]
impl SessionEventHandler for NodeCoordinator {
    async fn on_message(&self, from: PeerEndpoint, message: PeerMessage) {
        match message.payload {
            Payload::Inv { items } => self.handle_inv(from, items).await,
            Payload::GetData { items } => self.handle_get_data(from, items).await,
            Payload::NewBlock { height, raw } => self.handle_new_block_gossip(from, height, raw).await,
            _ => {}
        }
    }

    async fn on_unknown(&self, from: PeerEndpoint) {
        log::debug!("unknown/unparseable message from {from}");
    }

    async fn on_disconnected(&self, from: PeerEndpoint, code: CloseCode) {
        self.peers.remove(&from);
        if log::log_enabled!(log::Level::Info) {
            log::info!("peer:disconnect {from} ({code:?})");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;
    use std::sync::Mutex as StdMutex;

    struct InMemoryStore {
        map: StdMutex<BTreeMap<String, Vec<u8>>>,
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

    struct AcceptingBlockchain;
    #[async_trait]
    impl BlockchainClient for AcceptingBlockchain {
        async fn local_height(&self) -> u64 {
            10
        }
        async fn header_at(&self, _height: u64) -> Option<crate::sync::Header> {
            None
        }
        async fn add_block(&self, _block: &Block) -> anyhow::Result<()> {
            Ok(())
        }
        async fn verify_block(&self, _height: u64) -> anyhow::Result<()> {
            Ok(())
        }
        async fn has_object(&self, _hash: &str) -> bool {
            false
        }
        async fn block_by_hash(&self, _hash: &str) -> Option<Block> {
            None
        }
    }

    struct EmptyMempool;
    #[async_trait]
    impl MempoolClient for EmptyMempool {
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

    struct AlwaysVerifies;
    #[async_trait]
    impl NodeVerifier for AlwaysVerifies {
        async fn verify(&self, _attrs: &NodeAttributes) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn coordinator() -> Arc<NodeCoordinator> {
        NodeCoordinator::new(
            Arc::new(BanStore::new(HashSet::new(), HashSet::new())),
            Arc::new(InMemoryStore { map: StdMutex::new(BTreeMap::new()) }),
            Arc::new(AcceptingBlockchain),
            Arc::new(EmptyMempool),
            Arc::new(AlwaysVerifies),
        )
    }

    #[tokio::test]
    async fn broadcast_raw_tx_with_no_peers_fails() {
        let coordinator = coordinator();
        let result = coordinator.broadcast_raw_tx(vec![1, 2, 3]).await;
        assert!(matches!(result, Err(NodeError::NoBootstrapPeers)));
    }

    #[tokio::test]
    async fn new_block_gossip_one_ahead_classifies_add_direct() {
        let coordinator = coordinator();
        let block = Block {
            height: 11,
            hash: "h11".to_string(),
            header: crate::sync::Header {
                height: 11,
                hash: "h11".to_string(),
                previous_hash: "h10".to_string(),
                timestamp: 11,
            },
            transactions: Vec::new(),
            raw: Vec::new(),
        };
        let raw = bincode::serialize(&block).unwrap();
        let endpoint = PeerEndpoint::new(Ipv4Addr::new(10, 0, 0, 1).into(), 8333);
        coordinator.handle_new_block_gossip(endpoint, 11, raw).await;
        assert!(coordinator.orphans.lock().await.is_empty());
    }

    #[tokio::test]
    async fn not_ahead_block_is_held_as_orphan() {
        // Local tip is 10 (`AcceptingBlockchain::local_height`); a block at
        // or below the tip is neither one ahead nor more than one ahead, so
        // `classify_new_block` routes it to `GossipAction::Orphan`.
        let coordinator = coordinator();
        let block = Block {
            height: 9,
            hash: "h9".to_string(),
            header: crate::sync::Header {
                height: 9,
                hash: "h9".to_string(),
                previous_hash: "h8".to_string(),
                timestamp: 9,
            },
            transactions: Vec::new(),
            raw: Vec::new(),
        };
        let raw = bincode::serialize(&block).unwrap();
        let endpoint = PeerEndpoint::new(Ipv4Addr::new(10, 0, 0, 2).into(), 8333);
        coordinator.handle_new_block_gossip(endpoint, 9, raw).await;
        assert_eq!(coordinator.orphans.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn gap_block_restarts_sync_without_orphaning() {
        // A block more than one ahead of the local tip restarts sync
        // instead of being held as an orphan; the orphan pool stays empty.
        let coordinator = coordinator();
        let block = Block {
            height: 20,
            hash: "h20".to_string(),
            header: crate::sync::Header {
                height: 20,
                hash: "h20".to_string(),
                previous_hash: "h19".to_string(),
                timestamp: 20,
            },
            transactions: Vec::new(),
            raw: Vec::new(),
        };
        let raw = bincode::serialize(&block).unwrap();
        let endpoint = PeerEndpoint::new(Ipv4Addr::new(10, 0, 0, 3).into(), 8333);
        coordinator.handle_new_block_gossip(endpoint, 20, raw).await;
        assert!(coordinator.orphans.lock().await.is_empty());
    }
}
