//! The connection state machine: handshake, framed messaging, request
//! correlation, rate limiting, ban scoring.
//!
//! Grounded heavily on `peer_list::peer::Peer` (atomics for hot counters,
//! a `Mutex`-guarded compound state, an `mpsc` writer channel, a
//! `broadcast` exit channel) and `tracker::request::Request` (response
//! correlation via a one-shot broadcast channel, `notify` consuming
//! `self`). The request-timeout/discard-late-response behavior mirrors
//! `Peer::request_blocking_object`'s `select!` over the exit channel and a
//! `tokio::time::timeout`.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::RngCore;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::time::timeout;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::config::{
    BAN_SCORE_HANDLER_EXCEPTION, BAN_SCORE_INVALID_BLOCK, BAN_SCORE_INVALID_INVENTORY,
    BAN_SCORE_INVALID_TX, BAN_SCORE_RATE_LIMIT, BAN_SCORE_VERIFICATION_FAILURE,
    DEFAULT_BAN_TIME_SECS, MAX_UNSOLICITED_PER_SECOND, PEER_DEFAULT_REQUEST_TIMEOUT_MILLIS,
    PEER_HANDSHAKE_TIMEOUT_MILLIS, PEER_LATENCY_SAMPLES, PEER_LATENCY_WINDOW_SECS,
    PEER_MIN_PING_INTERVAL_SECS, PEER_PACKET_CHANNEL_SIZE,
};
use crate::peer::ban::BanStore;
use crate::peer::connection::{Connection, ConnectionError};
use crate::peer::endpoint::PeerEndpoint;
use crate::peer::message::{MessageError, MessageType, NodeInfoData, Payload, PeerMessage, VoteRecord};
use crate::peer::rate_limiter::RateLimiter;
use crate::store::KvStore;
use crate::time::{current_time_in_millis, current_time_in_seconds};

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("session is not ready")]
    NotReady,
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("unexpected message during handshake")]
    UnexpectedHandshakeMessage,
    #[error("request timed out")]
    RequestTimeout,
    #[error("peer disconnected")]
    Disconnected,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    CircuitBreaker(#[from] CircuitBreakerError),
}

pub type PeerResult<T> = Result<T, PeerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Normal = 1000,
    HandshakeTimeout = 1002,
    PolicyViolation = 1008,
}

/// Connection lifecycle. Any state may transition to `Banned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Connected,
    Ready,
    Syncing,
    Banned,
}

/// Read/write background task lifecycle, tracked separately from
/// `PeerState` so a session can report "my writer task died" independent
/// of protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Inactive,
    Active,
    Exiting,
    Finished,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    pub version: u32,
    pub services: u64,
    pub start_height: u64,
    pub user_agent: String,
}

/// Ring buffer of RTT samples capped at N within a time window.
struct LatencyRing {
    samples: VecDeque<(u64, u64)>,
    capacity: usize,
    window_secs: u64,
}

impl LatencyRing {
    fn new(capacity: usize, window_secs: u64) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            window_secs,
        }
    }

    fn push(&mut self, rtt_millis: u64) {
        let now = current_time_in_millis() / 1000;
        self.samples.push_back((now, rtt_millis));
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
        let window_start = now.saturating_sub(self.window_secs);
        while matches!(self.samples.front(), Some((ts, _)) if *ts < window_start) {
            self.samples.pop_front();
        }
    }

    fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: u64 = self.samples.iter().map(|(_, rtt)| rtt).sum();
        Some(sum as f64 / self.samples.len() as f64)
    }
}

/// Handler the coordinator implements to receive session events. Sessions
/// hold only this channel-shaped dependency, never a pointer back to the
/// coordinator itself, to avoid a reference cycle.
#[async_trait]
pub trait SessionEventHandler: Send + Sync {
    async fn on_message(&self, from: PeerEndpoint, message: PeerMessage);
    async fn on_unknown(&self, from: PeerEndpoint);
    async fn on_disconnected(&self, from: PeerEndpoint, code: CloseCode);
}

type PendingRequests = Mutex<HashMap<[u8; 32], oneshot::Sender<PeerMessage>>>;

pub struct PeerSession {
    pub endpoint: PeerEndpoint,
    connection: Arc<Connection>,
    state: Mutex<PeerState>,
    handshake: Mutex<Option<HandshakeInfo>>,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    rate_limiter: RateLimiter,
    pending_requests: PendingRequests,
    latency: Mutex<LatencyRing>,
    last_ping_nonce: AtomicU64,
    last_ping_sent_millis: AtomicU64,
    unsolicited_count: AtomicU32,
    unsolicited_window_start: AtomicU64,
    ban_store: Arc<BanStore>,
    kv_store: Arc<dyn KvStore>,
    breaker: Arc<CircuitBreaker>,
    exit_channel: broadcast::Sender<()>,
    write_tx: mpsc::Sender<Bytes>,
    read_task: Mutex<TaskState>,
    write_task: Mutex<TaskState>,
    handler: Arc<dyn SessionEventHandler>,
}

impl fmt::Display for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peer[{}]", self.endpoint)
    }
}

impl PeerSession {
    pub fn new(
        connection: Connection,
        endpoint: PeerEndpoint,
        ban_store: Arc<BanStore>,
        kv_store: Arc<dyn KvStore>,
        breaker: Arc<CircuitBreaker>,
        handler: Arc<dyn SessionEventHandler>,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (exit_channel, _) = broadcast::channel(1);
        let (write_tx, write_rx) = mpsc::channel(PEER_PACKET_CHANNEL_SIZE);

        let session = Arc::new(Self {
            endpoint,
            connection: Arc::new(connection),
            state: Mutex::new(PeerState::Connecting),
            handshake: Mutex::new(None),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            rate_limiter: RateLimiter::with_defaults(),
            pending_requests: Mutex::new(HashMap::new()),
            latency: Mutex::new(LatencyRing::new(PEER_LATENCY_SAMPLES, PEER_LATENCY_WINDOW_SECS)),
            last_ping_nonce: AtomicU64::new(0),
            last_ping_sent_millis: AtomicU64::new(0),
            unsolicited_count: AtomicU32::new(0),
            unsolicited_window_start: AtomicU64::new(0),
            ban_store,
            kv_store,
            breaker,
            exit_channel,
            write_tx,
            read_task: Mutex::new(TaskState::Inactive),
            write_task: Mutex::new(TaskState::Inactive),
            handler,
        });

        (session, write_rx)
    }

    pub async fn state(&self) -> PeerState {
        *self.state.lock().await
    }

    async fn set_state(&self, new_state: PeerState) {
        *self.state.lock().await = new_state;
    }

    pub fn subscribe_exit(&self) -> broadcast::Receiver<()> {
        self.exit_channel.subscribe()
    }

    pub async fn handshake_info(&self) -> Option<HandshakeInfo> {
        self.handshake.lock().await.clone()
    }

    pub async fn average_latency_millis(&self) -> Option<f64> {
        self.latency.lock().await.average()
    }

    /// The writer task: drains `write_rx` and forwards frames to the
    /// connection, preserving submission order for this session.
    pub async fn run_writer(self: Arc<Self>, mut write_rx: mpsc::Receiver<Bytes>) {
        *self.write_task.lock().await = TaskState::Active;
        while let Some(bytes) = write_rx.recv().await {
            if let Err(e) = self.connection.send_bytes(&bytes).await {
                log::warn!("{self} writer task error: {e}");
                break;
            }
        }
        *self.write_task.lock().await = TaskState::Finished;
    }

    /// Performs the VERSION/VERACK handshake with a watchdog. On timeout,
    /// closes the connection with code 1002 before returning the error.
    pub async fn perform_handshake(
        self: &Arc<Self>,
        local: HandshakeInfo,
        local_timestamp: u64,
    ) -> PeerResult<()> {
        let watchdog = Duration::from_millis(PEER_HANDSHAKE_TIMEOUT_MILLIS);

        let version_msg = PeerMessage::new(
            MessageType::Version,
            Payload::Version {
                version: local.version,
                services: local.services,
                timestamp: local_timestamp,
                start_height: local.start_height,
                user_agent: local.user_agent.clone(),
            },
        )?
        .with_checksum()?;
        self.write_raw(&version_msg).await?;

        let remote_version = match timeout(watchdog, self.read_one()).await {
            Ok(Ok(msg)) => msg,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                self.close(CloseCode::HandshakeTimeout).await;
                return Err(PeerError::HandshakeTimeout);
            }
        };

        let Payload::Version {
            version,
            services,
            start_height,
            user_agent,
            ..
        } = remote_version.payload
        else {
            self.close(CloseCode::HandshakeTimeout).await;
            return Err(PeerError::UnexpectedHandshakeMessage);
        };

        *self.handshake.lock().await = Some(HandshakeInfo {
            version,
            services,
            start_height,
            user_agent,
        });

        let verack_msg = PeerMessage::new(MessageType::Verack, Payload::Verack)?.with_checksum()?;
        self.write_raw(&verack_msg).await?;

        let remote_verack = match timeout(watchdog, self.read_one()).await {
            Ok(Ok(msg)) => msg,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                self.close(CloseCode::HandshakeTimeout).await;
                return Err(PeerError::HandshakeTimeout);
            }
        };

        if remote_verack.message_type != MessageType::Verack {
            self.close(CloseCode::HandshakeTimeout).await;
            return Err(PeerError::UnexpectedHandshakeMessage);
        }

        self.set_state(PeerState::Ready).await;
        Ok(())
    }

    async fn read_one(&self) -> PeerResult<PeerMessage> {
        let bytes = self.connection.recv_bytes().await?;
        let msg = PeerMessage::decode(&bytes)?;
        msg.verify_checksum()?;
        Ok(msg)
    }

    async fn write_raw(&self, msg: &PeerMessage) -> PeerResult<()> {
        let encoded = msg.encode()?;
        self.bytes_sent.fetch_add(encoded.len() as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.write_tx
            .send(Bytes::from(encoded))
            .await
            .map_err(|_| PeerError::Disconnected)
    }

    fn is_messaging_allowed(state: PeerState) -> bool {
        matches!(state, PeerState::Ready | PeerState::Syncing)
    }

    /// `send(type, payload)`: fails if not ready. Wrapped in the
    /// per-session circuit breaker; attaches a payload checksum.
    pub async fn send(&self, message_type: MessageType, payload: Payload) -> PeerResult<()> {
        if !Self::is_messaging_allowed(self.state().await) {
            return Err(PeerError::NotReady);
        }

        let msg = PeerMessage::new(message_type, payload)?.with_checksum()?;
        let breaker_result = self
            .breaker
            .run(|| async {
                self.write_raw(&msg).await.map_err(anyhow::Error::from)
            })
            .await;

        breaker_result.map_err(PeerError::CircuitBreaker)
    }

    /// `request(type, payload, timeout)`: registers a pending continuation
    /// keyed by a fresh 32-byte request id, sends, and races the response
    /// against the timeout and the session's exit channel.
    pub async fn request(
        &self,
        message_type: MessageType,
        payload: Payload,
        request_timeout: Duration,
    ) -> PeerResult<PeerMessage> {
        if !Self::is_messaging_allowed(self.state().await) {
            return Err(PeerError::NotReady);
        }

        let mut request_id = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut request_id);

        let (tx, rx) = oneshot::channel();
        self.pending_requests.lock().await.insert(request_id, tx);

        let msg = PeerMessage::new(message_type, payload)?
            .with_request_id(request_id)
            .with_checksum()?;

        if let Err(e) = self.write_raw(&msg).await {
            self.pending_requests.lock().await.remove(&request_id);
            return Err(e);
        }

        let mut exit_rx = self.subscribe_exit();
        tokio::select! {
            _ = exit_rx.recv() => {
                self.pending_requests.lock().await.remove(&request_id);
                Err(PeerError::Disconnected)
            }
            result = timeout(request_timeout, rx) => {
                match result {
                    Ok(Ok(msg)) => Ok(msg),
                    Ok(Err(_)) => {
                        self.pending_requests.lock().await.remove(&request_id);
                        Err(PeerError::Disconnected)
                    }
                    Err(_) => {
                        self.pending_requests.lock().await.remove(&request_id);
                        Err(PeerError::RequestTimeout)
                    }
                }
            }
        }
    }

    /// Convenience wrapper using the configured default request timeout.
    pub async fn request_default_timeout(
        &self,
        message_type: MessageType,
        payload: Payload,
    ) -> PeerResult<PeerMessage> {
        self.request(
            message_type,
            payload,
            Duration::from_millis(PEER_DEFAULT_REQUEST_TIMEOUT_MILLIS),
        )
        .await
    }

    /// Reader loop: parses, rate-limits, and dispatches incoming frames
    /// until the connection errors or the exit channel fires.
    pub async fn run_reader(self: Arc<Self>) {
        *self.read_task.lock().await = TaskState::Active;
        let mut exit_rx = self.subscribe_exit();

        loop {
            let recv_fut = self.connection.recv_bytes();
            let bytes = tokio::select! {
                _ = exit_rx.recv() => break,
                result = recv_fut => result,
            };

            let bytes = match bytes {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::debug!("{self} connection closed: {e}");
                    break;
                }
            };

            self.messages_received.fetch_add(1, Ordering::Relaxed);
            self.bytes_received.fetch_add(bytes.len() as u64, Ordering::Relaxed);

            if !self.rate_limiter.try_acquire(bytes.len()) {
                self.apply_penalty(BAN_SCORE_RATE_LIMIT, "rate limit exceeded").await;
                continue;
            }

            let msg = match PeerMessage::decode(&bytes) {
                Ok(msg) => msg,
                Err(_) => {
                    self.handler.on_unknown(self.endpoint).await;
                    continue;
                }
            };

            if msg.verify_checksum().is_err() {
                self.handler.on_unknown(self.endpoint).await;
                continue;
            }

            self.dispatch(msg).await;
        }

        self.close(CloseCode::Normal).await;
        *self.read_task.lock().await = TaskState::Finished;
    }

    async fn dispatch(self: &Arc<Self>, msg: PeerMessage) {
        if let Some(request_id) = msg.request_id {
            if let Some(tx) = self.pending_requests.lock().await.remove(&request_id) {
                let _ = tx.send(msg);
                return;
            }
        }

        match msg.message_type {
            MessageType::Ping => {
                if let Payload::Ping { nonce, timestamp: _ } = &msg.payload {
                    let _ = self
                        .send(
                            MessageType::Pong,
                            Payload::Pong {
                                nonce: *nonce,
                                timestamp: current_time_in_millis(),
                            },
                        )
                        .await;
                }
            }
            MessageType::Pong => {
                if let Payload::Pong { nonce, .. } = &msg.payload {
                    if *nonce == self.last_ping_nonce.load(Ordering::Relaxed) {
                        let sent_at = self.last_ping_sent_millis.load(Ordering::Relaxed);
                        let rtt = current_time_in_millis().saturating_sub(sent_at);
                        self.latency.lock().await.push(rtt);
                    }
                }
            }
            MessageType::Block | MessageType::NewBlock => {
                if !self.check_unsolicited_rate() {
                    self.apply_penalty(BAN_SCORE_INVALID_BLOCK, "unsolicited block flood").await;
                    return;
                }
                self.handler.on_message(self.endpoint, msg).await;
            }
            _ => {
                self.handler.on_message(self.endpoint, msg).await;
            }
        }
    }

    /// 1-second sliding window guard against unsolicited push-style
    /// messages, independent of the general rate limiter.
    fn check_unsolicited_rate(&self) -> bool {
        let now_secs = current_time_in_millis() / 1000;
        let window_start = self.unsolicited_window_start.load(Ordering::Relaxed);
        if now_secs != window_start {
            self.unsolicited_window_start.store(now_secs, Ordering::Relaxed);
            self.unsolicited_count.store(0, Ordering::Relaxed);
        }
        let count = self.unsolicited_count.fetch_add(1, Ordering::Relaxed) + 1;
        count <= MAX_UNSOLICITED_PER_SECOND
    }

    /// Sends a PING if `min_ping_interval` has elapsed since the last one.
    /// Intended to be driven by a periodic caller's ping-interval timer,
    /// scheduled outside the session itself.
    pub async fn maybe_ping(&self) {
        let interval_millis = PEER_MIN_PING_INTERVAL_SECS * 1000;
        let now = current_time_in_millis();
        let last = self.last_ping_sent_millis.load(Ordering::Relaxed);
        if now.saturating_sub(last) < interval_millis {
            return;
        }

        let nonce = rand::thread_rng().next_u64();
        self.last_ping_nonce.store(nonce, Ordering::Relaxed);
        self.last_ping_sent_millis.store(now, Ordering::Relaxed);

        let _ = self
            .send(MessageType::Ping, Payload::Ping { nonce, timestamp: now })
            .await;
    }

    /// Applies a ban-score penalty for the listed infraction and, if the
    /// threshold is crossed, closes with 1008 and persists the ban.
    pub async fn apply_penalty(&self, penalty: u32, reason: &str) {
        let (_, crossed) = self.ban_store.add_score(self.endpoint, penalty);
        if crossed {
            if let Err(e) = self
                .ban_store
                .ban(self.kv_store.as_ref(), self.endpoint, reason, DEFAULT_BAN_TIME_SECS)
                .await
            {
                log::warn!("{self} failed to persist ban: {e}");
            }
            self.set_state(PeerState::Banned).await;
            self.close(CloseCode::PolicyViolation).await;
        }
    }

    pub async fn record_invalid_inventory(&self) {
        self.apply_penalty(BAN_SCORE_INVALID_INVENTORY, "invalid inventory item").await;
    }

    pub async fn record_invalid_tx(&self) {
        self.apply_penalty(BAN_SCORE_INVALID_TX, "malformed or stale transaction").await;
    }

    pub async fn record_verification_failure(&self) {
        self.apply_penalty(BAN_SCORE_VERIFICATION_FAILURE, "node verification failed").await;
    }

    pub async fn record_handler_exception(&self) {
        self.apply_penalty(BAN_SCORE_HANDLER_EXCEPTION, "message handler exception").await;
    }

    /// Key under which a per-peer metric is cached: `peer:<endpoint>:<metric>`.
    /// Endpoint is this crate's normalized stable key (see `DESIGN.md`),
    /// used in place of the source's separate peer-id scheme.
    fn peer_key(&self, metric: &str) -> String {
        format!("peer:{}:{}", self.endpoint, metric)
    }

    /// Queries `GET_NODE_INFO` on demand, caching `height`/`minedBlocks`/
    /// `balance`/the full record under `peer:<endpoint>:<metric>`. A
    /// request failure falls back to the last cached value.
    pub async fn node_info(&self) -> PeerResult<NodeInfoData> {
        match self
            .request_default_timeout(MessageType::GetNodeInfo, Payload::GetNodeInfo { info: None })
            .await
        {
            Ok(PeerMessage {
                payload: Payload::GetNodeInfo { info: Some(info) },
                ..
            }) => {
                self.cache_node_info(&info).await;
                Ok(info)
            }
            _ => self.cached_node_info().await.ok_or(PeerError::RequestTimeout),
        }
    }

    async fn cache_node_info(&self, info: &NodeInfoData) {
        let scalars = [
            (self.peer_key("height"), info.height.to_string()),
            (self.peer_key("minedBlocks"), info.mined_blocks.to_string()),
            (self.peer_key("balance"), info.balance.to_string()),
        ];
        for (key, value) in scalars {
            if let Err(e) = self.kv_store.put(&key, value.as_bytes()).await {
                log::warn!("{self} failed to cache {key}: {e}");
            }
        }
        if let Ok(encoded) = serde_json::to_vec(info) {
            if let Err(e) = self.kv_store.put(&self.peer_key("info"), &encoded).await {
                log::warn!("{self} failed to cache node info: {e}");
            }
        }
    }

    async fn cached_node_info(&self) -> Option<NodeInfoData> {
        let bytes = self.kv_store.get(&self.peer_key("info")).await.ok().flatten()?;
        serde_json::from_slice(&bytes).ok()
    }

    async fn cached_scalar(&self, metric: &str) -> Option<u64> {
        let bytes = self.kv_store.get(&self.peer_key(metric)).await.ok().flatten()?;
        std::str::from_utf8(&bytes).ok()?.parse().ok()
    }

    /// `peer:<endpoint>:minedBlocks`, falling back to the last cached value.
    pub async fn mined_blocks(&self) -> Option<u64> {
        self.cached_scalar("minedBlocks").await
    }

    /// `peer:<endpoint>:balance`, falling back to the last cached value.
    pub async fn balance(&self) -> Option<u64> {
        self.cached_scalar("balance").await
    }

    /// Voting power isn't given its own persisted key in §6; it rides
    /// along inside the cached `peer:<endpoint>:info` record.
    pub async fn voting_power(&self) -> Option<u64> {
        self.cached_node_info().await.map(|info| info.voting_power)
    }

    /// Requests `GET_VOTES` since 24 hours ago, persists each returned
    /// vote under `peer:<endpoint>:vote:<timestamp>`, then returns the
    /// full 24h window via a range scan, so a request failure still
    /// surfaces whatever was already recorded.
    pub async fn votes_last_24h(&self) -> PeerResult<Vec<VoteRecord>> {
        let since = current_time_in_seconds().saturating_sub(24 * 3600);

        if let Ok(PeerMessage {
            payload: Payload::GetVotes { votes: Some(votes), .. },
            ..
        }) = self
            .request_default_timeout(
                MessageType::GetVotes,
                Payload::GetVotes {
                    since_timestamp: since,
                    votes: None,
                },
            )
            .await
        {
            for vote in &votes {
                let key = self.peer_key(&format!("vote:{}", vote.timestamp));
                if let Ok(encoded) = serde_json::to_vec(vote) {
                    if let Err(e) = self.kv_store.put(&key, &encoded).await {
                        log::warn!("{self} failed to persist vote: {e}");
                    }
                }
            }
        }

        let start = self.peer_key("vote:");
        let end = self.peer_key("vote:\u{10FFFF}");
        let rows = self
            .kv_store
            .scan_range(&start, &end)
            .await
            .map_err(|_| PeerError::Disconnected)?;
        Ok(rows
            .into_iter()
            .filter_map(|(_, bytes)| serde_json::from_slice::<VoteRecord>(&bytes).ok())
            .filter(|vote| vote.timestamp >= since)
            .collect())
    }

    /// Closes the session: fails all pending requests, fires the exit
    /// channel, and notifies the handler.
    pub async fn close(&self, code: CloseCode) {
        let mut state = self.state.lock().await;
        if *state == PeerState::Disconnected {
            return;
        }
        if *state != PeerState::Banned {
            *state = PeerState::Disconnected;
        }
        drop(state);

        let mut pending = self.pending_requests.lock().await;
        pending.clear();
        drop(pending);

        let _ = self.exit_channel.send(());
        let _ = self.connection.shutdown().await;
        self.handler.on_disconnected(self.endpoint, code).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;
    use std::sync::Mutex as StdMutex;

    use tokio::net::{TcpListener, TcpStream};

    use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};

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

    struct NoopHandler;

    #[async_trait]
    impl SessionEventHandler for NoopHandler {
        async fn on_message(&self, _from: PeerEndpoint, _message: PeerMessage) {}
        async fn on_unknown(&self, _from: PeerEndpoint) {}
        async fn on_disconnected(&self, _from: PeerEndpoint, _code: CloseCode) {}
    }

    async fn test_session() -> Arc<PeerSession> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) =
            tokio::join!(TcpStream::connect(addr), async { listener.accept().await.unwrap() });
        drop(accepted);
        let connection = Connection::new(client.unwrap(), addr, true);

        let endpoint = PeerEndpoint::new(Ipv4Addr::new(10, 0, 0, 1).into(), 8333);
        let ban_store = Arc::new(BanStore::new(Default::default(), Default::default()));
        let kv_store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let breaker = Arc::new(CircuitBreaker::new("test", CircuitBreakerConfig::default()));
        let handler: Arc<dyn SessionEventHandler> = Arc::new(NoopHandler);

        let (session, _write_rx) = PeerSession::new(connection, endpoint, ban_store, kv_store, breaker, handler);
        session
    }

    #[tokio::test]
    async fn node_info_caches_scalars_and_falls_back_on_miss() {
        let session = test_session().await;
        assert!(session.mined_blocks().await.is_none());

        let info = NodeInfoData {
            version: 1,
            mined_blocks: 42,
            balance: 1_000,
            voting_power: 7,
            height: 99,
        };
        session.cache_node_info(&info).await;

        assert_eq!(session.mined_blocks().await, Some(42));
        assert_eq!(session.balance().await, Some(1_000));
        assert_eq!(session.voting_power().await, Some(7));
        assert_eq!(session.cached_scalar("height").await, Some(99));
    }

    #[tokio::test]
    async fn votes_last_24h_filters_out_stale_entries() {
        let session = test_session().await;
        let now = current_time_in_seconds();

        let fresh = VoteRecord {
            timestamp: now,
            data: "yes".into(),
        };
        let stale = VoteRecord {
            timestamp: now.saturating_sub(2 * 24 * 3600),
            data: "stale".into(),
        };
        for vote in [&fresh, &stale] {
            let key = session.peer_key(&format!("vote:{}", vote.timestamp));
            let encoded = serde_json::to_vec(vote).unwrap();
            session.kv_store.put(&key, &encoded).await.unwrap();
        }

        let votes = session.votes_last_24h().await.unwrap();
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].data, "yes");
    }

    #[test]
    fn latency_ring_caps_at_sample_count() {
        let mut ring = LatencyRing::new(3, 60);
        for i in 0..5 {
            ring.push(i * 10);
        }
        assert_eq!(ring.samples.len(), 3);
    }

    #[test]
    fn latency_average_is_correct() {
        let mut ring = LatencyRing::new(10, 60);
        ring.push(100);
        ring.push(200);
        assert_eq!(ring.average(), Some(150.0));
    }

    #[test]
    fn messaging_disallowed_outside_ready_or_syncing() {
        assert!(!PeerSession::is_messaging_allowed(PeerState::Connecting));
        assert!(!PeerSession::is_messaging_allowed(PeerState::Disconnected));
        assert!(PeerSession::is_messaging_allowed(PeerState::Ready));
        assert!(PeerSession::is_messaging_allowed(PeerState::Syncing));
    }
}
