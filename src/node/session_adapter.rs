//! Adapts a connected [`PeerSession`] to the synchronizer's
//! [`SyncPeer`] seam, so `sync::Synchronizer` never depends on the
//! session type directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::PEER_SELECTION_TIMEOUT_SECS;
use crate::peer::{MessageType, Payload, PeerEndpoint, PeerSession};
use crate::store::Block;
use crate::sync::{Header, SyncError, SyncPeer};

/// Wraps a session with the bandwidth estimate and reported height the
/// synchronizer needs but sessions themselves don't track.
pub struct SessionSyncPeer {
    session: Arc<PeerSession>,
    reported_height: AtomicU64,
    bandwidth_bytes_per_sec: AtomicU64,
}

impl SessionSyncPeer {
    pub fn new(session: Arc<PeerSession>) -> Self {
        Self {
            session,
            reported_height: AtomicU64::new(0),
            bandwidth_bytes_per_sec: AtomicU64::new(0),
        }
    }

    pub fn set_reported_height(&self, height: u64) {
        self.reported_height.store(height, Ordering::Relaxed);
    }

    pub fn set_bandwidth_estimate(&self, bytes_per_sec: u64) {
        self.bandwidth_bytes_per_sec.store(bytes_per_sec, Ordering::Relaxed);
    }
}

#[async_trait]
impl SyncPeer for SessionSyncPeer {
    fn endpoint(&self) -> PeerEndpoint {
        self.session.endpoint
    }

    fn services(&self) -> u64 {
        0
    }

    fn is_banned(&self) -> bool {
        false
    }

    async fn reported_height(&self) -> u64 {
        if let Some(info) = self.session.handshake_info().await {
            return info.start_height.max(self.reported_height.load(Ordering::Relaxed));
        }
        self.reported_height.load(Ordering::Relaxed)
    }

    async fn average_latency_millis(&self) -> Option<f64> {
        self.session.average_latency_millis().await
    }

    async fn average_bandwidth_bytes_per_sec(&self) -> u64 {
        self.bandwidth_bytes_per_sec.load(Ordering::Relaxed)
    }

    async fn request_headers(&self, start_height: u64, end_height: u64) -> Result<Vec<Header>, SyncError> {
        let response = self
            .session
            .request(
                MessageType::GetHeaders,
                Payload::GetHeaders { start_height, end_height },
                Duration::from_secs(PEER_SELECTION_TIMEOUT_SECS),
            )
            .await
            .map_err(|e| SyncError::RequestFailed(e.to_string()))?;

        let Payload::Headers { raw } = response.payload else {
            return Err(SyncError::RequestFailed("expected HEADERS response".to_string()));
        };

        raw.iter()
            .map(|bytes| bincode::deserialize::<Header>(bytes).map_err(|e| SyncError::RequestFailed(e.to_string())))
            .collect()
    }

    async fn request_block(&self, height: u64) -> Result<Block, SyncError> {
        let response = self
            .session
            .request_default_timeout(MessageType::GetBlock, Payload::GetBlock { height })
            .await
            .map_err(|e| SyncError::RequestFailed(e.to_string()))?;

        let Payload::Block { raw, .. } = response.payload else {
            return Err(SyncError::RequestFailed("expected BLOCK response".to_string()));
        };

        bincode::deserialize::<Block>(&raw).map_err(|e| SyncError::RequestFailed(e.to_string()))
    }
}
