//! The synchronizer's view of a peer: just enough to select a sync
//! source and drive headers/blocks requests, without depending on
//! [`crate::peer::session::PeerSession`] directly — the node coordinator
//! adapts its sessions to this trait.

use async_trait::async_trait;

use crate::peer::PeerEndpoint;
use crate::store::Block;

use super::error::SyncError;
use super::header::Header;

#[async_trait]
pub trait SyncPeer: Send + Sync {
    fn endpoint(&self) -> PeerEndpoint;
    fn services(&self) -> u64;
    fn is_banned(&self) -> bool;
    async fn reported_height(&self) -> u64;
    async fn average_latency_millis(&self) -> Option<f64>;
    async fn average_bandwidth_bytes_per_sec(&self) -> u64;
    async fn request_headers(&self, start_height: u64, end_height: u64) -> Result<Vec<Header>, SyncError>;
    async fn request_block(&self, height: u64) -> Result<Block, SyncError>;
}

/// Filters to peers that are connected (implicit — callers only pass
/// connected sessions), unbanned, report a height greater than local,
/// advertise compatible services, and meet the configured bandwidth
/// floor; sorted by height descending then latency ascending.
pub async fn select_sync_peer(
    peers: &[std::sync::Arc<dyn SyncPeer>],
    local_height: u64,
    required_services: u64,
    min_bandwidth_bytes_per_sec: u64,
) -> Option<std::sync::Arc<dyn SyncPeer>> {
    let mut candidates = Vec::new();
    for peer in peers {
        if peer.is_banned() {
            continue;
        }
        if peer.services() & required_services != required_services {
            continue;
        }
        let height = peer.reported_height().await;
        if height <= local_height {
            continue;
        }
        if peer.average_bandwidth_bytes_per_sec().await < min_bandwidth_bytes_per_sec {
            continue;
        }
        let latency = peer.average_latency_millis().await.unwrap_or(f64::MAX);
        candidates.push((peer.clone(), height, latency));
    }

    candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal)));
    candidates.into_iter().next().map(|(peer, _, _)| peer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    struct FakePeer {
        endpoint: PeerEndpoint,
        height: u64,
        latency: f64,
        bandwidth: u64,
        banned: bool,
        services: u64,
    }

    #[async_trait]
    impl SyncPeer for FakePeer {
        fn endpoint(&self) -> PeerEndpoint {
            self.endpoint
        }
        fn services(&self) -> u64 {
            self.services
        }
        fn is_banned(&self) -> bool {
            self.banned
        }
        async fn reported_height(&self) -> u64 {
            self.height
        }
        async fn average_latency_millis(&self) -> Option<f64> {
            Some(self.latency)
        }
        async fn average_bandwidth_bytes_per_sec(&self) -> u64 {
            self.bandwidth
        }
        async fn request_headers(&self, _start: u64, _end: u64) -> Result<Vec<Header>, SyncError> {
            unimplemented!()
        }
        async fn request_block(&self, _height: u64) -> Result<Block, SyncError> {
            unimplemented!()
        }
    }

    fn peer(last_octet: u8, height: u64, latency: f64) -> Arc<dyn SyncPeer> {
        Arc::new(FakePeer {
            endpoint: PeerEndpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)), 8333),
            height,
            latency,
            bandwidth: 2 * 1024 * 1024,
            banned: false,
            services: 1,
        })
    }

    #[tokio::test]
    async fn picks_highest_then_lowest_latency() {
        let peers = vec![peer(1, 100, 200.0), peer(2, 150, 50.0), peer(3, 150, 10.0)];
        let selected = select_sync_peer(&peers, 50, 0, 1024 * 1024).await.unwrap();
        assert_eq!(selected.endpoint(), peers[2].endpoint());
    }

    #[tokio::test]
    async fn excludes_peers_not_ahead_of_local() {
        let peers = vec![peer(1, 50, 10.0)];
        assert!(select_sync_peer(&peers, 50, 0, 1024 * 1024).await.is_none());
    }

    #[tokio::test]
    async fn excludes_banned_peers() {
        let mut banned = FakePeer {
            endpoint: PeerEndpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), 8333),
            height: 200,
            latency: 1.0,
            bandwidth: 2 * 1024 * 1024,
            banned: true,
            services: 1,
        };
        banned.banned = true;
        let peers: Vec<Arc<dyn SyncPeer>> = vec![Arc::new(banned)];
        assert!(select_sync_peer(&peers, 50, 0, 1024 * 1024).await.is_none());
    }

    #[tokio::test]
    async fn excludes_low_bandwidth_peers() {
        let mut slow = FakePeer {
            endpoint: PeerEndpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 8)), 8333),
            height: 200,
            latency: 1.0,
            bandwidth: 100,
            banned: false,
            services: 1,
        };
        slow.bandwidth = 100;
        let peers: Vec<Arc<dyn SyncPeer>> = vec![Arc::new(slow)];
        assert!(select_sync_peer(&peers, 50, 0, 1024 * 1024).await.is_none());
    }
}
