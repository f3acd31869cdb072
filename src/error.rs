//! Crate-wide error types.
//!
//! Each component defines its own `thiserror` enum close to where the
//! errors originate (`circuit_breaker::CircuitBreakerError`,
//! `seed::SeedDiscoveryError`, `peer::PeerError`, `sync::SyncError`,
//! `node::NodeError`) and this module composes them into the two errors
//! that cross component boundaries: `P2pError` (anything a peer session or
//! synchronizer can raise) and `NodeError` (anything the coordinator can
//! raise, including a `P2pError`).

use thiserror::Error;

use crate::circuit_breaker::CircuitBreakerError;
use crate::peer::PeerError;
use crate::seed::SeedDiscoveryError;
use crate::sync::SyncError;

#[derive(Error, Debug)]
pub enum P2pError {
    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    CircuitBreaker(#[from] CircuitBreakerError),

    #[error(transparent)]
    SeedDiscovery(#[from] SeedDiscoveryError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

pub type P2pResult<T> = Result<T, P2pError>;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    P2p(#[from] P2pError),

    #[error("peer verification failed for {endpoint}: {reason}")]
    VerificationFailed { endpoint: String, reason: String },

    #[error("no seeds resolved and peer cache is empty, cannot bootstrap")]
    NoBootstrapPeers,

    #[error("bind failed on {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("store error: {0}")]
    Store(String),

    #[error("node is shutting down")]
    ShuttingDown,
}

pub type NodeResult<T> = Result<T, NodeError>;
