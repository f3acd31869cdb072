use thiserror::Error;

use super::validator::HeaderBatchError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("no eligible sync peer found")]
    NoEligiblePeer,
    #[error("peer selection timed out")]
    SelectionTimeout,
    #[error("sync pipeline timed out")]
    PipelineTimeout,
    #[error("request to peer failed: {0}")]
    RequestFailed(String),
    #[error("request to peer timed out")]
    RequestTimeout,
    #[error(transparent)]
    InvalidHeaderBatch(#[from] HeaderBatchError),
    #[error("block at height {height} does not match its header (expected hash {expected}, got {got})")]
    BlockHeaderMismatch { height: u64, expected: String, got: String },
    #[error("blockchain rejected block at height {height}: {source}")]
    BlockRejected { height: u64, source: anyhow::Error },
    #[error("chain verification failed at height {0}")]
    ChainVerificationFailed(u64),
    #[error("sync already in progress")]
    AlreadySyncing,
}

pub type SyncResult<T> = Result<T, SyncError>;
