//! Contracts for the external collaborators this core depends on but does
//! not implement: block/transaction validation, the UTXO set, the mempool,
//! consensus, cryptographic primitives, and the persistent key-value store.
//!
//! Each is an `async_trait` the caller implements and injects, parameterizing
//! this crate's P2P layer over a storage/consensus bound rather than hard-
//! coding a concrete backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::sync::Header;

/// A block as seen by the synchronizer: enough to validate and hand off,
/// opaque otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub hash: String,
    pub header: Header,
    pub transactions: Vec<String>,
    pub raw: Vec<u8>,
}

/// Validation and persistence of blocks/transactions, owned by the node,
/// not this crate.
#[async_trait]
pub trait BlockchainClient: Send + Sync {
    /// Current local tip height.
    async fn local_height(&self) -> u64;

    /// Header stored locally at `height`, if any.
    async fn header_at(&self, height: u64) -> Option<Header>;

    /// Validate and append a block. Errors are treated as fatal to the
    /// current sync pipeline.
    async fn add_block(&self, block: &Block) -> anyhow::Result<()>;

    /// Re-verify a block already present locally (used by the optional
    /// full chain verification pass).
    async fn verify_block(&self, height: u64) -> anyhow::Result<()>;

    /// Whether a block or transaction hash is already known locally.
    async fn has_object(&self, hash: &str) -> bool;

    /// Fetches a block by hash for GETDATA serving, if present locally.
    async fn block_by_hash(&self, hash: &str) -> Option<Block>;
}

/// Mempool membership, owned by the node.
#[async_trait]
pub trait MempoolClient: Send + Sync {
    /// Remove transactions that were just included in a block. Failures
    /// here are logged as warnings, never fatal to the sync pipeline.
    async fn remove_included(&self, tx_hashes: &[String]) -> anyhow::Result<()>;

    /// Whether a transaction is known to the mempool.
    async fn contains(&self, tx_hash: &str) -> bool;

    /// Fetches a transaction's raw bytes for GETDATA serving, if present.
    async fn raw_tx(&self, tx_hash: &str) -> Option<Vec<u8>>;
}

/// A minimal persistent key-value store. Keys are UTF-8 strings with a
/// `<namespace>:<key>` convention (`ban:<addr>`, `peer:<id>:<metric>`, ...).
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
    /// Keys in `[start, end)` in lexicographic order, for range scans such
    /// as `listBans` or 24h vote participation.
    async fn scan_range(&self, start: &str, end: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>>;
}

/// Cryptographic verification of a peer's self-reported identity at
/// connect time. Concrete key/signature schemes are out of scope; this
/// crate only calls the contract.
#[async_trait]
pub trait NodeVerifier: Send + Sync {
    async fn verify(&self, attrs: &NodeAttributes) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAttributes {
    pub version: u32,
    pub public_key: String,
    pub signature: String,
    pub timestamp: u64,
    pub tag_info: String,
}
