//! The wire message: a closed message-type enum plus a tagged-union
//! payload, validated against its type at parse time.
//!
//! Wire encoding is otherwise unpinned; this core picks length-prefixed
//! bincode framing, plus a strict schema validator so a payload can never
//! be accepted under the wrong declared message type.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed message-type enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Version,
    Verack,
    Ping,
    Pong,
    Addr,
    Inv,
    GetData,
    NotFound,
    GetBlocks,
    GetHeaders,
    GetBlockTxn,
    Tx,
    Block,
    Headers,
    GetAddr,
    Mempool,
    Reject,
    GetNodeInfo,
    GetBlock,
    NewBlock,
    NewTransaction,
    GetVotes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InventoryKind {
    Block,
    Tx,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryItem {
    pub kind: InventoryKind,
    pub hash: String,
}

/// Tagged union over every message type's payload. Variant names mirror
/// `MessageType` exactly so the validator below can match structurally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    Version {
        version: u32,
        services: u64,
        timestamp: u64,
        start_height: u64,
        user_agent: String,
    },
    Verack,
    Ping {
        nonce: u64,
        timestamp: u64,
    },
    Pong {
        nonce: u64,
        timestamp: u64,
    },
    Addr {
        addresses: Vec<String>,
    },
    Inv {
        items: Vec<InventoryItem>,
    },
    GetData {
        items: Vec<InventoryItem>,
    },
    NotFound {
        items: Vec<InventoryItem>,
    },
    GetBlocks {
        heights: Vec<u64>,
    },
    GetHeaders {
        start_height: u64,
        end_height: u64,
    },
    GetBlockTxn {
        hash: String,
        indexes: Vec<u32>,
    },
    Tx {
        raw: Vec<u8>,
    },
    Block {
        height: u64,
        raw: Vec<u8>,
    },
    Headers {
        raw: Vec<Vec<u8>>,
    },
    GetAddr,
    Mempool,
    Reject {
        reason: String,
    },
    /// Doubles as request and response: a bare request carries `info:
    /// None`; the reply fills it in. There is no separate wire message
    /// for the answer, matching the closed `MessageType` enum.
    GetNodeInfo {
        info: Option<NodeInfoData>,
    },
    GetBlock {
        height: u64,
    },
    NewBlock {
        height: u64,
        raw: Vec<u8>,
    },
    NewTransaction {
        raw: Vec<u8>,
    },
    /// Same request/response doubling as `GetNodeInfo`: `votes: None` on
    /// the request, populated on the reply.
    GetVotes {
        since_timestamp: u64,
        votes: Option<Vec<VoteRecord>>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfoData {
    pub version: u32,
    pub mined_blocks: u64,
    pub balance: u64,
    pub voting_power: u64,
    pub height: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRecord {
    pub timestamp: u64,
    pub data: String,
}

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("payload shape does not match declared type {0:?}")]
    SchemaMismatch(MessageType),
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

/// One framed protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerMessage {
    pub message_type: MessageType,
    pub payload: Payload,
    /// Present on `request`/response pairs; absent on fire-and-forget sends.
    pub request_id: Option<[u8; 32]>,
    /// Content-hash of the serialized payload, attached by `send`.
    pub checksum: Option<String>,
}

impl PeerMessage {
    pub fn new(message_type: MessageType, payload: Payload) -> Result<Self, MessageError> {
        validate_schema(message_type, &payload)?;
        Ok(Self {
            message_type,
            payload,
            request_id: None,
            checksum: None,
        })
    }

    pub fn with_request_id(mut self, request_id: [u8; 32]) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Attaches a checksum computed over the serialized payload.
    pub fn with_checksum(mut self) -> Result<Self, MessageError> {
        let encoded = bincode::serialize(&self.payload)?;
        self.checksum = Some(content_checksum(&encoded));
        Ok(self)
    }

    pub fn verify_checksum(&self) -> Result<(), MessageError> {
        let Some(expected) = &self.checksum else {
            return Ok(());
        };
        let encoded = bincode::serialize(&self.payload)?;
        if &content_checksum(&encoded) != expected {
            return Err(MessageError::ChecksumMismatch);
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let msg: PeerMessage = bincode::deserialize(bytes)?;
        validate_schema(msg.message_type, &msg.payload)?;
        Ok(msg)
    }
}

/// Rejects frames whose payload variant doesn't match the declared type.
fn validate_schema(message_type: MessageType, payload: &Payload) -> Result<(), MessageError> {
    use MessageType as T;
    use Payload as P;
    let matches = matches!(
        (message_type, payload),
        (T::Version, P::Version { .. })
            | (T::Verack, P::Verack)
            | (T::Ping, P::Ping { .. })
            | (T::Pong, P::Pong { .. })
            | (T::Addr, P::Addr { .. })
            | (T::Inv, P::Inv { .. })
            | (T::GetData, P::GetData { .. })
            | (T::NotFound, P::NotFound { .. })
            | (T::GetBlocks, P::GetBlocks { .. })
            | (T::GetHeaders, P::GetHeaders { .. })
            | (T::GetBlockTxn, P::GetBlockTxn { .. })
            | (T::Tx, P::Tx { .. })
            | (T::Block, P::Block { .. })
            | (T::Headers, P::Headers { .. })
            | (T::GetAddr, P::GetAddr)
            | (T::Mempool, P::Mempool)
            | (T::Reject, P::Reject { .. })
            | (T::GetNodeInfo, P::GetNodeInfo { .. })
            | (T::GetBlock, P::GetBlock { .. })
            | (T::NewBlock, P::NewBlock { .. })
            | (T::NewTransaction, P::NewTransaction { .. })
            | (T::GetVotes, P::GetVotes { .. })
    );
    if matches {
        Ok(())
    } else {
        Err(MessageError::SchemaMismatch(message_type))
    }
}

/// Hex-digest content hash over the serialized payload. Cryptographic
/// authentication is an external collaborator's concern; this uses xxh3
/// purely for corruption/tamper detection on the wire.
fn content_checksum(bytes: &[u8]) -> String {
    hex::encode(xxhash_rust::xxh3::xxh3_64(bytes).to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_every_message_type() {
        let samples = vec![
            PeerMessage::new(
                MessageType::Version,
                Payload::Version {
                    version: 1,
                    services: 0,
                    timestamp: 0,
                    start_height: 0,
                    user_agent: "test".into(),
                },
            ),
            PeerMessage::new(MessageType::Verack, Payload::Verack),
            PeerMessage::new(
                MessageType::Ping,
                Payload::Ping {
                    nonce: 1,
                    timestamp: 0,
                },
            ),
            PeerMessage::new(MessageType::GetAddr, Payload::GetAddr),
            PeerMessage::new(
                MessageType::GetBlock,
                Payload::GetBlock { height: 42 },
            ),
        ];
        for msg in samples {
            let msg = msg.unwrap().with_checksum().unwrap();
            let encoded = msg.encode().unwrap();
            let decoded = PeerMessage::decode(&encoded).unwrap();
            decoded.verify_checksum().unwrap();
            assert_eq!(decoded.message_type, msg.message_type);
        }
    }

    #[test]
    fn rejects_type_payload_mismatch() {
        let result = PeerMessage::new(MessageType::Ping, Payload::Verack);
        assert!(matches!(result, Err(MessageError::SchemaMismatch(MessageType::Ping))));
    }

    #[test]
    fn detects_tampered_checksum() {
        let mut msg = PeerMessage::new(MessageType::GetAddr, Payload::GetAddr)
            .unwrap()
            .with_checksum()
            .unwrap();
        msg.payload = Payload::Mempool;
        assert!(matches!(msg.verify_checksum(), Err(MessageError::ChecksumMismatch)));
    }
}
