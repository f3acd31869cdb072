//! Peer session: identity, wire format, rate limiting, ban scoring,
//! compression, framing, and the connection state machine.

pub mod ban;
pub mod compression;
pub mod connection;
pub mod endpoint;
pub mod message;
pub mod rate_limiter;
pub mod session;

pub use ban::{BanError, BanRecord, BanStore};
pub use compression::{Compression, CompressionError};
pub use connection::{Connection, ConnectionError};
pub use endpoint::{EndpointParseError, PeerEndpoint};
pub use message::{
    InventoryItem, InventoryKind, MessageError, MessageType, NodeInfoData, Payload, PeerMessage,
    VoteRecord,
};
pub use rate_limiter::RateLimiter;
pub use session::{
    CloseCode, HandshakeInfo, PeerError, PeerResult, PeerSession, PeerState, SessionEventHandler,
    TaskState,
};
