//! The node coordinator: peer table, peer-state projection, orphan pool,
//! connect flow, inventory handling, maintenance timer, broadcast fan-out.

pub mod coordinator;
pub mod orphan;
pub mod peer_state;
pub mod session_adapter;

pub use coordinator::NodeCoordinator;
pub use orphan::{OrphanBlock, OrphanPool};
pub use peer_state::{PeerState, PeerStateCache};
pub use session_adapter::SessionSyncPeer;
