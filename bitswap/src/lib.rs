//! Bitswap block-exchange protocol engine
//!
//! Peers exchange immutable binary blocks identified by content identifiers.
//! Each peer maintains a local block store, advertises a list of blocks it
//! wants, fulfills incoming requests from its own store, and accounts for
//! bytes sent and received per peer.

pub mod constants;
pub mod coordinator;
pub mod engine;
pub mod ledger;
pub mod message;
pub mod msg_queue;
pub mod network;
pub mod pb;
pub mod stats;
pub mod transport;
pub mod want_manager;
pub mod wantlist;

pub use constants::*;
pub use coordinator::*;
pub use engine::*;
pub use ledger::*;
pub use message::*;
pub use msg_queue::*;
pub use network::*;
pub use stats::*;
pub use transport::*;
pub use want_manager::*;
pub use wantlist::*;

pub use bitswap_interface::BitswapError;

pub type Result<T> = std::result::Result<T, BitswapError>;

/// What a remote peer is asked for: the block bytes themselves, or only a
/// Have/DontHave answer. The legacy v1.0.0 protocol supports only `Block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum WantType {
    Block,
    Have,
}
