//! Error types for Bitswap operations

use thiserror::Error;

/// Main error type for the Bitswap engine and its collaborators.
///
/// Network-facing variants (`Dial`, `Format`, `Timeout`, ...) are absorbed
/// and logged by the engine; the protocol is best-effort and relies on
/// resends through other peers. Local and store errors surface to callers.
#[derive(Error, Debug)]
pub enum BitswapError {
    /// API called before `start()` or after `stop()`
    #[error("engine not started")]
    NotStarted,

    /// Block not found in the local store
    #[error("block not found: {cid}")]
    BlockNotFound { cid: cid::Cid },

    /// A pending `get` was cancelled by `unwant`
    #[error("want for {cid} was cancelled")]
    Unwanted { cid: cid::Cid },

    /// Transport could not reach the peer
    #[error("failed to dial {peer}: {reason}")]
    Dial {
        peer: libp2p::PeerId,
        reason: String,
    },

    /// Malformed inbound message
    #[error("malformed message: {0}")]
    Format(#[from] prost::DecodeError),

    /// No hasher registered for a multihash code found in a block prefix
    #[error("no hasher registered for multihash code {code:#04x}")]
    UnsupportedHash { code: u64 },

    /// A block whose reconstructed CID does not match its prefix
    #[error("block does not match its declared prefix: {cid}")]
    CidMismatch { cid: cid::Cid },

    /// Inbound stream idle beyond the configured window
    #[error("stream idle timeout")]
    Timeout,

    /// Operation was aborted, e.g. by engine shutdown
    #[error("operation was aborted")]
    Aborted,

    /// CID parsing or validation errors
    #[error("CID error: {0}")]
    Cid(#[from] cid::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Block store error
    #[error("store error: {message}")]
    Store { message: String },

    /// Content routing error
    #[error("routing error: {message}")]
    Routing { message: String },

    /// Network error
    #[error("network error: {message}")]
    Network { message: String },

    /// Generic error with custom message
    #[error("{0}")]
    Other(String),
}

impl BitswapError {
    /// Create a store error from any displayable message
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create a routing error from any displayable message
    pub fn routing(message: impl Into<String>) -> Self {
        Self::Routing {
            message: message.into(),
        }
    }

    /// Create a network error from any displayable message
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a dial error for a peer
    pub fn dial(peer: libp2p::PeerId, reason: impl Into<String>) -> Self {
        Self::Dial {
            peer,
            reason: reason.into(),
        }
    }

    /// Create a generic error from any displayable message
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}
