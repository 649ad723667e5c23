//! Routing interface for content discovery

use async_trait::async_trait;
use cid::Cid;
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};

use crate::{AwaitIterable, BitswapError};

/// Information about a peer that can supply content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    /// The peer's ID
    pub id: PeerId,
    /// Known multiaddresses for the peer
    pub multiaddrs: Vec<Multiaddr>,
}

impl PeerInfo {
    /// Create peer info with no known addresses
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            multiaddrs: Vec::new(),
        }
    }
}

/// Routing interface for content discovery
///
/// Backed by a DHT or any other provider record system. The engine treats
/// provider lookups as best-effort and never surfaces their failures to
/// `get` callers.
#[async_trait]
pub trait Routing: Send + Sync {
    /// Find providers for a given CID
    async fn find_providers(&self, cid: &Cid) -> Result<AwaitIterable<PeerInfo>, BitswapError>;

    /// Announce that this node can provide content for a CID
    async fn provide(&self, cid: &Cid) -> Result<(), BitswapError>;
}
