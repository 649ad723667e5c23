//! Block storage interface

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;

use crate::BitswapError;

/// A CID/block pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pair {
    pub cid: Cid,
    pub block: Bytes,
}

impl Pair {
    /// Create a new pair
    pub fn new(cid: Cid, block: Bytes) -> Self {
        Self { cid, block }
    }
}

/// Block storage interface
///
/// The store owns the `cid -> bytes` mapping and its persistence. The engine
/// assumes the store verifies that block data matches the CID's multihash;
/// the engine itself performs no verification on `put`.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Check whether a block exists in the store
    async fn has(&self, cid: &Cid) -> Result<bool, BitswapError>;

    /// Retrieve a block from the store
    ///
    /// Returns [`BitswapError::BlockNotFound`] when the CID is absent.
    async fn get(&self, cid: &Cid) -> Result<Bytes, BitswapError>;

    /// Store a block
    async fn put(&self, cid: &Cid, block: Bytes) -> Result<(), BitswapError>;

    /// Store multiple blocks
    async fn put_many(&self, blocks: Vec<Pair>) -> Result<(), BitswapError>;
}
