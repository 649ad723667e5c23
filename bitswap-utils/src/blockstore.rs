//! Block store implementations

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use tokio::sync::RwLock;
use tracing::trace;

use bitswap_interface::{BitswapError, BlockStore, Pair};

/// Configuration for the sled-backed blockstore
#[derive(Debug, Clone, Default)]
pub struct BlockstoreConfig {
    /// On-disk location; a temporary database is used when unset
    pub path: Option<PathBuf>,
}

/// Blockstore keeping everything in process memory
#[derive(Debug, Default)]
pub struct MemoryBlockstore {
    blocks: RwLock<HashMap<Cid, Bytes>>,
}

impl MemoryBlockstore {
    /// Create an empty in-memory blockstore
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blocks
    pub async fn len(&self) -> usize {
        self.blocks.read().await.len()
    }

    /// Whether the store holds no blocks
    pub async fn is_empty(&self) -> bool {
        self.blocks.read().await.is_empty()
    }
}

#[async_trait]
impl BlockStore for MemoryBlockstore {
    async fn has(&self, cid: &Cid) -> Result<bool, BitswapError> {
        Ok(self.blocks.read().await.contains_key(cid))
    }

    async fn get(&self, cid: &Cid) -> Result<Bytes, BitswapError> {
        self.blocks
            .read()
            .await
            .get(cid)
            .cloned()
            .ok_or(BitswapError::BlockNotFound { cid: *cid })
    }

    async fn put(&self, cid: &Cid, block: Bytes) -> Result<(), BitswapError> {
        trace!("storing {} ({} bytes)", cid, block.len());
        self.blocks.write().await.insert(*cid, block);
        Ok(())
    }

    async fn put_many(&self, blocks: Vec<Pair>) -> Result<(), BitswapError> {
        let mut store = self.blocks.write().await;
        for pair in blocks {
            store.insert(pair.cid, pair.block);
        }
        Ok(())
    }
}

/// Sled-backed blockstore
pub struct SledBlockstore {
    db: sled::Db,
}

impl SledBlockstore {
    /// Open a blockstore at the configured path, or a temporary one
    pub fn new(config: BlockstoreConfig) -> Result<Self, BitswapError> {
        let db = if let Some(path) = config.path {
            sled::open(path)
                .map_err(|e| BitswapError::store(format!("failed to open blockstore: {}", e)))?
        } else {
            sled::Config::new().temporary(true).open().map_err(|e| {
                BitswapError::store(format!("failed to create temporary blockstore: {}", e))
            })?
        };
        Ok(Self { db })
    }

    fn key(cid: &Cid) -> Vec<u8> {
        cid.to_bytes()
    }
}

#[async_trait]
impl BlockStore for SledBlockstore {
    async fn has(&self, cid: &Cid) -> Result<bool, BitswapError> {
        self.db
            .contains_key(Self::key(cid))
            .map_err(|e| BitswapError::store(format!("blockstore lookup error: {}", e)))
    }

    async fn get(&self, cid: &Cid) -> Result<Bytes, BitswapError> {
        match self.db.get(Self::key(cid)) {
            Ok(Some(data)) => Ok(Bytes::from(data.to_vec())),
            Ok(None) => Err(BitswapError::BlockNotFound { cid: *cid }),
            Err(e) => Err(BitswapError::store(format!("blockstore get error: {}", e))),
        }
    }

    async fn put(&self, cid: &Cid, block: Bytes) -> Result<(), BitswapError> {
        self.db
            .insert(Self::key(cid), block.as_ref())
            .map_err(|e| BitswapError::store(format!("blockstore put error: {}", e)))?;
        Ok(())
    }

    async fn put_many(&self, blocks: Vec<Pair>) -> Result<(), BitswapError> {
        for pair in blocks {
            self.put(&pair.cid, pair.block).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use multihash::Multihash;
    use sha2::{Digest, Sha256};

    fn make_pair(data: &[u8]) -> Pair {
        let digest = Sha256::digest(data);
        let mh = Multihash::wrap(0x12, &digest).unwrap();
        Pair::new(Cid::new_v1(0x55, mh), Bytes::copy_from_slice(data))
    }

    #[tokio::test]
    async fn test_memory_blockstore_round_trip() {
        let store = MemoryBlockstore::new();
        let pair = make_pair(b"in memory");

        assert!(!store.has(&pair.cid).await.unwrap());
        assert!(matches!(
            store.get(&pair.cid).await.unwrap_err(),
            BitswapError::BlockNotFound { .. }
        ));

        store.put(&pair.cid, pair.block.clone()).await.unwrap();
        assert!(store.has(&pair.cid).await.unwrap());
        assert_eq!(store.get(&pair.cid).await.unwrap(), pair.block);
    }

    #[tokio::test]
    async fn test_memory_blockstore_put_many() {
        let store = MemoryBlockstore::new();
        let pairs: Vec<Pair> = (0u8..4).map(|i| make_pair(&[i])).collect();

        store.put_many(pairs.clone()).await.unwrap();
        assert_eq!(store.len().await, 4);
        for pair in pairs {
            assert_eq!(store.get(&pair.cid).await.unwrap(), pair.block);
        }
    }

    #[tokio::test]
    async fn test_sled_blockstore_round_trip() {
        let store = SledBlockstore::new(BlockstoreConfig::default()).unwrap();
        let pair = make_pair(b"on disk");

        assert!(!store.has(&pair.cid).await.unwrap());
        store.put(&pair.cid, pair.block.clone()).await.unwrap();
        assert!(store.has(&pair.cid).await.unwrap());
        assert_eq!(store.get(&pair.cid).await.unwrap(), pair.block);

        assert!(matches!(
            store.get(&make_pair(b"missing").cid).await.unwrap_err(),
            BitswapError::BlockNotFound { .. }
        ));
    }
}
