//! End-to-end block exchange between two engines
//!
//! Two nodes share an in-memory transport hub and provider registry. The
//! provider stores and announces a block; the requester discovers it
//! through routing, connects, broadcasts its wantlist and receives the
//! block, with both ledgers accounting the transfer.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cid::Cid;
use libp2p::PeerId;
use multihash::Multihash;
use sha2::{Digest, Sha256};
use tracing::info;

use bitswap::{
    Bitswap, BitswapConfig, MemoryHub, MemoryRouting, MemoryRoutingHub, MemoryTransport,
};
use bitswap_interface::{BitswapError, Pair};
use bitswap_utils::MemoryBlockstore;

fn make_pair(data: &[u8]) -> Pair {
    let digest = Sha256::digest(data);
    let mh = Multihash::wrap(0x12, &digest).unwrap();
    Pair::new(Cid::new_v1(0x55, mh), Bytes::copy_from_slice(data))
}

struct Node {
    peer: PeerId,
    bitswap: Arc<Bitswap>,
}

async fn spawn_node(
    hub: &Arc<MemoryHub>,
    routing_hub: &Arc<MemoryRoutingHub>,
    config: BitswapConfig,
) -> Node {
    let peer = PeerId::random();
    let transport = MemoryTransport::new(hub.clone(), peer, 32, 128);
    let routing = MemoryRouting::new(routing_hub.clone(), peer);
    let bitswap = Arc::new(Bitswap::new(
        Arc::new(MemoryBlockstore::new()),
        transport,
        routing,
        config,
    ));
    bitswap.start().await.unwrap();
    Node { peer, bitswap }
}

#[tokio::test]
async fn test_remote_fetch_through_provider_discovery() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let hub = MemoryHub::new();
    let routing_hub = MemoryRoutingHub::new();

    let requester = spawn_node(&hub, &routing_hub, BitswapConfig::default()).await;
    let provider = spawn_node(&hub, &routing_hub, BitswapConfig::default()).await;

    let pair = make_pair(b"block held only by the provider");
    info!("provider {} announces {}", provider.peer, pair.cid);
    provider.bitswap.put(pair.clone()).await.unwrap();

    // The requester has never met the provider; routing bridges the gap
    let block = tokio::time::timeout(
        Duration::from_secs(5),
        requester.bitswap.get(&pair.cid),
    )
    .await
    .expect("remote fetch timed out")
    .unwrap();
    assert_eq!(block, pair.block);

    // The want is retired everywhere once the block arrived
    assert!(requester.bitswap.wantlist().await.is_empty());

    // Both sides accounted the transfer
    let sent = provider
        .bitswap
        .ledger(&requester.peer)
        .await
        .expect("provider should hold a ledger for the requester");
    assert_eq!(sent.bytes_sent, pair.block.len() as u64);

    let received = requester
        .bitswap
        .ledger(&provider.peer)
        .await
        .expect("requester should hold a ledger for the provider");
    assert_eq!(received.bytes_recv, pair.block.len() as u64);

    // A second get is a local hit now
    let again = tokio::time::timeout(
        Duration::from_millis(200),
        requester.bitswap.get(&pair.cid),
    )
    .await
    .expect("second get should be served locally")
    .unwrap();
    assert_eq!(again, pair.block);

    let stats = requester.bitswap.stats();
    assert_eq!(stats.blocks_received, 1);
    assert_eq!(stats.data_received, pair.block.len() as u64);
}

#[tokio::test]
async fn test_block_put_after_want_reaches_connected_peer() {
    let hub = MemoryHub::new();
    let routing_hub = MemoryRoutingHub::new();

    let requester = spawn_node(&hub, &routing_hub, BitswapConfig::default()).await;
    let provider = spawn_node(&hub, &routing_hub, BitswapConfig::default()).await;

    // Pre-connect the nodes so the wantlist broadcast reaches the provider
    // before it holds the block
    let pair = make_pair(b"late arrival");
    provider.bitswap.put(make_pair(b"warm up")).await.unwrap();
    let warmup = make_pair(b"warm up");
    let _ = tokio::time::timeout(
        Duration::from_secs(5),
        requester.bitswap.get(&warmup.cid),
    )
    .await
    .expect("warm-up fetch timed out")
    .unwrap();

    let fetch = {
        let bitswap = requester.bitswap.clone();
        let cid = pair.cid;
        tokio::spawn(async move { bitswap.get(&cid).await })
    };

    // Give the want time to propagate, then make the block appear
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        provider
            .bitswap
            .wantlist_for_peer(&requester.peer)
            .await
            .iter()
            .filter(|entry| entry.cid == pair.cid)
            .count(),
        1
    );
    provider.bitswap.put(pair.clone()).await.unwrap();

    let block = tokio::time::timeout(Duration::from_secs(5), fetch)
        .await
        .expect("fetch never resolved")
        .unwrap()
        .unwrap();
    assert_eq!(block, pair.block);
}

#[tokio::test]
async fn test_unwant_while_fetching_remotely() {
    let hub = MemoryHub::new();
    let routing_hub = MemoryRoutingHub::new();
    let node = spawn_node(&hub, &routing_hub, BitswapConfig::default()).await;

    let cid = make_pair(b"never arrives").cid;
    let fetch = {
        let bitswap = node.bitswap.clone();
        tokio::spawn(async move { bitswap.get(&cid).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    node.bitswap.unwant(&cid).await;
    let result = fetch.await.unwrap();
    assert!(matches!(result, Err(BitswapError::Unwanted { .. })));
    assert!(node.bitswap.wantlist().await.is_empty());
}
