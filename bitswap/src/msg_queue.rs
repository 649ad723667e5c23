//! Per-peer outbound message queue with debounced flush
//!
//! A burst of want/cancel updates coalesces into one wire message per quiet
//! period. Delivery is at-most-once best-effort: if the peer cannot be
//! dialled the message is logged and dropped, and the protocol relies on
//! resends through other peers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use libp2p::PeerId;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::{
    message::{BitswapMessage, MessageEntry},
    network::Network,
};

/// Outbound aggregator for a single remote peer
pub struct MessageQueue {
    peer: PeerId,
    network: Arc<Network>,
    pending: Arc<Mutex<Vec<MessageEntry>>>,
    flush_scheduled: Arc<AtomicBool>,
    debounce: Duration,
    refcnt: AtomicUsize,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl MessageQueue {
    /// Create a queue for a peer
    pub fn new(peer: PeerId, network: Arc<Network>, debounce: Duration) -> Self {
        Self {
            peer,
            network,
            pending: Arc::new(Mutex::new(Vec::new())),
            flush_scheduled: Arc::new(AtomicBool::new(false)),
            debounce,
            refcnt: AtomicUsize::new(0),
            flush_task: Mutex::new(None),
        }
    }

    /// The remote peer this queue serves
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Count one more holder of this queue
    pub fn inc_ref(&self) -> usize {
        self.refcnt.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Release one holder; the queue is dropped by its owner at zero
    pub fn dec_ref(&self) -> usize {
        self.refcnt
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(1))
            })
            .map(|prev| prev.saturating_sub(1))
            .unwrap_or(0)
    }

    /// Append entries and schedule a debounced flush.
    ///
    /// Appends within the debounce window coalesce; exactly one message is
    /// emitted per quiet period.
    pub async fn add_entries(&self, entries: Vec<MessageEntry>) {
        if entries.is_empty() {
            return;
        }
        self.pending.lock().await.extend(entries);

        if self.flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        let pending = self.pending.clone();
        let flush_scheduled = self.flush_scheduled.clone();
        let network = self.network.clone();
        let peer = self.peer;
        let debounce = self.debounce;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            flush_scheduled.store(false, Ordering::SeqCst);
            let entries: Vec<MessageEntry> = pending.lock().await.drain(..).collect();
            Self::transmit_entries(network, peer, entries);
        });
        *self.flush_task.lock().await = Some(handle);
    }

    /// Flush any pending entries immediately
    pub async fn send_entries(&self) {
        self.flush_scheduled.store(false, Ordering::SeqCst);
        let entries: Vec<MessageEntry> = self.pending.lock().await.drain(..).collect();
        Self::transmit_entries(self.network.clone(), self.peer, entries);
    }

    /// Send a pre-built message without debouncing
    pub async fn add_message(&self, message: BitswapMessage) {
        Self::transmit(self.network.clone(), self.peer, message);
    }

    /// Cancel the debounce timer and drop anything still pending
    pub async fn stop(&self) {
        if let Some(handle) = self.flush_task.lock().await.take() {
            handle.abort();
        }
        self.flush_scheduled.store(false, Ordering::SeqCst);
        self.pending.lock().await.clear();
    }

    fn transmit_entries(network: Arc<Network>, peer: PeerId, entries: Vec<MessageEntry>) {
        if entries.is_empty() {
            return;
        }
        let mut message = BitswapMessage::new(false);
        for entry in entries {
            message.push_entry(entry);
        }
        Self::transmit(network, peer, message);
    }

    /// Dial and send without awaiting delivery; failures are logged and the
    /// message dropped
    fn transmit(network: Arc<Network>, peer: PeerId, message: BitswapMessage) {
        if message.is_empty() {
            return;
        }
        tokio::spawn(async move {
            if let Err(e) = network.connect_to(&peer).await {
                debug!("dropping message for {}: {}", peer, e);
                return;
            }
            trace!(
                "sending {} entries, {} blocks to {}",
                message.entries().count(),
                message.blocks().count(),
                peer
            );
            if let Err(e) = network.send_message(&peer, message).await {
                debug!("send to {} failed: {}", peer, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{ProtocolId, BITSWAP_PROTOCOLS};
    use crate::message::HasherRegistry;
    use crate::network::NetworkConfig;
    use crate::transport::{MemoryHub, MemoryTransport, NullRouting, Transport};
    use bytes::Bytes;
    use futures::StreamExt;
    use multihash::Multihash;
    use sha2::{Digest, Sha256};
    use tokio_util::codec::FramedRead;
    use unsigned_varint::codec::UviBytes;

    fn make_cid(data: &[u8]) -> cid::Cid {
        let digest = Sha256::digest(data);
        let mh = Multihash::wrap(0x12, &digest).unwrap();
        cid::Cid::new_v1(0x55, mh)
    }

    async fn started_network(hub: &Arc<MemoryHub>, peer: PeerId) -> Arc<Network> {
        let transport = MemoryTransport::new(hub.clone(), peer, 32, 128);
        let network = Arc::new(Network::new(
            transport,
            Arc::new(NullRouting),
            Arc::new(HasherRegistry::default()),
            NetworkConfig::default(),
        ));
        network.start().await.unwrap();
        network
    }

    #[tokio::test]
    async fn test_debounce_coalesces_into_one_message() {
        let hub = MemoryHub::new();
        let a = PeerId::random();
        let b = PeerId::random();
        let network = started_network(&hub, a).await;

        let b_transport = MemoryTransport::new(hub.clone(), b, 32, 128);
        let mut b_incoming = b_transport
            .register_handler(BITSWAP_PROTOCOLS.to_vec())
            .await
            .unwrap();

        let queue = MessageQueue::new(b, network, Duration::from_millis(10));
        let c1 = make_cid(b"c1");
        let c2 = make_cid(b"c2");
        let c3 = make_cid(b"c3");

        // Three rapid updates inside the debounce window
        queue.add_entries(vec![MessageEntry::new_block(c1, 1)]).await;
        queue.add_entries(vec![MessageEntry::new_block(c2, 1)]).await;
        queue.add_entries(vec![MessageEntry::new_block(c3, 1)]).await;

        let stream = tokio::time::timeout(Duration::from_secs(2), b_incoming.recv())
            .await
            .unwrap()
            .unwrap();
        let mut framed = FramedRead::new(stream.io, UviBytes::<Bytes>::default());
        let frame = framed.next().await.unwrap().unwrap();
        let decoded = crate::message::BitswapMessage::deserialize(
            &frame,
            ProtocolId::B120,
            &HasherRegistry::default(),
        )
        .unwrap();

        let mut cids: Vec<_> = decoded.entries().map(|e| e.cid).collect();
        cids.sort_by_key(|cid| cid.to_bytes());
        let mut expected = vec![c1, c2, c3];
        expected.sort_by_key(|cid| cid.to_bytes());
        assert_eq!(cids, expected);

        // No second stream shows up: one message per quiet period
        assert!(
            tokio::time::timeout(Duration::from_millis(100), b_incoming.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_unreachable_peer_drops_message() {
        let hub = MemoryHub::new();
        let a = PeerId::random();
        let network = started_network(&hub, a).await;

        // Peer was never registered on the hub: dial fails, message dropped
        let queue = MessageQueue::new(PeerId::random(), network, Duration::from_millis(1));
        queue
            .add_entries(vec![MessageEntry::new_block(make_cid(b"lost"), 1)])
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(queue.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_ref_counting() {
        let hub = MemoryHub::new();
        let network = started_network(&hub, PeerId::random()).await;
        let queue = MessageQueue::new(PeerId::random(), network, Duration::from_millis(10));

        assert_eq!(queue.inc_ref(), 1);
        assert_eq!(queue.inc_ref(), 2);
        assert_eq!(queue.dec_ref(), 1);
        assert_eq!(queue.dec_ref(), 0);
        assert_eq!(queue.dec_ref(), 0);
    }
}
