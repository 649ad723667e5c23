//! Decision engine: inbound message processing and outbound block dispatch
//!
//! For every remote peer the engine keeps a ledger (their wantlist and the
//! bytes exchanged) and a task queue that serves one response at a time.
//! Peers are served concurrently with respect to each other, but a slow
//! remote never holds up anyone else's responses.

use std::collections::HashMap;
use std::sync::Arc;

use cid::Cid;
use libp2p::PeerId;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::{
    ledger::{Ledger, LedgerSnapshot},
    message::{BitswapMessage, Presence},
    network::Network,
    stats::Stats,
    wantlist::{Wantlist, WantlistEntry},
    WantType,
};
use bitswap_interface::{BitswapError, BlockStore, Pair};

/// Work items processed one at a time per peer
#[derive(Debug)]
enum EngineTask {
    /// Serve as much of the peer's wantlist as the local store holds
    ServeWantlist,
    /// Newly stored blocks the peer is known to want
    SendBlocks(Vec<Cid>),
}

struct Worker {
    tx: mpsc::UnboundedSender<EngineTask>,
    handle: JoinHandle<()>,
}

/// The decision engine
pub struct Engine {
    store: Arc<dyn BlockStore>,
    network: Arc<Network>,
    stats: Arc<Stats>,
    ledgers: Arc<RwLock<HashMap<PeerId, Arc<Mutex<Ledger>>>>>,
    workers: RwLock<HashMap<PeerId, Worker>>,
}

impl Engine {
    /// Create an engine over the given store and network
    pub fn new(store: Arc<dyn BlockStore>, network: Arc<Network>, stats: Arc<Stats>) -> Self {
        Self {
            store,
            network,
            stats,
            ledgers: Arc::new(RwLock::new(HashMap::new())),
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Process an inbound message from a peer.
    ///
    /// Updates the peer's ledger (byte accounting and wantlist), schedules
    /// a response task for anything we can serve from the local store, and
    /// returns the received blocks for the coordinator to write to the
    /// store and hand to waiting getters.
    pub async fn message_received(&self, peer: PeerId, message: BitswapMessage) -> Vec<Pair> {
        self.stats.record_message_received();
        let ledger = self.ensure_ledger(peer).await;

        let mut has_wants = false;
        {
            let mut ledger = ledger.lock().await;

            let received = message.block_bytes();
            if received > 0 {
                ledger.received_bytes(received);
            }

            if message.full() {
                let mut wantlist = Wantlist::new();
                for entry in message.entries().filter(|e| !e.cancel) {
                    wantlist.add_flagged(
                        entry.cid,
                        entry.priority,
                        entry.want_type,
                        entry.send_dont_have,
                    );
                    has_wants = true;
                }
                ledger.replace_wantlist(wantlist);
            } else {
                for entry in message.entries() {
                    if entry.cancel {
                        ledger.cancel_want(&entry.cid);
                    } else {
                        ledger.wants(
                            entry.cid,
                            entry.priority,
                            entry.want_type,
                            entry.send_dont_have,
                        );
                        has_wants = true;
                    }
                }
            }

            // Blocks they sent us are blocks they evidently hold
            for (cid, _) in message.blocks() {
                ledger.cancel_want(cid);
            }
        }

        if has_wants {
            self.enqueue(peer, EngineTask::ServeWantlist).await;
        }

        message
            .blocks()
            .map(|(cid, data)| Pair::new(*cid, data.clone()))
            .collect()
    }

    /// Bookkeeping for a block sent outside a serve task: account the bytes
    /// and drop the CID from the peer's wantlist
    pub async fn message_sent(&self, peer: &PeerId, cid: &Cid, bytes_len: u64) {
        if let Some(ledger) = self.ledgers.read().await.get(peer).cloned() {
            let mut ledger = ledger.lock().await;
            ledger.sent_bytes(bytes_len);
            ledger.cancel_want(cid);
        }
        self.stats.record_block_sent(bytes_len);
    }

    /// Newly stored blocks: schedule sends to every connected peer whose
    /// wantlist mentions them
    pub async fn notify_new_blocks(&self, cids: &[Cid]) {
        if cids.is_empty() {
            return;
        }
        let ledgers: Vec<(PeerId, Arc<Mutex<Ledger>>)> = self
            .ledgers
            .read()
            .await
            .iter()
            .map(|(peer, ledger)| (*peer, ledger.clone()))
            .collect();

        for (peer, ledger) in ledgers {
            let matching: Vec<Cid> = {
                let ledger = ledger.lock().await;
                cids.iter()
                    .filter(|cid| ledger.wantlist().contains(cid))
                    .copied()
                    .collect()
            };
            if matching.is_empty() {
                continue;
            }
            // Only peers with a live worker, i.e. still connected
            if self.workers.read().await.contains_key(&peer) {
                self.enqueue(peer, EngineTask::SendBlocks(matching)).await;
            }
        }
    }

    /// Ensure a ledger and response worker exist for the peer
    pub async fn peer_connected(&self, peer: PeerId) {
        self.ensure_ledger(peer).await;
        self.ensure_worker(peer).await;
    }

    /// Stop the peer's response worker; the ledger is retained since
    /// accounting is cumulative
    pub async fn peer_disconnected(&self, peer: &PeerId) {
        if let Some(worker) = self.workers.write().await.remove(peer) {
            worker.handle.abort();
            debug!("stopped response worker for {}", peer);
        }
    }

    /// An inbound stream failed to decode; the stream was closed upstream
    pub fn receive_error(&self, error: BitswapError) {
        warn!("inbound message error: {}", error);
    }

    /// The wantlist a peer has sent us, in canonical order
    pub async fn wantlist_for_peer(&self, peer: &PeerId) -> Vec<WantlistEntry> {
        match self.ledgers.read().await.get(peer) {
            Some(ledger) => ledger.lock().await.wantlist().sorted_entries(),
            None => Vec::new(),
        }
    }

    /// Snapshot of a peer's ledger counters
    pub async fn ledger(&self, peer: &PeerId) -> Option<LedgerSnapshot> {
        match self.ledgers.read().await.get(peer) {
            Some(ledger) => Some(ledger.lock().await.snapshot()),
            None => None,
        }
    }

    async fn ensure_ledger(&self, peer: PeerId) -> Arc<Mutex<Ledger>> {
        if let Some(ledger) = self.ledgers.read().await.get(&peer) {
            return ledger.clone();
        }
        let mut ledgers = self.ledgers.write().await;
        ledgers
            .entry(peer)
            .or_insert_with(|| Arc::new(Mutex::new(Ledger::new(peer))))
            .clone()
    }

    async fn ensure_worker(&self, peer: PeerId) {
        if self.workers.read().await.contains_key(&peer) {
            return;
        }
        let ledger = self.ensure_ledger(peer).await;
        let mut workers = self.workers.write().await;
        if workers.contains_key(&peer) {
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(worker_loop(
            peer,
            rx,
            self.store.clone(),
            self.network.clone(),
            self.stats.clone(),
            ledger,
        ));
        workers.insert(peer, Worker { tx, handle });
        trace!("started response worker for {}", peer);
    }

    async fn enqueue(&self, peer: PeerId, task: EngineTask) {
        self.ensure_worker(peer).await;
        if let Some(worker) = self.workers.read().await.get(&peer) {
            let _ = worker.tx.send(task);
        }
    }
}

/// Serves one task at a time for a single peer
async fn worker_loop(
    peer: PeerId,
    mut rx: mpsc::UnboundedReceiver<EngineTask>,
    store: Arc<dyn BlockStore>,
    network: Arc<Network>,
    stats: Arc<Stats>,
    ledger: Arc<Mutex<Ledger>>,
) {
    while let Some(task) = rx.recv().await {
        match task {
            EngineTask::ServeWantlist => {
                let entries = ledger.lock().await.wantlist().by_priority();
                respond(&peer, &entries, false, &store, &network, &stats, &ledger).await;
            }
            EngineTask::SendBlocks(cids) => {
                let entries: Vec<WantlistEntry> = {
                    let ledger = ledger.lock().await;
                    cids.iter()
                        .filter_map(|cid| ledger.wantlist().get(cid).cloned())
                        .collect()
                };
                respond(&peer, &entries, true, &store, &network, &stats, &ledger).await;
            }
        }
    }
}

/// Build and send one response message for the given wantlist entries.
///
/// `settle` removes answered entries from the peer's wantlist; serve tasks
/// leave the wantlist intact and rely on the peer's cancels.
async fn respond(
    peer: &PeerId,
    entries: &[WantlistEntry],
    settle: bool,
    store: &Arc<dyn BlockStore>,
    network: &Arc<Network>,
    stats: &Arc<Stats>,
    ledger: &Arc<Mutex<Ledger>>,
) {
    let mut response = BitswapMessage::new(false);
    let mut sent: Vec<(Cid, u64)> = Vec::new();
    let mut answered: Vec<Cid> = Vec::new();

    for entry in entries {
        let have = match store.has(&entry.cid).await {
            Ok(have) => have,
            Err(e) => {
                debug!("store lookup for {} failed: {}", entry.cid, e);
                continue;
            }
        };

        if !have {
            if entry.send_dont_have {
                response.add_presence(entry.cid, Presence::DontHave);
            }
            continue;
        }

        match entry.want_type {
            WantType::Have => {
                response.add_presence(entry.cid, Presence::Have);
                answered.push(entry.cid);
            }
            WantType::Block => match store.get(&entry.cid).await {
                Ok(data) => {
                    sent.push((entry.cid, data.len() as u64));
                    answered.push(entry.cid);
                    response.add_block(entry.cid, data);
                }
                Err(e) => {
                    debug!("store read for {} failed: {}", entry.cid, e);
                }
            },
        }
    }

    if response.is_empty() {
        return;
    }

    trace!(
        "responding to {} with {} blocks, {} presences",
        peer,
        sent.len(),
        answered.len().saturating_sub(sent.len())
    );
    match network.send_message(peer, response).await {
        Ok(()) => {
            let mut ledger = ledger.lock().await;
            for (_, len) in &sent {
                ledger.sent_bytes(*len);
                stats.record_block_sent(*len);
            }
            if settle {
                for cid in &answered {
                    ledger.cancel_want(cid);
                }
            }
        }
        Err(e) => {
            // Best effort; the peer re-requests through its own resends
            debug!("response to {} dropped: {}", peer, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::BITSWAP_PROTOCOLS;
    use crate::message::{HasherRegistry, MessageEntry};
    use crate::network::NetworkConfig;
    use crate::transport::{MemoryHub, MemoryTransport, NullRouting, Transport};
    use bitswap_utils::MemoryBlockstore;
    use bytes::Bytes;
    use futures::StreamExt;
    use multihash::Multihash;
    use sha2::{Digest, Sha256};
    use std::time::Duration;
    use tokio::sync::mpsc as tokio_mpsc;
    use tokio_util::codec::FramedRead;
    use unsigned_varint::codec::UviBytes;

    fn make_block(data: &[u8]) -> Pair {
        let digest = Sha256::digest(data);
        let mh = Multihash::wrap(0x12, &digest).unwrap();
        Pair::new(Cid::new_v1(0x55, mh), Bytes::copy_from_slice(data))
    }

    struct Fixture {
        engine: Engine,
        store: Arc<MemoryBlockstore>,
        remote: PeerId,
        incoming: tokio_mpsc::Receiver<crate::transport::IncomingStream>,
    }

    async fn fixture() -> Fixture {
        let hub = MemoryHub::new();
        let local = PeerId::random();
        let remote = PeerId::random();

        let transport = MemoryTransport::new(hub.clone(), local, 32, 128);
        let network = Arc::new(Network::new(
            transport,
            Arc::new(NullRouting),
            Arc::new(HasherRegistry::default()),
            NetworkConfig::default(),
        ));
        network.start().await.unwrap();

        let remote_transport = MemoryTransport::new(hub, remote, 32, 128);
        let incoming = remote_transport
            .register_handler(BITSWAP_PROTOCOLS.to_vec())
            .await
            .unwrap();

        let store = Arc::new(MemoryBlockstore::new());
        let engine = Engine::new(store.clone(), network, Arc::new(Stats::default()));
        Fixture {
            engine,
            store,
            remote,
            incoming,
        }
    }

    async fn recv_response(
        incoming: &mut tokio_mpsc::Receiver<crate::transport::IncomingStream>,
    ) -> BitswapMessage {
        let stream = tokio::time::timeout(Duration::from_secs(2), incoming.recv())
            .await
            .expect("timed out waiting for response")
            .expect("transport closed");
        let protocol = stream.protocol;
        let mut framed = FramedRead::new(stream.io, UviBytes::<Bytes>::default());
        let frame = framed.next().await.unwrap().unwrap();
        BitswapMessage::deserialize(&frame, protocol, &HasherRegistry::default()).unwrap()
    }

    #[tokio::test]
    async fn test_wantlist_then_cancel_over_the_alphabet() {
        let mut fx = fixture().await;

        let blocks: HashMap<char, Pair> = ('a'..='z')
            .map(|c| (c, make_block(format!("block {}", c).as_bytes())))
            .collect();
        for pair in blocks.values() {
            fx.store.put(&pair.cid, pair.block.clone()).await.unwrap();
        }

        let mut full = BitswapMessage::new(true);
        for pair in blocks.values() {
            full.push_entry(MessageEntry::new_block(pair.cid, 1));
        }

        let vowels = ['a', 'e', 'i', 'o', 'u'];
        let mut cancels = BitswapMessage::new(false);
        for vowel in vowels {
            cancels.cancel(blocks[&vowel].cid);
        }

        // Both updates land before the response worker runs
        fx.engine.message_received(fx.remote, full).await;
        fx.engine.message_received(fx.remote, cancels).await;

        let response = recv_response(&mut fx.incoming).await;
        let sent: Vec<Cid> = response.blocks().map(|(cid, _)| *cid).collect();

        let expected: Vec<Cid> = ('a'..='z')
            .filter(|c| !vowels.contains(c))
            .map(|c| blocks[&c].cid)
            .collect();
        assert_eq!(sent.len(), 21);
        for cid in &expected {
            assert!(sent.contains(cid));
        }

        // The ledger's wantlist holds exactly the consonants
        let wantlist = fx.engine.wantlist_for_peer(&fx.remote).await;
        assert_eq!(wantlist.len(), 21);
        for entry in &wantlist {
            assert!(expected.contains(&entry.cid));
        }
    }

    #[tokio::test]
    async fn test_partial_update_preserves_unmentioned_entries() {
        let fx = fixture().await;
        let a = make_block(b"a").cid;
        let b = make_block(b"b").cid;
        let c = make_block(b"c").cid;
        let d = make_block(b"d").cid;

        let mut full = BitswapMessage::new(true);
        full.add_entry(a, 1, WantType::Block, false);
        full.add_entry(b, 1, WantType::Block, false);
        fx.engine.message_received(fx.remote, full).await;

        let mut delta = BitswapMessage::new(false);
        delta.add_entry(c, 2, WantType::Block, false);
        fx.engine.message_received(fx.remote, delta).await;

        let wantlist = fx.engine.wantlist_for_peer(&fx.remote).await;
        let cids: Vec<Cid> = wantlist.iter().map(|e| e.cid).collect();
        assert_eq!(cids.len(), 3);
        assert!(cids.contains(&a) && cids.contains(&b) && cids.contains(&c));

        // A later full message replaces everything
        let mut replacement = BitswapMessage::new(true);
        replacement.add_entry(d, 1, WantType::Block, false);
        fx.engine.message_received(fx.remote, replacement).await;

        let wantlist = fx.engine.wantlist_for_peer(&fx.remote).await;
        assert_eq!(wantlist.len(), 1);
        assert_eq!(wantlist[0].cid, d);
    }

    #[tokio::test]
    async fn test_ledger_accounts_bytes_both_ways() {
        let mut fx = fixture().await;
        let served = make_block(b"served block");
        fx.store
            .put(&served.cid, served.block.clone())
            .await
            .unwrap();

        // They want a block we have and send us one of theirs
        let incoming_block = make_block(b"their block");
        let mut message = BitswapMessage::new(false);
        message.push_entry(MessageEntry::new_block(served.cid, 1));
        message.add_block(incoming_block.cid, incoming_block.block.clone());

        let received = fx.engine.message_received(fx.remote, message).await;
        assert_eq!(received, vec![incoming_block.clone()]);

        let response = recv_response(&mut fx.incoming).await;
        assert_eq!(response.blocks().count(), 1);

        let snapshot = fx.engine.ledger(&fx.remote).await.unwrap();
        assert_eq!(snapshot.bytes_sent, served.block.len() as u64);
        assert_eq!(snapshot.bytes_recv, incoming_block.block.len() as u64);
        assert_eq!(
            snapshot.debt_ratio,
            served.block.len() as f64 / (incoming_block.block.len() + 1) as f64
        );
    }

    #[tokio::test]
    async fn test_want_have_answered_with_presence() {
        let mut fx = fixture().await;
        let held = make_block(b"present");
        fx.store.put(&held.cid, held.block.clone()).await.unwrap();
        let absent = make_block(b"absent").cid;

        let mut message = BitswapMessage::new(false);
        message.push_entry(MessageEntry::new_have(held.cid, 1));
        message.push_entry(MessageEntry::new_block(absent, 1));
        fx.engine.message_received(fx.remote, message).await;

        let response = recv_response(&mut fx.incoming).await;
        assert_eq!(response.blocks().count(), 0);

        let presences: HashMap<Cid, Presence> =
            response.presences().map(|(cid, p)| (*cid, p)).collect();
        assert_eq!(presences.get(&held.cid), Some(&Presence::Have));
        assert_eq!(presences.get(&absent), Some(&Presence::DontHave));
    }

    #[tokio::test]
    async fn test_disconnect_retains_ledger() {
        let fx = fixture().await;
        let mut message = BitswapMessage::new(false);
        let pair = make_block(b"kept");
        message.add_block(pair.cid, pair.block.clone());
        fx.engine.message_received(fx.remote, message).await;

        fx.engine.peer_disconnected(&fx.remote).await;

        let snapshot = fx.engine.ledger(&fx.remote).await.unwrap();
        assert_eq!(snapshot.bytes_recv, pair.block.len() as u64);
    }

    #[tokio::test]
    async fn test_notify_new_blocks_serves_interested_peer() {
        let mut fx = fixture().await;
        let pair = make_block(b"arrives later");

        let mut message = BitswapMessage::new(false);
        message.push_entry(MessageEntry::new_block(pair.cid, 1));
        fx.engine.message_received(fx.remote, message).await;

        // Nothing to send yet: the store is empty, only a DontHave goes out
        let first = recv_response(&mut fx.incoming).await;
        assert_eq!(first.blocks().count(), 0);

        fx.store.put(&pair.cid, pair.block.clone()).await.unwrap();
        fx.engine.notify_new_blocks(&[pair.cid]).await;

        let second = recv_response(&mut fx.incoming).await;
        let blocks: Vec<_> = second.blocks().collect();
        assert_eq!(blocks.len(), 1);
        assert_eq!(*blocks[0].0, pair.cid);

        // The answered want is settled
        assert!(fx.engine.wantlist_for_peer(&fx.remote).await.is_empty());
    }
}
