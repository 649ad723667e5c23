//! Session coordinator: the `get`/`put`/`unwant` surface
//!
//! Binds the block store, the routing provider, the want-manager and the
//! decision engine together. Local getters park on one-shot notifiers in a
//! pending registry; blocks arriving from the network or from a local `put`
//! wake every getter of that CID, cancel the want everywhere, and are
//! offered to peers whose ledgers mention them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use cid::Cid;
use futures::stream::{FuturesUnordered, StreamExt};
use libp2p::PeerId;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::{
    constants::*,
    engine::Engine,
    ledger::LedgerSnapshot,
    message::HasherRegistry,
    network::{Network, NetworkConfig, NetworkEvent},
    stats::{Stats, StatsSnapshot},
    transport::Transport,
    want_manager::WantManager,
    wantlist::WantlistEntry,
    Result, WantType,
};
use bitswap_interface::{AwaitIterable, BitswapError, BlockStore, Pair, Routing};

/// Engine configuration
#[derive(Clone)]
pub struct BitswapConfig {
    /// Restrict to the legacy `/ipfs/bitswap/1.0.0` protocol
    pub b100_only: bool,
    /// Providers connected to per `find_and_connect` request
    pub max_providers_per_request: usize,
    /// Debounce window for outbound wantlist updates
    pub wantlist_send_debounce: Duration,
    /// Idle timeout for inbound streams
    pub incoming_stream_timeout: Duration,
    /// Inbound stream bound, enforced by the transport
    pub max_inbound_streams: usize,
    /// Outbound stream bound, enforced by the transport
    pub max_outbound_streams: usize,
    /// Outgoing messages above this size are split
    pub max_outgoing_message_size: usize,
    /// Multihash codes this node can digest when decoding payloads
    pub hashers: HasherRegistry,
}

impl Default for BitswapConfig {
    fn default() -> Self {
        Self {
            b100_only: false,
            max_providers_per_request: DEFAULT_MAX_PROVIDERS_PER_REQUEST,
            wantlist_send_debounce: Duration::from_millis(DEFAULT_WANTLIST_SEND_DEBOUNCE),
            incoming_stream_timeout: Duration::from_millis(DEFAULT_INCOMING_STREAM_TIMEOUT),
            max_inbound_streams: DEFAULT_MAX_INBOUND_STREAMS,
            max_outbound_streams: DEFAULT_MAX_OUTBOUND_STREAMS,
            max_outgoing_message_size: DEFAULT_MAX_OUTGOING_MESSAGE_SIZE,
            hashers: HasherRegistry::default(),
        }
    }
}

impl std::fmt::Debug for BitswapConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitswapConfig")
            .field("b100_only", &self.b100_only)
            .field("max_providers_per_request", &self.max_providers_per_request)
            .field("wantlist_send_debounce", &self.wantlist_send_debounce)
            .field("incoming_stream_timeout", &self.incoming_stream_timeout)
            .finish_non_exhaustive()
    }
}

struct PendingWant {
    waiters: HashMap<u64, oneshot::Sender<Result<Bytes>>>,
    next_id: u64,
}

/// Registry of one-shot notifiers per wanted CID.
///
/// A CID moves Absent -> Wanted on the first `get`, then to Resolved (block
/// arrived) or Cancelled (last getter gone, or `unwant`); both terminal
/// states remove the entry.
#[derive(Default)]
struct PendingRegistry {
    inner: StdMutex<HashMap<Cid, PendingWant>>,
}

impl PendingRegistry {
    fn register(&self, cid: Cid) -> (u64, oneshot::Receiver<Result<Bytes>>) {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = inner.entry(cid).or_insert_with(|| PendingWant {
            waiters: HashMap::new(),
            next_id: 0,
        });
        let id = entry.next_id;
        entry.next_id += 1;
        entry.waiters.insert(id, tx);
        (id, rx)
    }

    /// Remove one waiter; returns `true` when it was still registered
    fn remove_waiter(&self, cid: &Cid, id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.get_mut(cid) {
            Some(entry) => {
                let removed = entry.waiters.remove(&id).is_some();
                if entry.waiters.is_empty() {
                    inner.remove(cid);
                }
                removed
            }
            None => false,
        }
    }

    /// Deliver a block to every waiter of its CID; returns how many woke
    fn resolve(&self, cid: &Cid, block: &Bytes) -> usize {
        let entry = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(cid);
        match entry {
            Some(entry) => {
                let mut woken = 0;
                for (_, tx) in entry.waiters {
                    if tx.send(Ok(block.clone())).is_ok() {
                        woken += 1;
                    }
                }
                woken
            }
            None => 0,
        }
    }

    /// Fail every waiter of a CID; returns how many were failed
    fn fail(&self, cid: &Cid, error: impl Fn() -> BitswapError) -> usize {
        let entry = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(cid);
        match entry {
            Some(entry) => {
                let count = entry.waiters.len();
                for (_, tx) in entry.waiters {
                    let _ = tx.send(Err(error()));
                }
                count
            }
            None => 0,
        }
    }

    /// Fail everything; used at shutdown
    fn fail_all(&self) {
        let entries = std::mem::take(&mut *self.inner.lock().unwrap_or_else(|e| e.into_inner()));
        for (_, entry) in entries {
            for (_, tx) in entry.waiters {
                let _ = tx.send(Err(BitswapError::Aborted));
            }
        }
    }

    fn waiter_count(&self, cid: &Cid) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(cid)
            .map(|entry| entry.waiters.len())
            .unwrap_or(0)
    }
}

/// Releases a getter's registration if its future is dropped before the
/// block arrives; the last one out cancels the want
struct WaiterGuard {
    pending: Arc<PendingRegistry>,
    want_manager: Arc<WantManager>,
    cid: Cid,
    id: u64,
    armed: bool,
}

impl WaiterGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.pending.remove_waiter(&self.cid, self.id) {
            let want_manager = self.want_manager.clone();
            let cid = self.cid;
            tokio::spawn(async move {
                want_manager.cancel_wants(&[cid]).await;
            });
        }
    }
}

struct Shared {
    store: Arc<dyn BlockStore>,
    network: Arc<Network>,
    want_manager: Arc<WantManager>,
    engine: Arc<Engine>,
    stats: Arc<Stats>,
    pending: Arc<PendingRegistry>,
}

impl Shared {
    /// Blocks decoded off the wire: account, store, then fan out
    async fn deliver_received(&self, blocks: Vec<Pair>) {
        for pair in &blocks {
            let len = pair.block.len() as u64;
            self.stats.record_block_received(len);
            if self.pending.waiter_count(&pair.cid) == 0
                && matches!(self.store.has(&pair.cid).await, Ok(true))
            {
                self.stats.record_duplicate(len);
            }
        }

        if let Err(e) = self.store.put_many(blocks.clone()).await {
            warn!("failed to store {} received blocks: {}", blocks.len(), e);
        }
        self.fan_out(blocks, false).await;
    }

    /// Wake waiters, retire wants, and offer the blocks to interested peers
    async fn fan_out(&self, blocks: Vec<Pair>, announce: bool) {
        let cids: Vec<Cid> = blocks.iter().map(|pair| pair.cid).collect();

        for pair in &blocks {
            let woken = self.pending.resolve(&pair.cid, &pair.block);
            if woken > 0 {
                trace!("woke {} getters of {}", woken, pair.cid);
            }
        }

        // All local demand is satisfied; refcount drops to zero and a
        // single cancel goes out per CID that was wanted
        self.want_manager.cancel_wants_force(&cids).await;
        self.engine.notify_new_blocks(&cids).await;

        if announce {
            for cid in cids {
                let network = self.network.clone();
                tokio::spawn(async move {
                    if let Err(e) = network.provide(&cid).await {
                        debug!("provide for {} failed: {}", cid, e);
                    }
                });
            }
        }
    }
}

/// The Bitswap engine's client surface
pub struct Bitswap {
    shared: Arc<Shared>,
    running: Arc<RwLock<bool>>,
    event_task: StdMutex<Option<JoinHandle<()>>>,
}

impl Bitswap {
    /// Assemble an engine over a block store, a transport and a routing
    /// provider
    pub fn new(
        store: Arc<dyn BlockStore>,
        transport: Arc<dyn Transport>,
        routing: Arc<dyn Routing>,
        config: BitswapConfig,
    ) -> Self {
        let network = Arc::new(Network::new(
            transport,
            routing,
            Arc::new(config.hashers.clone()),
            NetworkConfig {
                b100_only: config.b100_only,
                max_providers_per_request: config.max_providers_per_request,
                incoming_stream_timeout: config.incoming_stream_timeout,
                max_outgoing_message_size: config.max_outgoing_message_size,
            },
        ));
        let stats = Arc::new(Stats::default());
        let want_manager = Arc::new(WantManager::new(
            network.clone(),
            config.wantlist_send_debounce,
        ));
        let engine = Arc::new(Engine::new(store.clone(), network.clone(), stats.clone()));

        Self {
            shared: Arc::new(Shared {
                store,
                network,
                want_manager,
                engine,
                stats,
                pending: Arc::new(PendingRegistry::default()),
            }),
            running: Arc::new(RwLock::new(false)),
            event_task: StdMutex::new(None),
        }
    }

    /// Start the engine: network handlers, want-manager, and the event loop
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if *running {
            return Ok(());
        }

        info!("starting bitswap");
        self.shared.network.start().await?;
        self.shared.want_manager.run().await;

        let events = self
            .shared
            .network
            .take_events()
            .ok_or_else(|| BitswapError::other("engine cannot be restarted after stop"))?;
        let shared = self.shared.clone();
        let task = tokio::spawn(event_loop(shared, events));
        *self
            .event_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(task);

        *running = true;
        Ok(())
    }

    /// Stop the engine, aborting in-flight network I/O and failing pending
    /// getters; the block store is untouched
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if !*running {
            return Ok(());
        }

        info!("stopping bitswap");
        if let Some(task) = self
            .event_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        self.shared.want_manager.stop().await;
        self.shared.network.stop().await?;
        self.shared.pending.fail_all();
        *running = false;
        Ok(())
    }

    /// Whether the engine is running
    pub async fn is_started(&self) -> bool {
        *self.running.read().await
    }

    /// Fetch a block, from the local store if present, otherwise from the
    /// network.
    ///
    /// Concurrent getters of one CID share a single want; dropping the last
    /// getter broadcasts a cancel. The future resolves when the block is
    /// stored locally, and fails with [`BitswapError::Unwanted`] if
    /// [`Bitswap::unwant`] is called first.
    pub async fn get(&self, cid: &Cid) -> Result<Bytes> {
        if !self.is_started().await {
            return Err(BitswapError::NotStarted);
        }

        if self.shared.store.has(cid).await? {
            trace!("{} served from the local store", cid);
            return self.shared.store.get(cid).await;
        }

        let (id, rx) = self.shared.pending.register(*cid);

        // The block may have landed between the check and registration
        if matches!(self.shared.store.has(cid).await, Ok(true)) {
            self.shared.pending.remove_waiter(cid, id);
            return self.shared.store.get(cid).await;
        }

        let guard = WaiterGuard {
            pending: self.shared.pending.clone(),
            want_manager: self.shared.want_manager.clone(),
            cid: *cid,
            id,
            armed: true,
        };

        debug!("want {}", cid);
        self.shared
            .want_manager
            .want_blocks(&[*cid], DEFAULT_PRIORITY, WantType::Block)
            .await;

        // Provider discovery runs in the background and never fails the get
        let network = self.shared.network.clone();
        let stats = self.shared.stats.clone();
        let target = *cid;
        tokio::spawn(async move {
            match network.find_and_connect(&target).await {
                Ok((connected, failed)) => {
                    if failed > 0 {
                        stats.record_provider_dial_failures(failed as u64);
                    }
                    trace!("connected to {} providers of {}", connected, target);
                }
                Err(e) => debug!("provider lookup for {} failed: {}", target, e),
            }
        });

        let result = match rx.await {
            Ok(result) => result,
            Err(_) => Err(BitswapError::Aborted),
        };
        guard.disarm();
        result
    }

    /// Fetch many blocks, yielding each as it arrives rather than in
    /// request order
    pub fn get_many(self: &Arc<Self>, cids: Vec<Cid>) -> AwaitIterable<Result<Pair>> {
        let this = self.clone();
        Box::pin(async_stream::stream! {
            let mut lookups: FuturesUnordered<_> = cids
                .into_iter()
                .map(|cid| {
                    let this = this.clone();
                    async move { this.get(&cid).await.map(|block| Pair::new(cid, block)) }
                })
                .collect();
            while let Some(result) = lookups.next().await {
                yield result;
            }
        })
    }

    /// Store a block, wake its getters, retire the want and announce it
    pub async fn put(&self, pair: Pair) -> Result<()> {
        if !self.is_started().await {
            return Err(BitswapError::NotStarted);
        }
        self.shared.store.put(&pair.cid, pair.block.clone()).await?;
        self.shared.fan_out(vec![pair], true).await;
        Ok(())
    }

    /// [`Bitswap::put`] for many blocks at once
    pub async fn put_many(&self, pairs: Vec<Pair>) -> Result<()> {
        if !self.is_started().await {
            return Err(BitswapError::NotStarted);
        }
        self.shared.store.put_many(pairs.clone()).await?;
        self.shared.fan_out(pairs, true).await;
        Ok(())
    }

    /// Abandon a CID: every pending getter fails with
    /// [`BitswapError::Unwanted`] and the want is cancelled everywhere
    /// regardless of how many getters held it
    pub async fn unwant(&self, cid: &Cid) {
        let failed = self
            .shared
            .pending
            .fail(cid, || BitswapError::Unwanted { cid: *cid });
        if failed > 0 {
            debug!("failed {} getters of {}", failed, cid);
        }
        self.shared.want_manager.cancel_wants_force(&[*cid]).await;
    }

    /// Snapshot of this node's wantlist
    pub async fn wantlist(&self) -> Vec<WantlistEntry> {
        self.shared.want_manager.wantlist().await
    }

    /// The wantlist a peer has sent us
    pub async fn wantlist_for_peer(&self, peer: &PeerId) -> Vec<WantlistEntry> {
        self.shared.engine.wantlist_for_peer(peer).await
    }

    /// A peer's ledger counters, if we have exchanged anything with it
    pub async fn ledger(&self, peer: &PeerId) -> Option<LedgerSnapshot> {
        self.shared.engine.ledger(peer).await
    }

    /// Aggregate exchange counters
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }
}

async fn event_loop(
    shared: Arc<Shared>,
    mut events: tokio::sync::mpsc::UnboundedReceiver<NetworkEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            NetworkEvent::Message { peer, message } => {
                let blocks = shared.engine.message_received(peer, message).await;
                if !blocks.is_empty() {
                    shared.deliver_received(blocks).await;
                }
            }
            NetworkEvent::PeerConnected(peer) => {
                debug!("peer connected: {}", peer);
                shared.want_manager.connected(peer).await;
                shared.engine.peer_connected(peer).await;
            }
            NetworkEvent::PeerDisconnected(peer) => {
                debug!("peer disconnected: {}", peer);
                shared.want_manager.disconnected(&peer).await;
                shared.engine.peer_disconnected(&peer).await;
            }
            NetworkEvent::ReceiveError(error) => shared.engine.receive_error(error),
        }
    }
}
