//! Transport contract and an in-memory implementation for testing
//!
//! The real peer-to-peer transport (dialing, stream multiplexing, peer
//! discovery) lives outside the engine; this module defines the seam the
//! network adapter talks to. [`MemoryTransport`] wires engines together
//! over in-process byte pipes with real protocol negotiation and framing,
//! which is what the test-suite runs on.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use cid::Cid;
use futures::stream;
use libp2p::PeerId;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{constants::ProtocolId, Result};
use bitswap_interface::{AwaitIterable, BitswapError, PeerInfo, Routing};

/// Buffer size of the in-memory byte pipes
const PIPE_CAPACITY: usize = 256 * 1024;

/// An inbound stream handed to the protocol handler
pub struct IncomingStream {
    /// The dialling peer
    pub peer: PeerId,
    /// The protocol negotiated for this stream
    pub protocol: ProtocolId,
    /// Read half of the stream
    pub io: Box<dyn AsyncRead + Send + Unpin>,
}

/// An outbound stream with its negotiated protocol
pub struct OutboundStream {
    /// The protocol negotiated for this stream
    pub protocol: ProtocolId,
    /// Write half of the stream; closing it ends the remote's read loop
    pub io: Box<dyn AsyncWrite + Send + Unpin>,
}

impl std::fmt::Debug for OutboundStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundStream")
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

/// Connection lifecycle notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyEvent {
    Connected(PeerId),
    Disconnected(PeerId),
}

/// The transport seam between the engine and the host's networking stack
#[async_trait]
pub trait Transport: Send + Sync {
    /// Register a handler for the given protocols; inbound streams arrive
    /// on the returned receiver until [`Transport::unregister_handler`]
    async fn register_handler(
        &self,
        protocols: Vec<ProtocolId>,
    ) -> Result<mpsc::Receiver<IncomingStream>>;

    /// Remove the registered handler; new inbound streams are refused
    async fn unregister_handler(&self);

    /// Subscribe to connect/disconnect notifications
    async fn subscribe_topology(&self) -> mpsc::UnboundedReceiver<TopologyEvent>;

    /// Ensure a connection to the peer exists, dialling if necessary
    async fn dial(&self, peer: &PeerId) -> Result<()>;

    /// Open a new stream to the peer, negotiating the first protocol in
    /// `protocols` the remote supports
    async fn open_stream(&self, peer: &PeerId, protocols: &[ProtocolId])
        -> Result<OutboundStream>;

    /// Currently connected peers
    async fn connections(&self) -> Vec<PeerId>;
}

/// Counts live streams against a limit; the transport refuses streams
/// beyond it
#[derive(Debug)]
struct StreamBudget {
    live: AtomicUsize,
    limit: usize,
}

impl StreamBudget {
    fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            live: AtomicUsize::new(0),
            limit,
        })
    }

    fn acquire(self: &Arc<Self>) -> Option<BudgetGuard> {
        let mut current = self.live.load(Ordering::SeqCst);
        loop {
            if current >= self.limit {
                return None;
            }
            match self.live.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(BudgetGuard(self.clone())),
                Err(observed) => current = observed,
            }
        }
    }
}

struct BudgetGuard(Arc<StreamBudget>);

impl Drop for BudgetGuard {
    fn drop(&mut self) {
        self.0.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One half of an in-memory stream, released from its budget on drop
struct GuardedStream {
    inner: DuplexStream,
    _guard: BudgetGuard,
}

impl AsyncRead for GuardedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for GuardedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

struct Handler {
    protocols: Vec<ProtocolId>,
    tx: mpsc::Sender<IncomingStream>,
}

struct EndpointState {
    handler: Mutex<Option<Handler>>,
    topology: Mutex<Vec<mpsc::UnboundedSender<TopologyEvent>>>,
    connections: Mutex<HashSet<PeerId>>,
    inbound: Arc<StreamBudget>,
}

impl EndpointState {
    fn notify(&self, event: TopologyEvent) {
        let mut subs = self.topology.lock().unwrap_or_else(|e| e.into_inner());
        subs.retain(|tx| tx.send(event).is_ok());
    }
}

/// Shared rendezvous for a set of [`MemoryTransport`]s
#[derive(Default)]
pub struct MemoryHub {
    endpoints: Mutex<HashMap<PeerId, Arc<EndpointState>>>,
}

impl MemoryHub {
    /// Create an empty hub
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn endpoint(&self, peer: &PeerId) -> Option<Arc<EndpointState>> {
        self.endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer)
            .cloned()
    }
}

/// In-memory [`Transport`] joined to other endpoints through a [`MemoryHub`]
pub struct MemoryTransport {
    peer: PeerId,
    hub: Arc<MemoryHub>,
    state: Arc<EndpointState>,
    outbound: Arc<StreamBudget>,
}

impl MemoryTransport {
    /// Register a new endpoint on the hub
    pub fn new(
        hub: Arc<MemoryHub>,
        peer: PeerId,
        max_inbound_streams: usize,
        max_outbound_streams: usize,
    ) -> Arc<Self> {
        let state = Arc::new(EndpointState {
            handler: Mutex::new(None),
            topology: Mutex::new(Vec::new()),
            connections: Mutex::new(HashSet::new()),
            inbound: StreamBudget::new(max_inbound_streams),
        });
        hub.endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer, state.clone());
        Arc::new(Self {
            peer,
            hub,
            state,
            outbound: StreamBudget::new(max_outbound_streams),
        })
    }

    /// The local peer id
    pub fn local_peer(&self) -> PeerId {
        self.peer
    }

    /// Tear down the connection to a peer, notifying both sides
    pub fn disconnect(&self, peer: &PeerId) {
        let was_connected = self
            .state
            .connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peer);
        if !was_connected {
            return;
        }
        self.state.notify(TopologyEvent::Disconnected(*peer));

        if let Some(remote) = self.hub.endpoint(peer) {
            remote
                .connections
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.peer);
            remote.notify(TopologyEvent::Disconnected(self.peer));
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn register_handler(
        &self,
        protocols: Vec<ProtocolId>,
    ) -> Result<mpsc::Receiver<IncomingStream>> {
        let (tx, rx) = mpsc::channel(64);
        let mut handler = self.state.handler.lock().unwrap_or_else(|e| e.into_inner());
        *handler = Some(Handler { protocols, tx });
        Ok(rx)
    }

    async fn unregister_handler(&self) {
        let mut handler = self.state.handler.lock().unwrap_or_else(|e| e.into_inner());
        *handler = None;
    }

    async fn subscribe_topology(&self) -> mpsc::UnboundedReceiver<TopologyEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .topology
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    async fn dial(&self, peer: &PeerId) -> Result<()> {
        if *peer == self.peer {
            return Err(BitswapError::dial(*peer, "cannot dial self"));
        }
        let remote = self
            .hub
            .endpoint(peer)
            .ok_or_else(|| BitswapError::dial(*peer, "peer unreachable"))?;

        let newly_connected = self
            .state
            .connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(*peer);
        if newly_connected {
            self.state.notify(TopologyEvent::Connected(*peer));
        }

        let remote_new = remote
            .connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(self.peer);
        if remote_new {
            remote.notify(TopologyEvent::Connected(self.peer));
        }

        Ok(())
    }

    async fn open_stream(
        &self,
        peer: &PeerId,
        protocols: &[ProtocolId],
    ) -> Result<OutboundStream> {
        let remote = self
            .hub
            .endpoint(peer)
            .ok_or_else(|| BitswapError::dial(*peer, "peer unreachable"))?;

        let (remote_protocols, remote_tx) = {
            let handler = remote.handler.lock().unwrap_or_else(|e| e.into_inner());
            let handler = handler
                .as_ref()
                .ok_or_else(|| BitswapError::network(format!("{} has no handler", peer)))?;
            (handler.protocols.clone(), handler.tx.clone())
        };

        // Our preference order wins; first mutually supported protocol
        let protocol = protocols
            .iter()
            .copied()
            .find(|p| remote_protocols.contains(p))
            .ok_or_else(|| {
                BitswapError::network(format!("no common protocol with {}", peer))
            })?;

        let local_guard = self
            .outbound
            .acquire()
            .ok_or_else(|| BitswapError::network("outbound stream limit reached"))?;
        let remote_guard = remote
            .inbound
            .acquire()
            .ok_or_else(|| BitswapError::network(format!("{} refused stream", peer)))?;

        let (local_io, remote_io) = tokio::io::duplex(PIPE_CAPACITY);
        let incoming = IncomingStream {
            peer: self.peer,
            protocol,
            io: Box::new(GuardedStream {
                inner: remote_io,
                _guard: remote_guard,
            }),
        };
        remote_tx
            .send(incoming)
            .await
            .map_err(|_| BitswapError::network(format!("{} stopped accepting streams", peer)))?;

        Ok(OutboundStream {
            protocol,
            io: Box::new(GuardedStream {
                inner: local_io,
                _guard: local_guard,
            }),
        })
    }

    async fn connections(&self) -> Vec<PeerId> {
        self.state
            .connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect()
    }
}

/// In-memory provider records shared between [`MemoryRouting`] instances
#[derive(Default)]
pub struct MemoryRoutingHub {
    providers: Mutex<HashMap<Cid, Vec<PeerId>>>,
}

impl MemoryRoutingHub {
    /// Create an empty provider registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// In-memory [`Routing`] backed by a shared provider registry
pub struct MemoryRouting {
    local: PeerId,
    hub: Arc<MemoryRoutingHub>,
}

impl MemoryRouting {
    /// Create a routing view for one peer
    pub fn new(hub: Arc<MemoryRoutingHub>, local: PeerId) -> Arc<Self> {
        Arc::new(Self { local, hub })
    }
}

#[async_trait]
impl Routing for MemoryRouting {
    async fn find_providers(&self, cid: &Cid) -> Result<AwaitIterable<PeerInfo>> {
        let local = self.local;
        let providers: Vec<PeerInfo> = self
            .hub
            .providers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(cid)
            .map(|peers| {
                peers
                    .iter()
                    .filter(|p| **p != local)
                    .map(|p| PeerInfo::new(*p))
                    .collect()
            })
            .unwrap_or_default();
        debug!("{} providers for {}", providers.len(), cid);
        Ok(Box::pin(stream::iter(providers)))
    }

    async fn provide(&self, cid: &Cid) -> Result<()> {
        let mut providers = self
            .hub
            .providers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let entry = providers.entry(*cid).or_default();
        if !entry.contains(&self.local) {
            entry.push(self.local);
        }
        Ok(())
    }
}

/// A [`Routing`] that knows no providers; for nodes running without a DHT
#[derive(Debug, Default)]
pub struct NullRouting;

#[async_trait]
impl Routing for NullRouting {
    async fn find_providers(&self, _cid: &Cid) -> Result<AwaitIterable<PeerInfo>> {
        Ok(Box::pin(stream::empty()))
    }

    async fn provide(&self, _cid: &Cid) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::BITSWAP_PROTOCOLS;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_dial_notifies_both_sides() {
        let hub = MemoryHub::new();
        let a = MemoryTransport::new(hub.clone(), PeerId::random(), 32, 128);
        let b = MemoryTransport::new(hub.clone(), PeerId::random(), 32, 128);

        let mut a_topo = a.subscribe_topology().await;
        let mut b_topo = b.subscribe_topology().await;
        let _ = b.register_handler(BITSWAP_PROTOCOLS.to_vec()).await.unwrap();

        a.dial(&b.local_peer()).await.unwrap();

        assert_eq!(
            a_topo.recv().await,
            Some(TopologyEvent::Connected(b.local_peer()))
        );
        assert_eq!(
            b_topo.recv().await,
            Some(TopologyEvent::Connected(a.local_peer()))
        );
        assert_eq!(a.connections().await, vec![b.local_peer()]);

        // Dialling again is idempotent
        a.dial(&b.local_peer()).await.unwrap();
        assert!(a_topo.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dial_unknown_peer_fails() {
        let hub = MemoryHub::new();
        let a = MemoryTransport::new(hub, PeerId::random(), 32, 128);
        let err = a.dial(&PeerId::random()).await.unwrap_err();
        assert!(matches!(err, BitswapError::Dial { .. }));
    }

    #[tokio::test]
    async fn test_stream_negotiation_prefers_our_order() {
        let hub = MemoryHub::new();
        let a = MemoryTransport::new(hub.clone(), PeerId::random(), 32, 128);
        let b = MemoryTransport::new(hub.clone(), PeerId::random(), 32, 128);

        let mut incoming = b.register_handler(BITSWAP_PROTOCOLS.to_vec()).await.unwrap();
        a.dial(&b.local_peer()).await.unwrap();

        let mut stream = a
            .open_stream(&b.local_peer(), BITSWAP_PROTOCOLS)
            .await
            .unwrap();
        assert_eq!(stream.protocol, ProtocolId::B120);

        stream.io.write_all(b"ping").await.unwrap();
        stream.io.shutdown().await.unwrap();

        let mut accepted = incoming.recv().await.unwrap();
        assert_eq!(accepted.protocol, ProtocolId::B120);
        assert_eq!(accepted.peer, a.local_peer());

        let mut buf = Vec::new();
        accepted.io.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"ping");
    }

    #[tokio::test]
    async fn test_no_common_protocol() {
        let hub = MemoryHub::new();
        let a = MemoryTransport::new(hub.clone(), PeerId::random(), 32, 128);
        let b = MemoryTransport::new(hub.clone(), PeerId::random(), 32, 128);

        let _incoming = b
            .register_handler(vec![ProtocolId::B110, ProtocolId::B120])
            .await
            .unwrap();
        a.dial(&b.local_peer()).await.unwrap();

        let err = a
            .open_stream(&b.local_peer(), &[ProtocolId::B100])
            .await
            .unwrap_err();
        assert!(matches!(err, BitswapError::Network { .. }));
    }

    #[tokio::test]
    async fn test_inbound_stream_limit_refuses() {
        let hub = MemoryHub::new();
        let a = MemoryTransport::new(hub.clone(), PeerId::random(), 32, 128);
        let b = MemoryTransport::new(hub.clone(), PeerId::random(), 1, 128);

        let _incoming = b.register_handler(BITSWAP_PROTOCOLS.to_vec()).await.unwrap();
        a.dial(&b.local_peer()).await.unwrap();

        let first = a
            .open_stream(&b.local_peer(), BITSWAP_PROTOCOLS)
            .await
            .unwrap();
        let err = a
            .open_stream(&b.local_peer(), BITSWAP_PROTOCOLS)
            .await
            .unwrap_err();
        assert!(matches!(err, BitswapError::Network { .. }));

        // Releasing the first stream frees the budget
        drop(first);
        drop(_incoming);
    }

    #[tokio::test]
    async fn test_memory_routing_round_trip() {
        let hub = MemoryRoutingHub::new();
        let provider = PeerId::random();
        let seeker = PeerId::random();
        let routing_provider = MemoryRouting::new(hub.clone(), provider);
        let routing_seeker = MemoryRouting::new(hub, seeker);

        let cid = Cid::default();
        routing_provider.provide(&cid).await.unwrap();

        use futures::StreamExt;
        let found: Vec<_> = routing_seeker
            .find_providers(&cid)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, provider);
    }
}
