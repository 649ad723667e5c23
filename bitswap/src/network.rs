//! Network adapter for the Bitswap engine
//!
//! Binds protocol handlers on the transport, dials peers and opens
//! outbound streams with protocol negotiation, frames messages with a
//! varint length prefix, and forwards decoded messages and connection
//! events to the engine. Provider lookups delegate to the routing
//! collaborator.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use libp2p::PeerId;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, trace, warn};
use unsigned_varint::codec::UviBytes;

use crate::{
    constants::*,
    message::{BitswapMessage, HasherRegistry},
    transport::{IncomingStream, TopologyEvent, Transport},
    Result,
};
use bitswap_interface::{AwaitIterable, BitswapError, PeerInfo, Routing};

/// Events surfaced to the engine's event loop
#[derive(Debug)]
pub enum NetworkEvent {
    /// A decoded message arrived from a peer
    Message {
        peer: PeerId,
        message: BitswapMessage,
    },
    /// A connection to a peer was established
    PeerConnected(PeerId),
    /// A connection to a peer was closed
    PeerDisconnected(PeerId),
    /// An inbound stream failed to decode; the stream was closed, the peer
    /// stays connected
    ReceiveError(BitswapError),
}

/// Network adapter configuration
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Restrict to the legacy `/ipfs/bitswap/1.0.0` protocol
    pub b100_only: bool,
    /// Providers connected to per `find_and_connect`
    pub max_providers_per_request: usize,
    /// Inbound stream idle timeout; resets on every received frame
    pub incoming_stream_timeout: Duration,
    /// Outgoing messages above this size are split
    pub max_outgoing_message_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            b100_only: false,
            max_providers_per_request: DEFAULT_MAX_PROVIDERS_PER_REQUEST,
            incoming_stream_timeout: Duration::from_millis(DEFAULT_INCOMING_STREAM_TIMEOUT),
            max_outgoing_message_size: DEFAULT_MAX_OUTGOING_MESSAGE_SIZE,
        }
    }
}

/// Network component binding the transport and routing collaborators
pub struct Network {
    transport: Arc<dyn Transport>,
    routing: Arc<dyn Routing>,
    config: NetworkConfig,
    hashers: Arc<HasherRegistry>,
    running: Arc<RwLock<bool>>,
    event_tx: mpsc::UnboundedSender<NetworkEvent>,
    event_rx: StdMutex<Option<mpsc::UnboundedReceiver<NetworkEvent>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Network {
    /// Create a new network adapter
    pub fn new(
        transport: Arc<dyn Transport>,
        routing: Arc<dyn Routing>,
        hashers: Arc<HasherRegistry>,
        config: NetworkConfig,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            routing,
            config,
            hashers,
            running: Arc::new(RwLock::new(false)),
            event_tx,
            event_rx: StdMutex::new(Some(event_rx)),
            tasks: StdMutex::new(Vec::new()),
        }
    }

    /// The protocols this node advertises, newest first
    pub fn protocols(&self) -> Vec<ProtocolId> {
        if self.config.b100_only {
            vec![ProtocolId::B100]
        } else {
            BITSWAP_PROTOCOLS.to_vec()
        }
    }

    /// Take the event receiver; available once per adapter
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<NetworkEvent>> {
        self.event_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Whether the adapter is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Register protocol handlers and begin accepting streams
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if *running {
            return Ok(());
        }

        info!(
            "starting bitswap network with protocols {:?}",
            self.protocols()
        );

        let mut incoming = self.transport.register_handler(self.protocols()).await?;
        let event_tx = self.event_tx.clone();
        let hashers = self.hashers.clone();
        let idle_timeout = self.config.incoming_stream_timeout;

        let accept = tokio::spawn(async move {
            // Read loops abort with the accept loop when this set drops
            let mut readers = JoinSet::new();
            while let Some(stream) = incoming.recv().await {
                let event_tx = event_tx.clone();
                let hashers = hashers.clone();
                readers.spawn(read_loop(stream, event_tx, hashers, idle_timeout));
                while readers.try_join_next().is_some() {}
            }
        });

        let mut topology = self.transport.subscribe_topology().await;
        let event_tx = self.event_tx.clone();
        let topo = tokio::spawn(async move {
            while let Some(event) = topology.recv().await {
                let forwarded = match event {
                    TopologyEvent::Connected(peer) => NetworkEvent::PeerConnected(peer),
                    TopologyEvent::Disconnected(peer) => NetworkEvent::PeerDisconnected(peer),
                };
                if event_tx.send(forwarded).is_err() {
                    break;
                }
            }
        });

        // Replay connections that were already open before start
        for peer in self.transport.connections().await {
            let _ = self.event_tx.send(NetworkEvent::PeerConnected(peer));
        }

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(accept);
        tasks.push(topo);
        *running = true;
        Ok(())
    }

    /// Unregister handlers and abort in-flight I/O
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if !*running {
            return Ok(());
        }

        info!("stopping bitswap network");
        self.transport.unregister_handler().await;
        let tasks = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for task in tasks {
            task.abort();
        }
        *running = false;
        Ok(())
    }

    /// Ensure a connection to a peer exists
    pub async fn connect_to(&self, peer: &PeerId) -> Result<()> {
        if !*self.running.read().await {
            return Err(BitswapError::NotStarted);
        }
        self.transport.dial(peer).await
    }

    /// Send a message to a peer on a fresh stream.
    ///
    /// Dials if needed, negotiates the best protocol, serializes for the
    /// negotiated version, writes length-prefixed frames and closes the
    /// stream. Oversized messages are split into several frames.
    pub async fn send_message(&self, peer: &PeerId, message: BitswapMessage) -> Result<()> {
        if !*self.running.read().await {
            return Err(BitswapError::NotStarted);
        }
        if message.is_empty() {
            return Ok(());
        }

        self.transport.dial(peer).await?;
        let stream = self
            .transport
            .open_stream(peer, &self.protocols())
            .await?;
        let protocol = stream.protocol;
        trace!("sending message to {} over {}", peer, protocol);

        let mut framed = FramedWrite::new(stream.io, UviBytes::<Bytes>::default());
        for part in message.split(self.config.max_outgoing_message_size) {
            framed.send(Bytes::from(part.serialize(protocol))).await?;
        }

        let mut io = framed.into_inner();
        io.shutdown().await?;
        Ok(())
    }

    /// Find providers for a CID through the routing collaborator
    pub async fn find_providers(&self, cid: &cid::Cid) -> Result<AwaitIterable<PeerInfo>> {
        self.routing.find_providers(cid).await
    }

    /// Find providers and connect to up to the configured number of them in
    /// parallel, ignoring per-peer dial failures. Returns `(connected,
    /// failed)` counts.
    pub async fn find_and_connect(&self, cid: &cid::Cid) -> Result<(usize, usize)> {
        let providers = self.routing.find_providers(cid).await?;
        let candidates: Vec<PeerInfo> = providers
            .take(self.config.max_providers_per_request)
            .collect()
            .await;

        let dials = candidates.iter().map(|provider| {
            let transport = self.transport.clone();
            let peer = provider.id;
            async move { transport.dial(&peer).await.map_err(|e| (peer, e)) }
        });

        let mut connected = 0;
        let mut failed = 0;
        for outcome in futures::future::join_all(dials).await {
            match outcome {
                Ok(()) => connected += 1,
                Err((peer, e)) => {
                    debug!("could not connect to provider {}: {}", peer, e);
                    failed += 1;
                }
            }
        }
        Ok((connected, failed))
    }

    /// Announce this node as a provider for a CID
    pub async fn provide(&self, cid: &cid::Cid) -> Result<()> {
        self.routing.provide(cid).await
    }
}

/// Per-stream read loop: length-prefixed frames, decoded for the stream's
/// negotiated protocol, with a reset-on-data idle timeout
async fn read_loop(
    stream: IncomingStream,
    event_tx: mpsc::UnboundedSender<NetworkEvent>,
    hashers: Arc<HasherRegistry>,
    idle_timeout: Duration,
) {
    let peer = stream.peer;
    let protocol = stream.protocol;
    let mut framed = FramedRead::new(stream.io, UviBytes::<Bytes>::default());

    loop {
        let frame = match tokio::time::timeout(idle_timeout, framed.next()).await {
            Err(_) => {
                debug!("stream from {} idle for {:?}, aborting", peer, idle_timeout);
                let _ = event_tx.send(NetworkEvent::ReceiveError(BitswapError::Timeout));
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                warn!("stream from {} failed: {}", peer, e);
                let _ = event_tx.send(NetworkEvent::ReceiveError(e.into()));
                return;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match BitswapMessage::deserialize(&frame, protocol, &hashers) {
            Ok(message) => {
                trace!(
                    "message from {} over {}: {} entries, {} blocks",
                    peer,
                    protocol,
                    message.entries().count(),
                    message.blocks().count()
                );
                if event_tx
                    .send(NetworkEvent::Message { peer, message })
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                warn!("undecodable message from {}: {}", peer, e);
                let _ = event_tx.send(NetworkEvent::ReceiveError(e));
                return;
            }
        }
    }
}
