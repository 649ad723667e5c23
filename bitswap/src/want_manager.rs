//! Want-manager: the engine's own wantlist and its fan-out to peers
//!
//! Tracks the blocks this node wants and mirrors every change to the
//! message queue of each connected peer. All peers see the same wantlist;
//! newly connected peers receive it in one `full` message.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cid::Cid;
use libp2p::PeerId;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{
    message::{BitswapMessage, MessageEntry},
    msg_queue::MessageQueue,
    network::Network,
    wantlist::{Wantlist, WantlistEntry},
    WantType,
};

/// Tracks local wants and broadcasts updates to every known peer
pub struct WantManager {
    network: Arc<Network>,
    wantlist: Arc<RwLock<Wantlist>>,
    queues: Arc<RwLock<HashMap<PeerId, Arc<MessageQueue>>>>,
    debounce: Duration,
    running: Arc<RwLock<bool>>,
}

impl WantManager {
    /// Create a want-manager sending through the given network adapter
    pub fn new(network: Arc<Network>, debounce: Duration) -> Self {
        Self {
            network,
            wantlist: Arc::new(RwLock::new(Wantlist::new())),
            queues: Arc::new(RwLock::new(HashMap::new())),
            debounce,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Begin accepting wants
    pub async fn run(&self) {
        *self.running.write().await = true;
        info!("want-manager running");
    }

    /// Stop, cancelling in-flight debounce timers and dropping all queues
    pub async fn stop(&self) {
        *self.running.write().await = false;
        let queues = std::mem::take(&mut *self.queues.write().await);
        for queue in queues.values() {
            queue.stop().await;
        }
        info!("want-manager stopped");
    }

    /// Snapshot of the current wantlist in canonical order
    pub async fn wantlist(&self) -> Vec<WantlistEntry> {
        self.wantlist.read().await.sorted_entries()
    }

    /// The wantlist as seen by one peer; identical to the global list since
    /// updates broadcast to everyone
    pub async fn wantlist_for_peer(&self, _peer: &PeerId) -> Vec<WantlistEntry> {
        self.wantlist().await
    }

    /// Whether a CID is currently wanted
    pub async fn wants(&self, cid: &Cid) -> bool {
        self.wantlist.read().await.contains(cid)
    }

    /// Add wants and broadcast them to every known peer.
    ///
    /// Each call holds one reference per CID; `cancel_wants` releases it.
    pub async fn want_blocks(&self, cids: &[Cid], priority: i32, want_type: WantType) {
        if cids.is_empty() {
            return;
        }

        let mut entries = Vec::with_capacity(cids.len());
        {
            let mut wantlist = self.wantlist.write().await;
            for cid in cids {
                wantlist.add(*cid, priority, want_type);
                entries.push(MessageEntry {
                    cid: *cid,
                    priority,
                    want_type,
                    cancel: false,
                    send_dont_have: want_type == WantType::Block,
                });
            }
        }

        debug!("want {} cids", cids.len());
        for queue in self.queues.read().await.values() {
            queue.add_entries(entries.clone()).await;
        }
    }

    /// Release one reference per CID; a cancel is broadcast only for CIDs
    /// whose reference count reached zero
    pub async fn cancel_wants(&self, cids: &[Cid]) {
        self.cancel_inner(cids, false).await;
    }

    /// Drop CIDs outright regardless of reference count, broadcasting a
    /// cancel for each that was present
    pub async fn cancel_wants_force(&self, cids: &[Cid]) {
        self.cancel_inner(cids, true).await;
    }

    async fn cancel_inner(&self, cids: &[Cid], force: bool) {
        let mut cancels = Vec::new();
        {
            let mut wantlist = self.wantlist.write().await;
            for cid in cids {
                let gone = if force {
                    wantlist.remove_force(cid)
                } else {
                    wantlist.remove(cid)
                };
                if gone {
                    cancels.push(MessageEntry::new_cancel(*cid));
                }
            }
        }

        if cancels.is_empty() {
            return;
        }
        debug!("cancelling {} cids", cancels.len());
        for queue in self.queues.read().await.values() {
            queue.add_entries(cancels.clone()).await;
        }
    }

    /// A peer connected: create its queue if new and send it the full
    /// current wantlist as a single `full` message
    pub async fn connected(&self, peer: PeerId) {
        let queue = {
            let mut queues = self.queues.write().await;
            if let Some(queue) = queues.get(&peer) {
                queue.inc_ref();
                return;
            }
            let queue = Arc::new(MessageQueue::new(
                peer,
                self.network.clone(),
                self.debounce,
            ));
            queue.inc_ref();
            queues.insert(peer, queue.clone());
            queue
        };

        let wantlist = self.wantlist.read().await;
        if wantlist.is_empty() {
            return;
        }
        let mut message = BitswapMessage::new(true);
        for entry in wantlist.sorted_entries() {
            message.push_entry(MessageEntry {
                cid: entry.cid,
                priority: entry.priority,
                want_type: entry.want_type,
                cancel: false,
                send_dont_have: entry.want_type == WantType::Block,
            });
        }
        drop(wantlist);

        debug!("sending full wantlist to {}", peer);
        queue.add_message(message).await;
    }

    /// A peer disconnected: drop its queue once nothing references it
    pub async fn disconnected(&self, peer: &PeerId) {
        let mut queues = self.queues.write().await;
        if let Some(queue) = queues.get(peer) {
            if queue.dec_ref() == 0 {
                queue.stop().await;
                queues.remove(peer);
            }
        }
    }

    /// Peers with live message queues
    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.queues.read().await.keys().copied().collect()
    }
}
