//! Per-peer exchange accounting
//!
//! One ledger exists per remote peer for the lifetime of the engine. It
//! tracks the bytes exchanged in both directions and the wantlist the peer
//! has sent us. The debt ratio feeds peer selection: a high ratio means we
//! have sent far more than we received.

use cid::Cid;
use libp2p::PeerId;
use serde::Serialize;

use crate::{Wantlist, WantType};

/// Accounting for a single remote peer
#[derive(Debug, Clone)]
pub struct Ledger {
    /// The remote peer
    pub peer: PeerId,
    /// Total block bytes sent to this peer
    pub bytes_sent: u64,
    /// Total block bytes received from this peer
    pub bytes_recv: u64,
    /// Number of exchanges (messages carrying blocks) in either direction
    pub exchanged: u64,
    /// The wantlist this peer has sent us
    wantlist: Wantlist,
}

/// Point-in-time copy of a ledger's counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct LedgerSnapshot {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub exchanged: u64,
    pub debt_ratio: f64,
    pub wantlist_len: usize,
}

impl Ledger {
    /// Create a fresh ledger for a peer
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            bytes_sent: 0,
            bytes_recv: 0,
            exchanged: 0,
            wantlist: Wantlist::new(),
        }
    }

    /// Record block bytes sent to this peer
    pub fn sent_bytes(&mut self, n: u64) {
        self.bytes_sent += n;
        self.exchanged += 1;
    }

    /// Record block bytes received from this peer
    pub fn received_bytes(&mut self, n: u64) {
        self.bytes_recv += n;
        self.exchanged += 1;
    }

    /// `bytes_sent / (bytes_recv + 1)`
    pub fn debt_ratio(&self) -> f64 {
        self.bytes_sent as f64 / (self.bytes_recv + 1) as f64
    }

    /// Record a want from this peer
    pub fn wants(&mut self, cid: Cid, priority: i32, want_type: WantType, send_dont_have: bool) {
        self.wantlist
            .add_flagged(cid, priority, want_type, send_dont_have);
    }

    /// Drop a want, e.g. on cancel or after the block was sent
    pub fn cancel_want(&mut self, cid: &Cid) -> bool {
        self.wantlist.remove_force(cid)
    }

    /// Replace the whole wantlist (a `full` message arrived)
    pub fn replace_wantlist(&mut self, wantlist: Wantlist) {
        self.wantlist = wantlist;
    }

    /// The peer's current wantlist as known to us
    pub fn wantlist(&self) -> &Wantlist {
        &self.wantlist
    }

    /// Counters as a plain snapshot
    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            bytes_sent: self.bytes_sent,
            bytes_recv: self.bytes_recv,
            exchanged: self.exchanged,
            debt_ratio: self.debt_ratio(),
            wantlist_len: self.wantlist.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use multihash::Multihash;
    use sha2::{Digest, Sha256};

    fn make_cid(data: &[u8]) -> Cid {
        let digest = Sha256::digest(data);
        let mh = Multihash::wrap(0x12, &digest).unwrap();
        Cid::new_v1(0x55, mh)
    }

    #[test]
    fn test_debt_ratio_is_exact() {
        let mut ledger = Ledger::new(PeerId::random());
        assert_eq!(ledger.debt_ratio(), 0.0);

        ledger.sent_bytes(100);
        assert_eq!(ledger.debt_ratio(), 100.0 / 1.0);

        ledger.received_bytes(49);
        assert_eq!(ledger.debt_ratio(), 100.0 / 50.0);
        assert_eq!(ledger.exchanged, 2);
    }

    #[test]
    fn test_wantlist_tracking() {
        let mut ledger = Ledger::new(PeerId::random());
        let cid = make_cid(b"wanted");

        ledger.wants(cid, 5, WantType::Block, true);
        assert!(ledger.wantlist().contains(&cid));

        assert!(ledger.cancel_want(&cid));
        assert!(!ledger.wantlist().contains(&cid));
    }

    #[test]
    fn test_replace_wantlist() {
        let mut ledger = Ledger::new(PeerId::random());
        ledger.wants(make_cid(b"old"), 1, WantType::Block, true);

        let mut replacement = Wantlist::new();
        replacement.add(make_cid(b"new"), 1, WantType::Block);
        ledger.replace_wantlist(replacement);

        assert!(!ledger.wantlist().contains(&make_cid(b"old")));
        assert!(ledger.wantlist().contains(&make_cid(b"new")));
    }
}
