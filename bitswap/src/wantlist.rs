use std::collections::HashMap;

use cid::Cid;

use crate::WantType;

/// Entry in a wantlist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WantlistEntry {
    /// Content ID of the wanted block
    pub cid: Cid,
    /// Priority of this want, higher is more important
    pub priority: i32,
    /// Whether the full block or only a Have answer is wanted
    pub want_type: WantType,
    /// Whether the wanter asked for a DontHave answer when the block is
    /// absent
    pub send_dont_have: bool,
    /// How many holders currently want this CID
    pub ref_count: u32,
    /// Insertion order, used as a tie-break when sorting by priority
    pub(crate) seq: u64,
}

/// Ordered multiset of `(CID, priority, want-type)` with reference counting
#[derive(Debug, Clone, Default)]
pub struct Wantlist {
    entries: HashMap<Cid, WantlistEntry>,
    next_seq: u64,
}

impl Wantlist {
    /// Create an empty wantlist
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a want for a CID.
    ///
    /// If the CID is already present its reference count is incremented and
    /// the priority refreshed; a block want supersedes an existing have
    /// want. Returns `true` when the CID was newly inserted.
    pub fn add(&mut self, cid: Cid, priority: i32, want_type: WantType) -> bool {
        self.add_flagged(cid, priority, want_type, false)
    }

    /// [`Wantlist::add`] carrying the wanter's send-dont-have flag
    pub fn add_flagged(
        &mut self,
        cid: Cid,
        priority: i32,
        want_type: WantType,
        send_dont_have: bool,
    ) -> bool {
        if let Some(entry) = self.entries.get_mut(&cid) {
            entry.ref_count += 1;
            entry.priority = priority;
            entry.send_dont_have = entry.send_dont_have || send_dont_have;
            if want_type == WantType::Block {
                entry.want_type = WantType::Block;
            }
            return false;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            cid,
            WantlistEntry {
                cid,
                priority,
                want_type,
                send_dont_have,
                ref_count: 1,
                seq,
            },
        );
        true
    }

    /// Decrement the reference count for a CID, deleting the entry when it
    /// reaches zero. Returns `true` when the entry was deleted.
    pub fn remove(&mut self, cid: &Cid) -> bool {
        match self.entries.get_mut(cid) {
            Some(entry) if entry.ref_count > 1 => {
                entry.ref_count -= 1;
                false
            }
            Some(_) => {
                self.entries.remove(cid);
                true
            }
            None => false,
        }
    }

    /// Delete an entry regardless of its reference count. Returns `true`
    /// when an entry existed.
    pub fn remove_force(&mut self, cid: &Cid) -> bool {
        self.entries.remove(cid).is_some()
    }

    /// Whether the wantlist contains a CID
    pub fn contains(&self, cid: &Cid) -> bool {
        self.entries.contains_key(cid)
    }

    /// Get the entry for a CID
    pub fn get(&self, cid: &Cid) -> Option<&WantlistEntry> {
        self.entries.get(cid)
    }

    /// All entries in unspecified order
    pub fn entries(&self) -> impl Iterator<Item = &WantlistEntry> {
        self.entries.values()
    }

    /// All entries ordered by canonical CID bytes.
    ///
    /// Deterministic so two peers holding the same wantlist serialize
    /// identical wire messages.
    pub fn sorted_entries(&self) -> Vec<WantlistEntry> {
        let mut entries: Vec<_> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.cid.to_bytes().cmp(&b.cid.to_bytes()));
        entries
    }

    /// Entries ordered by descending priority, insertion order breaking ties
    pub fn by_priority(&self) -> Vec<WantlistEntry> {
        let mut entries: Vec<_> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        entries
    }

    /// Number of distinct CIDs wanted
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the wantlist is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry
    pub fn clear(&mut self) {
        self.entries.clear();
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
    fn test_add_and_remove_ref_counting() {
        let mut wantlist = Wantlist::new();
        let cid = make_cid(b"refcount");

        assert!(wantlist.add(cid, 1, WantType::Block));
        assert!(!wantlist.add(cid, 1, WantType::Block));
        assert_eq!(wantlist.get(&cid).unwrap().ref_count, 2);

        // First remove only decrements
        assert!(!wantlist.remove(&cid));
        assert!(wantlist.contains(&cid));

        // Second remove deletes
        assert!(wantlist.remove(&cid));
        assert!(!wantlist.contains(&cid));

        // Removing an absent CID reports nothing happened
        assert!(!wantlist.remove(&cid));
    }

    #[test]
    fn test_remove_force_ignores_ref_count() {
        let mut wantlist = Wantlist::new();
        let cid = make_cid(b"force");

        wantlist.add(cid, 1, WantType::Block);
        wantlist.add(cid, 1, WantType::Block);
        wantlist.add(cid, 1, WantType::Block);

        assert!(wantlist.remove_force(&cid));
        assert!(!wantlist.contains(&cid));
        assert!(!wantlist.remove_force(&cid));
    }

    #[test]
    fn test_block_want_supersedes_have() {
        let mut wantlist = Wantlist::new();
        let cid = make_cid(b"upgrade");

        wantlist.add(cid, 1, WantType::Have);
        assert_eq!(wantlist.get(&cid).unwrap().want_type, WantType::Have);

        wantlist.add(cid, 1, WantType::Block);
        assert_eq!(wantlist.get(&cid).unwrap().want_type, WantType::Block);

        // A later have does not downgrade
        wantlist.add(cid, 1, WantType::Have);
        assert_eq!(wantlist.get(&cid).unwrap().want_type, WantType::Block);
    }

    #[test]
    fn test_sorted_entries_is_deterministic() {
        let cids: Vec<Cid> = (0u8..12).map(|i| make_cid(&[i])).collect();

        let mut forward = Wantlist::new();
        for cid in &cids {
            forward.add(*cid, 1, WantType::Block);
        }

        let mut backward = Wantlist::new();
        for cid in cids.iter().rev() {
            backward.add(*cid, 1, WantType::Block);
        }

        let forward_order: Vec<Cid> =
            forward.sorted_entries().iter().map(|e| e.cid).collect();
        let backward_order: Vec<Cid> =
            backward.sorted_entries().iter().map(|e| e.cid).collect();
        assert_eq!(forward_order, backward_order);

        let mut expected = forward_order.clone();
        expected.sort_by_key(|cid| cid.to_bytes());
        assert_eq!(forward_order, expected);
    }

    #[test]
    fn test_by_priority_tie_break_is_insertion_order() {
        let mut wantlist = Wantlist::new();
        let first = make_cid(b"first");
        let second = make_cid(b"second");
        let urgent = make_cid(b"urgent");

        wantlist.add(first, 1, WantType::Block);
        wantlist.add(second, 1, WantType::Block);
        wantlist.add(urgent, 9, WantType::Block);

        let order: Vec<Cid> = wantlist.by_priority().iter().map(|e| e.cid).collect();
        assert_eq!(order, vec![urgent, first, second]);
    }
}
