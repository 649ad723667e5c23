//! In-memory Bitswap message and the two wire codecs
//!
//! A [`BitswapMessage`] is built up entry by entry, then serialized for the
//! protocol version negotiated on the outgoing stream. Entries, blocks and
//! presences are keyed by canonical CID bytes so two peers building the same
//! message produce identical wire bytes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use cid::{Cid, Version};
use multihash::Multihash;
use sha2::{Digest, Sha256};

use crate::{constants::ProtocolId, pb, Result, WantType};
use bitswap_interface::BitswapError;

/// Multihash code for sha2-256, the only hasher registered by default
pub const SHA2_256_CODE: u64 = 0x12;

/// A digest function for one multihash code
pub type HasherFn = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Resolves multihash codes to digest functions.
///
/// Used when decoding v1.1.0+ payloads: the block's CID is reconstructed by
/// hashing the data with the algorithm named in the prefix. Codes without a
/// registered hasher make the block undecodable.
#[derive(Clone)]
pub struct HasherRegistry {
    hashers: HashMap<u64, HasherFn>,
}

impl HasherRegistry {
    /// Create an empty registry
    pub fn empty() -> Self {
        Self {
            hashers: HashMap::new(),
        }
    }

    /// Register a digest function for a multihash code
    pub fn register(&mut self, code: u64, hasher: HasherFn) {
        self.hashers.insert(code, hasher);
    }

    /// Hash `data` with the hasher registered for `code`
    pub fn digest(&self, code: u64, data: &[u8]) -> Option<Vec<u8>> {
        self.hashers.get(&code).map(|h| h(data))
    }
}

impl Default for HasherRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(
            SHA2_256_CODE,
            Arc::new(|data| Sha256::digest(data).to_vec()),
        );
        registry
    }
}

impl std::fmt::Debug for HasherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HasherRegistry")
            .field("codes", &self.hashers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Have/DontHave answer for a wanted CID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Presence {
    Have,
    DontHave,
}

/// A single wantlist entry carried in a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEntry {
    pub cid: Cid,
    pub priority: i32,
    pub want_type: WantType,
    pub cancel: bool,
    pub send_dont_have: bool,
}

impl MessageEntry {
    /// Entry requesting the full block
    pub fn new_block(cid: Cid, priority: i32) -> Self {
        Self {
            cid,
            priority,
            want_type: WantType::Block,
            cancel: false,
            send_dont_have: true,
        }
    }

    /// Entry requesting only a Have/DontHave answer
    pub fn new_have(cid: Cid, priority: i32) -> Self {
        Self {
            cid,
            priority,
            want_type: WantType::Have,
            cancel: false,
            send_dont_have: false,
        }
    }

    /// Entry cancelling a previous want
    pub fn new_cancel(cid: Cid) -> Self {
        Self {
            cid,
            priority: 0,
            want_type: WantType::Block,
            cancel: true,
            send_dont_have: false,
        }
    }
}

/// In-memory representation of one wire message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BitswapMessage {
    full: bool,
    entries: BTreeMap<Vec<u8>, MessageEntry>,
    blocks: BTreeMap<Vec<u8>, (Cid, Bytes)>,
    presences: BTreeMap<Vec<u8>, (Cid, Presence)>,
    pending_bytes: i32,
}

impl BitswapMessage {
    /// Create a new message; `full` marks it as a complete wantlist
    /// replacement rather than a delta
    pub fn new(full: bool) -> Self {
        Self {
            full,
            ..Default::default()
        }
    }

    /// Whether this message replaces the receiver's view of our wantlist
    pub fn full(&self) -> bool {
        self.full
    }

    /// Add a wantlist entry; a later entry for the same CID replaces the
    /// earlier one
    pub fn add_entry(&mut self, cid: Cid, priority: i32, want_type: WantType, cancel: bool) {
        self.push_entry(MessageEntry {
            cid,
            priority,
            want_type,
            cancel,
            send_dont_have: false,
        });
    }

    /// Add a fully specified wantlist entry
    pub fn push_entry(&mut self, entry: MessageEntry) {
        self.entries.insert(entry.cid.to_bytes(), entry);
    }

    /// Add a cancel entry for a CID
    pub fn cancel(&mut self, cid: Cid) {
        self.push_entry(MessageEntry::new_cancel(cid));
    }

    /// Attach a block
    pub fn add_block(&mut self, cid: Cid, data: Bytes) {
        self.blocks.insert(cid.to_bytes(), (cid, data));
    }

    /// Attach a Have/DontHave answer
    pub fn add_presence(&mut self, cid: Cid, presence: Presence) {
        self.presences.insert(cid.to_bytes(), (cid, presence));
    }

    /// Set the pending-bytes hint
    pub fn set_pending_bytes(&mut self, pending: i32) {
        self.pending_bytes = pending;
    }

    /// The pending-bytes hint
    pub fn pending_bytes(&self) -> i32 {
        self.pending_bytes
    }

    /// Whether the message carries nothing at all
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.blocks.is_empty() && self.presences.is_empty()
    }

    /// Wantlist entries in canonical (CID byte-lex) order
    pub fn entries(&self) -> impl Iterator<Item = &MessageEntry> {
        self.entries.values()
    }

    /// Attached blocks in canonical order
    pub fn blocks(&self) -> impl Iterator<Item = (&Cid, &Bytes)> {
        self.blocks.values().map(|(cid, data)| (cid, data))
    }

    /// Attached presences in canonical order
    pub fn presences(&self) -> impl Iterator<Item = (&Cid, Presence)> {
        self.presences.values().map(|(cid, p)| (cid, *p))
    }

    /// Sum of attached block data lengths
    pub fn block_bytes(&self) -> u64 {
        self.blocks.values().map(|(_, data)| data.len() as u64).sum()
    }

    /// Merge another message into this one; later entries win per CID
    pub fn merge(&mut self, other: BitswapMessage) {
        self.full = self.full || other.full;
        self.entries.extend(other.entries);
        self.blocks.extend(other.blocks);
        self.presences.extend(other.presences);
        self.pending_bytes = self.pending_bytes.saturating_add(other.pending_bytes);
    }

    /// Rough wire size, used for splitting before serialization
    pub fn estimated_size(&self) -> usize {
        let entries: usize = self
            .entries
            .keys()
            .map(|cid_bytes| cid_bytes.len() + 16)
            .sum();
        let blocks: usize = self
            .blocks
            .values()
            .map(|(cid, data)| cid.to_bytes().len() + data.len() + 8)
            .sum();
        let presences: usize = self
            .presences
            .keys()
            .map(|cid_bytes| cid_bytes.len() + 4)
            .sum();
        entries + blocks + presences + 16
    }

    /// Split into messages no larger than `max_size`, blocks first since
    /// they dominate the size
    pub fn split(self, max_size: usize) -> Vec<BitswapMessage> {
        if self.estimated_size() <= max_size {
            return vec![self];
        }

        let mut messages = Vec::new();
        let mut current = BitswapMessage::new(self.full);
        current.pending_bytes = self.pending_bytes;

        for (key, (cid, data)) in self.blocks {
            let item = cid.to_bytes().len() + data.len() + 8;
            if !current.is_empty() && current.estimated_size() + item > max_size {
                messages.push(std::mem::replace(&mut current, BitswapMessage::new(false)));
            }
            current.blocks.insert(key, (cid, data));
        }

        for (key, entry) in self.entries {
            let item = key.len() + 16;
            if !current.is_empty() && current.estimated_size() + item > max_size {
                messages.push(std::mem::replace(&mut current, BitswapMessage::new(false)));
            }
            current.entries.insert(key, entry);
        }

        for (key, presence) in self.presences {
            let item = key.len() + 4;
            if !current.is_empty() && current.estimated_size() + item > max_size {
                messages.push(std::mem::replace(&mut current, BitswapMessage::new(false)));
            }
            current.presences.insert(key, presence);
        }

        if !current.is_empty() {
            messages.push(current);
        }
        messages
    }

    /// Serialize for the given negotiated protocol
    pub fn serialize(&self, protocol: ProtocolId) -> Vec<u8> {
        if protocol.is_legacy() {
            self.serialize_v100()
        } else {
            self.serialize_v110()
        }
    }

    /// Serialize in the legacy v1.0.0 format: entries carry a bare CID-v0
    /// multihash, blocks are raw bytes, presences and want-have are dropped
    /// (want-have downgrades to a block want since the receiver cannot
    /// answer presences)
    pub fn serialize_v100(&self) -> Vec<u8> {
        let entries = self
            .entries
            .values()
            .map(|entry| pb::Entry {
                block: legacy_cid_bytes(&entry.cid),
                priority: entry.priority,
                cancel: entry.cancel,
                want_type: pb::WireWantType::WantBlock as i32,
                send_dont_have: false,
            })
            .collect::<Vec<_>>();

        let message = pb::Message {
            wantlist: if entries.is_empty() && !self.full {
                None
            } else {
                Some(pb::Wantlist {
                    entries,
                    full: self.full,
                })
            },
            blocks: self
                .blocks
                .values()
                .map(|(_, data)| data.to_vec())
                .collect(),
            payload: Vec::new(),
            block_presences: Vec::new(),
            pending_bytes: 0,
        };

        message.encode_to_bytes()
    }

    /// Serialize in the v1.1.0/v1.2.0 format with CID prefixes, presences
    /// and the pending-bytes hint
    pub fn serialize_v110(&self) -> Vec<u8> {
        let entries = self
            .entries
            .values()
            .map(|entry| pb::Entry {
                block: entry.cid.to_bytes(),
                priority: entry.priority,
                cancel: entry.cancel,
                want_type: match entry.want_type {
                    WantType::Block => pb::WireWantType::WantBlock as i32,
                    WantType::Have => pb::WireWantType::WantHave as i32,
                },
                send_dont_have: entry.send_dont_have,
            })
            .collect::<Vec<_>>();

        let message = pb::Message {
            wantlist: if entries.is_empty() && !self.full {
                None
            } else {
                Some(pb::Wantlist {
                    entries,
                    full: self.full,
                })
            },
            blocks: Vec::new(),
            payload: self
                .blocks
                .values()
                .map(|(cid, data)| pb::PayloadBlock {
                    prefix: cid_prefix(cid),
                    data: data.to_vec(),
                })
                .collect(),
            block_presences: self
                .presences
                .values()
                .map(|(cid, presence)| pb::BlockPresence {
                    cid: cid.to_bytes(),
                    r#type: match presence {
                        Presence::Have => pb::WirePresenceType::Have as i32,
                        Presence::DontHave => pb::WirePresenceType::DontHave as i32,
                    },
                })
                .collect(),
            pending_bytes: self.pending_bytes,
        };

        message.encode_to_bytes()
    }

    /// Deserialize wire bytes for the given negotiated protocol.
    ///
    /// On the legacy protocol the block CID is not on the wire; it is
    /// derived by hashing the data with sha2-256 and wrapping as CID-v0.
    /// This is a fixed assumption of v1.0.0, not a negotiated parameter.
    pub fn deserialize(
        bytes: &[u8],
        protocol: ProtocolId,
        hashers: &HasherRegistry,
    ) -> Result<Self> {
        let wire = pb::Message::decode_from_bytes(bytes)?;
        let mut message = BitswapMessage::new(
            wire.wantlist.as_ref().map(|w| w.full).unwrap_or(false),
        );
        message.pending_bytes = wire.pending_bytes;

        if let Some(wantlist) = wire.wantlist {
            for entry in wantlist.entries {
                let cid = Cid::try_from(&entry.block[..])?;
                let want_type = if protocol.is_legacy() {
                    WantType::Block
                } else {
                    match pb::WireWantType::from(entry.want_type) {
                        pb::WireWantType::WantBlock => WantType::Block,
                        pb::WireWantType::WantHave => WantType::Have,
                    }
                };
                message.push_entry(MessageEntry {
                    cid,
                    priority: entry.priority,
                    want_type,
                    cancel: entry.cancel,
                    send_dont_have: !protocol.is_legacy() && entry.send_dont_have,
                });
            }
        }

        for data in wire.blocks {
            let digest = hashers
                .digest(SHA2_256_CODE, &data)
                .ok_or(BitswapError::UnsupportedHash {
                    code: SHA2_256_CODE,
                })?;
            let mh = Multihash::wrap(SHA2_256_CODE, &digest)
                .map_err(|e| BitswapError::other(format!("multihash wrap failed: {}", e)))?;
            let cid = Cid::new_v0(mh)?;
            message.add_block(cid, Bytes::from(data));
        }

        for block in wire.payload {
            let cid = cid_from_prefix(&block.prefix, &block.data, hashers)?;
            message.add_block(cid, Bytes::from(block.data));
        }

        if !protocol.is_legacy() {
            for presence in wire.block_presences {
                let cid = Cid::try_from(&presence.cid[..])?;
                let presence = match pb::WirePresenceType::from(presence.r#type) {
                    pb::WirePresenceType::Have => Presence::Have,
                    pb::WirePresenceType::DontHave => Presence::DontHave,
                };
                message.add_presence(cid, presence);
            }
        }

        Ok(message)
    }
}

/// The CID minus its multihash digest: version, codec, mh-type, mh-length,
/// each as an unsigned varint
pub fn cid_prefix(cid: &Cid) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(16);
    let mut buf = unsigned_varint::encode::u64_buffer();

    let version = match cid.version() {
        Version::V0 => 0u64,
        Version::V1 => 1u64,
    };
    prefix.extend_from_slice(unsigned_varint::encode::u64(version, &mut buf));
    prefix.extend_from_slice(unsigned_varint::encode::u64(cid.codec(), &mut buf));
    prefix.extend_from_slice(unsigned_varint::encode::u64(cid.hash().code(), &mut buf));
    prefix.extend_from_slice(unsigned_varint::encode::u64(
        cid.hash().size() as u64,
        &mut buf,
    ));
    prefix
}

/// Reconstruct a block's CID from its prefix by hashing the data with the
/// algorithm the prefix names
fn cid_from_prefix(prefix: &[u8], data: &[u8], hashers: &HasherRegistry) -> Result<Cid> {
    let (version, rest) = unsigned_varint::decode::u64(prefix)
        .map_err(|e| BitswapError::other(format!("bad cid prefix: {}", e)))?;
    let (codec, rest) = unsigned_varint::decode::u64(rest)
        .map_err(|e| BitswapError::other(format!("bad cid prefix: {}", e)))?;
    let (mh_code, rest) = unsigned_varint::decode::u64(rest)
        .map_err(|e| BitswapError::other(format!("bad cid prefix: {}", e)))?;
    let (mh_len, _) = unsigned_varint::decode::u64(rest)
        .map_err(|e| BitswapError::other(format!("bad cid prefix: {}", e)))?;

    let digest = hashers
        .digest(mh_code, data)
        .ok_or(BitswapError::UnsupportedHash { code: mh_code })?;
    let mh = Multihash::wrap(mh_code, &digest)
        .map_err(|e| BitswapError::other(format!("multihash wrap failed: {}", e)))?;

    let cid = match Version::try_from(version)? {
        Version::V0 => Cid::new_v0(mh)?,
        Version::V1 => Cid::new_v1(codec, mh),
    };

    if digest.len() as u64 != mh_len {
        return Err(BitswapError::CidMismatch { cid });
    }
    Ok(cid)
}

/// Entry bytes for the legacy protocol: the bare CID-v0 multihash where
/// possible, the full CID bytes otherwise
fn legacy_cid_bytes(cid: &Cid) -> Vec<u8> {
    match cid.version() {
        Version::V0 => cid.to_bytes(),
        Version::V1 => Cid::new_v0(cid.hash().to_owned())
            .map(|v0| v0.to_bytes())
            .unwrap_or_else(|_| cid.to_bytes()),
    }
}
