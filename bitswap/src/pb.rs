//! Protocol Buffer definitions for Bitswap wire messages
//!
//! A single schema serves every protocol version: v1.0.0 peers populate the
//! `blocks` field with raw bytes and ignore `want_type`, `send_dont_have`,
//! `block_presences` and `pending_bytes`; v1.1.0 and later use the
//! prefix-carrying `payload` field instead.

use prost::Message as ProstMessage;

/// Want type for wantlist entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum WireWantType {
    /// Want the full block
    WantBlock = 0,
    /// Only want to know whether the peer has the block
    WantHave = 1,
}

impl From<i32> for WireWantType {
    fn from(value: i32) -> Self {
        match value {
            1 => WireWantType::WantHave,
            _ => WireWantType::WantBlock,
        }
    }
}

/// Block presence type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum WirePresenceType {
    /// Peer has the block
    Have = 0,
    /// Peer does not have the block
    DontHave = 1,
}

impl From<i32> for WirePresenceType {
    fn from(value: i32) -> Self {
        match value {
            0 => WirePresenceType::Have,
            _ => WirePresenceType::DontHave,
        }
    }
}

/// Wantlist entry in a Bitswap message
#[derive(Clone, PartialEq, ProstMessage)]
pub struct Entry {
    /// CID bytes; a bare CID-v0 multihash on the legacy protocol
    #[prost(bytes = "vec", tag = "1")]
    pub block: Vec<u8>,
    /// Priority of the request, higher is more important
    #[prost(int32, tag = "2")]
    pub priority: i32,
    /// Whether this entry cancels a previous want
    #[prost(bool, tag = "3")]
    pub cancel: bool,
    /// Want type (0 = Block, 1 = Have)
    #[prost(int32, tag = "4")]
    pub want_type: i32,
    /// Whether the receiver should answer DontHave when it lacks the block
    #[prost(bool, tag = "5")]
    pub send_dont_have: bool,
}

/// Wantlist in a Bitswap message
#[derive(Clone, PartialEq, ProstMessage)]
pub struct Wantlist {
    /// Wantlist entries
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<Entry>,
    /// Whether this replaces the receiver's stored view of the wantlist
    #[prost(bool, tag = "2")]
    pub full: bool,
}

/// A prefix-carrying block payload (v1.1.0+)
#[derive(Clone, PartialEq, ProstMessage)]
pub struct PayloadBlock {
    /// CID minus the multihash digest: version, codec, mh-type, mh-length
    #[prost(bytes = "vec", tag = "1")]
    pub prefix: Vec<u8>,
    /// Raw block data
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

/// Block presence information (v1.2.0)
#[derive(Clone, PartialEq, ProstMessage)]
pub struct BlockPresence {
    /// Full CID bytes
    #[prost(bytes = "vec", tag = "1")]
    pub cid: Vec<u8>,
    /// Presence type (0 = Have, 1 = DontHave)
    #[prost(int32, tag = "2")]
    pub r#type: i32,
}

/// The Bitswap wire message
#[derive(Clone, PartialEq, ProstMessage)]
pub struct Message {
    /// Wantlist update
    #[prost(message, optional, tag = "1")]
    pub wantlist: Option<Wantlist>,
    /// Raw block bytes; legacy v1.0.0 only, CID derived by hashing
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub blocks: Vec<Vec<u8>>,
    /// Prefix-carrying block payload; v1.1.0 and later
    #[prost(message, repeated, tag = "3")]
    pub payload: Vec<PayloadBlock>,
    /// Have/DontHave answers; v1.2.0
    #[prost(message, repeated, tag = "4")]
    pub block_presences: Vec<BlockPresence>,
    /// Bytes queued for this peer but not yet sent
    #[prost(int32, tag = "5")]
    pub pending_bytes: i32,
}

impl Message {
    /// Encode the message to bytes
    pub fn encode_to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buf).expect("encoding into a Vec never fails");
        buf
    }

    /// Decode a message from bytes
    pub fn decode_from_bytes(bytes: &[u8]) -> Result<Self, prost::DecodeError> {
        Self::decode(bytes)
    }
}
