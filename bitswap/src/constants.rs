//! Bitswap protocol constants and engine defaults

/// Bitswap protocol version 1.2.0
pub const BITSWAP_120: &str = "/ipfs/bitswap/1.2.0";

/// Bitswap protocol version 1.1.0
pub const BITSWAP_110: &str = "/ipfs/bitswap/1.1.0";

/// Bitswap protocol version 1.0.0
pub const BITSWAP_100: &str = "/ipfs/bitswap/1.0.0";

/// All supported Bitswap protocols, newest first so the remote negotiates
/// the highest mutually supported version
pub const BITSWAP_PROTOCOLS: &[ProtocolId] =
    &[ProtocolId::B120, ProtocolId::B110, ProtocolId::B100];

/// Default debounce window before a queued wantlist update is flushed
/// (milliseconds)
pub const DEFAULT_WANTLIST_SEND_DEBOUNCE: u64 = 10;

/// Default idle timeout for inbound streams (milliseconds); the timer resets
/// on every received frame
pub const DEFAULT_INCOMING_STREAM_TIMEOUT: u64 = 30_000;

/// Default priority for want requests
pub const DEFAULT_PRIORITY: i32 = 1;

/// Default maximum number of inbound streams
pub const DEFAULT_MAX_INBOUND_STREAMS: usize = 32;

/// Default maximum number of outbound streams
pub const DEFAULT_MAX_OUTBOUND_STREAMS: usize = 128;

/// Default maximum providers connected to per `find_and_connect` request
pub const DEFAULT_MAX_PROVIDERS_PER_REQUEST: usize = 10;

/// Default maximum outgoing message size (bytes); larger messages are split
pub const DEFAULT_MAX_OUTGOING_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Maximum block size accepted in a single message (bytes)
pub const MAX_BLOCK_SIZE: usize = 2 * 1024 * 1024;

/// A negotiated Bitswap protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProtocolId {
    /// `/ipfs/bitswap/1.0.0` — legacy single-protobuf format, raw block bytes
    B100,
    /// `/ipfs/bitswap/1.1.0` — CID-prefixed payload format
    B110,
    /// `/ipfs/bitswap/1.2.0` — adds want-have and block presences
    B120,
}

impl ProtocolId {
    /// The protocol string advertised on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolId::B100 => BITSWAP_100,
            ProtocolId::B110 => BITSWAP_110,
            ProtocolId::B120 => BITSWAP_120,
        }
    }

    /// Parse a protocol string
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            BITSWAP_100 => Some(ProtocolId::B100),
            BITSWAP_110 => Some(ProtocolId::B110),
            BITSWAP_120 => Some(ProtocolId::B120),
            _ => None,
        }
    }

    /// Whether this version uses the legacy v1.0.0 wire format
    pub fn is_legacy(&self) -> bool {
        matches!(self, ProtocolId::B100)
    }

    /// Whether this version carries want-have entries and block presences
    pub fn supports_presences(&self) -> bool {
        matches!(self, ProtocolId::B120)
    }
}

impl std::fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_ordering_newest_first() {
        assert_eq!(BITSWAP_PROTOCOLS[0], ProtocolId::B120);
        assert_eq!(BITSWAP_PROTOCOLS[2], ProtocolId::B100);
    }

    #[test]
    fn test_protocol_round_trip() {
        for proto in BITSWAP_PROTOCOLS {
            assert_eq!(ProtocolId::from_str_opt(proto.as_str()), Some(*proto));
        }
        assert_eq!(ProtocolId::from_str_opt("/ipfs/bitswap/9.9.9"), None);
    }
}
