//! # Core QUIC Types (RFC 8999, RFC 9000)
//!
//! Connection IDs, packet numbers, stream identifiers and endpoint roles.

use bytes::Bytes;
use rand::Rng;

// ============================================================================
// Connection ID (RFC 9000 Section 5.1, RFC 8999 Section 5.3)
// ============================================================================

/// Maximum length of a Connection ID (20 bytes per RFC 9000)
pub const MAX_CID_LENGTH: usize = 20;

/// Bounds for locally generated connection IDs.
pub const LOCAL_CID_MIN_LENGTH: usize = 8;
pub const LOCAL_CID_MAX_LENGTH: usize = 15;

/// Connection ID - Version-independent identifier (RFC 8999 Section 5.3)
///
/// Opaque byte string chosen by each endpoint. The router keys its
/// connection table on these.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    bytes: Bytes,
}

impl ConnectionId {
    /// Returns None if length exceeds MAX_CID_LENGTH
    pub fn new(bytes: Bytes) -> Option<Self> {
        if bytes.len() > MAX_CID_LENGTH {
            return None;
        }
        Some(Self { bytes })
    }

    /// Create from a borrowed slice (copies data)
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        Self::new(Bytes::copy_from_slice(slice))
    }

    /// Random ID of 8 to 15 bytes, used for locally issued IDs.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let len = rng.gen_range(LOCAL_CID_MIN_LENGTH..=LOCAL_CID_MAX_LENGTH);
        let mut bytes = vec![0u8; len];
        rng.fill(&mut bytes[..]);
        Self {
            bytes: Bytes::from(bytes),
        }
    }

    pub fn empty() -> Self {
        Self {
            bytes: Bytes::new(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectionId({})", hex::encode(&self.bytes))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(&self.bytes))
    }
}

// ============================================================================
// Packet Number (RFC 9000 Section 12.3)
// ============================================================================

/// Packet Number
///
/// Initial, Handshake and 1-RTT packets draw from one shared, strictly
/// increasing sequence per connection.
pub type PacketNumber = u64;

// ============================================================================
// Side (Client vs Server)
// ============================================================================

/// Connection endpoint side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn is_client(self) -> bool {
        matches!(self, Side::Client)
    }

    pub fn is_server(self) -> bool {
        matches!(self, Side::Server)
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Client => f.write_str("client"),
            Side::Server => f.write_str("server"),
        }
    }
}

// ============================================================================
// Stream ID (RFC 9000 Section 2.1)
// ============================================================================

/// Stream direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Bidirectional,
    Unidirectional,
}

/// Stream ID - Identifies a bidirectional or unidirectional stream
///
/// The two least significant bits encode stream type and initiator:
/// - Bit 0: Initiator (0=client, 1=server)
/// - Bit 1: Direction (0=bidirectional, 1=unidirectional)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl StreamId {
    /// Build the `index`-th stream of the given initiator and direction.
    pub fn new(index: u64, initiator: Side, direction: Direction) -> Self {
        let mut id = index << 2;
        if initiator.is_server() {
            id |= 0x01;
        }
        if direction == Direction::Unidirectional {
            id |= 0x02;
        }
        Self(id)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// Sequence number among streams of the same type.
    pub fn index(self) -> u64 {
        self.0 >> 2
    }

    pub fn initiator(self) -> Side {
        if self.0 & 0x01 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    pub fn direction(self) -> Direction {
        if self.0 & 0x02 == 0 {
            Direction::Bidirectional
        } else {
            Direction::Unidirectional
        }
    }

    pub fn is_bidirectional(self) -> bool {
        self.direction() == Direction::Bidirectional
    }

    pub fn is_unidirectional(self) -> bool {
        !self.is_bidirectional()
    }

    /// Whether `side` opened this stream.
    pub fn is_local(self, side: Side) -> bool {
        self.initiator() == side
    }

    /// Whether `side` may send on this stream.
    pub fn can_send(self, side: Side) -> bool {
        self.is_bidirectional() || self.is_local(side)
    }

    /// Whether `side` may receive on this stream.
    pub fn can_receive(self, side: Side) -> bool {
        self.is_bidirectional() || !self.is_local(side)
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod connection_id_tests {
        use super::*;

        #[test]
        fn test_connection_id_max_length() {
            // RFC 9000 Section 5.1: Maximum CID length is 20 bytes
            assert!(ConnectionId::from_slice(&[0xab; MAX_CID_LENGTH]).is_some());
            assert!(ConnectionId::from_slice(&[0xab; MAX_CID_LENGTH + 1]).is_none());
        }

        #[test]
        fn test_random_connection_id_length() {
            for _ in 0..64 {
                let cid = ConnectionId::random();
                assert!((LOCAL_CID_MIN_LENGTH..=LOCAL_CID_MAX_LENGTH).contains(&cid.len()));
            }
        }

        #[test]
        fn test_connection_id_display_is_hex() {
            let cid = ConnectionId::from_slice(&[0x83, 0x94, 0xc8, 0xf0]).unwrap();
            assert_eq!(cid.to_string(), "8394c8f0");
        }
    }

    mod stream_id_tests {
        use super::*;

        #[test]
        fn test_stream_id_type_bits() {
            // RFC 9000 Section 2.1, Table 1
            assert_eq!(StreamId(0).initiator(), Side::Client);
            assert!(StreamId(0).is_bidirectional());
            assert_eq!(StreamId(1).initiator(), Side::Server);
            assert!(StreamId(2).is_unidirectional());
            assert_eq!(StreamId(7).initiator(), Side::Server);
            assert!(StreamId(7).is_unidirectional());
        }

        #[test]
        fn test_stream_id_new_matches_bits() {
            assert_eq!(StreamId::new(0, Side::Client, Direction::Bidirectional), StreamId(0));
            assert_eq!(StreamId::new(1, Side::Server, Direction::Unidirectional), StreamId(7));
            assert_eq!(StreamId(7).index(), 1);
        }

        #[test]
        fn test_unidirectional_send_receive_roles() {
            let id = StreamId(7);
            assert!(id.can_send(Side::Server));
            assert!(!id.can_receive(Side::Server));
            assert!(id.can_receive(Side::Client));
            assert!(!id.can_send(Side::Client));
        }
    }
}
