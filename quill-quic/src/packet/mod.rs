//! # QUIC Packets (RFC 9000 Section 17)
//!
//! Decoded packet values. Initial, Handshake and 1-RTT ("short") packets are
//! *full* packets: they carry a packet number and a [`Payload`] and are
//! protected with the cipher of their encryption level. Retry and Version
//! Negotiation packets carry neither.

pub mod header;
pub mod number;

use bytes::Bytes;

use crate::crypto::EncryptionLevel;
use crate::frames::Payload;
use crate::types::{ConnectionId, PacketNumber};

pub use header::InvariantHeader;
pub use number::PacketNumberAllocator;

/// Long header fields shared by Initial, Handshake and Retry packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongHeader {
    pub version: u32,
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
}

/// Initial packet (RFC 9000 Section 17.2.2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialPacket {
    pub header: LongHeader,
    /// Retry token echoed by the client; empty when none
    pub token: Bytes,
    pub number: PacketNumber,
    pub payload: Payload,
}

/// Handshake packet (RFC 9000 Section 17.2.4)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePacket {
    pub header: LongHeader,
    pub number: PacketNumber,
    pub payload: Payload,
}

/// 1-RTT packet (RFC 9000 Section 17.3.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortPacket {
    pub dcid: ConnectionId,
    pub number: PacketNumber,
    pub payload: Payload,
}

/// Retry packet (RFC 9000 Section 17.2.5)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPacket {
    /// `dcid` echoes the client's SCID; `scid` is the ID the client must use next
    pub header: LongHeader,
    pub token: Bytes,
    /// Destination ID of the Initial that triggered the Retry
    pub original_dcid: ConnectionId,
}

/// Version Negotiation packet (RFC 9000 Section 17.2.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionNegotiationPacket {
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
    pub supported_versions: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Initial,
    Handshake,
    Short,
    Retry,
    VersionNegotiation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Initial(InitialPacket),
    Handshake(HandshakePacket),
    Short(ShortPacket),
    Retry(RetryPacket),
    VersionNegotiation(VersionNegotiationPacket),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Initial(_) => PacketType::Initial,
            Packet::Handshake(_) => PacketType::Handshake,
            Packet::Short(_) => PacketType::Short,
            Packet::Retry(_) => PacketType::Retry,
            Packet::VersionNegotiation(_) => PacketType::VersionNegotiation,
        }
    }

    /// Encryption level implied by the packet type.
    pub fn level(&self) -> Option<EncryptionLevel> {
        match self {
            Packet::Initial(_) => Some(EncryptionLevel::Initial),
            Packet::Handshake(_) => Some(EncryptionLevel::Handshake),
            Packet::Short(_) => Some(EncryptionLevel::OneRtt),
            Packet::Retry(_) | Packet::VersionNegotiation(_) => None,
        }
    }

    pub fn number(&self) -> Option<PacketNumber> {
        match self {
            Packet::Initial(p) => Some(p.number),
            Packet::Handshake(p) => Some(p.number),
            Packet::Short(p) => Some(p.number),
            Packet::Retry(_) | Packet::VersionNegotiation(_) => None,
        }
    }

    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Packet::Initial(p) => Some(&p.payload),
            Packet::Handshake(p) => Some(&p.payload),
            Packet::Short(p) => Some(&p.payload),
            Packet::Retry(_) | Packet::VersionNegotiation(_) => None,
        }
    }

    /// Whether this packet carries a number and a payload.
    pub fn is_full(&self) -> bool {
        self.number().is_some()
    }

    /// Same packet with `payload` swapped in. Packets without a payload are
    /// returned unchanged.
    pub fn with_payload(self, payload: Payload) -> Packet {
        match self {
            Packet::Initial(p) => Packet::Initial(InitialPacket { payload, ..p }),
            Packet::Handshake(p) => Packet::Handshake(HandshakePacket { payload, ..p }),
            Packet::Short(p) => Packet::Short(ShortPacket { payload, ..p }),
            other => other,
        }
    }

    pub fn dcid(&self) -> &ConnectionId {
        match self {
            Packet::Initial(p) => &p.header.dcid,
            Packet::Handshake(p) => &p.header.dcid,
            Packet::Short(p) => &p.dcid,
            Packet::Retry(p) => &p.header.dcid,
            Packet::VersionNegotiation(p) => &p.dcid,
        }
    }

    pub fn scid(&self) -> Option<&ConnectionId> {
        match self {
            Packet::Initial(p) => Some(&p.header.scid),
            Packet::Handshake(p) => Some(&p.header.scid),
            Packet::Retry(p) => Some(&p.header.scid),
            Packet::VersionNegotiation(p) => Some(&p.scid),
            Packet::Short(_) => None,
        }
    }

    /// Version field of long header packets.
    pub fn version(&self) -> Option<u32> {
        match self {
            Packet::Initial(p) => Some(p.header.version),
            Packet::Handshake(p) => Some(p.header.version),
            Packet::Retry(p) => Some(p.header.version),
            Packet::VersionNegotiation(_) => Some(crate::version::VERSION_NEGOTIATION),
            Packet::Short(_) => None,
        }
    }

    pub fn is_ack_eliciting(&self) -> bool {
        self.payload().is_some_and(Payload::is_ack_eliciting)
    }

    pub fn is_ack_only(&self) -> bool {
        self.payload().is_some_and(Payload::is_ack_only)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::Frame;

    fn short(number: PacketNumber) -> Packet {
        Packet::Short(ShortPacket {
            dcid: ConnectionId::from_slice(&[7; 8]).unwrap(),
            number,
            payload: Payload::single(Frame::Ping),
        })
    }

    #[test]
    fn test_level_follows_packet_type() {
        assert_eq!(short(1).level(), Some(EncryptionLevel::OneRtt));
        let vn = Packet::VersionNegotiation(VersionNegotiationPacket {
            dcid: ConnectionId::empty(),
            scid: ConnectionId::empty(),
            supported_versions: vec![1],
        });
        assert_eq!(vn.level(), None);
        assert!(!vn.is_full());
    }

    #[test]
    fn test_with_payload_keeps_number() {
        let packet = short(9).with_payload(Payload::empty());
        assert_eq!(packet.number(), Some(9));
        assert!(packet.payload().unwrap().is_empty());
    }
}
