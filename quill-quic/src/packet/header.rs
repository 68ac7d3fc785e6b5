//! # Version-Independent Header Fields (RFC 8999)
//!
//! Enough of a datagram's first packet to route it or answer it with Version
//! Negotiation, without knowing the version's packet layout.
//!
//! ```text
//! Long Header Packet {
//!   Header Form (1) = 1,
//!   Version-Specific Bits (7),
//!   Version (32),
//!   Destination Connection ID Length (8),
//!   Destination Connection ID (0..2040),
//!   Source Connection ID Length (8),
//!   Source Connection ID (0..2040),
//!   Version-Specific Data (..),
//! }
//!
//! Short Header Packet {
//!   Header Form (1) = 0,
//!   Version-Specific Bits (7),
//!   Destination Connection ID (..),
//!   Version-Specific Data (..),
//! }
//! ```

use bytes::{Buf, BufMut, BytesMut};

use super::VersionNegotiationPacket;
use crate::error::{Error, Result};
use crate::types::ConnectionId;
use crate::version::VERSION_NEGOTIATION;

/// Header Form Bit (most significant bit)
pub const HEADER_FORM_BIT: u8 = 0x80;

/// Fixed Bit, set in every QUIC v1 packet
pub const FIXED_BIT: u8 = 0x40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantHeader {
    Long {
        first: u8,
        version: u32,
        dcid: ConnectionId,
        scid: ConnectionId,
    },
    Short {
        first: u8,
        dcid: ConnectionId,
    },
}

impl InvariantHeader {
    /// Parse the invariant fields. Short headers carry no length for their
    /// Destination Connection ID, so the caller supplies the length it issues.
    pub fn parse(datagram: &[u8], short_dcid_len: usize) -> Result<Self> {
        let mut buf = datagram;
        if !buf.has_remaining() {
            return Err(Error::MalformedPacket("empty datagram"));
        }
        let first = buf.get_u8();
        if first & HEADER_FORM_BIT == 0 {
            let dcid = take_cid(&mut buf, short_dcid_len)?;
            return Ok(InvariantHeader::Short { first, dcid });
        }
        if buf.remaining() < 4 {
            return Err(Error::MalformedPacket("truncated version"));
        }
        let version = buf.get_u32();
        let dcid = take_prefixed_cid(&mut buf)?;
        let scid = take_prefixed_cid(&mut buf)?;
        Ok(InvariantHeader::Long {
            first,
            version,
            dcid,
            scid,
        })
    }

    pub fn is_long(&self) -> bool {
        matches!(self, InvariantHeader::Long { .. })
    }

    pub fn version(&self) -> Option<u32> {
        match self {
            InvariantHeader::Long { version, .. } => Some(*version),
            InvariantHeader::Short { .. } => None,
        }
    }

    pub fn dcid(&self) -> &ConnectionId {
        match self {
            InvariantHeader::Long { dcid, .. } | InvariantHeader::Short { dcid, .. } => dcid,
        }
    }
}

fn take_prefixed_cid(buf: &mut &[u8]) -> Result<ConnectionId> {
    if !buf.has_remaining() {
        return Err(Error::MalformedPacket("truncated connection id length"));
    }
    let len = buf.get_u8() as usize;
    take_cid(buf, len)
}

fn take_cid(buf: &mut &[u8], len: usize) -> Result<ConnectionId> {
    if buf.remaining() < len {
        return Err(Error::MalformedPacket("truncated connection id"));
    }
    let cid = ConnectionId::from_slice(&(*buf)[..len])
        .ok_or(Error::MalformedPacket("connection id too long"))?;
    buf.advance(len);
    Ok(cid)
}

impl VersionNegotiationPacket {
    /// Reply to a long header packet carrying an unsupported version. The
    /// peer's IDs are echoed swapped (RFC 9000 Section 17.2.1).
    pub fn reply_to(header: &InvariantHeader, supported_versions: &[u32]) -> Option<Self> {
        match header {
            InvariantHeader::Long { dcid, scid, .. } => Some(Self {
                dcid: scid.clone(),
                scid: dcid.clone(),
                supported_versions: supported_versions.to_vec(),
            }),
            InvariantHeader::Short { .. } => None,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        // Unused bits are arbitrary; the fixed bit is set to pass middleboxes.
        buf.put_u8(HEADER_FORM_BIT | FIXED_BIT | (rand::random::<u8>() & 0x3f));
        buf.put_u32(VERSION_NEGOTIATION);
        buf.put_u8(self.dcid.len() as u8);
        buf.put_slice(self.dcid.as_bytes());
        buf.put_u8(self.scid.len() as u8);
        buf.put_slice(self.scid.as_bytes());
        for version in &self.supported_versions {
            buf.put_u32(*version);
        }
    }

    pub fn decode(datagram: &[u8]) -> Result<Self> {
        let (dcid, scid) = match InvariantHeader::parse(datagram, 0)? {
            InvariantHeader::Long {
                version: VERSION_NEGOTIATION,
                dcid,
                scid,
                ..
            } => (dcid, scid),
            _ => return Err(Error::MalformedPacket("not a version negotiation packet")),
        };
        let mut rest = &datagram[7 + dcid.len() + scid.len()..];
        if rest.is_empty() || rest.len() % 4 != 0 {
            return Err(Error::MalformedPacket("bad supported version list"));
        }
        let mut supported_versions = Vec::with_capacity(rest.len() / 4);
        while rest.has_remaining() {
            supported_versions.push(rest.get_u32());
        }
        Ok(Self {
            dcid,
            scid,
            supported_versions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::VERSION_1;

    fn long_header_bytes(version: u32, dcid: &[u8], scid: &[u8]) -> Vec<u8> {
        let mut buf = vec![0xc3];
        buf.extend_from_slice(&version.to_be_bytes());
        buf.push(dcid.len() as u8);
        buf.extend_from_slice(dcid);
        buf.push(scid.len() as u8);
        buf.extend_from_slice(scid);
        buf.extend_from_slice(&[0u8; 16]);
        buf
    }

    #[test]
    fn test_parse_long_header_invariants() {
        let bytes = long_header_bytes(0xff00_001d, &[1; 8], &[2; 5]);
        let header = InvariantHeader::parse(&bytes, 8).unwrap();
        assert!(header.is_long());
        assert_eq!(header.version(), Some(0xff00_001d));
        assert_eq!(header.dcid().as_bytes(), &[1; 8]);
    }

    #[test]
    fn test_parse_short_header_uses_known_length() {
        let mut bytes = vec![0x41];
        bytes.extend_from_slice(&[9; 10]);
        bytes.extend_from_slice(&[0; 20]);
        let header = InvariantHeader::parse(&bytes, 10).unwrap();
        assert!(!header.is_long());
        assert_eq!(header.dcid().len(), 10);
    }

    #[test]
    fn test_parse_truncated_fails_closed() {
        assert!(InvariantHeader::parse(&[], 8).is_err());
        assert!(InvariantHeader::parse(&[0xc0, 0, 0], 8).is_err());
        let bytes = long_header_bytes(VERSION_1, &[1; 8], &[2; 8]);
        assert!(InvariantHeader::parse(&bytes[..12], 8).is_err());
    }

    #[test]
    fn test_version_negotiation_echoes_swapped_ids() {
        // RFC 9000 Section 17.2.1
        let bytes = long_header_bytes(0x1a2a_3a4a, &[1; 8], &[2; 4]);
        let header = InvariantHeader::parse(&bytes, 8).unwrap();
        let vn = VersionNegotiationPacket::reply_to(&header, &[VERSION_1]).unwrap();
        assert_eq!(vn.dcid.as_bytes(), &[2; 4]);
        assert_eq!(vn.scid.as_bytes(), &[1; 8]);

        let mut out = BytesMut::new();
        vn.encode(&mut out);
        assert_eq!(out[0] & HEADER_FORM_BIT, HEADER_FORM_BIT);
        assert_eq!(&out[1..5], &[0, 0, 0, 0]);
        assert_eq!(&out[out.len() - 4..], &VERSION_1.to_be_bytes());
        assert_eq!(VersionNegotiationPacket::decode(&out).unwrap(), vn);
    }

    #[test]
    fn test_version_negotiation_rejects_ragged_list() {
        let vn = VersionNegotiationPacket {
            dcid: ConnectionId::from_slice(&[1; 4]).unwrap(),
            scid: ConnectionId::from_slice(&[2; 4]).unwrap(),
            supported_versions: vec![VERSION_1],
        };
        let mut out = BytesMut::new();
        vn.encode(&mut out);
        out.truncate(out.len() - 1);
        assert!(VersionNegotiationPacket::decode(&out).is_err());
    }
}
