//! # QUIC Versions (RFC 8999, RFC 9000 Section 6)
//!
//! Version Negotiation uses the reserved value 0x00000000. Versions of the
//! form 0x?a?a?a?a are reserved for exercising negotiation and are never
//! listed as supported.

/// QUIC Version 1 (RFC 9000)
pub const VERSION_1: u32 = 0x0000_0001;

/// Version field of a Version Negotiation packet
pub const VERSION_NEGOTIATION: u32 = 0x0000_0000;

/// RFC 9000 Section 15: 0x?a?a?a?a versions are reserved.
pub fn is_reserved_version(version: u32) -> bool {
    (version & 0x0f0f_0f0f) == 0x0a0a_0a0a
}

/// Whether `version` may appear in a locally supported list.
pub fn is_negotiable(version: u32) -> bool {
    version != VERSION_NEGOTIATION && !is_reserved_version(version)
}
