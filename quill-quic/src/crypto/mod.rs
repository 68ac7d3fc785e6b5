//! # Packet Protection and Key Schedule (RFC 9001)
//!
//! [`AeadCipher`] holds the AES-128-GCM and header-protection keys for one
//! encryption level, both directions. [`KeySchedule`] owns one slot per level
//! and hands ciphers out to the send and receive paths.

pub mod aead;
pub mod key_schedule;

pub use aead::{hkdf_expand_label, initial_secrets, AeadCipher, PacketKeys};
pub use key_schedule::KeySchedule;

/// QUIC v1 Initial salt (RFC 9001 Section 5.2)
pub const INITIAL_SALT_V1: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c, 0xad,
    0xcc, 0xbb, 0x7f, 0x0a,
];

/// Encryption Level (RFC 9001 Section 4)
///
/// A packet's type fixes its level, and the level fixes the cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EncryptionLevel {
    /// Keys derived from the client's first Destination Connection ID
    Initial,
    /// Keys from the TLS handshake traffic secrets
    Handshake,
    /// Keys from the TLS application traffic secrets
    OneRtt,
}

impl EncryptionLevel {
    pub const ALL: [EncryptionLevel; 3] = [
        EncryptionLevel::Initial,
        EncryptionLevel::Handshake,
        EncryptionLevel::OneRtt,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            EncryptionLevel::Initial => 0,
            EncryptionLevel::Handshake => 1,
            EncryptionLevel::OneRtt => 2,
        }
    }
}

impl std::fmt::Display for EncryptionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncryptionLevel::Initial => f.write_str("initial"),
            EncryptionLevel::Handshake => f.write_str("handshake"),
            EncryptionLevel::OneRtt => f.write_str("1-rtt"),
        }
    }
}
