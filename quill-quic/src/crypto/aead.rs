//! AES-128-GCM packet protection and AES-ECB header protection
//! (RFC 9001 Sections 5.1-5.4).
//!
//! ```text
//! initial_secret = HKDF-Extract(initial_salt, client_dst_connection_id)
//! client_initial_secret = HKDF-Expand-Label(initial_secret, "client in", "", 32)
//! server_initial_secret = HKDF-Expand-Label(initial_secret, "server in", "", 32)
//! key = HKDF-Expand-Label(secret, "quic key", "", 16)
//! iv  = HKDF-Expand-Label(secret, "quic iv", "", 12)
//! hp  = HKDF-Expand-Label(secret, "quic hp", "", 16)
//! ```

use aes::cipher::BlockEncrypt;
use aes_gcm::aead::{Aead, Payload as AeadPayload};
use aes_gcm::{Aes128Gcm, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;

use super::{EncryptionLevel, INITIAL_SALT_V1};
use crate::error::{Error, Result};
use crate::types::{ConnectionId, PacketNumber, Side};

pub const KEY_LEN: usize = 16;
pub const IV_LEN: usize = 12;
pub const HP_KEY_LEN: usize = 16;
pub const TAG_LEN: usize = 16;
pub const SAMPLE_LEN: usize = 16;
const SECRET_LEN: usize = 32;

/// HKDF-Expand-Label from TLS 1.3 (RFC 8446 Section 7.1) with an empty
/// context.
pub fn hkdf_expand_label(secret: &[u8], label: &str, len: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha256>::from_prk(secret)
        .map_err(|_| Error::IllegalState("secret shorter than hash output"))?;
    let full_label = format!("tls13 {label}");
    let mut info = Vec::with_capacity(4 + full_label.len());
    info.extend_from_slice(&(len as u16).to_be_bytes());
    info.push(full_label.len() as u8);
    info.extend_from_slice(full_label.as_bytes());
    info.push(0);
    let mut out = vec![0u8; len];
    hk.expand(&info, &mut out)
        .map_err(|_| Error::IllegalState("HKDF output too long"))?;
    Ok(out)
}

/// Client and server Initial secrets for a Destination Connection ID.
pub fn initial_secrets(dcid: &ConnectionId) -> Result<(Vec<u8>, Vec<u8>)> {
    let (prk, _) = Hkdf::<Sha256>::extract(Some(&INITIAL_SALT_V1), dcid.as_bytes());
    let client = hkdf_expand_label(&prk, "client in", SECRET_LEN)?;
    let server = hkdf_expand_label(&prk, "server in", SECRET_LEN)?;
    Ok((client, server))
}

/// Raw key material for one direction of one level.
#[derive(Clone, PartialEq, Eq)]
pub struct PacketKeys {
    pub key: [u8; KEY_LEN],
    pub iv: [u8; IV_LEN],
    pub hp: [u8; HP_KEY_LEN],
}

impl PacketKeys {
    pub fn from_secret(secret: &[u8]) -> Result<Self> {
        let mut keys = PacketKeys {
            key: [0; KEY_LEN],
            iv: [0; IV_LEN],
            hp: [0; HP_KEY_LEN],
        };
        keys.key
            .copy_from_slice(&hkdf_expand_label(secret, "quic key", KEY_LEN)?);
        keys.iv
            .copy_from_slice(&hkdf_expand_label(secret, "quic iv", IV_LEN)?);
        keys.hp
            .copy_from_slice(&hkdf_expand_label(secret, "quic hp", HP_KEY_LEN)?);
        Ok(keys)
    }

    /// RFC 9001 Section 5.3: IV XOR the left-padded packet number.
    pub fn nonce(&self, pn: PacketNumber) -> [u8; IV_LEN] {
        let mut nonce = self.iv;
        for (dst, src) in nonce[IV_LEN - 8..].iter_mut().zip(pn.to_be_bytes()) {
            *dst ^= src;
        }
        nonce
    }
}

impl std::fmt::Debug for PacketKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PacketKeys(..)")
    }
}

struct DirectionalCipher {
    keys: PacketKeys,
    aead: Aes128Gcm,
    hp: aes::Aes128,
}

impl DirectionalCipher {
    fn new(keys: PacketKeys) -> Result<Self> {
        let aead = <Aes128Gcm as aes_gcm::KeyInit>::new_from_slice(&keys.key)
            .map_err(|_| Error::IllegalState("bad AEAD key length"))?;
        let hp = <aes::Aes128 as aes::cipher::KeyInit>::new_from_slice(&keys.hp)
            .map_err(|_| Error::IllegalState("bad header protection key length"))?;
        Ok(Self { keys, aead, hp })
    }

    fn mask(&self, sample: &[u8]) -> Result<[u8; 5]> {
        if sample.len() < SAMPLE_LEN {
            return Err(Error::MalformedPacket("header protection sample too short"));
        }
        let mut block = aes::Block::clone_from_slice(&sample[..SAMPLE_LEN]);
        self.hp.encrypt_block(&mut block);
        let mut mask = [0u8; 5];
        mask.copy_from_slice(&block[..5]);
        Ok(mask)
    }
}

/// Packet protection for one encryption level.
///
/// `local` keys seal what this endpoint sends, `remote` keys open what the
/// peer sends. Immutable once built.
pub struct AeadCipher {
    level: EncryptionLevel,
    local: DirectionalCipher,
    remote: DirectionalCipher,
}

impl AeadCipher {
    pub fn new(level: EncryptionLevel, local: PacketKeys, remote: PacketKeys) -> Result<Self> {
        Ok(Self {
            level,
            local: DirectionalCipher::new(local)?,
            remote: DirectionalCipher::new(remote)?,
        })
    }

    /// Build from TLS traffic secrets delivered by the handshake.
    pub fn from_secrets(
        level: EncryptionLevel,
        local_secret: &[u8],
        remote_secret: &[u8],
    ) -> Result<Self> {
        Self::new(
            level,
            PacketKeys::from_secret(local_secret)?,
            PacketKeys::from_secret(remote_secret)?,
        )
    }

    /// Initial keys for `side`, derived from the client's Destination
    /// Connection ID (RFC 9001 Section 5.2).
    pub fn initial(dcid: &ConnectionId, side: Side) -> Result<Self> {
        let (client, server) = initial_secrets(dcid)?;
        match side {
            Side::Client => Self::from_secrets(EncryptionLevel::Initial, &client, &server),
            Side::Server => Self::from_secrets(EncryptionLevel::Initial, &server, &client),
        }
    }

    pub fn level(&self) -> EncryptionLevel {
        self.level
    }

    pub fn local_keys(&self) -> &PacketKeys {
        &self.local.keys
    }

    pub fn remote_keys(&self) -> &PacketKeys {
        &self.remote.keys
    }

    /// Whether both ciphers carry identical key material.
    pub fn same_keys(&self, other: &AeadCipher) -> bool {
        self.level == other.level
            && self.local.keys == other.local.keys
            && self.remote.keys == other.remote.keys
    }

    /// Encrypt an outbound payload; `header` is the associated data.
    pub fn seal(&self, pn: PacketNumber, header: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.local.keys.nonce(pn);
        self.local
            .aead
            .encrypt(
                Nonce::from_slice(&nonce),
                AeadPayload {
                    msg: plaintext,
                    aad: header,
                },
            )
            .map_err(|_| Error::IllegalState("AEAD seal failed"))
    }

    /// Decrypt an inbound payload. Authentication failure is
    /// [`Error::Decrypt`]; the packet is to be discarded.
    pub fn open(&self, pn: PacketNumber, header: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_LEN {
            return Err(Error::Decrypt);
        }
        let nonce = self.remote.keys.nonce(pn);
        self.remote
            .aead
            .decrypt(
                Nonce::from_slice(&nonce),
                AeadPayload {
                    msg: ciphertext,
                    aad: header,
                },
            )
            .map_err(|_| Error::Decrypt)
    }

    /// Header protection mask for packets this endpoint sends.
    pub fn local_header_mask(&self, sample: &[u8]) -> Result<[u8; 5]> {
        self.local.mask(sample)
    }

    /// Header protection mask for packets the peer sends.
    pub fn remote_header_mask(&self, sample: &[u8]) -> Result<[u8; 5]> {
        self.remote.mask(sample)
    }
}

impl std::fmt::Debug for AeadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AeadCipher")
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}
