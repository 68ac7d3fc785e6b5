//! # TLS Collaborator Interface (RFC 9001 Section 4)
//!
//! The engine does not run TLS. A [`TlsSession`] consumes handshake bytes
//! per encryption level and reports what the handshake produced: messages
//! to send, traffic secrets for newly reachable levels, the peer's transport
//! parameters, and completion. Secrets become ciphers through the same
//! HKDF expansion as Initial keys.

use bytes::Bytes;

use crate::crypto::{AeadCipher, EncryptionLevel};
use crate::error::Result;
use crate::transport::TransportParameters;

/// Traffic secrets for one level, from the local point of view.
#[derive(Clone, PartialEq, Eq)]
pub struct HandshakeSecrets {
    pub level: EncryptionLevel,
    /// Secret protecting what we send
    pub local: Vec<u8>,
    /// Secret protecting what the peer sends
    pub remote: Vec<u8>,
}

impl HandshakeSecrets {
    pub fn cipher(&self) -> Result<AeadCipher> {
        AeadCipher::from_secrets(self.level, &self.local, &self.remote)
    }
}

impl std::fmt::Debug for HandshakeSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeSecrets")
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

/// Everything one step of the handshake produced.
#[derive(Debug, Clone, Default)]
pub struct HandshakeOutput {
    /// Handshake messages to send, in order, each at its level
    pub messages: Vec<(EncryptionLevel, Bytes)>,
    pub secrets: Vec<HandshakeSecrets>,
    /// Transport parameters, once the peer's have been read
    pub peer_parameters: Option<TransportParameters>,
    /// The peer's Finished has been verified
    pub complete: bool,
}

impl HandshakeOutput {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.secrets.is_empty()
            && self.peer_parameters.is_none()
            && !self.complete
    }
}

/// A TLS 1.3 handshake driven through CRYPTO frames.
///
/// Failures are reported as [`crate::Error::Crypto`] carrying the TLS
/// alert; the connection closes with `0x0100 + alert`.
pub trait TlsSession: Send {
    /// Begin the handshake with our transport parameters. A client returns
    /// its ClientHello; a server returns nothing until it hears one.
    fn start(&mut self, local_parameters: &TransportParameters) -> Result<HandshakeOutput>;

    /// Feed in-order handshake bytes received at `level`.
    fn process(&mut self, level: EncryptionLevel, data: &[u8]) -> Result<HandshakeOutput>;

    fn is_complete(&self) -> bool;
}
