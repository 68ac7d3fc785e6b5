//! quill-quic: QUIC Transport Engine Core
//!
//! The part of a QUIC endpoint that sits between the UDP socket and the
//! application: packet protection keys, the handshake state machine,
//! acknowledgment and retransmission bookkeeping, streams with flow
//! control, and the router that maps packets to connections.
//!
//! # RFC Coverage
//!
//! - **RFC 9000**: packets, frames, streams, flow control, Retry, Version Negotiation
//! - **RFC 9001**: Initial secrets, HKDF labels, AEAD packet protection, header protection
//! - **RFC 8999**: version-independent header fields
//!
//! # Module Organization
//!
//! - `crypto`: Initial secrets, AEAD ciphers, per-level key schedule
//! - `packet` / `frames`: typed packets and frames
//! - `recovery`: sent-packet buffer, ACK generation, retransmission
//! - `stream` / `flow_control`: stream state, reassembly, credit
//! - `connection`: state machine and the receive/send stage pipeline
//! - `server`: packet router, Retry tokens, Version Negotiation
//! - `tls`: the handshake seam a TLS 1.3 stack plugs into
//!
//! Byte-level encoding, UDP I/O and the TLS implementation itself live
//! outside this crate.

#![forbid(unsafe_code)]

pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod packet;
pub mod recovery;
pub mod server;
pub mod stream;
pub mod telemetry;
pub mod tls;
pub mod transport;
pub mod types;
pub mod varint;
pub mod version;

pub use config::EngineConfig;
pub use connection::{
    Connection, ConnectionEvent, ConnectionState, PacketSender, SendCompletion,
};
pub use crypto::{AeadCipher, EncryptionLevel, KeySchedule};
pub use error::{Error, Result, TransportError};
pub use frames::{Frame, Payload};
pub use packet::Packet;
pub use server::{RetryTokenManager, RouteOutcome, Router, TokenValidation};
pub use stream::{StreamEvent, StreamManager};
pub use tls::{HandshakeOutput, HandshakeSecrets, TlsSession};
pub use transport::TransportParameters;
pub use types::{ConnectionId, Direction, Side, StreamId};
pub use version::VERSION_1;
