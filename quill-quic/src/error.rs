//! QUIC Error Types
//!
//! RFC 9000 Section 20 defines the transport error space carried in
//! CONNECTION_CLOSE frames. Locally, errors fall into four groups:
//!
//! - **Transport errors**: protocol violations by the peer. Always fatal; the
//!   connection emits CONNECTION_CLOSE with the matching code.
//! - **Validation failures**: bad retry tokens, unsupported versions. The
//!   offending packet is dropped or answered, the connection is untouched.
//! - **Illegal state**: an operation invoked out of sequence, such as asking
//!   for a cipher before its level has been derived.
//! - **Crypto errors**: TLS alerts raised by the handshake collaborator,
//!   mapped to `0x0100 + alert` (RFC 9001 Section 4.8).

use thiserror::Error;

/// Transport Error Codes as defined in RFC 9000 Section 20.1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum TransportError {
    /// No error (0x00) - graceful shutdown and idle timeout
    NoError = 0x00,

    /// Internal Error (0x01)
    InternalError = 0x01,

    /// Connection Refused (0x02)
    ConnectionRefused = 0x02,

    /// Flow Control Error (0x03) - peer sent beyond an advertised limit
    FlowControlError = 0x03,

    /// Stream Limit Error (0x04) - peer opened more streams than permitted
    StreamLimitError = 0x04,

    /// Stream State Error (0x05) - frame received for a stream in the wrong state
    StreamStateError = 0x05,

    /// Final Size Error (0x06) - final size changed or data beyond it
    FinalSizeError = 0x06,

    /// Frame Encoding Error (0x07) - malformed frame or varint
    FrameEncodingError = 0x07,

    /// Transport Parameter Error (0x08)
    TransportParameterError = 0x08,

    /// Connection ID Limit Error (0x09)
    ConnectionIdLimitError = 0x09,

    /// Protocol Violation (0x0a) - frame not permitted in the current state
    ProtocolViolation = 0x0a,

    /// Invalid Token (0x0b)
    InvalidToken = 0x0b,

    /// Application Error (0x0c)
    ApplicationError = 0x0c,

    /// Crypto Buffer Exceeded (0x0d) - too much out-of-order CRYPTO data
    CryptoBufferExceeded = 0x0d,

    /// Key Update Error (0x0e)
    KeyUpdateError = 0x0e,

    /// AEAD Limit Reached (0x0f)
    AeadLimitReached = 0x0f,

    /// No Viable Path (0x10)
    NoViablePath = 0x10,
}

impl TransportError {
    /// Wire value of this code.
    pub fn code(self) -> u64 {
        self as u64
    }

    /// Map a TLS alert into the CRYPTO_ERROR range (RFC 9001 Section 4.8).
    pub fn crypto(alert: u8) -> u64 {
        0x0100 + alert as u64
    }
}

/// Generic Result Type for QUIC Operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the transport engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Peer violated the protocol; the connection must close with `code`.
    #[error("transport error {code:?}: {reason}")]
    Transport {
        code: TransportError,
        frame_type: Option<u64>,
        reason: String,
    },

    /// The TLS collaborator rejected a handshake message.
    #[error("TLS alert {alert}: {reason}")]
    Crypto { alert: u8, reason: String },

    /// An operation was invoked outside its permitted sequence.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// Local write refused for lack of peer credit.
    #[error("stream {stream_id} blocked by flow control")]
    FlowControlBlocked { stream_id: u64 },

    /// Peer reset the stream.
    #[error("stream {stream_id} reset by peer with code {error_code}")]
    StreamReset { stream_id: u64, error_code: u64 },

    /// AEAD open failed; the packet is discarded.
    #[error("packet decryption failed")]
    Decrypt,

    #[error("invalid retry token")]
    InvalidToken,

    #[error("unsupported version {0:#010x}")]
    UnsupportedVersion(u32),

    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    #[error("connection closed")]
    ConnectionClosed,

    /// The external packet sender rejected or dropped a packet.
    #[error("packet sender failed: {0}")]
    SendFailed(String),
}

impl Error {
    pub fn transport(code: TransportError, reason: impl Into<String>) -> Self {
        Error::Transport {
            code,
            frame_type: None,
            reason: reason.into(),
        }
    }

    /// Transport error attributed to a specific frame type.
    pub fn frame(code: TransportError, frame_type: u64, reason: impl Into<String>) -> Self {
        Error::Transport {
            code,
            frame_type: Some(frame_type),
            reason: reason.into(),
        }
    }

    /// Whether this error must tear the connection down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Transport { .. } | Error::Crypto { .. })
    }

    /// Code to place in CONNECTION_CLOSE, if this error closes the connection.
    pub fn transport_code(&self) -> Option<u64> {
        match self {
            Error::Transport { code, .. } => Some(code.code()),
            Error::Crypto { alert, .. } => Some(TransportError::crypto(*alert)),
            _ => None,
        }
    }
}

impl From<TransportError> for Error {
    fn from(code: TransportError) -> Self {
        Error::transport(code, "")
    }
}
