//! # QUIC Frame Types (RFC 9000 Section 19)
//!
//! Semantic frame values consumed and produced by the engine. Byte layout is
//! the codec's concern; these types carry only the fields the connection,
//! stream and acknowledgment logic act on.
//!
//! ## Frame Classification:
//! - **ACK-eliciting**: everything except ACK, PADDING and CONNECTION_CLOSE
//! - **Retransmittable**: everything except ACK and PADDING

use bytes::Bytes;

use crate::types::{PacketNumber, StreamId};

/// Frame Type Constants (RFC 9000 Section 19)
pub const FRAME_TYPE_PADDING: u64 = 0x00;
pub const FRAME_TYPE_PING: u64 = 0x01;
pub const FRAME_TYPE_ACK: u64 = 0x02;
pub const FRAME_TYPE_RESET_STREAM: u64 = 0x04;
pub const FRAME_TYPE_CRYPTO: u64 = 0x06;
pub const FRAME_TYPE_STREAM_BASE: u64 = 0x08; // 0x08-0x0f
pub const FRAME_TYPE_MAX_DATA: u64 = 0x10;
pub const FRAME_TYPE_MAX_STREAM_DATA: u64 = 0x11;
pub const FRAME_TYPE_DATA_BLOCKED: u64 = 0x14;
pub const FRAME_TYPE_STREAM_DATA_BLOCKED: u64 = 0x15;
pub const FRAME_TYPE_CONNECTION_CLOSE_QUIC: u64 = 0x1c;
pub const FRAME_TYPE_CONNECTION_CLOSE_APP: u64 = 0x1d;
pub const FRAME_TYPE_HANDSHAKE_DONE: u64 = 0x1e;

/// STREAM Frame Flag Bits (RFC 9000 Section 19.8)
pub const STREAM_FRAME_BIT_FIN: u64 = 0x01;
pub const STREAM_FRAME_BIT_LEN: u64 = 0x02;
pub const STREAM_FRAME_BIT_OFF: u64 = 0x04;

/// Inclusive range of acknowledged packet numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AckRange {
    pub smallest: PacketNumber,
    pub largest: PacketNumber,
}

impl AckRange {
    pub fn new(smallest: PacketNumber, largest: PacketNumber) -> Self {
        Self { smallest, largest }
    }

    pub fn single(pn: PacketNumber) -> Self {
        Self::new(pn, pn)
    }

    pub fn contains(&self, pn: PacketNumber) -> bool {
        (self.smallest..=self.largest).contains(&pn)
    }

    pub fn len(&self) -> u64 {
        self.largest.saturating_sub(self.smallest) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.smallest > self.largest
    }
}

/// ACK Frame (RFC 9000 Section 19.3)
///
/// Ranges are disjoint. Writers emit them in descending order, but readers
/// treat them as an unordered set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    /// Microseconds since the largest acknowledged packet was received
    pub ack_delay: u64,
    pub ranges: Vec<AckRange>,
}

impl AckFrame {
    pub fn largest(&self) -> Option<PacketNumber> {
        self.ranges.iter().map(|r| r.largest).max()
    }

    pub fn acknowledges(&self, pn: PacketNumber) -> bool {
        self.ranges.iter().any(|r| r.contains(pn))
    }
}

/// CRYPTO Frame (RFC 9000 Section 19.6)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoFrame {
    pub offset: u64,
    pub data: Bytes,
}

/// STREAM Frame (RFC 9000 Section 19.8)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub stream_id: StreamId,
    pub offset: u64,
    pub data: Bytes,
    pub fin: bool,
}

impl StreamFrame {
    /// Offset one past the last byte carried.
    pub fn end_offset(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// RESET_STREAM Frame (RFC 9000 Section 19.4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetStreamFrame {
    pub stream_id: StreamId,
    pub error_code: u64,
    pub final_size: u64,
}

/// MAX_DATA Frame (RFC 9000 Section 19.9)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxDataFrame {
    pub maximum_data: u64,
}

/// MAX_STREAM_DATA Frame (RFC 9000 Section 19.10)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxStreamDataFrame {
    pub stream_id: StreamId,
    pub maximum_stream_data: u64,
}

/// DATA_BLOCKED Frame (RFC 9000 Section 19.12)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBlockedFrame {
    /// Connection limit at which blocking occurred
    pub maximum_data: u64,
}

/// STREAM_DATA_BLOCKED Frame (RFC 9000 Section 19.13)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDataBlockedFrame {
    pub stream_id: StreamId,
    pub maximum_stream_data: u64,
}

/// CONNECTION_CLOSE Frame (RFC 9000 Section 19.19)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCloseFrame {
    pub error_code: u64,
    /// Triggering frame type; `None` for the application variant (0x1d)
    pub frame_type: Option<u64>,
    pub reason: Bytes,
    pub application: bool,
}

/// Every frame the engine understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Padding { length: usize },
    Ping,
    Ack(AckFrame),
    Crypto(CryptoFrame),
    Stream(StreamFrame),
    ResetStream(ResetStreamFrame),
    MaxData(MaxDataFrame),
    MaxStreamData(MaxStreamDataFrame),
    DataBlocked(DataBlockedFrame),
    StreamDataBlocked(StreamDataBlockedFrame),
    ConnectionClose(ConnectionCloseFrame),
    HandshakeDone,
}

impl Frame {
    /// Wire type of this frame.
    pub fn frame_type(&self) -> u64 {
        match self {
            Frame::Padding { .. } => FRAME_TYPE_PADDING,
            Frame::Ping => FRAME_TYPE_PING,
            Frame::Ack(_) => FRAME_TYPE_ACK,
            Frame::Crypto(_) => FRAME_TYPE_CRYPTO,
            Frame::Stream(f) => {
                let mut ty = FRAME_TYPE_STREAM_BASE | STREAM_FRAME_BIT_LEN;
                if f.offset > 0 {
                    ty |= STREAM_FRAME_BIT_OFF;
                }
                if f.fin {
                    ty |= STREAM_FRAME_BIT_FIN;
                }
                ty
            }
            Frame::ResetStream(_) => FRAME_TYPE_RESET_STREAM,
            Frame::MaxData(_) => FRAME_TYPE_MAX_DATA,
            Frame::MaxStreamData(_) => FRAME_TYPE_MAX_STREAM_DATA,
            Frame::DataBlocked(_) => FRAME_TYPE_DATA_BLOCKED,
            Frame::StreamDataBlocked(_) => FRAME_TYPE_STREAM_DATA_BLOCKED,
            Frame::ConnectionClose(f) if f.application => FRAME_TYPE_CONNECTION_CLOSE_APP,
            Frame::ConnectionClose(_) => FRAME_TYPE_CONNECTION_CLOSE_QUIC,
            Frame::HandshakeDone => FRAME_TYPE_HANDSHAKE_DONE,
        }
    }

    /// RFC 9002 Section 2: frames other than ACK, PADDING and
    /// CONNECTION_CLOSE elicit an acknowledgment.
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Ack(_) | Frame::Padding { .. } | Frame::ConnectionClose(_)
        )
    }

    /// Whether a lost copy of this frame must be sent again.
    pub fn is_retransmittable(&self) -> bool {
        !matches!(self, Frame::Ack(_) | Frame::Padding { .. })
    }

    /// RFC 9000 Section 12.4, Table 3: frames permitted in Initial and
    /// Handshake packets.
    pub fn allowed_in_handshake(&self) -> bool {
        match self {
            Frame::Padding { .. } | Frame::Ping | Frame::Ack(_) | Frame::Crypto(_) => true,
            Frame::ConnectionClose(f) => !f.application,
            _ => false,
        }
    }
}
