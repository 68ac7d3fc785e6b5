//! # Stream States (RFC 9000 Section 3)
//!
//! ```text
//! Sending half:                        Receiving half:
//!
//!   Ready --data--> Send                 Recv --fin--> SizeKnown
//!     |              |                     |              |
//!     +-----fin------+--> DataSent         |        all data received
//!     |              |       |             |              v
//!   reset          reset   all acked       |          DataRecvd --app read--> DataRead
//!     v              v       v             |
//!   ResetSent <------+    DataRecvd      RESET_STREAM --> ResetRecvd --app read--> ResetRead
//!     |
//!   reset acked --> ResetRecvd
//! ```

use std::collections::BTreeSet;

use super::buffer::ReceiveBuffer;
use crate::types::{PacketNumber, StreamId};

/// Sending half state (RFC 9000 Section 3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Ready,
    Send,
    /// FIN sent, waiting for every STREAM frame to be acknowledged
    DataSent,
    DataRecvd,
    ResetSent,
    ResetRecvd,
}

impl SendState {
    pub fn can_send(self) -> bool {
        matches!(self, SendState::Ready | SendState::Send)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SendState::DataRecvd | SendState::ResetRecvd)
    }
}

/// Receiving half state (RFC 9000 Section 3.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    Recv,
    SizeKnown,
    DataRecvd,
    DataRead,
    ResetRecvd,
    ResetRead,
}

impl RecvState {
    pub fn can_receive(self) -> bool {
        matches!(self, RecvState::Recv | RecvState::SizeKnown)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RecvState::DataRead | RecvState::ResetRead)
    }

    pub fn is_reset(self) -> bool {
        matches!(self, RecvState::ResetRecvd | RecvState::ResetRead)
    }
}

#[derive(Debug)]
pub(crate) struct SendHalf {
    pub state: SendState,
    /// Next offset to write
    pub offset: u64,
    /// Packets carrying STREAM frames not yet acknowledged
    pub outstanding: BTreeSet<PacketNumber>,
    /// Latest packet that carried our FIN
    pub fin_packet: Option<PacketNumber>,
    pub fin_acked: bool,
    /// Packet that carried our RESET_STREAM
    pub reset_packet: Option<PacketNumber>,
}

impl SendHalf {
    fn new() -> Self {
        Self {
            state: SendState::Ready,
            offset: 0,
            outstanding: BTreeSet::new(),
            fin_packet: None,
            fin_acked: false,
            reset_packet: None,
        }
    }

    /// Register `pn` as carrying a STREAM frame of this half.
    pub fn on_sent(&mut self, pn: PacketNumber, fin: bool) {
        self.outstanding.insert(pn);
        if fin {
            self.fin_packet = Some(pn);
        }
    }

    /// Record acknowledgment of `pn`. Returns true when the half just
    /// reached a terminal state.
    ///
    /// DataRecvd needs the FIN itself acknowledged, not merely an empty
    /// outstanding set: the FIN may still be waiting for its packet.
    pub fn on_acked(&mut self, pn: PacketNumber, carried_reset: bool) -> bool {
        self.outstanding.remove(&pn);
        if carried_reset && self.reset_packet == Some(pn) && self.state == SendState::ResetSent {
            self.state = SendState::ResetRecvd;
            return true;
        }
        if self.fin_packet == Some(pn) {
            self.fin_acked = true;
        }
        if self.state == SendState::DataSent && self.fin_acked && self.outstanding.is_empty() {
            self.state = SendState::DataRecvd;
            return true;
        }
        false
    }

    pub fn on_lost(&mut self, pn: PacketNumber) {
        self.outstanding.remove(&pn);
        if self.fin_packet == Some(pn) {
            self.fin_packet = None;
        }
        if self.reset_packet == Some(pn) {
            self.reset_packet = None;
        }
    }
}

#[derive(Debug)]
pub(crate) struct RecvHalf {
    pub state: RecvState,
    pub buffer: ReceiveBuffer,
    /// Error code from the peer's RESET_STREAM
    pub reset_code: Option<u64>,
}

impl RecvHalf {
    fn new() -> Self {
        Self {
            state: RecvState::Recv,
            buffer: ReceiveBuffer::new(),
            reset_code: None,
        }
    }

    /// Advance Recv -> SizeKnown -> DataRecvd after new data.
    pub fn refresh(&mut self) {
        if self.state == RecvState::Recv && self.buffer.final_size().is_some() {
            self.state = RecvState::SizeKnown;
        }
        if self.state == RecvState::SizeKnown && self.buffer.is_complete() {
            self.state = RecvState::DataRecvd;
        }
        if self.state == RecvState::DataRecvd && self.buffer.is_fully_read() {
            self.state = RecvState::DataRead;
        }
    }
}

/// One stream: either half is absent on unidirectional streams.
#[derive(Debug)]
pub struct Stream {
    pub id: StreamId,
    pub(crate) send: Option<SendHalf>,
    pub(crate) recv: Option<RecvHalf>,
}

impl Stream {
    /// Stream with the halves `id` permits for a local `side`.
    pub(crate) fn new(id: StreamId, can_send: bool, can_receive: bool) -> Self {
        Self {
            id,
            send: can_send.then(SendHalf::new),
            recv: can_receive.then(RecvHalf::new),
        }
    }

    pub fn send_state(&self) -> Option<SendState> {
        self.send.as_ref().map(|s| s.state)
    }

    pub fn recv_state(&self) -> Option<RecvState> {
        self.recv.as_ref().map(|r| r.state)
    }

    pub fn can_send(&self) -> bool {
        self.send_state().is_some_and(SendState::can_send)
    }

    pub fn can_receive(&self) -> bool {
        self.recv_state().is_some_and(RecvState::can_receive)
    }

    /// Either half can make no further progress on the wire.
    pub fn is_finished(&self) -> bool {
        !self.can_send() || !self.can_receive()
    }

    /// Both halves are terminal; the stream can be dropped.
    pub fn is_closed(&self) -> bool {
        self.send_state().map_or(true, SendState::is_terminal)
            && self.recv_state().map_or(true, RecvState::is_terminal)
    }
}
