//! # Sent-Packet Buffer (RFC 9002 Sections 2-3)
//!
//! Holds every outbound packet that carries more than ACKs until the peer
//! acknowledges it, and collects inbound packet numbers that still need to
//! be acknowledged.
//!
//! ## Outbound
//! An ACK-eliciting packet leaving while acknowledgments are pending picks up
//! an ACK frame covering them. The augmented packet is both buffered and
//! handed to the sender.
//!
//! ## Inbound
//! - The packet number joins the pending-ACK queue, except for Initial
//!   packets.
//! - Embedded ACK frames are validated in full, then applied: every buffered
//!   packet in range is removed and reported to the [`AckListener`] once.
//! - An immediate ACK is requested unless the packet is Initial, Handshake
//!   or ACK-only, so acknowledgments never elicit acknowledgments.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::ack;
use crate::crypto::EncryptionLevel;
use crate::error::{Error, Result, TransportError};
use crate::frames::{AckFrame, Frame, FRAME_TYPE_ACK};
use crate::packet::{Packet, PacketType};
use crate::types::PacketNumber;

/// Receives packets the peer has acknowledged.
pub trait AckListener: Send + Sync {
    fn on_packet_acked(&self, packet: &Packet);
}

/// A buffered outbound packet.
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub packet: Packet,
    pub sent_at: Instant,
}

/// Result of feeding one inbound packet to the buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckOutcome {
    /// Numbers of our packets this packet acknowledged for the first time
    pub newly_acked: Vec<PacketNumber>,
    /// Whether pending acknowledgments should go out now
    pub flush: bool,
}

#[derive(Default)]
struct BufferState {
    sent: BTreeMap<PacketNumber, SentPacket>,
    ack_queue: BTreeSet<PacketNumber>,
    largest_acked: Option<PacketNumber>,
}

#[derive(Default)]
pub struct PacketBuffer {
    state: Mutex<BufferState>,
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepare `packet` for transmission, returning the packet to send.
    pub fn send(&self, packet: Packet, now: Instant) -> Result<Packet> {
        let number = packet
            .number()
            .ok_or(Error::IllegalState("only numbered packets pass the send buffer"))?;
        let mut state = self.state.lock();

        let packet = match packet.payload() {
            Some(payload) if payload.is_ack_eliciting() && !state.ack_queue.is_empty() => {
                let pending = std::mem::take(&mut state.ack_queue);
                match ack::ack_frame(pending, 0) {
                    Some(frame) => {
                        trace!(pn = number, ranges = frame.ranges.len(), "piggybacking ACK");
                        let payload = payload.with_frame(Frame::Ack(frame));
                        packet.with_payload(payload)
                    }
                    None => packet,
                }
            }
            _ => packet,
        };

        if !packet.is_ack_only() {
            state.sent.insert(
                number,
                SentPacket {
                    packet: packet.clone(),
                    sent_at: now,
                },
            );
        }
        Ok(packet)
    }

    /// Account for an inbound packet.
    ///
    /// `largest_sent` bounds what the peer may acknowledge; acknowledging a
    /// packet never sent is a PROTOCOL_VIOLATION. No state changes when any
    /// ACK frame in the packet is invalid.
    pub fn on_packet(
        &self,
        packet: &Packet,
        largest_sent: Option<PacketNumber>,
        listener: &dyn AckListener,
    ) -> Result<AckOutcome> {
        let (Some(number), Some(payload)) = (packet.number(), packet.payload()) else {
            return Ok(AckOutcome::default());
        };

        for frame in payload.acks() {
            validate_ack(frame, largest_sent)?;
        }

        let acked = {
            let mut state = self.state.lock();
            if packet.packet_type() != PacketType::Initial {
                state.ack_queue.insert(number);
            }

            let mut acked = Vec::new();
            for frame in payload.acks() {
                for range in &frame.ranges {
                    let numbers: Vec<PacketNumber> = state
                        .sent
                        .range(range.smallest..=range.largest)
                        .map(|(pn, _)| *pn)
                        .collect();
                    for pn in numbers {
                        if let Some(sent) = state.sent.remove(&pn) {
                            acked.push(sent);
                        }
                    }
                }
                if let Some(largest) = frame.largest() {
                    state.largest_acked = state.largest_acked.max(Some(largest));
                }
            }
            acked
        };

        for sent in &acked {
            listener.on_packet_acked(&sent.packet);
        }
        if !acked.is_empty() {
            debug!(count = acked.len(), "packets acknowledged");
        }

        let flush = !matches!(
            packet.packet_type(),
            PacketType::Initial | PacketType::Handshake
        ) && !payload.is_ack_only();

        Ok(AckOutcome {
            newly_acked: acked.iter().filter_map(|s| s.packet.number()).collect(),
            flush,
        })
    }

    /// Drain pending acknowledgments into a standalone ACK frame.
    pub fn take_ack_frame(&self) -> Option<AckFrame> {
        let pending = std::mem::take(&mut self.state.lock().ack_queue);
        ack::ack_frame(pending, 0)
    }

    pub fn has_pending_acks(&self) -> bool {
        !self.state.lock().ack_queue.is_empty()
    }

    /// Remove and return packets sent at least `age` before `now`.
    pub fn due_for_retransmit(&self, now: Instant, age: Duration) -> Vec<SentPacket> {
        let mut state = self.state.lock();
        let due: Vec<PacketNumber> = state
            .sent
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.sent_at) >= age)
            .map(|(pn, _)| *pn)
            .collect();
        due.into_iter()
            .filter_map(|pn| state.sent.remove(&pn))
            .collect()
    }

    /// Put back a packet taken by [`PacketBuffer::due_for_retransmit`] that
    /// could not be sent again. It keeps its original send time.
    pub fn restore(&self, sent: SentPacket) {
        if let Some(pn) = sent.packet.number() {
            self.state.lock().sent.insert(pn, sent);
        }
    }

    /// Drop buffered packets of one level once its keys are retired.
    pub fn discard_level(&self, level: EncryptionLevel) -> usize {
        let mut state = self.state.lock();
        let before = state.sent.len();
        state.sent.retain(|_, s| s.packet.level() != Some(level));
        before - state.sent.len()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.sent.clear();
        state.ack_queue.clear();
    }

    pub fn contains(&self, pn: PacketNumber) -> bool {
        self.state.lock().sent.contains_key(&pn)
    }

    pub fn len(&self) -> usize {
        self.state.lock().sent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn largest_acked(&self) -> Option<PacketNumber> {
        self.state.lock().largest_acked
    }
}

fn validate_ack(frame: &AckFrame, largest_sent: Option<PacketNumber>) -> Result<()> {
    if frame.ranges.is_empty() {
        return Err(Error::frame(
            TransportError::FrameEncodingError,
            FRAME_TYPE_ACK,
            "ACK frame without ranges",
        ));
    }
    let mut sorted = frame.ranges.clone();
    sorted.sort_unstable();
    for (i, range) in sorted.iter().enumerate() {
        if range.is_empty() {
            return Err(Error::frame(
                TransportError::FrameEncodingError,
                FRAME_TYPE_ACK,
                "ACK range smallest exceeds largest",
            ));
        }
        if i > 0 && sorted[i - 1].largest >= range.smallest {
            return Err(Error::frame(
                TransportError::FrameEncodingError,
                FRAME_TYPE_ACK,
                "overlapping ACK ranges",
            ));
        }
    }
    let largest = sorted.last().map(|r| r.largest);
    match (largest, largest_sent) {
        (Some(acked), Some(sent)) if acked <= sent => Ok(()),
        _ => Err(Error::frame(
            TransportError::ProtocolViolation,
            FRAME_TYPE_ACK,
            "acknowledged a packet that was never sent",
        )),
    }
}
