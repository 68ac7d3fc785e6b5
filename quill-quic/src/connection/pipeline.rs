//! Packet stages.
//!
//! Every inbound packet walks the connection's stages in order, and so does
//! every outbound packet before it reaches the sender. Each stage hands the
//! (possibly rewritten) packet to the next one or stops the walk.
//!
//! | Stage   | Receive                                   | Send                              |
//! |---------|-------------------------------------------|-----------------------------------|
//! | `State` | Retry/VN, key and state gating, legality  | refuse after close, gate 1-RTT    |
//! | `Ack`   | pending ACKs, ACK frames, flush decision  | piggyback ACKs, buffer the packet |
//! | `Frame` | dispatch frames to TLS, streams, close    | tie stream frames to the packet   |

use std::time::Instant;

use tracing::{debug, trace};

use super::{Connection, ReceiveState};
use crate::crypto::EncryptionLevel;
use crate::error::{Error, Result, TransportError};
use crate::frames::{Frame, FRAME_TYPE_HANDSHAKE_DONE};
use crate::packet::Packet;
use crate::telemetry::ConnectionStats;

/// What a stage decided about a packet.
#[derive(Debug)]
pub enum Flow {
    /// Hand this packet to the next stage
    Continue(Packet),
    /// The packet is fully handled (or dropped)
    Stop,
}

pub(super) trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    fn on_receive(&self, conn: &Connection, rx: &mut ReceiveState, packet: Packet)
        -> Result<Flow>;

    fn before_send(&self, conn: &Connection, packet: Packet) -> Result<Flow>;
}

pub(super) fn stages() -> Vec<Box<dyn Stage>> {
    vec![Box::new(StateStage), Box::new(AckStage), Box::new(FrameStage)]
}

fn carries(packet: &Packet, pred: impl Fn(&Frame) -> bool) -> bool {
    packet
        .payload()
        .is_some_and(|payload| payload.frames().iter().any(pred))
}

// ============================================================================
// State
// ============================================================================

struct StateStage;

impl Stage for StateStage {
    fn name(&self) -> &'static str {
        "state"
    }

    fn on_receive(
        &self,
        conn: &Connection,
        rx: &mut ReceiveState,
        packet: Packet,
    ) -> Result<Flow> {
        let level = match &packet {
            Packet::Retry(retry) => {
                conn.on_retry(rx, retry)?;
                return Ok(Flow::Stop);
            }
            Packet::VersionNegotiation(vn) => {
                conn.on_version_negotiation(rx, vn);
                return Ok(Flow::Stop);
            }
            Packet::Initial(_) => EncryptionLevel::Initial,
            Packet::Handshake(_) => EncryptionLevel::Handshake,
            Packet::Short(_) => EncryptionLevel::OneRtt,
        };
        let state = conn.state();

        if !conn.keys.available(level) {
            if level == EncryptionLevel::Initial {
                // Initial keys are gone once the handshake is done
                trace!(pn = ?packet.number(), "late Initial packet dropped");
                ConnectionStats::incr(&conn.stats.packets_dropped);
            } else {
                conn.buffer_packet(rx, packet);
            }
            return Ok(Flow::Stop);
        }

        // RFC 9001 Section 5.7: the server holds 1-RTT keys before it has
        // verified the client's Finished, and must not use them until then
        if level == EncryptionLevel::OneRtt && conn.side.is_server() && !state.is_established() {
            conn.buffer_packet(rx, packet);
            return Ok(Flow::Stop);
        }

        if let Some(payload) = packet.payload() {
            if level != EncryptionLevel::OneRtt {
                if let Some(frame) = payload.frames().iter().find(|f| !f.allowed_in_handshake()) {
                    return Err(Error::frame(
                        TransportError::ProtocolViolation,
                        frame.frame_type(),
                        format!("frame type {:#x} not allowed at {level} level", frame.frame_type()),
                    ));
                }
            }
            if conn.side.is_server() && carries(&packet, |f| matches!(f, Frame::HandshakeDone)) {
                return Err(Error::frame(
                    TransportError::ProtocolViolation,
                    FRAME_TYPE_HANDSHAKE_DONE,
                    "client sent HANDSHAKE_DONE",
                ));
            }
        }

        if conn.side.is_client() && !rx.server_cid_learned {
            if let Some(scid) = packet.scid() {
                debug!(scid = %scid, "server connection id learned");
                *conn.remote_cid.write() = scid.clone();
                rx.server_cid_learned = true;
            }
        }

        if level == EncryptionLevel::Handshake && !rx.handshake_seen {
            rx.handshake_seen = true;
            // The peer has Handshake keys, so it holds everything we sent at Initial
            let dropped = conn.sent.discard_level(EncryptionLevel::Initial);
            trace!(dropped, "initial packets no longer tracked");
        }

        Ok(Flow::Continue(packet))
    }

    fn before_send(&self, conn: &Connection, packet: Packet) -> Result<Flow> {
        let state = conn.state();
        if state.is_established() {
            return Ok(Flow::Continue(packet));
        }
        if state.is_closing() {
            if state == super::ConnectionState::Closing
                && carries(&packet, |f| matches!(f, Frame::ConnectionClose(_)))
            {
                return Ok(Flow::Continue(packet));
            }
            return Err(Error::ConnectionClosed);
        }
        if packet.level() == Some(EncryptionLevel::OneRtt)
            && carries(&packet, |f| {
                matches!(f, Frame::Stream(_) | Frame::ResetStream(_))
            })
        {
            return Err(Error::IllegalState("stream data before the handshake completed"));
        }
        Ok(Flow::Continue(packet))
    }
}

// ============================================================================
// Acknowledgment
// ============================================================================

struct AckStage;

impl Stage for AckStage {
    fn name(&self) -> &'static str {
        "ack"
    }

    fn on_receive(
        &self,
        conn: &Connection,
        rx: &mut ReceiveState,
        packet: Packet,
    ) -> Result<Flow> {
        let largest_sent = conn.packet_numbers.largest_sent();
        let outcome = conn.sent.on_packet(&packet, largest_sent, &conn.streams)?;
        for pn in &outcome.newly_acked {
            conn.congestion.on_packet_acked(*pn);
        }
        ConnectionStats::add(&conn.stats.packets_acked, outcome.newly_acked.len() as u64);
        if outcome.flush {
            rx.flush_acks = true;
        }
        Ok(Flow::Continue(packet))
    }

    fn before_send(&self, conn: &Connection, packet: Packet) -> Result<Flow> {
        let packet = conn.sent.send(packet, Instant::now())?;
        if let Some(pn) = packet.number() {
            conn.congestion.on_packet_sent(pn);
        }
        Ok(Flow::Continue(packet))
    }
}

// ============================================================================
// Frames
// ============================================================================

struct FrameStage;

impl Stage for FrameStage {
    fn name(&self) -> &'static str {
        "frame"
    }

    fn on_receive(
        &self,
        conn: &Connection,
        rx: &mut ReceiveState,
        packet: Packet,
    ) -> Result<Flow> {
        let (Some(level), Some(payload)) = (packet.level(), packet.payload()) else {
            return Ok(Flow::Stop);
        };

        for frame in payload.frames() {
            match frame {
                Frame::Padding { .. } | Frame::Ping | Frame::Ack(_) => {}
                Frame::Crypto(f) => conn.on_crypto(rx, level, f)?,
                Frame::Stream(f) => conn.streams.on_stream_frame(f)?,
                Frame::ResetStream(f) => conn.streams.on_reset_stream(f)?,
                Frame::MaxData(f) => conn.streams.on_max_data(f),
                Frame::MaxStreamData(f) => conn.streams.on_max_stream_data(f)?,
                Frame::DataBlocked(f) => conn.streams.on_data_blocked(f),
                Frame::StreamDataBlocked(f) => conn.streams.on_stream_data_blocked(f)?,
                Frame::ConnectionClose(f) => {
                    conn.on_peer_close(rx, f);
                    return Ok(Flow::Stop);
                }
                Frame::HandshakeDone => conn.on_handshake_done()?,
            }
        }
        Ok(Flow::Continue(packet))
    }

    fn before_send(&self, conn: &Connection, packet: Packet) -> Result<Flow> {
        conn.streams.on_packet_sent(&packet);
        Ok(Flow::Continue(packet))
    }
}
