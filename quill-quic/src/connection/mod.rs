//! # QUIC Connection (RFC 9000 Sections 5, 10, 17; RFC 9001 Section 4)
//!
//! One [`Connection`] per peer. It owns the key schedule, the sent-packet
//! buffer, the stream table and the handshake state, and runs inbound and
//! outbound packets through the stages in [`pipeline`].
//!
//! ## Locking
//! Inbound processing is serialized by the receive lock, which also guards
//! the TLS session and CRYPTO reassembly. The send path never takes it: key
//! slots, packet numbers, the sent buffer and the stream table each carry
//! their own lock, so application writes and retransmissions race freely
//! with acknowledgment processing.
//!
//! ## Construction
//! Connections are built with [`Arc::new_cyclic`]; the idle timer keeps a
//! weak back-reference and never keeps a connection alive on its own.

mod idle;
pub mod pipeline;
pub mod sender;
pub mod state;


use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use crate::config::EngineConfig;
use crate::crypto::{EncryptionLevel, KeySchedule};
use crate::error::{Error, Result, TransportError};
use crate::frames::{
    ConnectionCloseFrame, CryptoFrame, Frame, Payload, FRAME_TYPE_CRYPTO, FRAME_TYPE_HANDSHAKE_DONE,
};
use crate::packet::{
    HandshakePacket, InitialPacket, LongHeader, Packet, PacketNumberAllocator, RetryPacket,
    ShortPacket, VersionNegotiationPacket,
};
use crate::recovery::{CongestionController, PacketBuffer, Unlimited};
use crate::stream::{ReceiveBuffer, StreamEvent, StreamManager};
use crate::telemetry::{ConnectionStats, StatsSnapshot};
use crate::tls::{HandshakeOutput, TlsSession};
use crate::transport::TransportParameters;
use crate::types::{ConnectionId, Direction, PacketNumber, Side, StreamId};
use crate::version::VERSION_1;

use idle::IdleTimer;
use pipeline::Stage;

pub use pipeline::Flow;
pub use sender::{CompletionHandle, PacketSender, SendCompletion};
pub use state::{transition, ConnectionState, HandshakeEvent};

/// Out-of-order CRYPTO data held per level before the connection gives up.
pub const MAX_CRYPTO_BUFFER: usize = 64 * 1024;

/// Connection-level notifications for the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Entered `Ready` (client) or `Done` (server)
    HandshakeComplete,
    Stream(StreamEvent),
    Closed {
        error_code: u64,
        reason: String,
        /// The peer sent CONNECTION_CLOSE
        by_peer: bool,
    },
}

/// State touched only by inbound processing.
struct ReceiveState {
    tls: Box<dyn TlsSession>,
    crypto_recv: [ReceiveBuffer; 3],
    crypto_send: [u64; 3],
    /// Client Initial-level messages, sent again after a Retry
    initial_flight: Vec<Bytes>,
    /// Packets waiting for keys or for the handshake to finish
    buffered: VecDeque<Packet>,
    retried: bool,
    server_cid_learned: bool,
    handshake_seen: bool,
    flush_acks: bool,
}

/// Handshake position used to decide whether buffered packets may now pass.
type Progress = (ConnectionState, [bool; 3]);

pub struct Connection {
    side: Side,
    version: u32,
    config: Arc<EngineConfig>,
    local_cid: ConnectionId,
    remote_cid: RwLock<ConnectionId>,
    /// Destination ID of the client's first Initial
    original_dcid: ConnectionId,
    /// Retry token echoed in our Initial packets
    token: RwLock<Bytes>,
    state: Mutex<ConnectionState>,
    keys: KeySchedule,
    packet_numbers: PacketNumberAllocator,
    sent: PacketBuffer,
    streams: StreamManager,
    congestion: Box<dyn CongestionController>,
    sender: Arc<dyn PacketSender>,
    stages: Vec<Box<dyn Stage>>,
    receive: Mutex<ReceiveState>,
    idle: IdleTimer,
    /// Set on receipt; the next ack-eliciting send restarts the idle timer
    rearm_on_send: AtomicBool,
    stats: ConnectionStats,
    events: Mutex<VecDeque<ConnectionEvent>>,
}

struct Parts {
    side: Side,
    version: u32,
    keys: KeySchedule,
    local_cid: ConnectionId,
    remote_cid: ConnectionId,
    original_dcid: ConnectionId,
}

impl Connection {
    /// New client connection with random connection IDs. Call
    /// [`Connection::connect`] to send the ClientHello.
    pub fn client(
        config: Arc<EngineConfig>,
        tls: Box<dyn TlsSession>,
        sender: Arc<dyn PacketSender>,
    ) -> Result<Arc<Self>> {
        let original_dcid = ConnectionId::random();
        let parts = Parts {
            side: Side::Client,
            version: config.supported_versions.first().copied().unwrap_or(VERSION_1),
            keys: KeySchedule::with_initial(&original_dcid, Side::Client)?,
            local_cid: ConnectionId::random(),
            remote_cid: original_dcid.clone(),
            original_dcid,
        };
        Ok(Self::build(parts, config, tls, sender))
    }

    /// Server connection for the client Initial that created it. The
    /// connection answers to the Initial's Destination ID, so later packets
    /// from the client route here unchanged.
    pub fn server(
        config: Arc<EngineConfig>,
        tls: Box<dyn TlsSession>,
        sender: Arc<dyn PacketSender>,
        initial: &InitialPacket,
    ) -> Result<Arc<Self>> {
        let dcid = initial.header.dcid.clone();
        let parts = Parts {
            side: Side::Server,
            version: initial.header.version,
            keys: KeySchedule::with_initial(&dcid, Side::Server)?,
            local_cid: dcid.clone(),
            remote_cid: initial.header.scid.clone(),
            original_dcid: dcid,
        };
        let conn = Self::build(parts, config, tls, sender);
        {
            let mut rx = conn.receive.lock();
            let params = TransportParameters::from_config(&conn.config, &conn.local_cid);
            let output = rx.tls.start(&params)?;
            conn.apply_handshake_output(&mut rx, None, output)?;
        }
        conn.idle.rearm();
        info!(side = %conn.side, cid = %conn.local_cid, "connection accepted");
        Ok(conn)
    }

    fn build(
        parts: Parts,
        config: Arc<EngineConfig>,
        tls: Box<dyn TlsSession>,
        sender: Arc<dyn PacketSender>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Connection {
            side: parts.side,
            version: parts.version,
            local_cid: parts.local_cid,
            remote_cid: RwLock::new(parts.remote_cid),
            original_dcid: parts.original_dcid,
            token: RwLock::new(Bytes::new()),
            state: Mutex::new(ConnectionState::Started),
            keys: parts.keys,
            packet_numbers: PacketNumberAllocator::new(),
            sent: PacketBuffer::new(),
            streams: StreamManager::new(parts.side, &config),
            congestion: Box::new(Unlimited::default()),
            sender,
            stages: pipeline::stages(),
            receive: Mutex::new(ReceiveState {
                tls,
                crypto_recv: [ReceiveBuffer::new(), ReceiveBuffer::new(), ReceiveBuffer::new()],
                crypto_send: [0; 3],
                initial_flight: Vec::new(),
                buffered: VecDeque::new(),
                retried: false,
                server_cid_learned: false,
                handshake_seen: false,
                flush_acks: false,
            }),
            idle: IdleTimer::new(config.idle_timeout(), weak.clone()),
            rearm_on_send: AtomicBool::new(false),
            stats: ConnectionStats::default(),
            events: Mutex::new(VecDeque::new()),
            config,
        })
    }

    /// Send the ClientHello and wait until the sender has taken it.
    pub async fn connect(&self) -> Result<()> {
        let completion = {
            let mut rx = self.receive.lock();
            if self.side.is_server() {
                return Err(Error::IllegalState("only clients initiate a handshake"));
            }
            if self.state() != ConnectionState::Started {
                return Err(Error::IllegalState("handshake already started"));
            }
            let params = TransportParameters::from_config(&self.config, &self.local_cid);
            let started = rx
                .tls
                .start(&params)
                .and_then(|output| self.apply_handshake_output(&mut rx, None, output));
            match started {
                Ok(completion) => completion,
                Err(err) => return Err(self.fail(&mut rx, err)),
            }
        };
        self.idle.rearm();
        info!(side = %self.side, cid = %self.local_cid, dcid = %self.original_dcid, "connecting");
        match completion {
            Some(completion) => completion.wait().await,
            None => Err(Error::IllegalState("TLS produced no ClientHello")),
        }
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Process one decrypted inbound packet.
    ///
    /// Transport and crypto errors close the connection (CONNECTION_CLOSE is
    /// sent at the highest available level) before being returned. Other
    /// errors drop the packet and leave the connection untouched.
    pub fn on_packet(&self, packet: Packet) -> Result<()> {
        let mut rx = self.receive.lock();
        if self.state().is_closing() {
            trace!(cid = %self.local_cid, "packet for closed connection ignored");
            ConnectionStats::incr(&self.stats.packets_dropped);
            return Ok(());
        }
        ConnectionStats::incr(&self.stats.packets_received);
        self.idle.rearm();
        self.rearm_on_send.store(true, Ordering::Release);

        let before = self.progress();
        let result = self
            .process(&mut rx, packet)
            .and_then(|()| self.replay_buffered(&mut rx, before))
            .and_then(|()| self.after_receive(&mut rx));
        result.map_err(|err| self.fail(&mut rx, err))
    }

    fn process(&self, rx: &mut ReceiveState, packet: Packet) -> Result<()> {
        let mut packet = packet;
        for stage in &self.stages {
            match stage.on_receive(self, rx, packet)? {
                Flow::Continue(next) => packet = next,
                Flow::Stop => {
                    trace!(stage = stage.name(), "receive pipeline stopped");
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn progress(&self) -> Progress {
        (
            self.state(),
            EncryptionLevel::ALL.map(|level| self.keys.available(level)),
        )
    }

    /// Run buffered packets again for as long as doing so moves the
    /// handshake forward.
    fn replay_buffered(&self, rx: &mut ReceiveState, mut seen: Progress) -> Result<()> {
        while !rx.buffered.is_empty() && !self.state().is_closing() {
            let now = self.progress();
            if now == seen {
                break;
            }
            seen = now;
            let pending = std::mem::take(&mut rx.buffered);
            debug!(count = pending.len(), state = %now.0, "replaying buffered packets");
            for packet in pending {
                self.process(rx, packet)?;
            }
        }
        Ok(())
    }

    fn buffer_packet(&self, rx: &mut ReceiveState, packet: Packet) {
        if rx.buffered.len() >= self.config.max_buffered_packets {
            debug!(pn = ?packet.number(), "buffer full, packet dropped");
            ConnectionStats::incr(&self.stats.packets_dropped);
            return;
        }
        trace!(pn = ?packet.number(), level = ?packet.level(), "packet buffered");
        ConnectionStats::incr(&self.stats.packets_buffered);
        rx.buffered.push_back(packet);
    }

    /// Send what inbound processing left behind: stream control frames and,
    /// when a flush was requested, a standalone ACK.
    fn after_receive(&self, rx: &mut ReceiveState) -> Result<()> {
        if self.state().is_closing() {
            return Ok(());
        }
        let control = self.streams.take_pending_frames();
        if !control.is_empty() {
            let _ = self.transmit(EncryptionLevel::OneRtt, control)?;
        }

        if std::mem::take(&mut rx.flush_acks) && self.sent.has_pending_acks() {
            if let Some(ack) = self.sent.take_ack_frame() {
                let _ = self.transmit(EncryptionLevel::OneRtt, vec![Frame::Ack(ack)])?;
                ConnectionStats::incr(&self.stats.ack_only_sent);
            }
        }

        let collected = self.streams.collect_garbage();
        if collected > 0 {
            trace!(collected, "streams collected");
        }
        Ok(())
    }

    /// Close on fatal errors; hand every error back.
    fn fail(&self, rx: &mut ReceiveState, err: Error) -> Error {
        if err.is_fatal() {
            warn!(side = %self.side, cid = %self.local_cid, error = %err, "closing on error");
            self.close_locked(rx, close_frame_for(&err), true, false);
        } else {
            debug!(side = %self.side, error = %err, "packet rejected");
        }
        err
    }

    fn on_crypto(&self, rx: &mut ReceiveState, level: EncryptionLevel, frame: &CryptoFrame) -> Result<()> {
        let buffer = &mut rx.crypto_recv[level.index()];
        buffer.insert(frame.offset, frame.data.clone(), false)?;
        if buffer.buffered() > MAX_CRYPTO_BUFFER {
            return Err(Error::frame(
                TransportError::CryptoBufferExceeded,
                FRAME_TYPE_CRYPTO,
                format!("more than {MAX_CRYPTO_BUFFER} bytes of {level} CRYPTO data buffered"),
            ));
        }
        while let Some(chunk) = rx.crypto_recv[level.index()].read() {
            trace!(%level, len = chunk.len(), "handshake bytes to TLS");
            let output = rx.tls.process(level, &chunk)?;
            let _ = self.apply_handshake_output(rx, Some(level), output)?;
        }
        Ok(())
    }

    /// Act on one TLS step: peer parameters, new keys, outgoing messages and
    /// completion. Returns the completion of the last message sent.
    fn apply_handshake_output(
        &self,
        rx: &mut ReceiveState,
        received_at: Option<EncryptionLevel>,
        output: HandshakeOutput,
    ) -> Result<Option<SendCompletion>> {
        if let Some(params) = &output.peer_parameters {
            params.validate_from(self.side.opposite())?;
            self.streams.set_peer_parameters(params);
            debug!(
                max_data = params.initial_max_data,
                max_streams_bidi = params.initial_max_streams_bidi,
                "peer transport parameters applied"
            );
        }

        if received_at == Some(EncryptionLevel::Initial) {
            self.advance(HandshakeEvent::InitialReceived)?;
        }

        for secrets in &output.secrets {
            self.keys.set(secrets.level, Arc::new(secrets.cipher()?))?;
            if secrets.level == EncryptionLevel::Handshake {
                self.advance(HandshakeEvent::HandshakeKeysInstalled)?;
            }
        }

        let mut last = None;
        for (level, data) in output.messages {
            if self.side.is_client() && level == EncryptionLevel::Initial {
                rx.initial_flight.push(data.clone());
            }
            last = Some(self.send_crypto(rx, level, data)?);
            match level {
                EncryptionLevel::Initial => self.advance(HandshakeEvent::HelloSent)?,
                EncryptionLevel::Handshake => self.advance(HandshakeEvent::HandshakeSent)?,
                EncryptionLevel::OneRtt => false,
            };
        }

        if output.complete {
            self.advance(HandshakeEvent::HandshakeComplete)?;
        }
        Ok(last)
    }

    fn send_crypto(
        &self,
        rx: &mut ReceiveState,
        level: EncryptionLevel,
        data: Bytes,
    ) -> Result<SendCompletion> {
        let offset = rx.crypto_send[level.index()];
        rx.crypto_send[level.index()] += data.len() as u64;
        self.transmit(level, vec![Frame::Crypto(CryptoFrame { offset, data })])
    }

    /// Apply `event` to the state machine. Returns whether the state moved.
    fn advance(&self, event: HandshakeEvent) -> Result<bool> {
        let (from, to) = {
            let mut state = self.state.lock();
            let from = *state;
            match transition(self.side, from, event) {
                Some(to) => {
                    *state = to;
                    (from, to)
                }
                None => return Ok(false),
            }
        };
        info!(side = %self.side, cid = %self.local_cid, %from, %to, ?event, "state changed");
        if to.is_established() {
            self.on_established()?;
        }
        Ok(true)
    }

    fn on_established(&self) -> Result<()> {
        self.keys.discard_initial();
        self.sent.discard_level(EncryptionLevel::Initial);
        self.events.lock().push_back(ConnectionEvent::HandshakeComplete);
        if self.side.is_server() {
            // RFC 9000 Section 19.20
            let _ = self.transmit(EncryptionLevel::OneRtt, vec![Frame::HandshakeDone])?;
        }
        Ok(())
    }

    fn on_handshake_done(&self) -> Result<()> {
        match self.state() {
            ConnectionState::BeforeReady => {
                self.advance(HandshakeEvent::HandshakeConfirmed)?;
                Ok(())
            }
            ConnectionState::Ready => {
                trace!("duplicate HANDSHAKE_DONE");
                Ok(())
            }
            state => Err(Error::frame(
                TransportError::ProtocolViolation,
                FRAME_TYPE_HANDSHAKE_DONE,
                format!("HANDSHAKE_DONE received in state {state}"),
            )),
        }
    }

    /// Client side of RFC 9000 Section 17.2.5.2: switch to the server's new
    /// connection ID, re-key Initial and send the first flight again with the
    /// token. Only the first valid Retry is honored.
    fn on_retry(&self, rx: &mut ReceiveState, retry: &RetryPacket) -> Result<()> {
        if self.side.is_server() || rx.retried || self.state() != ConnectionState::BeforeHello {
            debug!("unexpected Retry ignored");
            ConnectionStats::incr(&self.stats.packets_dropped);
            return Ok(());
        }
        if retry.header.dcid != self.local_cid
            || retry.original_dcid != self.original_dcid
            || retry.token.is_empty()
        {
            debug!(dcid = %retry.header.dcid, "Retry does not match our Initial, ignored");
            ConnectionStats::incr(&self.stats.packets_dropped);
            return Ok(());
        }

        let new_dcid = retry.header.scid.clone();
        self.keys.rederive_initial(&new_dcid, Side::Client)?;
        rx.retried = true;
        *self.remote_cid.write() = new_dcid.clone();
        *self.token.write() = retry.token.clone();
        let discarded = self.sent.discard_level(EncryptionLevel::Initial);
        rx.crypto_send[EncryptionLevel::Initial.index()] = 0;
        info!(dcid = %new_dcid, token_len = retry.token.len(), discarded, "retrying with token");

        for data in rx.initial_flight.clone() {
            let _ = self.send_crypto(rx, EncryptionLevel::Initial, data)?;
        }
        Ok(())
    }

    /// RFC 9000 Section 6.2: give up unless the list contains our version,
    /// in which case the packet is ignored.
    fn on_version_negotiation(&self, rx: &mut ReceiveState, vn: &VersionNegotiationPacket) {
        if self.side.is_server()
            || self.state() != ConnectionState::BeforeHello
            || vn.dcid != self.local_cid
            || vn.supported_versions.contains(&self.version)
        {
            debug!(versions = ?vn.supported_versions, "Version Negotiation ignored");
            ConnectionStats::incr(&self.stats.packets_dropped);
            return;
        }
        warn!(ours = self.version, theirs = ?vn.supported_versions, "no common version");
        let frame = ConnectionCloseFrame {
            error_code: TransportError::ConnectionRefused.code(),
            frame_type: Some(0),
            reason: Bytes::from_static(b"no common version"),
            application: false,
        };
        self.close_locked(rx, frame, false, true);
    }

    fn on_peer_close(&self, rx: &mut ReceiveState, frame: &ConnectionCloseFrame) {
        info!(
            side = %self.side,
            cid = %self.local_cid,
            code = frame.error_code,
            reason = %String::from_utf8_lossy(&frame.reason),
            "peer closed connection"
        );
        self.close_locked(rx, frame.clone(), false, true);
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    fn build_packet(&self, level: EncryptionLevel, number: PacketNumber, payload: Payload) -> Packet {
        let dcid = self.remote_cid.read().clone();
        let header = || LongHeader {
            version: self.version,
            dcid: dcid.clone(),
            scid: self.local_cid.clone(),
        };
        match level {
            EncryptionLevel::Initial => Packet::Initial(InitialPacket {
                header: header(),
                token: self.token.read().clone(),
                number,
                payload,
            }),
            EncryptionLevel::Handshake => Packet::Handshake(HandshakePacket {
                header: header(),
                number,
                payload,
            }),
            EncryptionLevel::OneRtt => Packet::Short(ShortPacket {
                dcid: dcid.clone(),
                number,
                payload,
            }),
        }
    }

    /// Number, stage and hand `frames` to the sender at `level`.
    fn transmit(&self, level: EncryptionLevel, frames: Vec<Frame>) -> Result<SendCompletion> {
        let cipher = self.keys.get(level)?;
        let number = self.packet_numbers.next();
        let mut packet = self.build_packet(level, number, Payload::new(frames));
        for stage in &self.stages {
            match stage.before_send(self, packet)? {
                Flow::Continue(next) => packet = next,
                Flow::Stop => return Ok(SendCompletion::done()),
            }
        }
        ConnectionStats::incr(&self.stats.packets_sent);
        // RFC 9000 Section 10.1: the first ack-eliciting packet sent after a
        // receipt also restarts the idle timer
        if packet.payload().is_some_and(Payload::is_ack_eliciting)
            && self.rearm_on_send.swap(false, Ordering::AcqRel)
        {
            self.idle.rearm();
        }
        trace!(pn = number, %level, frames = packet.payload().map_or(0, Payload::len), "packet out");
        Ok(self.sender.send(packet, cipher))
    }

    fn ensure_established(&self) -> Result<()> {
        let state = self.state();
        if state.is_closing() {
            return Err(Error::ConnectionClosed);
        }
        if !state.is_established() {
            return Err(Error::IllegalState("handshake not complete"));
        }
        Ok(())
    }

    /// Send STREAM/DATA_BLOCKED frames queued by a refused write.
    fn flush_control_frames(&self) -> Result<()> {
        let frames = self.streams.take_pending_frames();
        if !frames.is_empty() {
            let _ = self.transmit(EncryptionLevel::OneRtt, frames)?;
        }
        Ok(())
    }

    pub fn open_stream(&self, direction: Direction) -> Result<StreamId> {
        self.ensure_established()?;
        self.streams.open(direction)
    }

    /// Write `data` to a stream. The write is all or nothing: without
    /// enough credit nothing is sent, the blocked frames go out, and
    /// [`Error::FlowControlBlocked`] is returned.
    pub fn write(&self, id: StreamId, data: Bytes, fin: bool) -> Result<SendCompletion> {
        self.ensure_established()?;
        let frame = match self.streams.write(id, data, fin) {
            Ok(frame) => frame,
            Err(err @ Error::FlowControlBlocked { .. }) => {
                self.flush_control_frames()?;
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        let mut frames = vec![frame];
        frames.extend(self.streams.take_pending_frames());
        self.transmit(EncryptionLevel::OneRtt, frames)
    }

    pub fn reset_stream(&self, id: StreamId, error_code: u64) -> Result<SendCompletion> {
        self.ensure_established()?;
        let frame = self.streams.reset(id, error_code)?;
        self.transmit(EncryptionLevel::OneRtt, vec![frame])
    }

    /// Next contiguous chunk of a stream, or `None` if nothing is ready.
    pub fn read(&self, id: StreamId) -> Result<Option<Bytes>> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let chunk = self.streams.read(id)?;
        // Reading can raise receive windows
        if self.state().is_established() {
            self.flush_control_frames()?;
        }
        Ok(chunk)
    }

    /// Hand back packets that went unacknowledged for longer than
    /// `retransmit_after_ms` and send their frames again under new numbers.
    /// Returns how many packets were resent.
    pub fn retransmit_expired(&self, now: Instant) -> Result<usize> {
        if self.state().is_closing() {
            return Ok(0);
        }
        let mut resent = 0;
        let mut first_error = None;
        for sent in self.sent.due_for_retransmit(now, self.config.retransmit_after()) {
            let (Some(pn), Some(level), Some(payload)) =
                (sent.packet.number(), sent.packet.level(), sent.packet.payload())
            else {
                continue;
            };
            let frames = payload.retransmittable();
            if frames.is_empty() || !self.keys.available(level) {
                trace!(pn, %level, "lost packet not resent");
                self.streams.on_packet_lost(&sent.packet);
                self.congestion.on_packet_lost(pn);
                continue;
            }

            debug!(pn, %level, frames = frames.len(), "retransmitting");
            match self.transmit(level, frames) {
                Ok(mut completion) => {
                    // the new packet is registered; only now forget the old one
                    self.streams.on_packet_lost(&sent.packet);
                    self.congestion.on_packet_lost(pn);
                    ConnectionStats::incr(&self.stats.packets_retransmitted);
                    resent += 1;
                    if let Some(err) = completion.immediate_failure() {
                        // already buffered under its new number
                        warn!(pn, %level, error = %err, "retransmission not sent");
                        first_error.get_or_insert(err);
                    }
                }
                Err(err) => {
                    warn!(pn, %level, error = %err, "retransmission failed, packet kept");
                    self.sent.restore(sent);
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(resent),
        }
    }

    // ========================================================================
    // Close
    // ========================================================================

    /// Close with an application error code (RFC 9000 Section 10.2).
    pub fn close(&self, error_code: u64, reason: &str) {
        let mut rx = self.receive.lock();
        let frame = ConnectionCloseFrame {
            error_code,
            frame_type: None,
            reason: Bytes::copy_from_slice(reason.as_bytes()),
            application: true,
        };
        self.close_locked(&mut rx, frame, true, false);
    }

    pub(crate) fn on_idle_timeout(&self) {
        let mut rx = self.receive.lock();
        if !self.idle.expired() || self.state().is_closing() {
            return;
        }
        info!(
            side = %self.side,
            cid = %self.local_cid,
            timeout_ms = self.idle.timeout().as_millis() as u64,
            "idle timeout"
        );
        let frame = ConnectionCloseFrame {
            error_code: TransportError::NoError.code(),
            frame_type: Some(0),
            reason: Bytes::from_static(b"idle timeout"),
            application: false,
        };
        // RFC 9000 Section 10.1: idle timeout closes silently
        self.close_locked(&mut rx, frame, false, false);
    }

    /// Enter `Closing`, optionally tell the peer, release everything and
    /// settle in `Closed`.
    fn close_locked(
        &self,
        rx: &mut ReceiveState,
        frame: ConnectionCloseFrame,
        notify_peer: bool,
        by_peer: bool,
    ) {
        {
            let mut state = self.state.lock();
            if state.is_closing() {
                return;
            }
            *state = ConnectionState::Closing;
        }

        if notify_peer {
            if let Some(level) = self.keys.highest_available() {
                let frame = close_frame_at(frame.clone(), level);
                match self.transmit(level, vec![Frame::ConnectionClose(frame)]) {
                    Ok(completion) => drop(completion),
                    Err(err) => error!(error = %err, "failed to send CONNECTION_CLOSE"),
                }
            }
        }

        self.idle.cancel();
        self.streams.clear();
        self.sent.clear();
        rx.buffered.clear();
        rx.initial_flight.clear();
        for buffer in rx.crypto_recv.iter_mut() {
            buffer.clear();
        }
        self.keys.discard_all();
        *self.state.lock() = ConnectionState::Closed;

        let reason = String::from_utf8_lossy(&frame.reason).into_owned();
        info!(
            side = %self.side,
            cid = %self.local_cid,
            code = frame.error_code,
            %reason,
            by_peer,
            "connection closed"
        );
        self.events.lock().push_back(ConnectionEvent::Closed {
            error_code: frame.error_code,
            reason,
            by_peer,
        });
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn poll_event(&self) -> Option<ConnectionEvent> {
        if let Some(event) = self.events.lock().pop_front() {
            return Some(event);
        }
        self.streams.poll_event().map(ConnectionEvent::Stream)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// The ID this endpoint answers to.
    pub fn local_cid(&self) -> &ConnectionId {
        &self.local_cid
    }

    /// The ID placed in outgoing packets.
    pub fn remote_cid(&self) -> ConnectionId {
        self.remote_cid.read().clone()
    }

    pub fn original_dcid(&self) -> &ConnectionId {
        &self.original_dcid
    }

    pub fn streams(&self) -> &StreamManager {
        &self.streams
    }

    pub fn is_established(&self) -> bool {
        self.state().is_established()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Packets sent and not yet acknowledged.
    pub fn unacked(&self) -> usize {
        self.sent.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("side", &self.side)
            .field("local_cid", &self.local_cid)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn close_frame_for(err: &Error) -> ConnectionCloseFrame {
    let frame_type = match err {
        Error::Transport { frame_type, .. } => frame_type.unwrap_or(0),
        _ => 0,
    };
    ConnectionCloseFrame {
        error_code: err
            .transport_code()
            .unwrap_or(TransportError::InternalError.code()),
        frame_type: Some(frame_type),
        reason: Bytes::from(err.to_string()),
        application: false,
    }
}

/// Application closes become APPLICATION_ERROR below 1-RTT so the code and
/// reason stay private (RFC 9000 Section 10.2.3).
fn close_frame_at(frame: ConnectionCloseFrame, level: EncryptionLevel) -> ConnectionCloseFrame {
    if frame.application && level != EncryptionLevel::OneRtt {
        return ConnectionCloseFrame {
            error_code: TransportError::ApplicationError.code(),
            frame_type: Some(0),
            reason: Bytes::new(),
            application: false,
        };
    }
    frame
}
