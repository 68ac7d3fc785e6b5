//! # Stream Manager (RFC 9000 Sections 2-4)
//!
//! Owns the stream table of one connection together with both flow-control
//! ledgers. Inbound STREAM / RESET_STREAM / MAX_* frames are applied here,
//! and local writes come back as frames ready to be packed.
//!
//! ## Stream creation
//!
//! - Local streams are opened explicitly with [`StreamManager::open`], within
//!   the peer's stream-count limits.
//! - Peer streams open on the first frame that references them. Opening
//!   index `n` implicitly opens every lower index of the same type
//!   (RFC 9000 Section 3.2). Indices beyond our configured limits are a
//!   STREAM_LIMIT_ERROR.
//! - Frames for streams already garbage-collected are ignored.
//!
//! ## Control frames
//!
//! MAX_DATA / MAX_STREAM_DATA raised by incoming data and the *_BLOCKED
//! frames produced by refused writes are queued; the connection collects
//! them with [`StreamManager::take_pending_frames`].

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::state::{RecvState, SendState, Stream};
use crate::config::{EngineConfig, FlowControlConfig};
use crate::error::{Error, Result, TransportError};
use crate::flow_control::{Credit, ReceiveWindow, SendCredit};
use crate::frames::{
    DataBlockedFrame, Frame, MaxDataFrame, MaxStreamDataFrame, ResetStreamFrame,
    StreamDataBlockedFrame, StreamFrame, FRAME_TYPE_MAX_STREAM_DATA, FRAME_TYPE_RESET_STREAM,
    FRAME_TYPE_STREAM_BASE, FRAME_TYPE_STREAM_DATA_BLOCKED,
};
use crate::packet::Packet;
use crate::recovery::AckListener;
use crate::transport::TransportParameters;
use crate::types::{Direction, Side, StreamId};

/// Stream Event (for application notification)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Peer opened a stream
    Opened { stream_id: StreamId },

    /// Data is ready at the read offset
    Readable { stream_id: StreamId },

    /// Every byte up to the final size has arrived
    Finished { stream_id: StreamId },

    /// Peer reset the stream
    Reset {
        stream_id: StreamId,
        error_code: u64,
        final_size: u64,
    },

    /// Peer acknowledged all data we sent, FIN included
    SendFinished { stream_id: StreamId },
}

/// Limits announced by the peer's transport parameters.
#[derive(Debug, Clone, Copy)]
struct PeerLimits {
    max_streams_bidi: u64,
    max_streams_uni: u64,
    stream_data_bidi_local: u64,
    stream_data_bidi_remote: u64,
    stream_data_uni: u64,
}

impl From<&TransportParameters> for PeerLimits {
    fn from(params: &TransportParameters) -> Self {
        Self {
            max_streams_bidi: params.initial_max_streams_bidi,
            max_streams_uni: params.initial_max_streams_uni,
            stream_data_bidi_local: params.initial_max_stream_data_bidi_local,
            stream_data_bidi_remote: params.initial_max_stream_data_bidi_remote,
            stream_data_uni: params.initial_max_stream_data_uni,
        }
    }
}

#[derive(Default)]
struct StreamTable {
    streams: HashMap<StreamId, Stream>,
    /// Next index for locally opened streams, [bidi, uni]
    next_local: [u64; 2],
    /// Peer streams opened so far, [bidi, uni]
    peer_opened: [u64; 2],
    peer: Option<PeerLimits>,
}

fn slot(direction: Direction) -> usize {
    match direction {
        Direction::Bidirectional => 0,
        Direction::Unidirectional => 1,
    }
}

/// Stream Manager (Connection-Level)
pub struct StreamManager {
    /// Local side (Client or Server)
    side: Side,
    flow: FlowControlConfig,
    /// Peer-initiated stream limits we enforce, [bidi, uni]
    max_peer_streams: [u64; 2],
    table: Mutex<StreamTable>,
    send_credit: SendCredit,
    receive_window: ReceiveWindow,
    pending: Mutex<Vec<Frame>>,
    events: Mutex<VecDeque<StreamEvent>>,
}

impl StreamManager {
    pub fn new(side: Side, config: &EngineConfig) -> Self {
        Self {
            side,
            flow: config.flow_control.clone(),
            max_peer_streams: [config.max_streams_bidi, config.max_streams_uni],
            table: Mutex::new(StreamTable::default()),
            // no credit until the peer's parameters arrive
            send_credit: SendCredit::new(0),
            receive_window: ReceiveWindow::new(config.flow_control.initial_max_data),
            pending: Mutex::new(Vec::new()),
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Apply the peer's transport parameters. Raises the credit of streams
    /// opened before they were known.
    pub fn set_peer_parameters(&self, params: &TransportParameters) {
        let mut table = self.table.lock();
        let peer = PeerLimits::from(params);
        table.peer = Some(peer);
        self.send_credit.on_max_data(params.initial_max_data);
        for (id, stream) in &table.streams {
            if stream.send.is_some() {
                self.send_credit
                    .on_max_stream_data(*id, self.send_limit(Some(peer), *id));
            }
        }
        debug!(
            max_data = params.initial_max_data,
            max_streams_bidi = peer.max_streams_bidi,
            max_streams_uni = peer.max_streams_uni,
            "peer stream limits applied"
        );
    }

    /// Credit the peer grants us on `id`.
    fn send_limit(&self, peer: Option<PeerLimits>, id: StreamId) -> u64 {
        let Some(peer) = peer else { return 0 };
        match (id.is_local(self.side), id.direction()) {
            (true, Direction::Bidirectional) => peer.stream_data_bidi_remote,
            (false, Direction::Bidirectional) => peer.stream_data_bidi_local,
            (true, Direction::Unidirectional) => peer
                .stream_data_uni
                .min(self.flow.initial_max_stream_data_uni_local),
            (false, Direction::Unidirectional) => 0,
        }
    }

    /// Window we grant the peer on `id`.
    fn receive_limit(&self, id: StreamId) -> u64 {
        match (id.is_local(self.side), id.direction()) {
            (true, Direction::Bidirectional) => self.flow.initial_max_stream_data_bidi_local,
            (false, Direction::Bidirectional) => self.flow.initial_max_stream_data_bidi_remote,
            (false, Direction::Unidirectional) => self.flow.initial_max_stream_data_uni_remote,
            (true, Direction::Unidirectional) => 0,
        }
    }

    fn register(&self, table: &mut StreamTable, id: StreamId) {
        let stream = Stream::new(id, id.can_send(self.side), id.can_receive(self.side));
        if stream.send.is_some() {
            self.send_credit
                .register_stream(id, self.send_limit(table.peer, id));
        }
        if stream.recv.is_some() {
            self.receive_window
                .register_stream(id, self.receive_limit(id));
        }
        table.streams.insert(id, stream);
    }

    /// Open a local stream.
    pub fn open(&self, direction: Direction) -> Result<StreamId> {
        let mut table = self.table.lock();
        let peer = table
            .peer
            .ok_or(Error::IllegalState("peer transport parameters not yet known"))?;
        let limit = match direction {
            Direction::Bidirectional => peer.max_streams_bidi,
            Direction::Unidirectional => peer.max_streams_uni,
        };
        let index = table.next_local[slot(direction)];
        if index >= limit {
            return Err(Error::IllegalState("peer stream limit reached"));
        }
        table.next_local[slot(direction)] += 1;
        let id = StreamId::new(index, self.side, direction);
        self.register(&mut table, id);
        debug!(stream_id = %id, ?direction, "stream opened");
        Ok(id)
    }

    /// Resolve a stream referenced by a peer frame, opening peer streams on
    /// first reference. `Ok(None)` means the stream was already collected.
    fn resolve<'a>(
        &self,
        table: &'a mut StreamTable,
        id: StreamId,
        frame_type: u64,
    ) -> Result<Option<&'a mut Stream>> {
        let direction = id.direction();
        if id.is_local(self.side) {
            if id.index() >= table.next_local[slot(direction)] {
                return Err(Error::frame(
                    TransportError::StreamStateError,
                    frame_type,
                    format!("stream {id} has not been opened locally"),
                ));
            }
            return Ok(table.streams.get_mut(&id));
        }

        if id.index() >= self.max_peer_streams[slot(direction)] {
            return Err(Error::frame(
                TransportError::StreamLimitError,
                frame_type,
                format!("stream {id} exceeds the peer stream limit"),
            ));
        }
        while table.peer_opened[slot(direction)] <= id.index() {
            let index = table.peer_opened[slot(direction)];
            let opened = StreamId::new(index, self.side.opposite(), direction);
            self.register(table, opened);
            table.peer_opened[slot(direction)] += 1;
            trace!(stream_id = %opened, "peer stream opened");
            self.events
                .lock()
                .push_back(StreamEvent::Opened { stream_id: opened });
        }
        Ok(table.streams.get_mut(&id))
    }

    /// Resolve a stream for a frame that carries peer data.
    fn resolve_receiving<'a>(
        &self,
        table: &'a mut StreamTable,
        id: StreamId,
        frame_type: u64,
    ) -> Result<Option<&'a mut Stream>> {
        if !id.can_receive(self.side) {
            return Err(Error::frame(
                TransportError::StreamStateError,
                frame_type,
                format!("stream {id} is send-only"),
            ));
        }
        self.resolve(table, id, frame_type)
    }

    /// Queue `data` on `id` and return the STREAM frame carrying it.
    ///
    /// Writes are all-or-nothing. When flow control refuses, the stream is
    /// unchanged, any new *_BLOCKED frame is queued, and
    /// [`Error::FlowControlBlocked`] is returned.
    pub fn write(&self, id: StreamId, data: Bytes, fin: bool) -> Result<Frame> {
        let mut table = self.table.lock();
        let send = table
            .streams
            .get_mut(&id)
            .ok_or(Error::IllegalState("unknown stream"))?
            .send
            .as_mut()
            .ok_or(Error::IllegalState("stream has no sending half"))?;
        if !send.state.can_send() {
            return Err(Error::IllegalState("stream sending half is finished"));
        }

        let offset = send.offset;
        let end = offset + data.len() as u64;
        if let Credit::Blocked(frames) = self.send_credit.try_consume(id, end)? {
            debug!(stream_id = %id, end, "write blocked by flow control");
            self.pending.lock().extend(frames);
            return Err(Error::FlowControlBlocked {
                stream_id: id.value(),
            });
        }

        send.offset = end;
        send.state = if fin {
            SendState::DataSent
        } else {
            SendState::Send
        };
        trace!(stream_id = %id, offset, len = data.len(), fin, "stream write");
        Ok(Frame::Stream(StreamFrame {
            stream_id: id,
            offset,
            data,
            fin,
        }))
    }

    /// Abandon sending on `id` and return the RESET_STREAM frame.
    pub fn reset(&self, id: StreamId, error_code: u64) -> Result<Frame> {
        let mut table = self.table.lock();
        let send = table
            .streams
            .get_mut(&id)
            .ok_or(Error::IllegalState("unknown stream"))?
            .send
            .as_mut()
            .ok_or(Error::IllegalState("stream has no sending half"))?;
        if !send.state.can_send() {
            return Err(Error::IllegalState("stream sending half is finished"));
        }
        send.state = SendState::ResetSent;
        debug!(stream_id = %id, error_code, final_size = send.offset, "stream reset");
        Ok(Frame::ResetStream(ResetStreamFrame {
            stream_id: id,
            error_code,
            final_size: send.offset,
        }))
    }

    /// Next in-order chunk of `id`, or `None` when nothing is ready yet.
    ///
    /// A stream reset by the peer fails with [`Error::StreamReset`].
    pub fn read(&self, id: StreamId) -> Result<Option<Bytes>> {
        let mut table = self.table.lock();
        let recv = table
            .streams
            .get_mut(&id)
            .ok_or(Error::IllegalState("unknown stream"))?
            .recv
            .as_mut()
            .ok_or(Error::IllegalState("stream has no receiving half"))?;
        if recv.state.is_reset() {
            recv.state = RecvState::ResetRead;
            return Err(Error::StreamReset {
                stream_id: id.value(),
                error_code: recv.reset_code.unwrap_or_default(),
            });
        }
        let chunk = recv.buffer.read();
        recv.refresh();
        Ok(chunk)
    }

    pub fn on_stream_frame(&self, frame: &StreamFrame) -> Result<()> {
        let id = frame.stream_id;
        let mut table = self.table.lock();
        let Some(stream) = self.resolve_receiving(&mut table, id, FRAME_TYPE_STREAM_BASE)? else {
            trace!(stream_id = %id, "STREAM for collected stream ignored");
            return Ok(());
        };
        let Some(recv) = stream.recv.as_mut() else {
            return Ok(());
        };
        if recv.state.is_reset() {
            return Ok(());
        }

        recv.buffer
            .validate(frame.offset, frame.data.len(), frame.fin)?;
        let updates = self.receive_window.on_data(id, frame.end_offset())?;
        recv.buffer
            .insert(frame.offset, frame.data.clone(), frame.fin)?;

        let before = recv.state;
        recv.refresh();
        let mut events = self.events.lock();
        if recv.buffer.is_readable() {
            events.push_back(StreamEvent::Readable { stream_id: id });
        }
        let complete = |state: RecvState| matches!(state, RecvState::DataRecvd | RecvState::DataRead);
        if !complete(before) && complete(recv.state) {
            events.push_back(StreamEvent::Finished { stream_id: id });
        }
        drop(events);
        self.pending.lock().extend(updates);
        Ok(())
    }

    pub fn on_reset_stream(&self, frame: &ResetStreamFrame) -> Result<()> {
        let id = frame.stream_id;
        let mut table = self.table.lock();
        let Some(stream) = self.resolve_receiving(&mut table, id, FRAME_TYPE_RESET_STREAM)? else {
            return Ok(());
        };
        let Some(recv) = stream.recv.as_mut() else {
            return Ok(());
        };
        recv.buffer.validate(frame.final_size, 0, true)?;
        if !matches!(recv.state, RecvState::Recv | RecvState::SizeKnown) {
            // everything already arrived or already reset
            return Ok(());
        }
        let updates = self.receive_window.on_data(id, frame.final_size)?;
        recv.state = RecvState::ResetRecvd;
        recv.reset_code = Some(frame.error_code);
        recv.buffer.clear();
        debug!(stream_id = %id, error_code = frame.error_code, "stream reset by peer");

        self.events.lock().push_back(StreamEvent::Reset {
            stream_id: id,
            error_code: frame.error_code,
            final_size: frame.final_size,
        });
        self.pending.lock().extend(updates);
        Ok(())
    }

    pub fn on_max_data(&self, frame: &MaxDataFrame) {
        self.send_credit.on_max_data(frame.maximum_data);
    }

    pub fn on_max_stream_data(&self, frame: &MaxStreamDataFrame) -> Result<()> {
        let id = frame.stream_id;
        if !id.can_send(self.side) {
            return Err(Error::frame(
                TransportError::StreamStateError,
                FRAME_TYPE_MAX_STREAM_DATA,
                format!("MAX_STREAM_DATA for receive-only stream {id}"),
            ));
        }
        let mut table = self.table.lock();
        if self
            .resolve(&mut table, id, FRAME_TYPE_MAX_STREAM_DATA)?
            .is_some()
            && self
                .send_credit
                .on_max_stream_data(id, frame.maximum_stream_data)
        {
            trace!(stream_id = %id, max = frame.maximum_stream_data, "stream credit raised");
        }
        Ok(())
    }

    pub fn on_data_blocked(&self, frame: &DataBlockedFrame) {
        debug!(limit = frame.maximum_data, "peer blocked at connection limit");
    }

    pub fn on_stream_data_blocked(&self, frame: &StreamDataBlockedFrame) -> Result<()> {
        let mut table = self.table.lock();
        self.resolve_receiving(&mut table, frame.stream_id, FRAME_TYPE_STREAM_DATA_BLOCKED)?;
        debug!(
            stream_id = %frame.stream_id,
            limit = frame.maximum_stream_data,
            "peer blocked at stream limit"
        );
        Ok(())
    }

    /// Associate STREAM and RESET_STREAM frames with the packet that sent them.
    pub fn on_packet_sent(&self, packet: &Packet) {
        let (Some(pn), Some(payload)) = (packet.number(), packet.payload()) else {
            return;
        };
        let mut table = self.table.lock();
        for frame in payload.frames() {
            let (id, fin, is_reset) = match frame {
                Frame::Stream(f) => (f.stream_id, f.fin, false),
                Frame::ResetStream(f) => (f.stream_id, false, true),
                _ => continue,
            };
            if let Some(send) = table.streams.get_mut(&id).and_then(|s| s.send.as_mut()) {
                if is_reset {
                    send.reset_packet = Some(pn);
                } else {
                    send.on_sent(pn, fin);
                }
            }
        }
    }

    /// Forget a lost packet; its frames are sent again in a new one.
    pub fn on_packet_lost(&self, packet: &Packet) {
        let Some(pn) = packet.number() else { return };
        let mut table = self.table.lock();
        for send in table.streams.values_mut().filter_map(|s| s.send.as_mut()) {
            send.on_lost(pn);
        }
    }

    /// Drop streams whose halves are both terminal. Returns how many.
    pub fn collect_garbage(&self) -> usize {
        let mut table = self.table.lock();
        let closed: Vec<StreamId> = table
            .streams
            .values()
            .filter(|s| s.is_closed())
            .map(|s| s.id)
            .collect();
        for id in &closed {
            table.streams.remove(id);
            self.send_credit.remove_stream(*id);
            self.receive_window.remove_stream(*id);
            trace!(stream_id = %id, "stream collected");
        }
        closed.len()
    }

    /// Control frames waiting to be sent.
    pub fn take_pending_frames(&self) -> Vec<Frame> {
        std::mem::take(&mut *self.pending.lock())
    }

    pub fn poll_event(&self) -> Option<StreamEvent> {
        self.events.lock().pop_front()
    }

    pub fn send_state(&self, id: StreamId) -> Option<SendState> {
        self.table.lock().streams.get(&id)?.send_state()
    }

    pub fn recv_state(&self, id: StreamId) -> Option<RecvState> {
        self.table.lock().streams.get(&id)?.recv_state()
    }

    pub fn can_send(&self, id: StreamId) -> bool {
        self.table
            .lock()
            .streams
            .get(&id)
            .is_some_and(Stream::can_send)
    }

    pub fn can_receive(&self, id: StreamId) -> bool {
        self.table
            .lock()
            .streams
            .get(&id)
            .is_some_and(Stream::can_receive)
    }

    pub fn is_finished(&self, id: StreamId) -> bool {
        self.table
            .lock()
            .streams
            .get(&id)
            .map_or(true, Stream::is_finished)
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.table.lock().streams.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.table.lock().streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Connection-level bytes we have sent.
    pub fn bytes_sent(&self) -> u64 {
        self.send_credit.connection_consumed()
    }

    /// Release every stream; used when the connection closes.
    pub fn clear(&self) {
        self.table.lock().streams.clear();
        self.pending.lock().clear();
        self.events.lock().clear();
    }
}

impl AckListener for StreamManager {
    fn on_packet_acked(&self, packet: &Packet) {
        let (Some(pn), Some(payload)) = (packet.number(), packet.payload()) else {
            return;
        };
        let mut table = self.table.lock();
        for frame in payload.frames() {
            let (id, is_reset) = match frame {
                Frame::Stream(f) => (f.stream_id, false),
                Frame::ResetStream(f) => (f.stream_id, true),
                _ => continue,
            };
            let Some(send) = table.streams.get_mut(&id).and_then(|s| s.send.as_mut()) else {
                continue;
            };
            if send.on_acked(pn, is_reset) && send.state == SendState::DataRecvd {
                debug!(stream_id = %id, "all stream data acknowledged");
                self.events
                    .lock()
                    .push_back(StreamEvent::SendFinished { stream_id: id });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::Payload;
    use crate::packet::ShortPacket;
    use crate::types::ConnectionId;

    fn params() -> TransportParameters {
        TransportParameters {
            initial_max_data: 1_000,
            initial_max_stream_data_bidi_local: 100,
            initial_max_stream_data_bidi_remote: 200,
            initial_max_stream_data_uni: 300,
            initial_max_streams_bidi: 2,
            initial_max_streams_uni: 2,
            ..Default::default()
        }
    }

    fn manager(side: Side) -> StreamManager {
        let mut config = EngineConfig::default();
        config.max_streams_bidi = 4;
        config.max_streams_uni = 4;
        config.flow_control.initial_max_stream_data_uni_local = 50;
        let manager = StreamManager::new(side, &config);
        manager.set_peer_parameters(&params());
        manager
    }

    fn stream_frame(id: u64, offset: u64, data: &'static [u8], fin: bool) -> StreamFrame {
        StreamFrame {
            stream_id: StreamId(id),
            offset,
            data: Bytes::from_static(data),
            fin,
        }
    }

    fn packet_with(number: u64, frames: Vec<Frame>) -> Packet {
        Packet::Short(ShortPacket {
            dcid: ConnectionId::from_slice(&[1; 8]).unwrap(),
            number,
            payload: Payload::new(frames),
        })
    }

    mod open_tests {
        use super::*;

        #[test]
        fn test_open_allocates_by_side_and_direction() {
            let client = manager(Side::Client);
            assert_eq!(client.open(Direction::Bidirectional).unwrap(), StreamId(0));
            assert_eq!(client.open(Direction::Bidirectional).unwrap(), StreamId(4));
            assert_eq!(client.open(Direction::Unidirectional).unwrap(), StreamId(2));

            let server = manager(Side::Server);
            assert_eq!(server.open(Direction::Bidirectional).unwrap(), StreamId(1));
            assert_eq!(server.open(Direction::Unidirectional).unwrap(), StreamId(3));
        }

        #[test]
        fn test_open_respects_peer_stream_limit() {
            let client = manager(Side::Client);
            client.open(Direction::Bidirectional).unwrap();
            client.open(Direction::Bidirectional).unwrap();
            assert!(matches!(
                client.open(Direction::Bidirectional),
                Err(Error::IllegalState(_))
            ));
        }

        #[test]
        fn test_open_before_peer_parameters_fails() {
            let manager = StreamManager::new(Side::Client, &EngineConfig::default());
            assert!(manager.open(Direction::Bidirectional).is_err());
        }
    }

    mod write_tests {
        use super::*;

        #[test]
        fn test_write_produces_stream_frames_with_offsets() {
            let client = manager(Side::Client);
            let id = client.open(Direction::Bidirectional).unwrap();
            let first = client.write(id, Bytes::from_static(b"abc"), false).unwrap();
            let second = client.write(id, Bytes::from_static(b"de"), true).unwrap();
            assert!(matches!(first, Frame::Stream(ref f) if f.offset == 0 && !f.fin));
            assert!(matches!(second, Frame::Stream(ref f) if f.offset == 3 && f.fin));
            assert_eq!(client.send_state(id), Some(SendState::DataSent));
        }

        #[test]
        fn test_fin_twice_is_illegal_state() {
            let client = manager(Side::Client);
            let id = client.open(Direction::Bidirectional).unwrap();
            client.write(id, Bytes::from_static(b"x"), true).unwrap();
            assert!(matches!(
                client.write(id, Bytes::new(), true),
                Err(Error::IllegalState(_))
            ));
        }

        #[test]
        fn test_reset_after_fin_is_illegal_state() {
            let client = manager(Side::Client);
            let id = client.open(Direction::Bidirectional).unwrap();
            client.write(id, Bytes::from_static(b"x"), true).unwrap();
            assert!(matches!(client.reset(id, 7), Err(Error::IllegalState(_))));
        }

        #[test]
        fn test_reset_carries_final_size() {
            let client = manager(Side::Client);
            let id = client.open(Direction::Bidirectional).unwrap();
            client.write(id, Bytes::from_static(b"hello"), false).unwrap();
            let frame = client.reset(id, 7).unwrap();
            assert_eq!(
                frame,
                Frame::ResetStream(ResetStreamFrame {
                    stream_id: id,
                    error_code: 7,
                    final_size: 5,
                })
            );
            assert_eq!(client.send_state(id), Some(SendState::ResetSent));
            assert!(client.write(id, Bytes::from_static(b"!"), false).is_err());
        }

        #[test]
        fn test_uni_write_capped_by_local_uni_limit() {
            // peer allows 300, our own uni_local cap is 50
            let client = manager(Side::Client);
            let id = client.open(Direction::Unidirectional).unwrap();
            client.write(id, Bytes::from(vec![0u8; 50]), false).unwrap();
            let err = client.write(id, Bytes::from_static(b"x"), false).unwrap_err();
            assert_eq!(err, Error::FlowControlBlocked { stream_id: id.value() });
            let pending = client.take_pending_frames();
            assert_eq!(
                pending,
                vec![Frame::StreamDataBlocked(StreamDataBlockedFrame {
                    stream_id: id,
                    maximum_stream_data: 50,
                })]
            );
            // same limit, no second blocked frame
            assert!(client.write(id, Bytes::from_static(b"x"), false).is_err());
            assert!(client.take_pending_frames().is_empty());
        }

        #[test]
        fn test_bidi_send_limits_follow_initiator() {
            let client = manager(Side::Client);
            let local = client.open(Direction::Bidirectional).unwrap();
            // our bidi stream: peer's bidi_remote window (200)
            client.write(local, Bytes::from(vec![0u8; 200]), false).unwrap();
            assert!(client.write(local, Bytes::from_static(b"x"), false).is_err());

            // peer's bidi stream: peer's bidi_local window (100)
            client.on_stream_frame(&stream_frame(1, 0, b"hi", false)).unwrap();
            client.write(StreamId(1), Bytes::from(vec![0u8; 100]), false).unwrap();
            assert!(client.write(StreamId(1), Bytes::from_static(b"x"), false).is_err());
        }

        #[test]
        fn test_write_to_receive_only_stream_fails() {
            let client = manager(Side::Client);
            client.on_stream_frame(&stream_frame(3, 0, b"x", false)).unwrap();
            assert!(matches!(
                client.write(StreamId(3), Bytes::from_static(b"y"), false),
                Err(Error::IllegalState(_))
            ));
        }
    }

    mod receive_tests {
        use super::*;

        #[test]
        fn test_two_frames_read_as_two_chunks() {
            let client = manager(Side::Client);
            client.on_stream_frame(&stream_frame(7, 0, b"abc", false)).unwrap();
            assert!(client.can_receive(StreamId(7)));
            client.on_stream_frame(&stream_frame(7, 3, b"def", true)).unwrap();
            assert!(!client.can_receive(StreamId(7)));

            assert_eq!(client.read(StreamId(7)).unwrap().unwrap(), &b"abc"[..]);
            assert_eq!(client.read(StreamId(7)).unwrap().unwrap(), &b"def"[..]);
            assert_eq!(client.read(StreamId(7)).unwrap(), None);
            assert_eq!(client.recv_state(StreamId(7)), Some(RecvState::DataRead));
        }

        #[test]
        fn test_empty_fin_after_full_read_finishes_stream() {
            let client = manager(Side::Client);
            client.on_stream_frame(&stream_frame(3, 0, b"abc", false)).unwrap();
            assert_eq!(client.read(StreamId(3)).unwrap().unwrap(), &b"abc"[..]);
            client.on_stream_frame(&stream_frame(3, 3, b"", true)).unwrap();

            let events: Vec<_> = std::iter::from_fn(|| client.poll_event()).collect();
            assert_eq!(
                events.last(),
                Some(&StreamEvent::Finished { stream_id: StreamId(3) })
            );
            assert_eq!(client.recv_state(StreamId(3)), Some(RecvState::DataRead));

            // a duplicate FIN does not finish it twice
            client.on_stream_frame(&stream_frame(3, 3, b"", true)).unwrap();
            assert_eq!(client.poll_event(), None);
        }

        #[test]
        fn test_peer_stream_opens_lower_indices() {
            let server = manager(Side::Server);
            server.on_stream_frame(&stream_frame(8, 0, b"x", false)).unwrap();
            assert!(server.contains(StreamId(0)));
            assert!(server.contains(StreamId(4)));
            assert!(server.contains(StreamId(8)));
            let opened: Vec<_> = std::iter::from_fn(|| server.poll_event())
                .filter(|e| matches!(e, StreamEvent::Opened { .. }))
                .collect();
            assert_eq!(opened.len(), 3);
        }

        #[test]
        fn test_peer_stream_limit_error() {
            let server = manager(Side::Server);
            // limit 4 bidi streams: index 4 is id 16
            let err = server
                .on_stream_frame(&stream_frame(16, 0, b"x", false))
                .unwrap_err();
            assert_eq!(
                err.transport_code(),
                Some(TransportError::StreamLimitError.code())
            );
        }

        #[test]
        fn test_frame_on_local_uni_stream_is_state_error() {
            let client = manager(Side::Client);
            client.open(Direction::Unidirectional).unwrap();
            let err = client
                .on_stream_frame(&stream_frame(2, 0, b"x", false))
                .unwrap_err();
            assert_eq!(
                err.transport_code(),
                Some(TransportError::StreamStateError.code())
            );
        }

        #[test]
        fn test_frame_on_unopened_local_stream_is_state_error() {
            let client = manager(Side::Client);
            let err = client
                .on_stream_frame(&stream_frame(4, 0, b"x", false))
                .unwrap_err();
            assert_eq!(
                err.transport_code(),
                Some(TransportError::StreamStateError.code())
            );
        }

        #[test]
        fn test_peer_exceeding_window_is_flow_control_error() {
            let client = manager(Side::Client);
            // peer uni streams get our uni_remote window
            let window = EngineConfig::default()
                .flow_control
                .initial_max_stream_data_uni_remote;
            let frame = StreamFrame {
                stream_id: StreamId(3),
                offset: window,
                data: Bytes::from_static(b"x"),
                fin: false,
            };
            let err = client.on_stream_frame(&frame).unwrap_err();
            assert_eq!(
                err.transport_code(),
                Some(TransportError::FlowControlError.code())
            );
        }

        #[test]
        fn test_half_window_queues_max_stream_data() {
            let mut config = EngineConfig::default();
            config.flow_control.initial_max_stream_data_uni_remote = 10;
            let client = StreamManager::new(Side::Client, &config);
            client.set_peer_parameters(&params());
            client
                .on_stream_frame(&stream_frame(3, 0, b"abcdef", false))
                .unwrap();
            assert_eq!(
                client.take_pending_frames(),
                vec![Frame::MaxStreamData(MaxStreamDataFrame {
                    stream_id: StreamId(3),
                    maximum_stream_data: 16,
                })]
            );
        }

        #[test]
        fn test_reset_surfaces_on_read() {
            let client = manager(Side::Client);
            client.on_stream_frame(&stream_frame(3, 0, b"abc", false)).unwrap();
            client
                .on_reset_stream(&ResetStreamFrame {
                    stream_id: StreamId(3),
                    error_code: 42,
                    final_size: 3,
                })
                .unwrap();
            assert_eq!(
                client.read(StreamId(3)),
                Err(Error::StreamReset {
                    stream_id: 3,
                    error_code: 42
                })
            );
            assert_eq!(client.recv_state(StreamId(3)), Some(RecvState::ResetRead));
        }

        #[test]
        fn test_reset_below_received_data_is_final_size_error() {
            let client = manager(Side::Client);
            client.on_stream_frame(&stream_frame(3, 0, b"abcdef", false)).unwrap();
            let err = client
                .on_reset_stream(&ResetStreamFrame {
                    stream_id: StreamId(3),
                    error_code: 0,
                    final_size: 2,
                })
                .unwrap_err();
            assert_eq!(
                err.transport_code(),
                Some(TransportError::FinalSizeError.code())
            );
        }

        #[test]
        fn test_max_stream_data_on_receive_only_stream() {
            let client = manager(Side::Client);
            let err = client
                .on_max_stream_data(&MaxStreamDataFrame {
                    stream_id: StreamId(3),
                    maximum_stream_data: 10,
                })
                .unwrap_err();
            assert_eq!(
                err.transport_code(),
                Some(TransportError::StreamStateError.code())
            );
        }
    }

    mod ack_tests {
        use super::*;

        #[test]
        fn test_ack_of_last_frame_finishes_send_half() {
            let client = manager(Side::Client);
            let id = client.open(Direction::Bidirectional).unwrap();
            let first = packet_with(1, vec![client.write(id, Bytes::from_static(b"a"), false).unwrap()]);
            let second = packet_with(2, vec![client.write(id, Bytes::from_static(b"b"), true).unwrap()]);
            client.on_packet_sent(&first);
            client.on_packet_sent(&second);

            client.on_packet_acked(&second);
            assert_eq!(client.send_state(id), Some(SendState::DataSent));
            client.on_packet_acked(&first);
            assert_eq!(client.send_state(id), Some(SendState::DataRecvd));
            assert!(std::iter::from_fn(|| client.poll_event())
                .any(|e| e == StreamEvent::SendFinished { stream_id: id }));
        }

        #[test]
        fn test_fin_not_finished_before_its_packet_is_sent() {
            let client = manager(Side::Client);
            let id = client.open(Direction::Bidirectional).unwrap();
            let first = packet_with(1, vec![client.write(id, Bytes::from_static(b"a"), false).unwrap()]);
            client.on_packet_sent(&first);
            let fin = client.write(id, Bytes::from_static(b"b"), true).unwrap();

            // ack for the earlier packet lands before the FIN is on the wire
            client.on_packet_acked(&first);
            assert_eq!(client.send_state(id), Some(SendState::DataSent));
            assert!(!std::iter::from_fn(|| client.poll_event())
                .any(|e| matches!(e, StreamEvent::SendFinished { .. })));

            let second = packet_with(2, vec![fin]);
            client.on_packet_sent(&second);
            client.on_packet_acked(&second);
            assert_eq!(client.send_state(id), Some(SendState::DataRecvd));
            assert_eq!(
                client.poll_event(),
                Some(StreamEvent::SendFinished { stream_id: id })
            );
        }

        #[test]
        fn test_lost_packet_no_longer_outstanding() {
            let client = manager(Side::Client);
            let id = client.open(Direction::Bidirectional).unwrap();
            let frame = client.write(id, Bytes::from_static(b"a"), true).unwrap();
            let lost = packet_with(1, vec![frame.clone()]);
            client.on_packet_sent(&lost);
            client.on_packet_lost(&lost);
            let resent = packet_with(5, vec![frame]);
            client.on_packet_sent(&resent);
            client.on_packet_acked(&resent);
            assert_eq!(client.send_state(id), Some(SendState::DataRecvd));
        }

        #[test]
        fn test_garbage_collection_ignores_later_frames() {
            let client = manager(Side::Client);
            client.on_stream_frame(&stream_frame(3, 0, b"abc", true)).unwrap();
            client.read(StreamId(3)).unwrap();
            assert_eq!(client.collect_garbage(), 1);
            assert!(!client.contains(StreamId(3)));

            // retransmitted copy of collected data is ignored
            client.on_stream_frame(&stream_frame(3, 0, b"abc", true)).unwrap();
            assert!(!client.contains(StreamId(3)));
        }
    }
}
