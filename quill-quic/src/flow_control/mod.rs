//! # Flow Control (RFC 9000 Section 4)
//!
//! Two ledgers per connection:
//!
//! - [`SendCredit`] tracks what the peer allows us to send. Each attempt to
//!   extend a stream is checked against the stream limit and the connection
//!   limit together; either both advance or neither does. A refused attempt
//!   yields a DATA_BLOCKED / STREAM_DATA_BLOCKED frame once per limit value.
//! - [`ReceiveWindow`] tracks what we allow the peer to send. Data beyond a
//!   limit is a FLOW_CONTROL_ERROR. Once more than half of a window is used,
//!   a MAX_DATA / MAX_STREAM_DATA frame extends it by a full window.
//!
//! Offsets are absolute stream offsets, so retransmitted or reordered data
//! at or below the recorded watermark is accepted without counting twice.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{Error, Result, TransportError};
use crate::frames::{
    DataBlockedFrame, Frame, MaxDataFrame, MaxStreamDataFrame, StreamDataBlockedFrame,
    FRAME_TYPE_STREAM_BASE,
};
use crate::types::StreamId;

// ============================================================================
// Send side
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct SendLimit {
    consumed: u64,
    max: u64,
    /// Limit value a BLOCKED frame was last emitted for
    blocked_at: Option<u64>,
}

impl SendLimit {
    fn new(max: u64) -> Self {
        Self {
            consumed: 0,
            max,
            blocked_at: None,
        }
    }

    fn raise(&mut self, max: u64) -> bool {
        if max <= self.max {
            return false;
        }
        self.max = max;
        self.blocked_at = None;
        true
    }

    /// True the first time blocking is observed at the current limit.
    fn mark_blocked(&mut self) -> bool {
        if self.blocked_at == Some(self.max) {
            return false;
        }
        self.blocked_at = Some(self.max);
        true
    }
}

/// Outcome of asking for send credit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credit {
    Granted,
    /// Refused; carries BLOCKED frames not yet reported for these limits
    Blocked(Vec<Frame>),
}

struct SendState {
    connection: SendLimit,
    streams: HashMap<StreamId, SendLimit>,
}

/// Credit granted to us by the peer.
pub struct SendCredit {
    state: Mutex<SendState>,
}

impl SendCredit {
    pub fn new(max_data: u64) -> Self {
        Self {
            state: Mutex::new(SendState {
                connection: SendLimit::new(max_data),
                streams: HashMap::new(),
            }),
        }
    }

    /// Start tracking `id` with the peer's initial limit. No-op if tracked.
    pub fn register_stream(&self, id: StreamId, max: u64) {
        self.state
            .lock()
            .streams
            .entry(id)
            .or_insert_with(|| SendLimit::new(max));
    }

    pub fn remove_stream(&self, id: StreamId) {
        self.state.lock().streams.remove(&id);
    }

    /// Extend stream `id` to `end_offset`.
    pub fn try_consume(&self, id: StreamId, end_offset: u64) -> Result<Credit> {
        let mut state = self.state.lock();
        let SendState {
            connection,
            streams,
        } = &mut *state;
        let stream = streams
            .get_mut(&id)
            .ok_or(Error::IllegalState("no send credit tracked for stream"))?;

        if end_offset <= stream.consumed {
            return Ok(Credit::Granted);
        }
        let delta = end_offset - stream.consumed;
        let stream_ok = end_offset <= stream.max;
        let connection_ok = connection.consumed + delta <= connection.max;

        if stream_ok && connection_ok {
            stream.consumed = end_offset;
            connection.consumed += delta;
            return Ok(Credit::Granted);
        }

        let mut frames = Vec::new();
        if !stream_ok && stream.mark_blocked() {
            trace!(stream_id = %id, limit = stream.max, "stream blocked");
            frames.push(Frame::StreamDataBlocked(StreamDataBlockedFrame {
                stream_id: id,
                maximum_stream_data: stream.max,
            }));
        }
        if !connection_ok && connection.mark_blocked() {
            trace!(limit = connection.max, "connection blocked");
            frames.push(Frame::DataBlocked(DataBlockedFrame {
                maximum_data: connection.max,
            }));
        }
        Ok(Credit::Blocked(frames))
    }

    /// Apply MAX_DATA. Limits never decrease; returns whether it grew.
    pub fn on_max_data(&self, max: u64) -> bool {
        let raised = self.state.lock().connection.raise(max);
        if raised {
            debug!(max_data = max, "peer raised connection limit");
        }
        raised
    }

    /// Apply MAX_STREAM_DATA for a tracked stream.
    pub fn on_max_stream_data(&self, id: StreamId, max: u64) -> bool {
        self.state
            .lock()
            .streams
            .get_mut(&id)
            .is_some_and(|limit| limit.raise(max))
    }

    pub fn connection_consumed(&self) -> u64 {
        self.state.lock().connection.consumed
    }

    pub fn max_data(&self) -> u64 {
        self.state.lock().connection.max
    }

    pub fn stream_consumed(&self, id: StreamId) -> Option<u64> {
        self.state.lock().streams.get(&id).map(|l| l.consumed)
    }

    pub fn stream_max(&self, id: StreamId) -> Option<u64> {
        self.state.lock().streams.get(&id).map(|l| l.max)
    }
}

// ============================================================================
// Receive side
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct RecvLimit {
    received: u64,
    max: u64,
    window: u64,
}

impl RecvLimit {
    fn new(window: u64) -> Self {
        Self {
            received: 0,
            max: window,
            window,
        }
    }

    /// New limit to advertise once less than half a window remains.
    fn next_max(&mut self) -> Option<u64> {
        if self.window == 0 || self.max - self.received >= self.window.div_ceil(2) {
            return None;
        }
        self.max = self.received + self.window;
        Some(self.max)
    }
}

struct RecvState {
    connection: RecvLimit,
    streams: HashMap<StreamId, RecvLimit>,
}

/// Credit we grant the peer.
pub struct ReceiveWindow {
    state: Mutex<RecvState>,
}

impl ReceiveWindow {
    pub fn new(max_data: u64) -> Self {
        Self {
            state: Mutex::new(RecvState {
                connection: RecvLimit::new(max_data),
                streams: HashMap::new(),
            }),
        }
    }

    pub fn register_stream(&self, id: StreamId, window: u64) {
        self.state
            .lock()
            .streams
            .entry(id)
            .or_insert_with(|| RecvLimit::new(window));
    }

    pub fn remove_stream(&self, id: StreamId) {
        self.state.lock().streams.remove(&id);
    }

    /// Record peer data on `id` up to `end_offset`.
    ///
    /// Returns MAX_STREAM_DATA / MAX_DATA frames to send. Exceeding either
    /// limit is a FLOW_CONTROL_ERROR and leaves both ledgers untouched.
    pub fn on_data(&self, id: StreamId, end_offset: u64) -> Result<Vec<Frame>> {
        let mut state = self.state.lock();
        let RecvState {
            connection,
            streams,
        } = &mut *state;
        let stream = streams
            .get_mut(&id)
            .ok_or(Error::IllegalState("no receive window tracked for stream"))?;

        if end_offset <= stream.received {
            return Ok(Vec::new());
        }
        let delta = end_offset - stream.received;
        if end_offset > stream.max {
            return Err(Error::frame(
                TransportError::FlowControlError,
                FRAME_TYPE_STREAM_BASE,
                format!(
                    "stream {id} data to offset {end_offset} exceeds limit {}",
                    stream.max
                ),
            ));
        }
        if connection.received + delta > connection.max {
            return Err(Error::frame(
                TransportError::FlowControlError,
                FRAME_TYPE_STREAM_BASE,
                format!(
                    "connection data {} exceeds limit {}",
                    connection.received + delta,
                    connection.max
                ),
            ));
        }
        stream.received = end_offset;
        connection.received += delta;

        let mut frames = Vec::new();
        if let Some(max) = stream.next_max() {
            frames.push(Frame::MaxStreamData(MaxStreamDataFrame {
                stream_id: id,
                maximum_stream_data: max,
            }));
        }
        if let Some(max) = connection.next_max() {
            frames.push(Frame::MaxData(MaxDataFrame { maximum_data: max }));
        }
        Ok(frames)
    }

    pub fn max_data(&self) -> u64 {
        self.state.lock().connection.max
    }

    pub fn connection_received(&self) -> u64 {
        self.state.lock().connection.received
    }

    pub fn stream_max(&self, id: StreamId) -> Option<u64> {
        self.state.lock().streams.get(&id).map(|l| l.max)
    }
}
