//! Immutable frame sequence carried by a full packet.

use std::sync::Arc;

use super::types::{AckFrame, Frame};

/// Ordered, immutable sequence of frames.
///
/// Adding a frame produces a new payload; existing holders never observe
/// the change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    frames: Arc<[Frame]>,
}

impl Payload {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            frames: frames.into(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn single(frame: Frame) -> Self {
        Self::new(vec![frame])
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Copy of this payload with `frame` appended.
    pub fn with_frame(&self, frame: Frame) -> Payload {
        let mut frames = Vec::with_capacity(self.frames.len() + 1);
        frames.extend(self.frames.iter().cloned());
        frames.push(frame);
        Payload::new(frames)
    }

    /// At least one ACK and nothing besides ACK and PADDING.
    pub fn is_ack_only(&self) -> bool {
        let mut saw_ack = false;
        for frame in self.frames.iter() {
            match frame {
                Frame::Ack(_) => saw_ack = true,
                Frame::Padding { .. } => {}
                _ => return false,
            }
        }
        saw_ack
    }

    pub fn is_ack_eliciting(&self) -> bool {
        self.frames.iter().any(Frame::is_ack_eliciting)
    }

    pub fn acks(&self) -> impl Iterator<Item = &AckFrame> {
        self.frames.iter().filter_map(|f| match f {
            Frame::Ack(ack) => Some(ack),
            _ => None,
        })
    }

    /// Frames worth sending again after loss.
    pub fn retransmittable(&self) -> Vec<Frame> {
        self.frames
            .iter()
            .filter(|f| f.is_retransmittable())
            .cloned()
            .collect()
    }
}

impl FromIterator<Frame> for Payload {
    fn from_iter<I: IntoIterator<Item = Frame>>(iter: I) -> Self {
        Payload::new(iter.into_iter().collect())
    }
}

impl From<Vec<Frame>> for Payload {
    fn from(frames: Vec<Frame>) -> Self {
        Payload::new(frames)
    }
}
