//! Acknowledgment tracking, retransmission and the congestion hook.

pub mod ack;
pub mod buffer;
pub mod congestion;

pub use ack::{ack_frame, coalesce};
pub use buffer::{AckListener, AckOutcome, PacketBuffer, SentPacket};
pub use congestion::{CongestionController, Unlimited};
