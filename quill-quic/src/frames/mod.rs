//! # QUIC Frames (RFC 9000 Section 19)
//!
//! Frames are a closed set of variants; every consumer dispatches with an
//! exhaustive `match`. A [`Payload`] is the immutable ordered list carried by
//! one packet.

pub mod payload;
pub mod types;

pub use payload::Payload;
pub use types::*;
