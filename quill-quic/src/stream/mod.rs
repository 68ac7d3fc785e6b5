//! # Streams (RFC 9000 Sections 2-3)
//!
//! Stream states, reassembly buffers, and the per-connection manager.

pub mod buffer;
pub mod manager;
pub mod state;

pub use buffer::ReceiveBuffer;
pub use manager::{StreamEvent, StreamManager};
pub use state::{RecvState, SendState, Stream};

pub use crate::types::StreamId;
