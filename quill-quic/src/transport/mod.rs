//! Transport parameters exchanged during the handshake.

pub mod parameters;

pub use parameters::TransportParameters;
