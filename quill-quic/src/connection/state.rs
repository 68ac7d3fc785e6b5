//! # Connection States
//!
//! Client and server walk structurally similar machines:
//!
//! ```text
//! Client:  Started --HelloSent--> BeforeHello --HandshakeKeysInstalled--> BeforeHandshake
//!            --HandshakeSent--> BeforeReady --HandshakeConfirmed--> Ready
//!
//! Server:  Started --InitialReceived--> BeforeHello --HelloSent--> BeforeHandshake
//!            --HandshakeSent--> BeforeDone --HandshakeComplete--> Done
//!
//! Either:  any --close--> Closing --resources released--> Closed
//! ```
//!
//! `Ready` and `Done` are the established states; application data flows
//! only there.

use std::fmt;

use crate::types::Side;

/// Connection State
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Started,
    /// Client: ClientHello sent. Server: ClientHello received.
    BeforeHello,
    /// Client: Handshake keys installed. Server: ServerHello sent.
    BeforeHandshake,
    /// Client: Finished sent, waiting for HANDSHAKE_DONE
    BeforeReady,
    /// Client established
    Ready,
    /// Server: handshake flight sent, waiting for the client's Finished
    BeforeDone,
    /// Server established
    Done,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Handshake finished; application data may flow.
    pub fn is_established(self) -> bool {
        matches!(self, ConnectionState::Ready | ConnectionState::Done)
    }

    pub fn is_closing(self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }

    pub fn is_handshaking(self) -> bool {
        !self.is_established() && !self.is_closing()
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Handshake progress that can move the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeEvent {
    /// Server read the client's first Initial
    InitialReceived,
    /// Our first Initial-level handshake message went out
    HelloSent,
    /// Client derived Handshake keys from the ServerHello
    HandshakeKeysInstalled,
    /// Our Handshake-level flight went out
    HandshakeSent,
    /// Server verified the client's Finished
    HandshakeComplete,
    /// Client received HANDSHAKE_DONE
    HandshakeConfirmed,
}

/// Next state for `event`, or `None` when the event does not move `side`
/// out of `from`.
pub fn transition(
    side: Side,
    from: ConnectionState,
    event: HandshakeEvent,
) -> Option<ConnectionState> {
    use ConnectionState::*;
    use HandshakeEvent::*;

    match (side, from, event) {
        (Side::Client, Started, HelloSent) => Some(BeforeHello),
        (Side::Client, BeforeHello, HandshakeKeysInstalled) => Some(BeforeHandshake),
        (Side::Client, BeforeHandshake, HandshakeSent) => Some(BeforeReady),
        (Side::Client, BeforeReady, HandshakeConfirmed) => Some(Ready),

        (Side::Server, Started, InitialReceived) => Some(BeforeHello),
        (Side::Server, BeforeHello, HelloSent) => Some(BeforeHandshake),
        (Side::Server, BeforeHandshake, HandshakeSent) => Some(BeforeDone),
        (Side::Server, BeforeDone, HandshakeComplete) => Some(Done),

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;
    use HandshakeEvent::*;

    fn walk(side: Side, events: &[HandshakeEvent]) -> ConnectionState {
        events.iter().fold(Started, |state, event| {
            transition(side, state, *event).unwrap_or_else(|| {
                panic!("{side} has no transition from {state} on {event:?}")
            })
        })
    }

    #[test]
    fn test_client_happy_path() {
        let end = walk(
            Side::Client,
            &[HelloSent, HandshakeKeysInstalled, HandshakeSent, HandshakeConfirmed],
        );
        assert_eq!(end, Ready);
        assert!(end.is_established());
    }

    #[test]
    fn test_server_happy_path() {
        let end = walk(
            Side::Server,
            &[InitialReceived, HelloSent, HandshakeSent, HandshakeComplete],
        );
        assert_eq!(end, Done);
    }

    #[test]
    fn test_out_of_order_events_do_not_move() {
        assert_eq!(transition(Side::Client, Started, HandshakeConfirmed), None);
        assert_eq!(transition(Side::Server, Started, HelloSent), None);
        assert_eq!(transition(Side::Server, BeforeHello, HandshakeKeysInstalled), None);
        assert_eq!(transition(Side::Client, Ready, HandshakeConfirmed), None);
    }

    #[test]
    fn test_closing_states_are_terminal() {
        for event in [InitialReceived, HelloSent, HandshakeSent, HandshakeComplete] {
            assert_eq!(transition(Side::Server, Closed, event), None);
            assert_eq!(transition(Side::Client, Closing, event), None);
        }
        assert!(Closing.is_closing());
        assert!(!Closed.is_handshaking());
        assert!(BeforeDone.is_handshaking());
    }
}
