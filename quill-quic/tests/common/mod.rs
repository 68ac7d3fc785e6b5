//! Shared harness: a scripted TLS handshake and an in-memory network that
//! carries client packets through the [`Router`] and server packets straight
//! back to the client.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use quill_quic::server::ConnectionFactory;
use quill_quic::{
    AeadCipher, Connection, EncryptionLevel, EngineConfig, Error, HandshakeOutput,
    HandshakeSecrets, Packet, PacketSender, Result, RetryTokenManager, RouteOutcome, Router,
    SendCompletion, Side, TlsSession, TransportParameters,
};

pub const CLIENT_HELLO: &[u8] = b"client hello";
pub const SERVER_HELLO: &[u8] = b"server hello";
pub const SERVER_FINISHED: &[u8] = b"server finished";
pub const CLIENT_FINISHED: &[u8] = b"client finished";

fn secrets(level: EncryptionLevel, local: u8, remote: u8) -> HandshakeSecrets {
    HandshakeSecrets {
        level,
        local: vec![local; 32],
        remote: vec![remote; 32],
    }
}

/// ClientHello / ServerHello + Finished / client Finished, with each side
/// reporting a copy of its own parameters as the peer's.
pub struct ScriptedTls {
    side: Side,
    local: Option<TransportParameters>,
    complete: bool,
}

impl ScriptedTls {
    pub fn boxed(side: Side) -> Box<dyn TlsSession> {
        Box::new(Self {
            side,
            local: None,
            complete: false,
        })
    }

    fn peer_parameters(&self) -> Option<TransportParameters> {
        self.local.clone().map(|mut params| {
            params.original_destination_connection_id = None;
            params.retry_source_connection_id = None;
            params
        })
    }
}

impl TlsSession for ScriptedTls {
    fn start(&mut self, local_parameters: &TransportParameters) -> Result<HandshakeOutput> {
        self.local = Some(local_parameters.clone());
        let mut output = HandshakeOutput::default();
        if self.side.is_client() {
            output
                .messages
                .push((EncryptionLevel::Initial, Bytes::from_static(CLIENT_HELLO)));
        }
        Ok(output)
    }

    fn process(&mut self, level: EncryptionLevel, data: &[u8]) -> Result<HandshakeOutput> {
        let mut output = HandshakeOutput::default();
        match (self.side, level) {
            (Side::Server, EncryptionLevel::Initial) if data == CLIENT_HELLO => {
                output.peer_parameters = self.peer_parameters();
                output.secrets = vec![
                    secrets(EncryptionLevel::Handshake, 2, 1),
                    secrets(EncryptionLevel::OneRtt, 4, 3),
                ];
                output.messages = vec![
                    (EncryptionLevel::Initial, Bytes::from_static(SERVER_HELLO)),
                    (EncryptionLevel::Handshake, Bytes::from_static(SERVER_FINISHED)),
                ];
            }
            (Side::Client, EncryptionLevel::Initial) if data == SERVER_HELLO => {
                output.secrets = vec![secrets(EncryptionLevel::Handshake, 1, 2)];
            }
            (Side::Client, EncryptionLevel::Handshake) if data == SERVER_FINISHED => {
                output.peer_parameters = self.peer_parameters();
                output.secrets = vec![secrets(EncryptionLevel::OneRtt, 3, 4)];
                output.messages = vec![(
                    EncryptionLevel::Handshake,
                    Bytes::from_static(CLIENT_FINISHED),
                )];
                output.complete = true;
                self.complete = true;
            }
            (Side::Server, EncryptionLevel::Handshake) if data == CLIENT_FINISHED => {
                output.complete = true;
                self.complete = true;
            }
            _ => {
                return Err(Error::Crypto {
                    alert: 10,
                    reason: "unexpected message".into(),
                });
            }
        }
        Ok(output)
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}

/// Collects packets one endpoint puts on the wire.
#[derive(Default)]
pub struct Wire {
    packets: Mutex<VecDeque<Packet>>,
}

impl Wire {
    pub fn push(&self, packet: Packet) {
        self.packets.lock().push_back(packet);
    }

    pub fn take(&self) -> Vec<Packet> {
        self.packets.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }
}

impl PacketSender for Wire {
    fn send(&self, packet: Packet, cipher: Arc<AeadCipher>) -> SendCompletion {
        assert_eq!(packet.level(), Some(cipher.level()));
        self.push(packet);
        SendCompletion::done()
    }
}

pub fn client_addr() -> SocketAddr {
    "192.0.2.10:50000".parse().unwrap()
}

/// One client talking to a router-fronted server.
pub struct Network {
    pub client: Arc<Connection>,
    pub client_wire: Arc<Wire>,
    pub router: Router,
    pub server_wire: Arc<Wire>,
    /// Datagrams the client put on the wire, counted as they are delivered
    pub client_datagrams: usize,
}

impl Network {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_configs(config.clone(), config)
    }

    pub fn with_configs(client_config: EngineConfig, server_config: EngineConfig) -> Self {
        let config = Arc::new(server_config);
        let client_wire = Arc::new(Wire::default());
        let server_wire = Arc::new(Wire::default());
        let client = Connection::client(
            Arc::new(client_config),
            ScriptedTls::boxed(Side::Client),
            client_wire.clone(),
        )
        .unwrap();

        let factory_config = config.clone();
        let factory_wire = server_wire.clone();
        let factory: ConnectionFactory = Box::new(move |initial| {
            Connection::server(
                factory_config.clone(),
                ScriptedTls::boxed(Side::Server),
                factory_wire.clone(),
                initial,
            )
        });
        let tokens = RetryTokenManager::new([0x42; 32], Duration::from_secs(60));
        let router = Router::with_tokens(config, tokens, factory);

        Self {
            client,
            client_wire,
            router,
            server_wire,
            client_datagrams: 0,
        }
    }

    /// Route everything the client sent; stateless replies go straight back.
    pub fn client_to_server(&mut self) -> Vec<RouteOutcome> {
        let mut outcomes = Vec::new();
        for packet in self.client_wire.take() {
            self.client_datagrams += 1;
            let outcome = match self.router.route(packet, client_addr()) {
                Ok(outcome) => outcome,
                Err(_) => continue,
            };
            match &outcome {
                RouteOutcome::Retry(retry) => self.server_wire.push(Packet::Retry(retry.clone())),
                RouteOutcome::VersionNegotiation(vn) => {
                    self.server_wire.push(Packet::VersionNegotiation(vn.clone()))
                }
                _ => {}
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    pub fn server_to_client(&self) -> usize {
        let packets = self.server_wire.take();
        let count = packets.len();
        for packet in packets {
            let _ = self.client.on_packet(packet);
        }
        count
    }

    /// Exchange packets until both directions go quiet.
    pub fn pump(&mut self) {
        loop {
            let outcomes = self.client_to_server();
            let delivered = self.server_to_client();
            if outcomes.is_empty() && delivered == 0 {
                return;
            }
        }
    }

    pub fn server(&self) -> Arc<Connection> {
        self.router
            .get(&self.client.remote_cid())
            .expect("no server connection for the client's destination id")
    }
}
