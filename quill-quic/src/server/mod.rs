//! # Packet Router (RFC 9000 Sections 5.2, 6, 8.1)
//!
//! Maps Destination Connection IDs to connections and decides what happens
//! to packets nobody owns yet:
//!
//! - **Unsupported version**: answered with Version Negotiation, no state kept
//! - **Initial without a valid token** (when Retry is required): answered
//!   with a Retry carrying a fresh address-bound token, no state kept
//! - **Initial that passes**: a new server connection, inserted if absent
//! - **Anything else**: dropped
//!
//! The router never encrypts or writes datagrams itself. Its outcomes tell
//! the I/O layer what to put on the wire.

pub mod retry;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context;
use parking_lot::RwLock;
use tracing::{debug, info, trace};

use crate::config::EngineConfig;
use crate::connection::Connection;
use crate::error::Result;
use crate::packet::{
    InitialPacket, InvariantHeader, LongHeader, Packet, RetryPacket, VersionNegotiationPacket,
};
use crate::types::ConnectionId;
use crate::version::VERSION_NEGOTIATION;

pub use retry::{RetryTokenManager, TokenValidation};

/// Client Initials must carry a Destination ID of at least this many bytes
/// (RFC 9000 Section 7.2).
pub const MIN_INITIAL_DCID_LEN: usize = 8;

/// Builds the server connection for an accepted Initial.
pub type ConnectionFactory =
    Box<dyn Fn(&InitialPacket) -> Result<Arc<Connection>> + Send + Sync>;

/// What the router did with a packet.
#[derive(Debug)]
pub enum RouteOutcome {
    /// Handed to a connection, `created` if the packet opened it
    Delivered {
        connection: Arc<Connection>,
        created: bool,
    },
    /// Reply to send back to the peer
    VersionNegotiation(VersionNegotiationPacket),
    /// Reply to send back to the peer
    Retry(RetryPacket),
    Dropped,
}

pub struct Router {
    config: Arc<EngineConfig>,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    tokens: RetryTokenManager,
    factory: ConnectionFactory,
}

impl Router {
    pub fn new(config: Arc<EngineConfig>, factory: ConnectionFactory) -> anyhow::Result<Self> {
        let tokens =
            RetryTokenManager::from_config(&config).context("retry_secret is not valid hex")?;
        Ok(Self::with_tokens(config, tokens, factory))
    }

    pub fn with_tokens(
        config: Arc<EngineConfig>,
        tokens: RetryTokenManager,
        factory: ConnectionFactory,
    ) -> Self {
        Self {
            config,
            connections: RwLock::new(HashMap::new()),
            tokens,
            factory,
        }
    }

    /// Version Negotiation reply for a long header carrying a version we do
    /// not speak. Checked on the invariant header, before any decryption.
    pub fn negotiate(&self, header: &InvariantHeader) -> Option<VersionNegotiationPacket> {
        let version = header.version()?;
        if self.supports(version) {
            return None;
        }
        debug!(version = %format!("{version:#010x}"), "answering with version negotiation");
        VersionNegotiationPacket::reply_to(header, &self.config.supported_versions)
    }

    fn supports(&self, version: u32) -> bool {
        // never answer a Version Negotiation packet with another one
        version == VERSION_NEGOTIATION || self.config.supported_versions.contains(&version)
    }

    pub fn route(&self, packet: Packet, peer: SocketAddr) -> Result<RouteOutcome> {
        if let Packet::VersionNegotiation(_) | Packet::Retry(_) = packet {
            trace!(%peer, "server-bound Retry or Version Negotiation dropped");
            return Ok(RouteOutcome::Dropped);
        }
        if let Some(version) = packet.version() {
            if !self.supports(version) {
                if let Some(scid) = packet.scid() {
                    return Ok(RouteOutcome::VersionNegotiation(VersionNegotiationPacket {
                        dcid: scid.clone(),
                        scid: packet.dcid().clone(),
                        supported_versions: self.config.supported_versions.clone(),
                    }));
                }
                return Ok(RouteOutcome::Dropped);
            }
        }

        if let Some(connection) = self.get(packet.dcid()) {
            deliver(&connection, packet)?;
            return Ok(RouteOutcome::Delivered {
                connection,
                created: false,
            });
        }

        let initial = match packet {
            Packet::Initial(initial) => initial,
            other => {
                trace!(dcid = %other.dcid(), %peer, "packet for unknown connection dropped");
                return Ok(RouteOutcome::Dropped);
            }
        };
        if initial.header.dcid.len() < MIN_INITIAL_DCID_LEN {
            debug!(dcid = %initial.header.dcid, "client Initial with short destination id dropped");
            return Ok(RouteOutcome::Dropped);
        }

        if self.config.require_retry {
            let validation = if initial.token.is_empty() {
                TokenValidation::Invalid
            } else {
                self.tokens
                    .validate(&initial.token, peer.ip(), SystemTime::now())
            };
            if !validation.is_valid() {
                return self.retry(&initial, peer);
            }
        }

        self.accept(initial)
    }

    fn retry(&self, initial: &InitialPacket, peer: SocketAddr) -> Result<RouteOutcome> {
        let token = self.tokens.mint(peer.ip(), SystemTime::now())?;
        let scid = ConnectionId::random();
        debug!(%peer, odcid = %initial.header.dcid, scid = %scid, "sending retry");
        Ok(RouteOutcome::Retry(RetryPacket {
            header: LongHeader {
                version: initial.header.version,
                dcid: initial.header.scid.clone(),
                scid,
            },
            token,
            original_dcid: initial.header.dcid.clone(),
        }))
    }

    fn accept(&self, initial: InitialPacket) -> Result<RouteOutcome> {
        let dcid = initial.header.dcid.clone();
        // factory runs under the write lock: one connection per id
        let (connection, created) = match self.connections.write().entry(dcid.clone()) {
            Entry::Occupied(existing) => (existing.get().clone(), false),
            Entry::Vacant(slot) => {
                let connection = (self.factory)(&initial)?;
                (slot.insert(connection).clone(), true)
            }
        };
        if created {
            info!(cid = %dcid, total = self.len(), "connection created");
        }
        deliver(&connection, Packet::Initial(initial))?;
        Ok(RouteOutcome::Delivered {
            connection,
            created,
        })
    }

    pub fn get(&self, cid: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().get(cid).cloned()
    }

    pub fn remove(&self, cid: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.write().remove(cid)
    }

    /// Forget every closed connection. Returns how many were removed.
    pub fn purge_closed(&self) -> usize {
        let mut connections = self.connections.write();
        let before = connections.len();
        connections.retain(|_, conn| !conn.is_closed());
        let purged = before - connections.len();
        if purged > 0 {
            debug!(purged, remaining = connections.len(), "closed connections purged");
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tokens(&self) -> &RetryTokenManager {
        &self.tokens
    }
}

/// Hand `packet` to `connection`. Only errors that closed the connection
/// fail the route; the rest cost just the packet.
fn deliver(connection: &Connection, packet: Packet) -> Result<()> {
    match connection.on_packet(packet) {
        Err(err) if !err.is_fatal() => {
            debug!(cid = %connection.local_cid(), error = %err, "packet rejected by connection");
            Ok(())
        }
        result => result,
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("connections", &self.len())
            .field("require_retry", &self.config.require_retry)
            .finish_non_exhaustive()
    }
}
