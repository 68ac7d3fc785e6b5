//! # Transport Parameters (RFC 9000 Section 18)
//!
//! Exchanged inside the TLS handshake. Their byte encoding belongs to the
//! TLS collaborator; the engine receives the decoded values and applies the
//! flow-control and stream-count limits they carry.

use crate::config::EngineConfig;
use crate::error::{Error, Result, TransportError};
use crate::types::{ConnectionId, Side};
use crate::varint::VARINT_MAX;

/// Transport Parameters Structure (RFC 9000 Section 18.2)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportParameters {
    // Connection IDs
    pub original_destination_connection_id: Option<ConnectionId>,
    pub initial_source_connection_id: Option<ConnectionId>,
    pub retry_source_connection_id: Option<ConnectionId>,

    // Idle Timeout (milliseconds)
    pub max_idle_timeout: Option<u64>,

    // Flow Control
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,

    // Stream Limits
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
}

impl TransportParameters {
    /// Parameters we advertise. The uni value is the window we grant the
    /// peer's unidirectional streams.
    pub fn from_config(config: &EngineConfig, scid: &ConnectionId) -> Self {
        let fc = &config.flow_control;
        Self {
            initial_source_connection_id: Some(scid.clone()),
            max_idle_timeout: Some(config.idle_timeout_ms),
            initial_max_data: fc.initial_max_data,
            initial_max_stream_data_bidi_local: fc.initial_max_stream_data_bidi_local,
            initial_max_stream_data_bidi_remote: fc.initial_max_stream_data_bidi_remote,
            initial_max_stream_data_uni: fc.initial_max_stream_data_uni_remote,
            initial_max_streams_bidi: config.max_streams_bidi,
            initial_max_streams_uni: config.max_streams_uni,
            ..Default::default()
        }
    }

    /// Check parameters received from a peer on `peer_side`.
    pub fn validate_from(&self, peer_side: Side) -> Result<()> {
        // RFC 9000 Section 18.2: only servers send these
        if peer_side.is_client()
            && (self.original_destination_connection_id.is_some()
                || self.retry_source_connection_id.is_some())
        {
            return Err(Error::transport(
                TransportError::TransportParameterError,
                "client sent a server-only transport parameter",
            ));
        }
        for (name, value) in [
            ("initial_max_data", self.initial_max_data),
            (
                "initial_max_stream_data_bidi_local",
                self.initial_max_stream_data_bidi_local,
            ),
            (
                "initial_max_stream_data_bidi_remote",
                self.initial_max_stream_data_bidi_remote,
            ),
            ("initial_max_stream_data_uni", self.initial_max_stream_data_uni),
        ] {
            if value > VARINT_MAX {
                return Err(Error::transport(
                    TransportError::TransportParameterError,
                    format!("{name} out of range"),
                ));
            }
        }
        // RFC 9000 Section 4.6
        if self.initial_max_streams_bidi > 1 << 60 || self.initial_max_streams_uni > 1 << 60 {
            return Err(Error::transport(
                TransportError::TransportParameterError,
                "stream count limit above 2^60",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_uses_remote_uni_window() {
        let mut config = EngineConfig::default();
        config.flow_control.initial_max_stream_data_uni_local = 10;
        config.flow_control.initial_max_stream_data_uni_remote = 20;
        let params = TransportParameters::from_config(&config, &ConnectionId::random());
        assert_eq!(params.initial_max_stream_data_uni, 20);
        assert_eq!(params.max_idle_timeout, Some(30_000));
    }

    #[test]
    fn test_client_cannot_send_original_dcid() {
        let params = TransportParameters {
            original_destination_connection_id: Some(ConnectionId::random()),
            ..Default::default()
        };
        assert!(params.validate_from(Side::Server).is_ok());
        let err = params.validate_from(Side::Client).unwrap_err();
        assert_eq!(
            err.transport_code(),
            Some(TransportError::TransportParameterError.code())
        );
    }

    #[test]
    fn test_stream_count_bound() {
        let params = TransportParameters {
            initial_max_streams_uni: (1 << 60) + 1,
            ..Default::default()
        };
        assert!(params.validate_from(Side::Server).is_err());
    }
}
