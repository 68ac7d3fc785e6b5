//! Engine configuration.
//!
//! Every knob has a default, so an empty TOML document is a valid
//! configuration:
//!
//! ```toml
//! idle_timeout_ms = 30000
//! require_retry = true
//! supported_versions = [1]
//!
//! [flow_control]
//! initial_max_data = 10485760
//! initial_max_stream_data_bidi_local = 1048576
//! initial_max_stream_data_bidi_remote = 1048576
//! initial_max_stream_data_uni_local = 1048576
//! initial_max_stream_data_uni_remote = 1048576
//! ```

pub mod loader;

pub use loader::load;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::version::{is_negotiable, VERSION_1};

/// Flow-control windows (RFC 9000 Section 4).
///
/// The four per-stream limits are independent; none is derived from
/// another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowControlConfig {
    /// Connection-wide receive window
    pub initial_max_data: u64,

    /// Receive window for bidirectional streams we open
    pub initial_max_stream_data_bidi_local: u64,

    /// Receive window for bidirectional streams the peer opens
    pub initial_max_stream_data_bidi_remote: u64,

    /// Cap on what we send on our own unidirectional streams
    pub initial_max_stream_data_uni_local: u64,

    /// Receive window for unidirectional streams the peer opens
    pub initial_max_stream_data_uni_remote: u64,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            initial_max_data: 10 * 1024 * 1024,
            initial_max_stream_data_bidi_local: 1024 * 1024,
            initial_max_stream_data_bidi_remote: 1024 * 1024,
            initial_max_stream_data_uni_local: 1024 * 1024,
            initial_max_stream_data_uni_remote: 1024 * 1024,
        }
    }
}

/// Configuration shared by every connection of an engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Versions offered in Version Negotiation, most preferred first
    pub supported_versions: Vec<u32>,

    pub idle_timeout_ms: u64,

    /// Answer token-less Initials with Retry (server)
    pub require_retry: bool,

    pub retry_token_lifetime_secs: u64,

    /// Hex-encoded HMAC key for retry tokens. Random when absent, which
    /// invalidates outstanding tokens on restart.
    pub retry_secret: Option<String>,

    /// Out-of-order handshake packets held per connection
    pub max_buffered_packets: usize,

    /// Age after which an unacknowledged packet is sent again
    pub retransmit_after_ms: u64,

    pub flow_control: FlowControlConfig,

    /// Bidirectional streams the peer may open
    pub max_streams_bidi: u64,

    /// Unidirectional streams the peer may open
    pub max_streams_uni: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            supported_versions: vec![VERSION_1],
            idle_timeout_ms: 30_000,
            require_retry: true,
            retry_token_lifetime_secs: 30,
            retry_secret: None,
            max_buffered_packets: 16,
            retransmit_after_ms: 300,
            flow_control: FlowControlConfig::default(),
            max_streams_bidi: 100,
            max_streams_uni: 100,
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn retransmit_after(&self) -> Duration {
        Duration::from_millis(self.retransmit_after_ms)
    }

    pub fn retry_token_lifetime(&self) -> Duration {
        Duration::from_secs(self.retry_token_lifetime_secs)
    }

    /// Decoded retry secret, if one is configured.
    pub fn retry_secret_bytes(&self) -> Option<Result<Vec<u8>, hex::FromHexError>> {
        self.retry_secret.as_deref().map(hex::decode)
    }

    /// Check every setting and report all problems at once.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.supported_versions.is_empty() {
            errors.push("supported_versions must list at least one version".to_string());
        }
        for version in &self.supported_versions {
            if !is_negotiable(*version) {
                errors.push(format!(
                    "supported_versions: {version:#010x} is reserved and cannot be offered"
                ));
            }
        }
        if self.idle_timeout_ms == 0 {
            errors.push("idle_timeout_ms must be greater than 0".to_string());
        }
        if self.retry_token_lifetime_secs == 0 {
            errors.push("retry_token_lifetime_secs must be greater than 0".to_string());
        }
        match self.retry_secret_bytes() {
            Some(Err(e)) => errors.push(format!("retry_secret is not valid hex: {e}")),
            Some(Ok(bytes)) if bytes.len() < 16 => {
                errors.push("retry_secret must be at least 16 bytes".to_string())
            }
            _ => {}
        }
        if self.retransmit_after_ms == 0 {
            errors.push("retransmit_after_ms must be greater than 0".to_string());
        }

        let fc = &self.flow_control;
        for (name, value) in [
            ("initial_max_data", fc.initial_max_data),
            (
                "initial_max_stream_data_bidi_local",
                fc.initial_max_stream_data_bidi_local,
            ),
            (
                "initial_max_stream_data_bidi_remote",
                fc.initial_max_stream_data_bidi_remote,
            ),
            (
                "initial_max_stream_data_uni_local",
                fc.initial_max_stream_data_uni_local,
            ),
            (
                "initial_max_stream_data_uni_remote",
                fc.initial_max_stream_data_uni_remote,
            ),
        ] {
            if value == 0 {
                errors.push(format!("flow_control.{name} must be greater than 0"));
            }
            if value > crate::varint::VARINT_MAX {
                errors.push(format!("flow_control.{name} exceeds 2^62-1"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
