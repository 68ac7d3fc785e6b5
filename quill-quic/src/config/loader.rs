//! Configuration loading.
//!
//! Precedence, lowest first:
//! 1. Defaults
//! 2. TOML file
//! 3. Environment variables with the `QUILL__` prefix and `__` as the
//!    nesting separator, e.g. `QUILL__IDLE_TIMEOUT_MS=5000` or
//!    `QUILL__FLOW_CONTROL__INITIAL_MAX_DATA=65536`

use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigLoader, Environment, File, FileFormat};

use super::EngineConfig;

pub const ENV_PREFIX: &str = "QUILL";

/// Load and validate configuration from `path` plus the environment.
///
/// A missing file is not an error; defaults and environment still apply.
pub fn load(path: impl AsRef<Path>) -> Result<EngineConfig> {
    let path = path.as_ref();
    if !path.exists() {
        tracing::warn!(
            config_path = %path.display(),
            "Configuration file not found, using defaults"
        );
    }

    let config: EngineConfig = ConfigLoader::builder()
        .add_source(
            File::from(path)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to read configuration: {}", path.display()))?
        .try_deserialize()
        .with_context(|| format!("Failed to parse configuration: {}", path.display()))?;

    config.validate().map_err(|errors| {
        anyhow::anyhow!("Configuration validation failed:\n{}", errors.join("\n"))
    })?;

    tracing::debug!(
        config_path = %path.display(),
        idle_timeout_ms = config.idle_timeout_ms,
        require_retry = config.require_retry,
        "Configuration loaded"
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "retransmit_after_ms = 120\nmax_streams_uni = 3\n[flow_control]\ninitial_max_data = 65536"
        )
        .unwrap();

        let config = load(file.path()).unwrap();
        assert_eq!(config.retransmit_after_ms, 120);
        assert_eq!(config.max_streams_uni, 3);
        assert_eq!(config.flow_control.initial_max_data, 65536);
        assert_eq!(config.idle_timeout_ms, 30_000);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.supported_versions, vec![crate::version::VERSION_1]);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "idle_timeout_ms = 0").unwrap();
        let err = load(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("idle_timeout_ms"));
    }
}
