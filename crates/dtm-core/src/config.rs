//! Session configuration.
//!
//! Loadable from TOML; every field has a default so partial files work.
//!
//! ```toml
//! parameter_set = "dtm-x25519-mlkem768-xchacha"
//! negotiate = true
//! max_resend = 3
//! keep_alive_interval_ms = 15000
//! ```

use crate::error::{DtmError, Result};
use crate::params::DEFAULT_PARAMETER_SET;
use crate::DEFAULT_MAX_PAYLOAD;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::path::Path;
use std::time::Duration;

/// Largest accepted file chunk
const MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// DTM session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DtmConfig {
    /// Name of the parameter set looked up in the catalog
    pub parameter_set: String,
    /// Run the Negotiate pre-exchange before Connect
    pub negotiate: bool,
    /// Resend requests tolerated per session
    pub max_resend: u32,
    /// Primary-channel resync attempts tolerated
    pub max_resync: u32,
    /// Depth of the sent and pending packet buffers
    pub buffer_depth: usize,
    /// Bound on transport connect plus handshake
    pub connect_timeout_ms: u64,
    /// Bound on a single transport send
    pub send_timeout_ms: u64,
    /// Keep-alive period once established (0 disables)
    pub keep_alive_interval_ms: u64,
    /// File transfer chunk size in bytes
    pub file_chunk_size: usize,
    /// Largest accepted packet payload
    pub max_payload: usize,
    /// Lifespan advertised with forward-secrecy key offers
    pub key_lifespan_secs: u64,
}

impl Default for DtmConfig {
    fn default() -> Self {
        Self {
            parameter_set: DEFAULT_PARAMETER_SET.to_string(),
            negotiate: false,
            max_resend: 8,
            max_resync: 2,
            buffer_depth: 256,
            connect_timeout_ms: 10_000,
            send_timeout_ms: 5_000,
            keep_alive_interval_ms: 0,
            file_chunk_size: 64 * 1024,
            max_payload: DEFAULT_MAX_PAYLOAD,
            key_lifespan_secs: 3600,
        }
    }
}

impl DtmConfig {
    /// Parse a TOML document
    ///
    /// # Errors
    ///
    /// Returns [`DtmError::InvalidConfig`] if parsing or validation fails.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| DtmError::InvalidConfig(Cow::Owned(e.to_string())))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    ///
    /// # Errors
    ///
    /// Returns [`DtmError::InvalidConfig`] if the file cannot be read,
    /// parsed or validated.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| DtmError::InvalidConfig(Cow::Owned(e.to_string())))?;
        Self::from_toml(&contents)
    }

    /// Serialize as TOML
    ///
    /// # Errors
    ///
    /// Returns [`DtmError::InvalidConfig`] if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| DtmError::InvalidConfig(Cow::Owned(e.to_string())))
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns [`DtmError::InvalidConfig`] if a value is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.parameter_set.is_empty() {
            return Err(DtmError::InvalidConfig(Cow::Borrowed(
                "parameter_set must not be empty",
            )));
        }
        if self.buffer_depth == 0 {
            return Err(DtmError::InvalidConfig(Cow::Borrowed(
                "buffer_depth must be at least 1",
            )));
        }
        if self.file_chunk_size == 0 || self.file_chunk_size > MAX_CHUNK_SIZE {
            return Err(DtmError::InvalidConfig(Cow::Owned(format!(
                "file_chunk_size must be between 1 and {MAX_CHUNK_SIZE}"
            ))));
        }
        if self.max_payload < self.file_chunk_size + 64 {
            return Err(DtmError::InvalidConfig(Cow::Borrowed(
                "max_payload must exceed file_chunk_size",
            )));
        }
        if self.connect_timeout_ms == 0 || self.send_timeout_ms == 0 {
            return Err(DtmError::InvalidConfig(Cow::Borrowed(
                "timeouts must be non-zero",
            )));
        }
        Ok(())
    }

    /// Connect timeout as a duration
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Send timeout as a duration
    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Keep-alive period, if enabled
    #[must_use]
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        (self.keep_alive_interval_ms > 0)
            .then(|| Duration::from_millis(self.keep_alive_interval_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DtmConfig::default();
        config.validate().unwrap();
        assert_eq!(config.parameter_set, DEFAULT_PARAMETER_SET);
        assert_eq!(config.keep_alive_interval(), None);
    }

    #[test]
    fn test_partial_toml() {
        let config = DtmConfig::from_toml(
            r#"
            negotiate = true
            max_resend = 2
            keep_alive_interval_ms = 250
            "#,
        )
        .unwrap();

        assert!(config.negotiate);
        assert_eq!(config.max_resend, 2);
        assert_eq!(config.max_resync, DtmConfig::default().max_resync);
        assert_eq!(config.keep_alive_interval(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = DtmConfig {
            buffer_depth: 32,
            ..DtmConfig::default()
        };
        let parsed = DtmConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_invalid_values() {
        let zero_depth = DtmConfig {
            buffer_depth: 0,
            ..DtmConfig::default()
        };
        assert!(matches!(zero_depth.validate(), Err(DtmError::InvalidConfig(_))));

        let zero_chunk = DtmConfig {
            file_chunk_size: 0,
            ..DtmConfig::default()
        };
        assert!(zero_chunk.validate().is_err());

        assert!(DtmConfig::from_toml("max_resend = \"lots\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dtm.toml");
        std::fs::write(&path, "buffer_depth = 16\n").unwrap();

        let config = DtmConfig::load(&path).unwrap();
        assert_eq!(config.buffer_depth, 16);
        assert!(DtmConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
