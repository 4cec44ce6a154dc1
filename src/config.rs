//! Host configuration
//!
//! Compiled defaults, optionally overridden by a TOML file and then by
//! command-line flags in `main`.

use crate::connection::ManagerSettings;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Loopback address the bridge endpoint listens on
    pub listen_addr: SocketAddr,
    /// Where the session record is stored
    pub session_path: PathBuf,
    pub connect_timeout_ms: u64,
    pub close_timeout_ms: u64,
    pub command_queue_depth: usize,
    /// Bytes read from a serial device per `Data` event at most
    pub serial_read_buffer: usize,
    pub mqtt_channel_capacity: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7878)),
            session_path: default_session_path(),
            connect_timeout_ms: 5000,
            close_timeout_ms: 2000,
            command_queue_depth: 64,
            serial_read_buffer: 4096,
            mqtt_channel_capacity: 64,
        }
    }
}

/// `<data dir>/portmux/session.json`, or the working directory when the
/// platform has no data directory
pub fn default_session_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("portmux")
        .join("session.json")
}

impl HostConfig {
    /// Load a TOML file; keys it leaves out keep their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: HostConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid("connect_timeout_ms must be positive".into()));
        }
        if self.close_timeout_ms == 0 {
            return Err(ConfigError::Invalid("close_timeout_ms must be positive".into()));
        }
        if self.command_queue_depth == 0 {
            return Err(ConfigError::Invalid("command_queue_depth must be positive".into()));
        }
        if self.serial_read_buffer == 0 {
            return Err(ConfigError::Invalid("serial_read_buffer must be positive".into()));
        }
        if self.mqtt_channel_capacity == 0 {
            return Err(ConfigError::Invalid("mqtt_channel_capacity must be positive".into()));
        }
        Ok(())
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            close_timeout: Duration::from_millis(self.close_timeout_ms),
            command_queue_depth: self.command_queue_depth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.listen_addr.to_string(), "127.0.0.1:7878");
        assert!(config.session_path.ends_with("portmux/session.json"));
        assert!(config.validate().is_ok());

        let settings = config.manager_settings();
        assert_eq!(settings.connect_timeout, Duration::from_secs(5));
        assert_eq!(settings.command_queue_depth, 64);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "listen_addr = \"127.0.0.1:9000\"").unwrap();
        writeln!(file, "connect_timeout_ms = 250").unwrap();

        let config = HostConfig::load(file.path()).unwrap();
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.connect_timeout_ms, 250);
        assert_eq!(config.close_timeout_ms, 2000);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = HostConfig::load(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_bad_values_are_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "command_queue_depth = 0").unwrap();
        assert!(matches!(
            HostConfig::load(file.path()),
            Err(ConfigError::Invalid(_))
        ));

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "listen_addr = 12").unwrap();
        assert!(matches!(
            HostConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
