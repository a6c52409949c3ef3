//! Configuration module for the chat server.
//!
//! This module defines the `ServerConfig` struct and provides functionality
//! to load the configuration from a TOML source (string or file).

use crate::error::ChatError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration struct.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address on which the server will bind.
    pub host: String,

    /// Port number of the WebSocket listener.
    pub port: u16,

    /// Port of the newline-delimited TCP listener. Disabled when absent.
    pub line_port: Option<u16>,

    /// Certificate and key for the TCP listener. Connections are plaintext when absent.
    pub tls: Option<TlsConfig>,

    /// Channel every connection starts in.
    pub default_channel: String,

    /// Maximum length, in characters, of display names and channel names.
    pub name_limit: usize,

    /// How long `serve` waits for open connections to wind down after shutdown.
    #[serde(deserialize_with = "crate::utils::deserialize_duration")]
    pub shutdown_grace: Duration,

    /// Upper bound on a single write to one connection. A recipient that does
    /// not accept its payload in time counts as a failed delivery.
    #[serde(deserialize_with = "crate::utils::deserialize_duration")]
    pub send_timeout: Duration,
}

/// PEM files used to terminate TLS on the line listener.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8081,
            line_port: None,
            tls: None,
            default_channel: "general".to_string(),
            name_limit: 31,
            shutdown_grace: Duration::from_secs(5),
            send_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Parses a configuration from TOML text. Missing keys fall back to defaults.
    ///
    /// # Errors
    ///
    /// `ChatError::Config` for malformed TOML, `ChatError::InvalidConfig` if
    /// the parsed values fail `validate`.
    pub fn from_toml_str(source: &str) -> Result<Self, ChatError> {
        let config: ServerConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values that would produce empty names, channels or instant send failures.
    pub fn validate(&self) -> Result<(), ChatError> {
        if self.name_limit == 0 {
            return Err(ChatError::InvalidConfig(
                "name_limit must be at least 1".to_string(),
            ));
        }
        if self.default_channel.trim().is_empty() {
            return Err(ChatError::InvalidConfig(
                "default_channel must not be empty".to_string(),
            ));
        }
        if self.send_timeout.is_zero() {
            return Err(ChatError::InvalidConfig(
                "send_timeout must be at least 1 second".to_string(),
            ));
        }
        Ok(())
    }

    /// Reads and parses a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ChatError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }
}
