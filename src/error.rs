//! Error types for the chat server.
//!
//! Only setup failures (registration, binding, TLS, configuration) and failed
//! writes are returned to callers. Per-connection transport conditions are turned into notifications
//! by the receive loop and never travel through this type.

use crate::state::ConnectionId;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the crate.
#[derive(Debug, Error)]
pub enum ChatError {
    /// A connection with this id is already live in the registry.
    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),

    /// The peer is gone; nothing more can be written to it.
    #[error("connection closed")]
    ConnectionClosed,

    /// A write did not complete within `send_timeout`.
    #[error("send timed out after {0:?}")]
    SendTimeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] axum::Error),

    #[error("TLS setup error: {0}")]
    Tls(String),

    #[error("malformed configuration: {0}")]
    Config(#[from] toml::de::Error),

    /// Configuration parsed but holds a value the server cannot run with.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<tokio_rustls::rustls::Error> for ChatError {
    fn from(err: tokio_rustls::rustls::Error) -> Self {
        ChatError::Tls(err.to_string())
    }
}
