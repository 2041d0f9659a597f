//! Error definitions for the MQTT session manager

use std::time::Duration;
use thiserror::Error;

/// Errors raised by a [`Transport`](super::transport::Transport) implementation
///
/// Cloneable so that acknowledgment failures can travel through the inbound
/// event channel to the session task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Broker address could not be turned into host and port
    #[error("Invalid broker address: {0}")]
    InvalidAddress(String),

    /// Client identifier rejected before the handle was built
    #[error("Invalid client id: {0:?}")]
    InvalidClientId(String),

    /// The client has no live connection to the broker
    #[error("Client not connected")]
    NotConnected,

    /// No ConnAck arrived within the connect timeout
    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    /// Network or protocol failure while connecting
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A request could not be queued or was refused by the broker
    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// The handle was released by `close()`
    #[error("Transport closed")]
    Closed,
}

/// Errors surfaced to callers of the session handle
#[derive(Debug, Error)]
pub enum SessionError {
    /// Transport handle could not be constructed
    #[error("Initialization error: {0}")]
    InitializationError(#[from] TransportError),

    /// Session task is gone or dropped a response
    #[error("Channel error: {0}")]
    ChannelError(String),
}

/// Errors while loading or writing the configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("No configuration directory available on this platform")]
    NoConfigDir,
}
