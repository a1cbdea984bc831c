//! Error types for the relay

use std::time::Duration;
use thiserror::Error;

/// Relay error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Upgrade failed: {0}")]
    Upgrade(String),

    #[error("Read failed: {0}")]
    Read(String),

    #[error("Write failed: {0}")]
    Write(String),

    #[error("Write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Broker publish failed: {0}")]
    BrokerPublish(String),

    #[error("Broker subscribe failed: {0}")]
    BrokerSubscribe(String),

    #[error("Queue full (capacity {0})")]
    QueueFull(usize),

    #[error("Queue closed")]
    QueueClosed,

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(err: base64::DecodeError) -> Self {
        Self::Codec(err.to_string())
    }
}

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, Error>;
