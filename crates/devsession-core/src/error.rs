//! Error types for the device-session system
//!
//! This module defines all error types used throughout the crate.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for device-session operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the device-session system
#[derive(Error, Debug)]
pub enum Error {
    /// The endpoint could not be reached or the link broke mid-exchange
    #[error("Connection failed: {0}")]
    Connection(String),

    /// A single exchange exceeded its deadline
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The device answered with something we could not understand
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Credentials or pairing were rejected by the device
    #[error("Authentication rejected: {0}")]
    Auth(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Local I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The session has no usable link for a command
    #[error("Session not connected")]
    NotConnected,

    /// The session has been disposed
    #[error("Session disposed")]
    Disposed,

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Coarse error taxonomy used for status details and propagation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network failures and timeouts
    Transport,
    /// Malformed or unexpected responses
    Protocol,
    /// Pairing or credential rejection
    Auth,
    /// Missing or invalid required parameter
    Configuration,
}

impl Error {
    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connection(_)
            | Error::Timeout(_)
            | Error::Io(_)
            | Error::NotConnected
            | Error::Disposed
            | Error::Other(_) => ErrorKind::Transport,
            Error::Protocol(_) | Error::Json(_) => ErrorKind::Protocol,
            Error::Auth(_) => ErrorKind::Auth,
            Error::Config(_) => ErrorKind::Configuration,
        }
    }

    /// Whether this error should force the session to re-pair
    pub fn is_auth(&self) -> bool {
        self.kind() == ErrorKind::Auth
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
