//! Error types for service discovery

use std::time::Duration;
use thiserror::Error;

/// Service discovery error type
#[derive(Error, Debug)]
pub enum Error {
    /// The coordination service cannot be reached, or the session to it died
    #[error("Connection error: {0}")]
    Connection(String),

    /// Lease grant, bind or heartbeat failure
    #[error("Lease error: {0}")]
    Lease(String),

    /// Malformed registry record
    #[error("Parse error: {0}")]
    Parse(String),

    /// Registry key that does not have two or three segments
    #[error("Invalid registry key: {0}")]
    InvalidKey(String),

    /// Descriptor that cannot be registered
    #[error("Invalid service descriptor: {0}")]
    InvalidDescriptor(String),

    /// Operation called in the wrong lifecycle state
    #[error("Invalid state: {0}")]
    State(String),

    /// A single coordination request exceeded its deadline
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Whether this error means the session to the coordination service is
    /// unusable and a fresh connection is required.
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Timeout(_))
    }

    /// Wrap a failure from a lease-scoped request, keeping connection
    /// failures classified as such.
    pub(crate) fn lease(context: &str, err: Error) -> Error {
        if err.is_connection() {
            err
        } else {
            Error::Lease(format!("{}: {}", context, err))
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
