//! Error types for the NSQ transport

use thiserror::Error;

/// Transport error
#[derive(Debug, Error)]
pub enum Error {
    /// Outgoing envelope could not be serialized; nothing was sent
    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    /// Incoming payload is malformed or has an unknown shape
    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    /// Connection or broker-level failure
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Envelope never passed through an NSQ receiver
    #[error("Envelope is not correlated with an NSQ message")]
    NotCorrelated,

    /// Invalid transport configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether redelivering the message that caused this error can never succeed.
    ///
    /// Transport failures are transient and left to the host bus retry policy.
    pub fn is_unrecoverable(&self) -> bool {
        !matches!(self, Error::TransportUnavailable(_))
    }
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
