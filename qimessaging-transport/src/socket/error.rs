//! Error types for socket operations.

use std::io;
use thiserror::Error;

use crate::wire::WireError;

/// Errors that can occur during socket operations.
///
/// `Clone` so that one failure can complete several waiting futures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SocketError {
    /// Host name resolution failed
    #[error("Cannot resolve {host}: {reason}")]
    Resolve {
        /// Host that was looked up
        host: String,
        /// Resolver message
        reason: String,
    },

    /// The host only resolves to IPv6 addresses and IPv6 is disabled
    #[error("{host} only resolves to IPv6 addresses and IPv6 is disabled")]
    Ipv6Disabled {
        /// Host that was looked up
        host: String,
    },

    /// No resolved address accepted the connection
    #[error("Cannot connect to {url}: {reason}")]
    Connect {
        /// Target url
        url: String,
        /// Last connection error
        reason: String,
    },

    /// The TLS handshake failed
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// TLS is requested but cannot be set up
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// A disconnect was requested while connecting
    #[error("Connection aborted by a disconnect request")]
    Aborted,

    /// The socket is not connected
    #[error("Socket is not connected")]
    NotConnected,

    /// Invalid operation for the current socket state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// An incoming header announced a payload above the configured maximum
    #[error("Message payload of {size} bytes exceeds the maximum of {max}")]
    MessageSize {
        /// Announced payload size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// The peer broke the framing protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<io::Error> for SocketError {
    fn from(error: io::Error) -> Self {
        SocketError::Io(error.to_string())
    }
}

impl From<WireError> for SocketError {
    fn from(error: WireError) -> Self {
        match error {
            WireError::PayloadTooLarge { size, max } => SocketError::MessageSize { size, max },
            other => SocketError::Protocol(other.to_string()),
        }
    }
}

/// Result type for socket operations.
pub type SocketResult<T> = Result<T, SocketError>;
