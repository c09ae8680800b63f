//! Unified error system for the routing fabric
//!
//! A single error type shared by the codec, the session security functions and
//! the connection layer. Callers branch on the variant (most importantly
//! `Timeout` and `Closed`), so variants are never folded into one another.

use serde::{Deserialize, Serialize};

/// Unified error type for all fabric operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum FabricError {
    /// A frame was truncated or structurally inconsistent
    #[error("Malformed frame: {message}")]
    MalformedFrame {
        /// What was wrong with the frame
        message: String,
    },

    /// Missing or invalid input to an encoder or tag function
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the rejected input
        message: String,
    },

    /// An awaited acknowledgment did not arrive before the caller's deadline
    #[error("Timeout: {operation} did not complete within {elapsed_ms}ms")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Deadline that elapsed, in milliseconds
        elapsed_ms: u64,
    },

    /// No usable connection right now; absorbed by the reconnect loop
    #[error("Connection unavailable: {message}")]
    ConnectionUnavailable {
        /// Why the connection is unavailable
        message: String,
    },

    /// The session or socket was explicitly closed
    #[error("Closed: {message}")]
    Closed {
        /// What was closed
        message: String,
    },

    /// The transport failed to forward a request
    #[error("Transport error: {message}")]
    Transport {
        /// Error message reported by the transport
        message: String,
    },

    /// An inbound request could not be handled
    #[error("Handler error: {message}")]
    Handler {
        /// Error message describing the handler failure
        message: String,
    },

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Config {
        /// Error message describing the configuration issue
        message: String,
    },
}

impl FabricError {
    /// Create a malformed frame error
    pub fn malformed_frame(message: impl Into<String>) -> Self {
        Self::MalformedFrame {
            message: message.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a timeout error for `operation` after `elapsed`
    pub fn timeout(operation: impl Into<String>, elapsed: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create a connection unavailable error
    pub fn connection_unavailable(message: impl Into<String>) -> Self {
        Self::ConnectionUnavailable {
            message: message.into(),
        }
    }

    /// Create a closed error
    pub fn closed(message: impl Into<String>) -> Self {
        Self::Closed {
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a handler error
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// True if this is a caller deadline expiring
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// True if the owning session or socket was closed
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }

    /// True for failures the reconnect loop recovers from on its own
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionUnavailable { .. })
    }
}

/// Standard Result type for fabric operations
pub type FabricResult<T> = std::result::Result<T, FabricError>;

impl From<std::io::Error> for FabricError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Self::Timeout {
                operation: err.to_string(),
                elapsed_ms: 0,
            },
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected => Self::connection_unavailable(err.to_string()),
            _ => Self::transport(err.to_string()),
        }
    }
}
