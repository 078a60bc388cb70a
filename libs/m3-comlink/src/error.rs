//! Link Error Types
//!
//! Core error type shared by the address parser, dispatch queue and transports.

use thiserror::Error;

/// Result type for m3-comlink operations
pub type Result<T> = std::result::Result<T, M3Error>;

/// M3 link errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum M3Error {
    /// Configuration errors (bad record table, out-of-range LED value)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Address text rejected at record initialization
    #[error("Address error: {0}")]
    Parse(String),

    /// Low-level transfer failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Connection errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// Transaction did not complete within its timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Non-zero status word returned by the addressed module
    #[error("Remote error code {code}")]
    Remote { code: u16 },

    /// Frame violates the wire format
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Dispatch queue worker is gone
    #[error("Dispatch queue closed")]
    QueueClosed,

    /// Dispatch queue is at capacity
    #[error("Dispatch queue full (capacity {0})")]
    QueueFull(usize),

    /// A request for this record is still in flight
    #[error("Request already pending")]
    Busy,

    /// Completion was signalled without a response attached
    #[error("Completion without response")]
    MissingResponse,

    /// IO errors
    #[error("IO error: {0}")]
    Io(String),

    /// Invalid data
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Not supported
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for M3Error {
    fn from(err: std::io::Error) -> Self {
        M3Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for M3Error {
    fn from(err: serde_json::Error) -> Self {
        M3Error::InvalidData(format!("JSON error: {}", err))
    }
}

// Helper methods for creating errors
impl M3Error {
    pub fn config(msg: impl Into<String>) -> Self {
        M3Error::Config(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        M3Error::Parse(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        M3Error::Transport(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        M3Error::Connection(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        M3Error::Timeout(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        M3Error::Protocol(msg.into())
    }

    pub fn invalid_data(msg: impl Into<String>) -> Self {
        M3Error::InvalidData(msg.into())
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        M3Error::NotSupported(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        M3Error::Internal(msg.into())
    }

    /// Check if this error indicates a need for reconnection
    pub fn needs_reconnect(&self) -> bool {
        match self {
            M3Error::Io(msg) => {
                msg.contains("Broken pipe")
                    || msg.contains("Connection reset")
                    || msg.contains("Connection refused")
                    || msg.contains("Connection aborted")
                    || msg.contains("Network is unreachable")
                    || msg.contains("early eof")
            },
            M3Error::Connection(_) => true,
            M3Error::NotConnected => true,
            M3Error::Protocol(_) => true,
            _ => false,
        }
    }

    /// Errors that only affect the current processing cycle
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            M3Error::Config(_) | M3Error::Parse(_) | M3Error::NotSupported(_)
        )
    }
}
