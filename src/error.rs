//! Error types for the gateway.

use thiserror::Error;

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;

/// SOCKS5 reply code used when a dial error carries no status of its own.
pub const DEFAULT_STATUS_CODE: u8 = 0x04;

/// Errors that can occur while accepting, parsing, dialing or relaying.
#[derive(Error, Debug)]
pub enum Error {
    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Malformed handshake bytes
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Protocol version mismatch
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch {
        /// Version this side speaks
        expected: u8,
        /// Version the peer sent
        actual: u8,
    },

    /// SOCKS5 address type outside 0x01, 0x03 and 0x13
    #[error("ATYP 0x{0:02x} not supported")]
    AddressType(u8),

    /// SOCKS5 command other than CONNECT
    #[error("command 0x{0:02x} not supported")]
    Command(u8),

    /// Failure that carries a protocol status code (SOCKS5 reply code)
    #[error("{message} (status 0x{code:02x})")]
    Status {
        /// Protocol status code
        code: u8,
        /// Human-readable cause
        message: String,
    },

    /// Frame length prefix exceeds the reader's buffer
    #[error("frame too large: length {length} exceeds buffer capacity {capacity}")]
    FrameTooLarge {
        /// Frame length, prefix included
        length: usize,
        /// Largest frame accepted
        capacity: usize,
    },

    /// No processor registered for a leading byte and no wildcard
    #[error("no processor registered for leading byte 0x{0:02x}")]
    NoProcessor(u8),

    /// Forward name already active
    #[error("forward {0:?} already exists")]
    DuplicateForward(String),

    /// Forward name not active
    #[error("forward {0:?} not found")]
    ForwardNotFound(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// WebSocket handshake or transport failure
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Connection torn down by a bulk close
    #[error("connection closed")]
    Closed,
}

impl Error {
    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create an error carrying a status code
    pub fn status(code: u8, msg: impl Into<String>) -> Self {
        Error::Status {
            code,
            message: msg.into(),
        }
    }

    /// Status code carried by this error, if any.
    pub fn status_code(&self) -> Option<u8> {
        match self {
            Error::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Check if this error is a malformed-handshake violation
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_)
                | Error::VersionMismatch { .. }
                | Error::AddressType(_)
                | Error::Command(_)
                | Error::FrameTooLarge { .. }
        )
    }

    /// Check if this error is a registry conflict of the lifecycle API
    pub fn is_registry_conflict(&self) -> bool {
        matches!(
            self,
            Error::NoProcessor(_) | Error::DuplicateForward(_) | Error::ForwardNotFound(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(e.to_string())
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Network(io) => io,
            Error::FrameTooLarge { .. } | Error::Protocol(_) => {
                std::io::Error::new(std::io::ErrorKind::InvalidData, e)
            }
            Error::Closed => std::io::Error::new(std::io::ErrorKind::NotConnected, e),
            other => std::io::Error::other(other),
        }
    }
}
