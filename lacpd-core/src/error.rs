//! Error types for lacpd-rs

use thiserror::Error;

/// Result type alias for lacpd operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for lacpd-rs
#[derive(Error, Debug)]
pub enum Error {
    /// Network I/O error
    #[error("Network I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol-level error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Packet construction error
    #[error("Packet construction error: {0}")]
    PacketConstruction(String),

    /// Packet parsing error
    #[error("Packet parsing error: {0}")]
    PacketParsing(String),

    /// Frame transmission error
    #[error("Transmit error: {0}")]
    Transmit(String),

    /// Port not present in the registry
    #[error("Port {0} not found")]
    PortNotFound(u16),

    /// Port already present in the registry
    #[error("Port {0} already exists")]
    PortExists(u16),

    /// Event submitted to a stopped engine
    #[error("Port engine stopped: {0}")]
    EngineStopped(String),

    /// Invalid configuration
    #[error("Invalid configuration '{name}': {reason}")]
    InvalidConfig { name: String, reason: String },
}

impl Error {
    /// Create a protocol error with a custom message
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a packet parsing error with a custom message
    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Error::PacketParsing(msg.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_config<S: Into<String>>(name: S, reason: S) -> Self {
        Error::InvalidConfig {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
