//! lacpd-rs Core Library
//!
//! This crate provides the fundamental types, error handling and collaborator
//! contracts shared by the lacpd-rs crates. The protocol engine itself lives
//! in `lacpd-protocol`; the wire codec in `lacpd-packet`.

pub mod error;
pub mod transmit;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result};
pub use transmit::{FrameTransmitter, NullTransmitter};
pub use types::{MacAddr, PortId};
