//! Ethernet frame construction and parsing
//!
//! Ethernet II framing as needed by a slow-protocols control plane: build
//! outbound frames (with minimum-size padding) and split inbound ones into
//! header fields plus payload.

use bytes::{BufMut, BytesMut};
use lacpd_core::MacAddr;
use std::fmt;

/// EtherType values this stack cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtherType {
    /// Slow Protocols (0x8809) - LACP, LAMP, OAM
    SlowProtocols,
    /// VLAN-tagged frame (0x8100)
    Vlan,
    /// Any other EtherType
    Other(u16),
}

impl EtherType {
    /// Convert EtherType to u16 value
    pub fn to_u16(self) -> u16 {
        match self {
            EtherType::SlowProtocols => 0x8809,
            EtherType::Vlan => 0x8100,
            EtherType::Other(val) => val,
        }
    }

    /// Create EtherType from u16 value
    pub fn from_u16(value: u16) -> Self {
        match value {
            0x8809 => EtherType::SlowProtocols,
            0x8100 => EtherType::Vlan,
            val => EtherType::Other(val),
        }
    }
}

impl fmt::Display for EtherType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EtherType::SlowProtocols => write!(f, "Slow Protocols"),
            EtherType::Vlan => write!(f, "VLAN"),
            EtherType::Other(val) => write!(f, "0x{:04X}", val),
        }
    }
}

/// Ethernet II frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetFrame {
    /// Destination MAC address
    pub destination: MacAddr,
    /// Source MAC address
    pub source: MacAddr,
    /// EtherType
    pub ethertype: EtherType,
    /// Payload data
    pub payload: Vec<u8>,
}

impl EthernetFrame {
    /// Minimum Ethernet frame size (without FCS)
    pub const MIN_FRAME_SIZE: usize = 60;

    /// Ethernet header size (dst + src + type)
    pub const HEADER_SIZE: usize = 14;

    /// Create a new Ethernet frame
    pub fn new(destination: MacAddr, source: MacAddr, ethertype: EtherType, payload: Vec<u8>) -> Self {
        EthernetFrame {
            destination,
            source,
            ethertype,
            payload,
        }
    }

    /// Convert the frame to bytes, padding to the minimum frame size if needed
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = BytesMut::with_capacity(Self::HEADER_SIZE + self.payload.len());

        buffer.put_slice(self.destination.as_bytes());
        buffer.put_slice(self.source.as_bytes());
        buffer.put_u16(self.ethertype.to_u16());
        buffer.put_slice(&self.payload);

        let mut result = buffer.to_vec();
        if result.len() < Self::MIN_FRAME_SIZE {
            result.resize(Self::MIN_FRAME_SIZE, 0);
        }

        result
    }

    /// Parse an Ethernet frame from bytes
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < Self::HEADER_SIZE {
            return None;
        }

        let mut dst = [0u8; 6];
        dst.copy_from_slice(&data[0..6]);
        let mut src = [0u8; 6];
        src.copy_from_slice(&data[6..12]);
        let ethertype = EtherType::from_u16(u16::from_be_bytes([data[12], data[13]]));

        Some(EthernetFrame {
            destination: MacAddr(dst),
            source: MacAddr(src),
            ethertype,
            payload: data[Self::HEADER_SIZE..].to_vec(),
        })
    }
}
