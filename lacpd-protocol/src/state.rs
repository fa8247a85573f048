//! Actor/Partner parameter blocks and the port state flag octet
//!
//! The data model of 802.1AX-2014 Section 6.4.2.3: a participant is
//! described by its system (priority + id), an operational key, a port
//! (priority + number) and an eight-bit state flag set. Four copies live on
//! every port: Actor admin/oper and Partner admin/oper.

use lacpd_core::MacAddr;
use lacpd_packet::ParticipantInfo;
use std::fmt;

/// The eight port state flags, LSB first (802.1AX Figure 6-8)
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct StateFlags(pub u8);

impl StateFlags {
    /// LACP_Activity: 1 = active, 0 = passive
    pub const ACTIVITY: u8 = 1 << 0;
    /// LACP_Timeout: 1 = short (fast cadence expected), 0 = long
    pub const TIMEOUT: u8 = 1 << 1;
    /// Aggregation: 1 = aggregatable, 0 = individual
    pub const AGGREGATION: u8 = 1 << 2;
    /// Synchronization: in sync with the partner's view of the LAG
    pub const SYNC: u8 = 1 << 3;
    /// Collecting: frames received on this port are handed up
    pub const COLLECTING: u8 = 1 << 4;
    /// Distributing: frames are transmitted via this port
    pub const DISTRIBUTING: u8 = 1 << 5;
    /// Defaulted: partner info comes from admin defaults, not a PDU
    pub const DEFAULTED: u8 = 1 << 6;
    /// Expired: the receive machine is in its Expired state
    pub const EXPIRED: u8 = 1 << 7;

    /// Partner admin template written once a live partner has been seen:
    /// losing it then keeps the port out of the aggregate.
    pub const AGGREGATABLE_DOWN: u8 = Self::ACTIVITY | Self::AGGREGATION;

    /// Create from a raw flag octet
    pub const fn new(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw flag octet
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Set the given bits
    pub fn set(&mut self, bits: u8) {
        self.0 |= bits;
    }

    /// Clear the given bits
    pub fn clear(&mut self, bits: u8) {
        self.0 &= !bits;
    }

    /// True iff every one of the given bits is set
    pub fn is_set(self, bits: u8) -> bool {
        self.0 & bits == bits
    }

    /// Masked equality: the two flag sets agree on every bit in `mask`
    pub fn masked_eq(self, other: StateFlags, mask: u8) -> bool {
        (self.0 & mask) == (other.0 & mask)
    }
}

impl fmt::Debug for StateFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(u8, &str); 8] = [
            (StateFlags::ACTIVITY, "ACT"),
            (StateFlags::TIMEOUT, "TMO"),
            (StateFlags::AGGREGATION, "AGG"),
            (StateFlags::SYNC, "SYN"),
            (StateFlags::COLLECTING, "COL"),
            (StateFlags::DISTRIBUTING, "DIS"),
            (StateFlags::DEFAULTED, "DEF"),
            (StateFlags::EXPIRED, "EXP"),
        ];
        write!(f, "0x{:02x}[", self.0)?;
        let mut first = true;
        for (bit, name) in NAMES {
            if self.0 & bit != 0 {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        write!(f, "]")
    }
}

/// System identity: priority plus MAC. Equality is bitwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SystemInfo {
    pub priority: u16,
    pub id: MacAddr,
}

impl SystemInfo {
    pub const fn new(priority: u16, id: MacAddr) -> Self {
        Self { priority, id }
    }
}

/// One participant's parameter block (802.1AX 6.4.7)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortInfo {
    pub system: SystemInfo,
    pub key: u16,
    pub port_priority: u16,
    pub port_number: u16,
    pub state: StateFlags,
}

impl PortInfo {
    /// Selective equality: system, key and port fields must be bitwise
    /// equal, and the state octets must agree on the bits in `state_mask`.
    ///
    /// Every byte of the system id participates, index-wise.
    pub fn matches(&self, other: &PortInfo, state_mask: u8) -> bool {
        self.system.id == other.system.id
            && self.system.priority == other.system.priority
            && self.key == other.key
            && self.port_priority == other.port_priority
            && self.port_number == other.port_number
            && self.state.masked_eq(other.state, state_mask)
    }

    /// Same identity comparison, against a PDU participant block
    pub fn matches_participant(&self, other: &ParticipantInfo, state_mask: u8) -> bool {
        self.matches(&PortInfo::from(other), state_mask)
    }
}

impl From<&ParticipantInfo> for PortInfo {
    fn from(p: &ParticipantInfo) -> Self {
        Self {
            system: SystemInfo::new(p.system_priority, p.system_id),
            key: p.key,
            port_priority: p.port_priority,
            port_number: p.port_number,
            state: StateFlags(p.state),
        }
    }
}

impl From<&PortInfo> for ParticipantInfo {
    fn from(p: &PortInfo) -> Self {
        Self {
            system_priority: p.system.priority,
            system_id: p.system.id,
            key: p.key,
            port_priority: p.port_priority,
            port_number: p.port_number,
            state: p.state.bits(),
        }
    }
}
