//! lacpd-rs wire layer
//!
//! Ethernet II frame construction/parsing and the LACPDU codec
//! (IEEE 802.1AX-2014 Section 6.4.2.3). The codec is deliberately
//! self-contained so tests can construct bit-exact PDUs.

pub mod ethernet;
pub mod lacpdu;

pub use ethernet::{EtherType, EthernetFrame};
pub use lacpdu::{Lacpdu, ParticipantInfo, LACPDU_LEN, LACP_SUBTYPE, SLOW_PROTOCOLS_MULTICAST};
