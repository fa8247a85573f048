//! LACPDU parsing and construction
//!
//! Implements the version 1 LACPDU layout of IEEE 802.1AX-2014 Section
//! 6.4.2.3: Actor and Partner information TLVs, the Collector information
//! TLV and the terminator, carried over the Slow Protocols EtherType
//! (0x8809) with subtype 0x01.
//!
//! ```text
//! Offset  Size  Field
//!      0     1  Subtype = 0x01
//!      1     1  Version (1 or 2)
//!      2     1  Actor TLV type = 0x01
//!      3     1  Actor TLV length = 0x14
//!      4    18  Actor information (priority, system, key, port, state)
//!     22     1  Partner TLV type = 0x02
//!     23     1  Partner TLV length = 0x14
//!     24    18  Partner information, same shape as Actor
//!     42     1  Collector TLV type = 0x03
//!     43     1  Collector TLV length = 0x10
//!     44     2  Collector max delay
//!     46    12  Reserved
//!     58     1  Terminator TLV type = 0x00
//!     59     1  Terminator TLV length = 0x00
//!     60    50  Reserved/pad
//! ```

use bytes::{BufMut, BytesMut};
use lacpd_core::{Error, MacAddr, Result};

/// Slow-protocols multicast destination (01:80:C2:00:00:02)
pub const SLOW_PROTOCOLS_MULTICAST: MacAddr = MacAddr([0x01, 0x80, 0xC2, 0x00, 0x00, 0x02]);

/// Slow Protocols subtype identifying LACP
pub const LACP_SUBTYPE: u8 = 0x01;

/// Total LACPDU payload length, terminator padding included
pub const LACPDU_LEN: usize = 110;

/// Minimum parseable length: through the terminator TLV
pub const LACPDU_MIN_LEN: usize = 60;

const TLV_ACTOR: u8 = 0x01;
const TLV_PARTNER: u8 = 0x02;
const TLV_COLLECTOR: u8 = 0x03;
const TLV_TERMINATOR: u8 = 0x00;
const TLV_PARTICIPANT_LEN: u8 = 0x14;
const TLV_COLLECTOR_LEN: u8 = 0x10;

/// One participant's information block (Actor or Partner TLV body)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParticipantInfo {
    /// System priority
    pub system_priority: u16,
    /// System identifier
    pub system_id: MacAddr,
    /// Operational key
    pub key: u16,
    /// Port priority
    pub port_priority: u16,
    /// Port number
    pub port_number: u16,
    /// Port state flag octet
    pub state: u8,
}

impl ParticipantInfo {
    /// Parse an 18-byte participant information body
    fn parse(data: &[u8]) -> Self {
        let mut system_id = [0u8; 6];
        system_id.copy_from_slice(&data[2..8]);
        Self {
            system_priority: u16::from_be_bytes([data[0], data[1]]),
            system_id: MacAddr(system_id),
            key: u16::from_be_bytes([data[8], data[9]]),
            port_priority: u16::from_be_bytes([data[10], data[11]]),
            port_number: u16::from_be_bytes([data[12], data[13]]),
            state: data[14],
        }
    }

    /// Append the 18-byte participant information body plus reserved pad
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u16(self.system_priority);
        buf.put_slice(self.system_id.as_bytes());
        buf.put_u16(self.key);
        buf.put_u16(self.port_priority);
        buf.put_u16(self.port_number);
        buf.put_u8(self.state);
        buf.put_slice(&[0u8; 3]);
    }
}

/// A version 1 LACPDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lacpdu {
    /// Protocol version (1 or 2)
    pub version: u8,
    /// Actor information TLV body
    pub actor: ParticipantInfo,
    /// Partner information TLV body
    pub partner: ParticipantInfo,
    /// Collector max delay (tens of microseconds)
    pub collector_max_delay: u16,
}

impl Lacpdu {
    /// Create a version 1 LACPDU from actor and partner information
    pub fn new(actor: ParticipantInfo, partner: ParticipantInfo) -> Self {
        Self {
            version: 1,
            actor,
            partner,
            collector_max_delay: 0,
        }
    }

    /// Parse an LACPDU from an Ethernet payload
    ///
    /// Validates the subtype and every TLV type/length. Anything that does
    /// not validate is a parse error; callers drop the frame and count it.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < LACPDU_MIN_LEN {
            return Err(Error::parse(format!(
                "LACPDU too short: {} bytes (need {})",
                data.len(),
                LACPDU_MIN_LEN
            )));
        }
        if data[0] != LACP_SUBTYPE {
            return Err(Error::parse(format!("bad slow-protocols subtype 0x{:02x}", data[0])));
        }
        let version = data[1];
        if version == 0 {
            return Err(Error::parse("bad LACP version 0"));
        }
        if data[2] != TLV_ACTOR || data[3] != TLV_PARTICIPANT_LEN {
            return Err(Error::parse(format!(
                "bad actor TLV: type=0x{:02x} len=0x{:02x}",
                data[2], data[3]
            )));
        }
        if data[22] != TLV_PARTNER || data[23] != TLV_PARTICIPANT_LEN {
            return Err(Error::parse(format!(
                "bad partner TLV: type=0x{:02x} len=0x{:02x}",
                data[22], data[23]
            )));
        }
        if data[42] != TLV_COLLECTOR || data[43] != TLV_COLLECTOR_LEN {
            return Err(Error::parse(format!(
                "bad collector TLV: type=0x{:02x} len=0x{:02x}",
                data[42], data[43]
            )));
        }
        if data[58] != TLV_TERMINATOR || data[59] != 0 {
            return Err(Error::parse("bad terminator TLV"));
        }

        Ok(Self {
            version,
            actor: ParticipantInfo::parse(&data[4..22]),
            partner: ParticipantInfo::parse(&data[24..42]),
            collector_max_delay: u16::from_be_bytes([data[44], data[45]]),
        })
    }

    /// Build the 110-byte LACPDU payload
    pub fn build(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(LACPDU_LEN);

        buf.put_u8(LACP_SUBTYPE);
        buf.put_u8(self.version);

        buf.put_u8(TLV_ACTOR);
        buf.put_u8(TLV_PARTICIPANT_LEN);
        self.actor.put(&mut buf);

        buf.put_u8(TLV_PARTNER);
        buf.put_u8(TLV_PARTICIPANT_LEN);
        self.partner.put(&mut buf);

        buf.put_u8(TLV_COLLECTOR);
        buf.put_u8(TLV_COLLECTOR_LEN);
        buf.put_u16(self.collector_max_delay);
        buf.put_slice(&[0u8; 12]);

        buf.put_u8(TLV_TERMINATOR);
        buf.put_u8(0);

        let mut out = buf.to_vec();
        out.resize(LACPDU_LEN, 0);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_actor() -> ParticipantInfo {
        ParticipantInfo {
            system_priority: 0x8000,
            system_id: MacAddr([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]),
            key: 1,
            port_priority: 0x80,
            port_number: 1,
            state: 0x47,
        }
    }

    fn sample_partner() -> ParticipantInfo {
        ParticipantInfo {
            system_priority: 0x8000,
            system_id: MacAddr([0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE]),
            key: 1,
            port_priority: 0x80,
            port_number: 2,
            state: 0x3D,
        }
    }

    #[test]
    fn test_build_layout() {
        let pdu = Lacpdu::new(sample_actor(), sample_partner());
        let bytes = pdu.build();

        assert_eq!(bytes.len(), LACPDU_LEN);
        assert_eq!(bytes[0], LACP_SUBTYPE);
        assert_eq!(bytes[1], 1);
        assert_eq!((bytes[2], bytes[3]), (0x01, 0x14));
        assert_eq!(u16::from_be_bytes([bytes[4], bytes[5]]), 0x8000);
        assert_eq!(&bytes[6..12], &[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        assert_eq!(u16::from_be_bytes([bytes[16], bytes[17]]), 1);
        assert_eq!(bytes[18], 0x47);
        assert_eq!((bytes[22], bytes[23]), (0x02, 0x14));
        assert_eq!(u16::from_be_bytes([bytes[36], bytes[37]]), 2);
        assert_eq!(bytes[38], 0x3D);
        assert_eq!((bytes[42], bytes[43]), (0x03, 0x10));
        assert_eq!((bytes[58], bytes[59]), (0x00, 0x00));
        assert!(bytes[60..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_roundtrip() {
        let pdu = Lacpdu::new(sample_actor(), sample_partner());
        let bytes = pdu.build();
        let parsed = Lacpdu::parse(&bytes).unwrap();

        assert_eq!(parsed, pdu);
        // encode(decode(frame)) == frame
        assert_eq!(parsed.build(), bytes);
    }

    #[test]
    fn test_parse_rejects_bad_subtype() {
        let mut bytes = Lacpdu::new(sample_actor(), sample_partner()).build();
        bytes[0] = 0x02;
        assert!(Lacpdu::parse(&bytes).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_tlv() {
        let mut bytes = Lacpdu::new(sample_actor(), sample_partner()).build();
        bytes[2] = 0x05;
        assert!(Lacpdu::parse(&bytes).is_err());

        let mut bytes = Lacpdu::new(sample_actor(), sample_partner()).build();
        bytes[23] = 0x10;
        assert!(Lacpdu::parse(&bytes).is_err());
    }

    #[test]
    fn test_parse_rejects_short_frame() {
        let bytes = Lacpdu::new(sample_actor(), sample_partner()).build();
        assert!(Lacpdu::parse(&bytes[..40]).is_err());
    }

    #[test]
    fn test_parse_version_2() {
        let mut pdu = Lacpdu::new(sample_actor(), sample_partner());
        pdu.version = 2;
        let parsed = Lacpdu::parse(&pdu.build()).unwrap();
        assert_eq!(parsed.version, 2);
    }
}
