// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed 16-byte PGM header shared by every packet type.
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         source port           |       destination port        |
//! +-------------------------------+-------------------------------+
//! |     type      |    options    |           checksum            |
//! +---------------+---------------+-------------------------------+
//! |                    global source id ...                       |
//! +---------------------------------------------------------------+
//! |      ... global source id     |         tsdu length           |
//! +-------------------------------+-------------------------------+
//! ```
//!
//! All multi-byte fields are network byte order on the wire and host
//! order in memory.

use super::{Gsi, GSI_LEN};
use crate::config::PGM_HEADER_SIZE;

// Header `options` bitmap.

/// Option extensions are present after the type-specific header.
pub const HDR_OPT_PRESENT: u8 = 0x01;
/// Packet is network-significant (carried on OPT-bearing packets).
pub const HDR_OPT_NETWORK: u8 = 0x02;
/// Variable-length packets within this transmission group.
pub const HDR_OPT_VAR_PKTLEN: u8 = 0x40;
/// Packet carries parity rather than original data.
pub const HDR_OPT_PARITY: u8 = 0x80;

/// PGM packet type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Spm = 0x00,
    Poll = 0x01,
    Polr = 0x02,
    Odata = 0x04,
    Rdata = 0x05,
    Nak = 0x08,
    Nnak = 0x09,
    Ncf = 0x0a,
    Spmr = 0x40,
}

impl PacketType {
    /// Decode a wire type byte.
    pub fn from_wire(byte: u8) -> Option<PacketType> {
        match byte {
            0x00 => Some(PacketType::Spm),
            0x01 => Some(PacketType::Poll),
            0x02 => Some(PacketType::Polr),
            0x04 => Some(PacketType::Odata),
            0x05 => Some(PacketType::Rdata),
            0x08 => Some(PacketType::Nak),
            0x09 => Some(PacketType::Nnak),
            0x0a => Some(PacketType::Ncf),
            0x40 => Some(PacketType::Spmr),
            _ => None,
        }
    }

    /// True for packets flowing from receivers toward the source.
    pub fn is_upstream(self) -> bool {
        matches!(
            self,
            PacketType::Nak | PacketType::Nnak | PacketType::Spmr | PacketType::Polr
        )
    }

    /// True for packets flowing from the source toward receivers.
    pub fn is_downstream(self) -> bool {
        !self.is_upstream()
    }
}

/// Parsed fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgmHeader {
    pub sport: u16,
    pub dport: u16,
    pub packet_type: PacketType,
    /// HDR_OPT_* bitmap.
    pub options: u8,
    /// Wire checksum as received; zero while building.
    pub checksum: u16,
    pub gsi: Gsi,
    /// Payload length after headers and options.
    pub tsdu_length: u16,
}

impl PgmHeader {
    pub fn new(packet_type: PacketType, sport: u16, dport: u16, gsi: Gsi) -> Self {
        Self {
            sport,
            dport,
            packet_type,
            options: 0,
            checksum: 0,
            gsi,
            tsdu_length: 0,
        }
    }

    /// Parse the leading 16 bytes of a datagram.
    ///
    /// Only structural validation happens here; checksum verification is
    /// a separate pass over the whole packet.
    pub fn parse(buf: &[u8]) -> Option<PgmHeader> {
        if buf.len() < PGM_HEADER_SIZE {
            return None;
        }
        let packet_type = PacketType::from_wire(buf[4])?;
        let mut gsi = [0u8; GSI_LEN];
        gsi.copy_from_slice(&buf[8..14]);
        Some(PgmHeader {
            sport: u16::from_be_bytes([buf[0], buf[1]]),
            dport: u16::from_be_bytes([buf[2], buf[3]]),
            packet_type,
            options: buf[5],
            checksum: u16::from_be_bytes([buf[6], buf[7]]),
            gsi: Gsi(gsi),
            tsdu_length: u16::from_be_bytes([buf[14], buf[15]]),
        })
    }

    /// Append the header with a zero checksum field; the caller stamps
    /// the checksum after the full packet is assembled.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.sport.to_be_bytes());
        buf.extend_from_slice(&self.dport.to_be_bytes());
        buf.push(self.packet_type as u8);
        buf.push(self.options);
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&self.gsi.0);
        buf.extend_from_slice(&self.tsdu_length.to_be_bytes());
    }
}

/// Stamp the Internet checksum into an assembled packet.
pub fn stamp_checksum(packet: &mut [u8]) {
    packet[6] = 0;
    packet[7] = 0;
    let sum = super::checksum::csum(packet);
    packet[6..8].copy_from_slice(&sum.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gsi() -> Gsi {
        Gsi([1, 2, 3, 4, 5, 6])
    }

    #[test]
    fn test_header_roundtrip() {
        let mut hdr = PgmHeader::new(PacketType::Odata, 7500, 7500, gsi());
        hdr.options = HDR_OPT_PRESENT;
        hdr.tsdu_length = 42;

        let mut buf = Vec::new();
        hdr.encode_into(&mut buf);
        assert_eq!(buf.len(), PGM_HEADER_SIZE);

        let parsed = PgmHeader::parse(&buf).expect("header must parse");
        assert_eq!(parsed.packet_type, PacketType::Odata);
        assert_eq!(parsed.sport, 7500);
        assert_eq!(parsed.gsi, gsi());
        assert_eq!(parsed.tsdu_length, 42);
        assert_eq!(parsed.options, HDR_OPT_PRESENT);
    }

    #[test]
    fn test_header_short_buffer_rejected() {
        let buf = [0u8; PGM_HEADER_SIZE - 1];
        assert!(PgmHeader::parse(&buf).is_none());
    }

    #[test]
    fn test_header_unknown_type_rejected() {
        let mut buf = vec![0u8; PGM_HEADER_SIZE];
        buf[4] = 0x77;
        assert!(PgmHeader::parse(&buf).is_none());
    }

    #[test]
    fn test_header_direction() {
        assert!(PacketType::Nak.is_upstream());
        assert!(PacketType::Spmr.is_upstream());
        assert!(PacketType::Spm.is_downstream());
        assert!(PacketType::Odata.is_downstream());
        assert!(PacketType::Ncf.is_downstream());
    }

    #[test]
    fn test_stamp_checksum_verifies() {
        let mut hdr = PgmHeader::new(PacketType::Spm, 1, 2, gsi());
        hdr.tsdu_length = 0;
        let mut buf = Vec::new();
        hdr.encode_into(&mut buf);
        buf.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);

        stamp_checksum(&mut buf);
        assert!(super::super::checksum::csum_verify(&buf));
    }
}
