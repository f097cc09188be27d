// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SPM (Source Path Message) and SPMR encoders/decoders.
//!
//! An SPM advertises the source's window edges and its NLA (the unicast
//! address receivers direct NAKs to). SPMR carries no body: a late joiner
//! asking the source for an immediate SPM.
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           spm sqn                             |
//! +---------------------------------------------------------------+
//! |                           txw trail                           |
//! +---------------------------------------------------------------+
//! |                           txw lead                            |
//! +-------------------------------+-------------------------------+
//! |          nla afi              |          reserved             |
//! +-------------------------------+-------------------------------+
//! |                      nla (4 or 16 bytes)                      |
//! +---------------------------------------------------------------+
//! ```

use std::net::IpAddr;

use super::header::{PacketType, PgmHeader, HDR_OPT_NETWORK, HDR_OPT_PRESENT};
use super::options::PacketOptions;
use super::{get_nla, nla_len, put_nla, stamp_checksum, Gsi};

/// Parsed SPM body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpmInfo {
    /// Monotonic SPM sequence, independent of the data sequence space.
    pub spm_sqn: u32,
    /// Advertised transmit-window trail.
    pub trail: u32,
    /// Advertised transmit-window lead.
    pub lead: u32,
    /// Source NLA to unicast NAKs to.
    pub nla: IpAddr,
}

/// Assemble a complete SPM TPDU with the checksum stamped.
///
/// `opts` is a finished option chain from
/// [`OptionsBuilder::finish`](super::OptionsBuilder::finish), or `None`.
pub fn encode_spm(
    sport: u16,
    dport: u16,
    gsi: Gsi,
    spm: &SpmInfo,
    opts: Option<&[u8]>,
) -> Vec<u8> {
    let mut hdr = PgmHeader::new(PacketType::Spm, sport, dport, gsi);
    if opts.is_some() {
        hdr.options = HDR_OPT_PRESENT | HDR_OPT_NETWORK;
    }

    let mut buf = Vec::with_capacity(
        crate::config::PGM_HEADER_SIZE
            + 12
            + nla_len(&spm.nla)
            + opts.map_or(0, <[u8]>::len),
    );
    hdr.encode_into(&mut buf);
    buf.extend_from_slice(&spm.spm_sqn.to_be_bytes());
    buf.extend_from_slice(&spm.trail.to_be_bytes());
    buf.extend_from_slice(&spm.lead.to_be_bytes());
    put_nla(&mut buf, &spm.nla);
    if let Some(chain) = opts {
        buf.extend_from_slice(chain);
    }
    stamp_checksum(&mut buf);
    buf
}

/// Assemble an SPMR TPDU (header only).
pub fn encode_spmr(sport: u16, dport: u16, gsi: Gsi) -> Vec<u8> {
    let hdr = PgmHeader::new(PacketType::Spmr, sport, dport, gsi);
    let mut buf = Vec::with_capacity(crate::config::PGM_HEADER_SIZE);
    hdr.encode_into(&mut buf);
    stamp_checksum(&mut buf);
    buf
}

/// Parse an SPM body (`body` starts after the fixed header).
pub fn parse_spm(header: &PgmHeader, body: &[u8]) -> Option<(SpmInfo, PacketOptions)> {
    if body.len() < 16 {
        return None;
    }
    let spm_sqn = u32::from_be_bytes(body[0..4].try_into().ok()?);
    let trail = u32::from_be_bytes(body[4..8].try_into().ok()?);
    let lead = u32::from_be_bytes(body[8..12].try_into().ok()?);
    let (nla, nla_used) = get_nla(&body[12..])?;

    let rest = &body[12 + nla_used..];
    let options = if header.options & HDR_OPT_PRESENT != 0 {
        PacketOptions::parse(rest)?
    } else {
        PacketOptions::default()
    };

    Some((
        SpmInfo {
            spm_sqn,
            trail,
            lead,
            nla,
        },
        options,
    ))
}

#[cfg(test)]
mod tests {
    use super::super::header::PgmHeader;
    use super::super::options::OptionsBuilder;
    use super::*;
    use crate::config::PGM_HEADER_SIZE;
    use crate::protocol::csum_verify;

    fn gsi() -> Gsi {
        Gsi([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff])
    }

    #[test]
    fn test_spm_roundtrip() {
        let spm = SpmInfo {
            spm_sqn: 3301,
            trail: 90,
            lead: 103,
            nla: "192.168.1.10".parse().unwrap(),
        };
        let wire = encode_spm(7500, 7500, gsi(), &spm, None);
        assert!(csum_verify(&wire), "encoder output must self-verify");

        let hdr = PgmHeader::parse(&wire).expect("header parses");
        assert_eq!(hdr.packet_type, PacketType::Spm);
        let (parsed, opts) =
            parse_spm(&hdr, &wire[PGM_HEADER_SIZE..]).expect("SPM body parses");
        assert_eq!(parsed, spm);
        assert_eq!(opts.total_len, 0);
    }

    #[test]
    fn test_spm_with_syn_option() {
        let spm = SpmInfo {
            spm_sqn: 0,
            trail: 1,
            lead: 0,
            nla: "10.1.2.3".parse().unwrap(),
        };
        let mut b = OptionsBuilder::new();
        b.syn();
        let wire = encode_spm(7500, 7500, gsi(), &spm, Some(&b.finish()));

        let hdr = PgmHeader::parse(&wire).unwrap();
        assert_ne!(hdr.options & HDR_OPT_PRESENT, 0);
        let (_, opts) = parse_spm(&hdr, &wire[PGM_HEADER_SIZE..]).expect("SPM parses");
        assert!(opts.syn, "OPT_SYN must survive the roundtrip");
    }

    #[test]
    fn test_spm_ipv6_nla() {
        let spm = SpmInfo {
            spm_sqn: 7,
            trail: 5,
            lead: 9,
            nla: "fe80::1".parse().unwrap(),
        };
        let wire = encode_spm(1, 2, gsi(), &spm, None);
        let hdr = PgmHeader::parse(&wire).unwrap();
        let (parsed, _) = parse_spm(&hdr, &wire[PGM_HEADER_SIZE..]).expect("SPM parses");
        assert_eq!(parsed.nla, spm.nla);
    }

    #[test]
    fn test_spm_truncated_rejected() {
        let spm = SpmInfo {
            spm_sqn: 1,
            trail: 1,
            lead: 1,
            nla: "127.0.0.1".parse().unwrap(),
        };
        let wire = encode_spm(1, 2, gsi(), &spm, None);
        let hdr = PgmHeader::parse(&wire).unwrap();
        let body = &wire[PGM_HEADER_SIZE..];
        assert!(parse_spm(&hdr, &body[..body.len() - 2]).is_none());
    }

    #[test]
    fn test_spmr_is_bare_header() {
        let wire = encode_spmr(7500, 7500, gsi());
        assert_eq!(wire.len(), PGM_HEADER_SIZE);
        let hdr = PgmHeader::parse(&wire).unwrap();
        assert_eq!(hdr.packet_type, PacketType::Spmr);
        assert!(csum_verify(&wire));
    }
}
