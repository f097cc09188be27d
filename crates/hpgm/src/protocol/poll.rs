// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! POLL / POLR codec.
//!
//! POLL is multicast by a parent (or DLR) to bound the population of
//! responders; POLR is the unicast response. The engine only counts
//! these today, but the codec is complete so a session stays parseable
//! in mixed deployments.

use std::net::IpAddr;

use super::header::{PacketType, PgmHeader};
use super::{get_nla, nla_len, put_nla, stamp_checksum, Gsi};
use crate::config::PGM_HEADER_SIZE;

/// Parsed POLL body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollInfo {
    pub sqn: u32,
    pub round: u16,
    /// Subtype: 0 = general, 1 = DLR.
    pub poll_type: u16,
    pub nla: IpAddr,
    /// Response back-off interval in microseconds.
    pub bo_ivl: u32,
    /// Random string receivers hash against the mask.
    pub rand: [u8; 4],
    pub mask: u32,
}

/// Parsed POLR body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolrInfo {
    pub sqn: u32,
    pub round: u16,
}

pub fn encode_poll(sport: u16, dport: u16, gsi: Gsi, poll: &PollInfo) -> Vec<u8> {
    let hdr = PgmHeader::new(PacketType::Poll, sport, dport, gsi);
    let mut buf = Vec::with_capacity(PGM_HEADER_SIZE + 8 + nla_len(&poll.nla) + 12);
    hdr.encode_into(&mut buf);
    buf.extend_from_slice(&poll.sqn.to_be_bytes());
    buf.extend_from_slice(&poll.round.to_be_bytes());
    buf.extend_from_slice(&poll.poll_type.to_be_bytes());
    put_nla(&mut buf, &poll.nla);
    buf.extend_from_slice(&poll.bo_ivl.to_be_bytes());
    buf.extend_from_slice(&poll.rand);
    buf.extend_from_slice(&poll.mask.to_be_bytes());
    stamp_checksum(&mut buf);
    buf
}

pub fn encode_polr(sport: u16, dport: u16, gsi: Gsi, polr: &PolrInfo) -> Vec<u8> {
    let hdr = PgmHeader::new(PacketType::Polr, sport, dport, gsi);
    let mut buf = Vec::with_capacity(PGM_HEADER_SIZE + 8);
    hdr.encode_into(&mut buf);
    buf.extend_from_slice(&polr.sqn.to_be_bytes());
    buf.extend_from_slice(&polr.round.to_be_bytes());
    buf.extend_from_slice(&[0, 0]);
    stamp_checksum(&mut buf);
    buf
}

pub fn parse_poll(body: &[u8]) -> Option<PollInfo> {
    if body.len() < 8 {
        return None;
    }
    let sqn = u32::from_be_bytes(body[0..4].try_into().ok()?);
    let round = u16::from_be_bytes([body[4], body[5]]);
    let poll_type = u16::from_be_bytes([body[6], body[7]]);
    let (nla, used) = get_nla(&body[8..])?;
    let tail = &body[8 + used..];
    if tail.len() < 12 {
        return None;
    }
    Some(PollInfo {
        sqn,
        round,
        poll_type,
        nla,
        bo_ivl: u32::from_be_bytes(tail[0..4].try_into().ok()?),
        rand: tail[4..8].try_into().ok()?,
        mask: u32::from_be_bytes(tail[8..12].try_into().ok()?),
    })
}

pub fn parse_polr(body: &[u8]) -> Option<PolrInfo> {
    if body.len() < 8 {
        return None;
    }
    Some(PolrInfo {
        sqn: u32::from_be_bytes(body[0..4].try_into().ok()?),
        round: u16::from_be_bytes([body[4], body[5]]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::csum_verify;

    fn gsi() -> Gsi {
        Gsi([1, 1, 2, 3, 5, 8])
    }

    #[test]
    fn test_poll_roundtrip() {
        let poll = PollInfo {
            sqn: 42,
            round: 2,
            poll_type: 0,
            nla: "10.0.0.5".parse().unwrap(),
            bo_ivl: 100_000,
            rand: [0xde, 0xad, 0xbe, 0xef],
            mask: 0x0000_00ff,
        };
        let wire = encode_poll(7500, 7500, gsi(), &poll);
        assert!(csum_verify(&wire));
        let parsed = parse_poll(&wire[PGM_HEADER_SIZE..]).expect("POLL parses");
        assert_eq!(parsed, poll);
    }

    #[test]
    fn test_polr_roundtrip() {
        let polr = PolrInfo { sqn: 42, round: 3 };
        let wire = encode_polr(7500, 7500, gsi(), &polr);
        assert!(csum_verify(&wire));
        let parsed = parse_polr(&wire[PGM_HEADER_SIZE..]).expect("POLR parses");
        assert_eq!(parsed, polr);
    }

    #[test]
    fn test_poll_truncated_rejected() {
        let poll = PollInfo {
            sqn: 1,
            round: 1,
            poll_type: 1,
            nla: "10.0.0.5".parse().unwrap(),
            bo_ivl: 1,
            rand: [0; 4],
            mask: 0,
        };
        let wire = encode_poll(1, 2, gsi(), &poll);
        assert!(parse_poll(&wire[PGM_HEADER_SIZE..wire.len() - 4]).is_none());
    }
}
