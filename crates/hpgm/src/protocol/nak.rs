// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! NAK / N-NAK / NCF encoders and decoders.
//!
//! All three share one body: the primary missing sequence plus the
//! source and group NLAs, with additional sequences batched through
//! OPT_NAK_LIST (63 sequences per packet at most, primary included).
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           nak sqn                             |
//! +-------------------------------+-------------------------------+
//! |       source nla afi          |          reserved             |
//! +-------------------------------+-------------------------------+
//! |                      source nla ...                           |
//! +-------------------------------+-------------------------------+
//! |       group nla afi           |          reserved             |
//! +-------------------------------+-------------------------------+
//! |                      group nla ...                            |
//! +---------------------------------------------------------------+
//! ```
//!
//! Receivers unicast NAKs to the source's advertised NLA; the source
//! multicasts NCFs with the identical body so other receivers suppress
//! duplicate requests.

use std::net::IpAddr;

use super::header::{PacketType, PgmHeader, HDR_OPT_NETWORK, HDR_OPT_PRESENT};
use super::options::{OptionsBuilder, PacketOptions};
use super::{get_nla, nla_len, put_nla, stamp_checksum, Gsi};
use crate::config::PGM_HEADER_SIZE;

/// Parsed NAK/N-NAK/NCF body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NakInfo {
    /// Primary missing sequence.
    pub sqn: u32,
    /// Source path NLA (must match the receiver's view of the source).
    pub src_nla: IpAddr,
    /// Multicast group NLA (must match the subscribed group).
    pub grp_nla: IpAddr,
}

/// Assemble a NAK, N-NAK, or NCF TPDU.
///
/// `list` carries the batched sequences beyond the primary; empty slices
/// omit OPT_NAK_LIST entirely.
pub fn encode_nak(
    packet_type: PacketType,
    sport: u16,
    dport: u16,
    gsi: Gsi,
    nak: &NakInfo,
    list: &[u32],
) -> Vec<u8> {
    debug_assert!(matches!(
        packet_type,
        PacketType::Nak | PacketType::Nnak | PacketType::Ncf
    ));

    let mut hdr = PgmHeader::new(packet_type, sport, dport, gsi);
    let chain = if list.is_empty() {
        None
    } else {
        let mut b = OptionsBuilder::new();
        b.nak_list(list);
        Some(b.finish())
    };
    if chain.is_some() {
        hdr.options = HDR_OPT_PRESENT | HDR_OPT_NETWORK;
    }

    let mut buf = Vec::with_capacity(
        PGM_HEADER_SIZE
            + 4
            + nla_len(&nak.src_nla)
            + nla_len(&nak.grp_nla)
            + chain.as_ref().map_or(0, Vec::len),
    );
    hdr.encode_into(&mut buf);
    buf.extend_from_slice(&nak.sqn.to_be_bytes());
    put_nla(&mut buf, &nak.src_nla);
    put_nla(&mut buf, &nak.grp_nla);
    if let Some(chain) = chain {
        buf.extend_from_slice(&chain);
    }
    stamp_checksum(&mut buf);
    buf
}

/// Parse a NAK/N-NAK/NCF body (`body` starts after the fixed header).
pub fn parse_nak(header: &PgmHeader, body: &[u8]) -> Option<(NakInfo, PacketOptions)> {
    if body.len() < 4 {
        return None;
    }
    let sqn = u32::from_be_bytes(body[0..4].try_into().ok()?);
    let (src_nla, src_used) = get_nla(&body[4..])?;
    let (grp_nla, grp_used) = get_nla(&body[4 + src_used..])?;

    let rest = &body[4 + src_used + grp_used..];
    let options = if header.options & HDR_OPT_PRESENT != 0 {
        PacketOptions::parse(rest)?
    } else {
        PacketOptions::default()
    };

    Some((
        NakInfo {
            sqn,
            src_nla,
            grp_nla,
        },
        options,
    ))
}
