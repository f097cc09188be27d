// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! ODATA/RDATA encoders and decoders.
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           data sqn                            |
//! +---------------------------------------------------------------+
//! |                           txw trail                           |
//! +---------------------------------------------------------------+
//! |            options (iff OPT_PRESENT) ... | TSDU ...           |
//! +---------------------------------------------------------------+
//! ```
//!
//! `tsdu_length` in the fixed header counts TSDU bytes only; framing must
//! agree exactly or the packet is malformed.
//!
//! Encoding returns the unfolded payload checksum alongside the TPDU so
//! the transmit window can retain it: retransmission re-sums only the
//! mutated headers and folds the cached payload sum back in
//! ([`reencode_rdata`]).

use super::checksum::{csum_block_add, csum_fold, csum_partial};
use super::header::{PacketType, PgmHeader, HDR_OPT_NETWORK, HDR_OPT_PRESENT};
use super::options::PacketOptions;
use super::Gsi;
use crate::config::{PGM_DATA_HEADER_SIZE, PGM_HEADER_SIZE};

/// DATA type-specific header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataInfo {
    pub data_sqn: u32,
    /// Advertised transmit-window trail at emission time.
    pub data_trail: u32,
}

/// Decoded DATA packet: header fields, options, payload location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedData {
    pub info: DataInfo,
    pub options: PacketOptions,
    /// Offset of the TSDU within the body slice passed to [`parse_data`].
    pub payload_offset: usize,
}

/// Assemble a complete ODATA or RDATA TPDU.
///
/// `hdr_flags` carries HDR_OPT_PARITY / HDR_OPT_VAR_PKTLEN when the
/// packet belongs to a FEC transmission group. Returns the stamped TPDU
/// and the unfolded checksum of `payload` for retransmit caching.
pub fn encode_data(
    packet_type: PacketType,
    sport: u16,
    dport: u16,
    gsi: Gsi,
    info: &DataInfo,
    hdr_flags: u8,
    opts: Option<&[u8]>,
    payload: &[u8],
) -> (Vec<u8>, u32) {
    debug_assert!(matches!(packet_type, PacketType::Odata | PacketType::Rdata));

    let mut hdr = PgmHeader::new(packet_type, sport, dport, gsi);
    hdr.options = hdr_flags;
    if opts.is_some() {
        hdr.options |= HDR_OPT_PRESENT | HDR_OPT_NETWORK;
    }
    hdr.tsdu_length = payload.len() as u16;

    let opts_len = opts.map_or(0, <[u8]>::len);
    let mut buf =
        Vec::with_capacity(PGM_HEADER_SIZE + PGM_DATA_HEADER_SIZE + opts_len + payload.len());
    hdr.encode_into(&mut buf);
    buf.extend_from_slice(&info.data_sqn.to_be_bytes());
    buf.extend_from_slice(&info.data_trail.to_be_bytes());
    if let Some(chain) = opts {
        buf.extend_from_slice(chain);
    }

    // Checksum split: one pass over the headers, one over the payload.
    // The payload sum is what the transmit window keeps.
    let header_sum = csum_partial(&buf, 0);
    let payload_sum = csum_partial(payload, 0);
    buf.extend_from_slice(payload);
    let folded = csum_fold(csum_block_add(header_sum, payload_sum));
    buf[6..8].copy_from_slice(&folded.to_be_bytes());

    (buf, payload_sum)
}

/// Rebuild an RDATA TPDU from a retained ODATA buffer.
///
/// Flips the type byte, refreshes the advertised trail, and restamps the
/// checksum from the cached unfolded payload sum without touching payload
/// bytes.
pub fn reencode_rdata(
    original: &[u8],
    payload_offset: usize,
    new_trail: u32,
    payload_sum: u32,
) -> Vec<u8> {
    debug_assert!(payload_offset >= PGM_HEADER_SIZE + PGM_DATA_HEADER_SIZE);
    debug_assert!(payload_offset % 2 == 0, "payload must stay 16-bit aligned");

    let mut buf = original.to_vec();
    buf[4] = PacketType::Rdata as u8;
    buf[6] = 0;
    buf[7] = 0;
    buf[20..24].copy_from_slice(&new_trail.to_be_bytes());

    let header_sum = csum_partial(&buf[..payload_offset], 0);
    let folded = csum_fold(csum_block_add(header_sum, payload_sum));
    buf[6..8].copy_from_slice(&folded.to_be_bytes());
    buf
}

/// Parse a DATA body (`body` starts after the fixed header).
///
/// Returns `None` when framing disagrees with `tsdu_length` or the
/// option chain is invalid.
pub fn parse_data(header: &PgmHeader, body: &[u8]) -> Option<ParsedData> {
    if body.len() < PGM_DATA_HEADER_SIZE {
        return None;
    }
    let info = DataInfo {
        data_sqn: u32::from_be_bytes(body[0..4].try_into().ok()?),
        data_trail: u32::from_be_bytes(body[4..8].try_into().ok()?),
    };

    let options = if header.options & HDR_OPT_PRESENT != 0 {
        PacketOptions::parse(&body[PGM_DATA_HEADER_SIZE..])?
    } else {
        PacketOptions::default()
    };
    let payload_offset = PGM_DATA_HEADER_SIZE + options.total_len;

    // tsdu_length must agree with framing exactly.
    if body.len() - payload_offset != header.tsdu_length as usize {
        return None;
    }

    Some(ParsedData {
        info,
        options,
        payload_offset,
    })
}

#[cfg(test)]
mod tests {
    use super::super::checksum::csum_verify;
    use super::super::header::HDR_OPT_PARITY;
    use super::super::options::{OptFragment, OptionsBuilder};
    use super::*;

    fn gsi() -> Gsi {
        Gsi([1, 2, 3, 4, 5, 6])
    }

    #[test]
    fn test_data_roundtrip() {
        let info = DataInfo {
            data_sqn: 100,
            data_trail: 90,
        };
        let (wire, _) = encode_data(
            PacketType::Odata,
            7500,
            7500,
            gsi(),
            &info,
            0,
            None,
            b"hello",
        );
        assert!(csum_verify(&wire));

        let hdr = PgmHeader::parse(&wire).expect("header parses");
        assert_eq!(hdr.tsdu_length, 5);
        let parsed = parse_data(&hdr, &wire[PGM_HEADER_SIZE..]).expect("body parses");
        assert_eq!(parsed.info, info);
        let payload = &wire[PGM_HEADER_SIZE + parsed.payload_offset..];
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn test_data_with_fragment_option() {
        let mut b = OptionsBuilder::new();
        b.fragment(&OptFragment {
            first_sqn: 200,
            frag_off: 1000,
            apdu_len: 3000,
        });
        let (wire, _) = encode_data(
            PacketType::Odata,
            1,
            2,
            gsi(),
            &DataInfo {
                data_sqn: 201,
                data_trail: 150,
            },
            0,
            Some(&b.finish()),
            &[0u8; 1000],
        );
        let hdr = PgmHeader::parse(&wire).unwrap();
        let parsed = parse_data(&hdr, &wire[PGM_HEADER_SIZE..]).expect("body parses");
        let frag = parsed.options.fragment.expect("fragment present");
        assert_eq!(frag.first_sqn, 200);
        assert_eq!(frag.frag_off, 1000);
        assert_eq!(frag.apdu_len, 3000);
    }

    #[test]
    fn test_data_tsdu_length_mismatch_rejected() {
        let (mut wire, _) = encode_data(
            PacketType::Odata,
            1,
            2,
            gsi(),
            &DataInfo {
                data_sqn: 1,
                data_trail: 1,
            },
            0,
            None,
            b"abcdef",
        );
        // Lie about the TSDU length.
        wire[14..16].copy_from_slice(&3u16.to_be_bytes());
        let hdr = PgmHeader::parse(&wire).unwrap();
        assert!(parse_data(&hdr, &wire[PGM_HEADER_SIZE..]).is_none());
    }

    #[test]
    fn test_rdata_reencode_preserves_payload_checksum() {
        let info = DataInfo {
            data_sqn: 97,
            data_trail: 95,
        };
        let payload = b"retained original payload";
        let (odata, payload_sum) =
            encode_data(PacketType::Odata, 9, 9, gsi(), &info, 0, None, payload);

        let payload_offset = PGM_HEADER_SIZE + PGM_DATA_HEADER_SIZE;
        let rdata = reencode_rdata(&odata, payload_offset, 96, payload_sum);

        assert!(csum_verify(&rdata), "re-folded checksum must verify");
        let hdr = PgmHeader::parse(&rdata).unwrap();
        assert_eq!(hdr.packet_type, PacketType::Rdata);
        let parsed = parse_data(&hdr, &rdata[PGM_HEADER_SIZE..]).expect("body parses");
        assert_eq!(parsed.info.data_sqn, 97);
        assert_eq!(parsed.info.data_trail, 96, "trail must be refreshed");
        assert_eq!(&rdata[payload_offset..], payload);
    }

    #[test]
    fn test_parity_flag_carried() {
        let (wire, _) = encode_data(
            PacketType::Odata,
            1,
            2,
            gsi(),
            &DataInfo {
                data_sqn: 304,
                data_trail: 300,
            },
            HDR_OPT_PARITY,
            None,
            &[0u8; 64],
        );
        let hdr = PgmHeader::parse(&wire).unwrap();
        assert_ne!(hdr.options & HDR_OPT_PARITY, 0);
    }

    #[test]
    fn test_data_short_body_rejected() {
        let hdr = PgmHeader::new(PacketType::Odata, 1, 2, gsi());
        assert!(parse_data(&hdr, &[0u8; 4]).is_none());
    }
}
