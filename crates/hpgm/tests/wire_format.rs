// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire-format golden vectors and round-trip properties.
//!
//! Pins the bit-level layout promised by RFC 3208: the 16-byte fixed
//! header, the type codes, the SPM/DATA/NAK bodies, the TLV option
//! chain, and the Internet checksum.

use hpgm::config::PGM_HEADER_SIZE;
use hpgm::protocol::{
    csum_verify, encode_data, encode_nak, encode_spm, parse_data, parse_nak, parse_spm, DataInfo,
    Gsi, NakInfo, OptFragment, OptionsBuilder, PacketType, PgmHeader, SpmInfo,
};

fn gsi() -> Gsi {
    Gsi([0x01, 0x02, 0x03, 0x04, 0x05, 0x06])
}

// ---------------------------------------------------------------------------
// Fixed header
// ---------------------------------------------------------------------------

#[test]
fn test_header_is_sixteen_bytes_exactly() {
    let spm = SpmInfo {
        spm_sqn: 0,
        trail: 0,
        lead: 0,
        nla: "127.0.0.1".parse().unwrap(),
    };
    let wire = encode_spm(1, 2, gsi(), &spm, None);
    assert_eq!(PGM_HEADER_SIZE, 16);
    // 16 header + 12 SPM fields + 8 IPv4 NLA.
    assert_eq!(wire.len(), 16 + 12 + 8);
}

#[test]
fn test_header_field_offsets() {
    let info = DataInfo {
        data_sqn: 100,
        data_trail: 90,
    };
    let (wire, _) = encode_data(
        PacketType::Odata,
        0x1234,
        0x5678,
        gsi(),
        &info,
        0,
        None,
        b"hello",
    );

    assert_eq!(&wire[0..2], &[0x12, 0x34], "sport, network order");
    assert_eq!(&wire[2..4], &[0x56, 0x78], "dport, network order");
    assert_eq!(wire[4], 0x04, "ODATA type code");
    assert_eq!(wire[5], 0x00, "no header options");
    assert_ne!(&wire[6..8], &[0, 0], "checksum stamped");
    assert_eq!(&wire[8..14], &[1, 2, 3, 4, 5, 6], "GSI");
    assert_eq!(&wire[14..16], &[0x00, 0x05], "tsdu length");
    // DATA body.
    assert_eq!(&wire[16..20], &100u32.to_be_bytes(), "data sqn");
    assert_eq!(&wire[20..24], &90u32.to_be_bytes(), "data trail");
    assert_eq!(&wire[24..], b"hello");
}

#[test]
fn test_type_codes_match_rfc() {
    assert_eq!(PacketType::Spm as u8, 0x00);
    assert_eq!(PacketType::Poll as u8, 0x01);
    assert_eq!(PacketType::Polr as u8, 0x02);
    assert_eq!(PacketType::Odata as u8, 0x04);
    assert_eq!(PacketType::Rdata as u8, 0x05);
    assert_eq!(PacketType::Nak as u8, 0x08);
    assert_eq!(PacketType::Nnak as u8, 0x09);
    assert_eq!(PacketType::Ncf as u8, 0x0a);
    assert_eq!(PacketType::Spmr as u8, 0x40);
}

// ---------------------------------------------------------------------------
// Option chain layout
// ---------------------------------------------------------------------------

#[test]
fn test_opt_length_opens_the_chain() {
    let mut b = OptionsBuilder::new();
    b.fragment(&OptFragment {
        first_sqn: 200,
        frag_off: 1000,
        apdu_len: 3000,
    });
    let chain = b.finish();

    assert_eq!(chain[0], 0x00, "OPT_LENGTH type");
    assert_eq!(chain[1], 4, "OPT_LENGTH length");
    assert_eq!(
        u16::from_be_bytes([chain[2], chain[3]]) as usize,
        chain.len(),
        "total option-region length"
    );
    assert_eq!(chain[4], 0x01 | 0x80, "OPT_FRAGMENT with END flag");
    assert_eq!(chain[5], 15, "fragment option length");
    // reserved(1), then the three fields.
    assert_eq!(&chain[7..11], &200u32.to_be_bytes());
    assert_eq!(&chain[11..15], &1000u32.to_be_bytes());
    assert_eq!(&chain[15..19], &3000u32.to_be_bytes());
}

#[test]
fn test_nak_list_layout() {
    let nak = NakInfo {
        sqn: 101,
        src_nla: "192.168.1.10".parse().unwrap(),
        grp_nla: "239.192.0.1".parse().unwrap(),
    };
    let wire = encode_nak(PacketType::Nak, 7500, 7500, gsi(), &nak, &[102]);

    // Body: sqn(4) + src nla(8) + grp nla(8).
    let body = &wire[PGM_HEADER_SIZE..];
    assert_eq!(&body[0..4], &101u32.to_be_bytes());
    assert_eq!(&body[4..6], &1u16.to_be_bytes(), "IPv4 AFI");
    assert_eq!(&body[8..12], &[192, 168, 1, 10]);
    assert_eq!(&body[12..14], &1u16.to_be_bytes());
    assert_eq!(&body[16..20], &[239, 192, 0, 1]);
    // Option region: OPT_LENGTH then OPT_NAK_LIST|END.
    let opts = &body[20..];
    assert_eq!(opts[0], 0x00);
    assert_eq!(opts[4], 0x02 | 0x80);
    assert_eq!(&opts[7..11], &102u32.to_be_bytes());
}

// ---------------------------------------------------------------------------
// Checksum and round trips
// ---------------------------------------------------------------------------

#[test]
fn test_every_encoder_output_verifies() {
    let spm = SpmInfo {
        spm_sqn: 9,
        trail: 1,
        lead: 7,
        nla: "10.0.0.1".parse().unwrap(),
    };
    assert!(csum_verify(&encode_spm(1, 2, gsi(), &spm, None)));

    let nak = NakInfo {
        sqn: 5,
        src_nla: "10.0.0.1".parse().unwrap(),
        grp_nla: "239.0.0.1".parse().unwrap(),
    };
    assert!(csum_verify(&encode_nak(
        PacketType::Ncf,
        1,
        2,
        gsi(),
        &nak,
        &[6, 7]
    )));

    let (data, _) = encode_data(
        PacketType::Rdata,
        1,
        2,
        gsi(),
        &DataInfo {
            data_sqn: 3,
            data_trail: 1,
        },
        0,
        None,
        &[0xffu8; 33],
    );
    assert!(csum_verify(&data));
}

#[test]
fn test_corruption_fails_verification() {
    let (mut wire, _) = encode_data(
        PacketType::Odata,
        1,
        2,
        gsi(),
        &DataInfo {
            data_sqn: 3,
            data_trail: 1,
        },
        0,
        None,
        b"payload bytes",
    );
    for byte in [0usize, 7, 16, wire.len() - 1] {
        wire[byte] ^= 0x01;
        assert!(!csum_verify(&wire), "flip at {} must break checksum", byte);
        wire[byte] ^= 0x01;
    }
    assert!(csum_verify(&wire));
}

#[test]
fn test_data_roundtrip_randomized() {
    fastrand::seed(0x9e3779b97f4a7c15);
    for _ in 0..200 {
        let len = fastrand::usize(0..1400);
        let payload: Vec<u8> = (0..len).map(|_| fastrand::u8(..)).collect();
        let info = DataInfo {
            data_sqn: fastrand::u32(..),
            data_trail: fastrand::u32(..),
        };
        let fragmented = fastrand::bool();
        let chain = fragmented.then(|| {
            let mut b = OptionsBuilder::new();
            b.fragment(&OptFragment {
                first_sqn: info.data_sqn,
                frag_off: fastrand::u32(..),
                apdu_len: fastrand::u32(1..),
            });
            b.finish()
        });

        let (wire, _) = encode_data(
            PacketType::Odata,
            fastrand::u16(..),
            fastrand::u16(..),
            gsi(),
            &info,
            0,
            chain.as_deref(),
            &payload,
        );
        assert!(csum_verify(&wire));

        let header = PgmHeader::parse(&wire).expect("header parses");
        let parsed = parse_data(&header, &wire[PGM_HEADER_SIZE..]).expect("body parses");
        assert_eq!(parsed.info, info);
        assert_eq!(&wire[PGM_HEADER_SIZE + parsed.payload_offset..], &payload[..]);
        assert_eq!(parsed.options.fragment.is_some(), fragmented);
    }
}

#[test]
fn test_spm_roundtrip_randomized() {
    fastrand::seed(42);
    for _ in 0..100 {
        let spm = SpmInfo {
            spm_sqn: fastrand::u32(..),
            trail: fastrand::u32(..),
            lead: fastrand::u32(..),
            nla: if fastrand::bool() {
                std::net::IpAddr::V4(fastrand::u32(..).to_be_bytes().into())
            } else {
                std::net::IpAddr::V6(u128::from(fastrand::u64(..)).into())
            },
        };
        let wire = encode_spm(fastrand::u16(..), fastrand::u16(..), gsi(), &spm, None);
        let header = PgmHeader::parse(&wire).unwrap();
        let (parsed, _) = parse_spm(&header, &wire[PGM_HEADER_SIZE..]).expect("SPM parses");
        assert_eq!(parsed, spm);
    }
}

#[test]
fn test_nak_roundtrip_randomized() {
    fastrand::seed(7);
    for _ in 0..100 {
        let count = fastrand::usize(0..=62);
        let list: Vec<u32> = (0..count).map(|_| fastrand::u32(..)).collect();
        let nak = NakInfo {
            sqn: fastrand::u32(..),
            src_nla: std::net::IpAddr::V4(fastrand::u32(..).to_be_bytes().into()),
            grp_nla: std::net::IpAddr::V4(fastrand::u32(..).to_be_bytes().into()),
        };
        let wire = encode_nak(PacketType::Nak, 1, 2, gsi(), &nak, &list);
        let header = PgmHeader::parse(&wire).unwrap();
        let (parsed, opts) = parse_nak(&header, &wire[PGM_HEADER_SIZE..]).expect("NAK parses");
        assert_eq!(parsed, nak);
        assert_eq!(opts.nak_list, list);
    }
}
