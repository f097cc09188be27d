// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TLV option chain shared by every PGM packet type.
//!
//! An option region is opened by OPT_LENGTH (type 0, length 4, carrying
//! the total region length) and closed by the entry whose type byte has
//! the END bit (0x80) set. Each entry is `type(1) length(1) body`.
//!
//! Parsing is an iterator over a borrowed slice yielding
//! `(option_type, body)` pairs; [`PacketOptions::parse`] aggregates the
//! recognized options and enforces the chain invariants:
//! - the region must start with OPT_LENGTH and its advertised total must
//!   fit the buffer,
//! - at most [`PGM_MAX_OPTIONS`](crate::config::PGM_MAX_OPTIONS) entries,
//! - the END entry must land exactly on the advertised total.

use crate::config::{PGM_MAX_OPTIONS, PGM_NAK_LIST_MAX};

// =======================================================================
// Option type codes
// =======================================================================

/// Mandatory leading entry carrying the total option-region length.
pub const OPT_LENGTH: u8 = 0x00;
/// Fragmentation header: (first_sqn, frag_off, apdu_len).
pub const OPT_FRAGMENT: u8 = 0x01;
/// Additional NAK sequences beyond the primary.
pub const OPT_NAK_LIST: u8 = 0x02;
/// FEC parameters advertised in SPMs.
pub const OPT_PARITY_PRM: u8 = 0x08;
/// Transmission-group number on parity packets.
pub const OPT_PARITY_GRP: u8 = 0x09;
/// Actual transmission-group size when a group is cut short.
pub const OPT_CURR_TGSIZE: u8 = 0x0a;
/// Session startup marker on the first SPMs.
pub const OPT_SYN: u8 = 0x0d;
/// Graceful shutdown marker.
pub const OPT_FIN: u8 = 0x0e;
/// Source reset marker.
pub const OPT_RST: u8 = 0x0f;
/// END-of-list flag on the final entry's type byte.
pub const OPT_END: u8 = 0x80;
/// Mask selecting the option type under the END flag.
pub const OPT_MASK: u8 = 0x7f;

/// OPT_PARITY_PRM flag: on-demand parity enabled.
pub const PARITY_PRM_OND: u8 = 0x01;
/// OPT_PARITY_PRM flag: proactive parity enabled.
pub const PARITY_PRM_PRO: u8 = 0x02;

const OPT_LENGTH_SIZE: usize = 4;

// =======================================================================
// Parsed forms
// =======================================================================

/// OPT_FRAGMENT payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptFragment {
    /// Sequence number of the APDU's first fragment.
    pub first_sqn: u32,
    /// Byte offset of this fragment within the APDU.
    pub frag_off: u32,
    /// Total APDU length in bytes.
    pub apdu_len: u32,
}

/// OPT_PARITY_PRM payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptParityPrm {
    /// PARITY_PRM_OND / PARITY_PRM_PRO flags.
    pub flags: u8,
    /// Transmission group size `k`.
    pub tgs: u32,
}

/// Every recognized option in one chain, aggregated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketOptions {
    /// Total byte length of the option region, OPT_LENGTH included.
    pub total_len: usize,
    pub fragment: Option<OptFragment>,
    pub nak_list: Vec<u32>,
    pub parity_prm: Option<OptParityPrm>,
    pub parity_grp: Option<u32>,
    pub curr_tgsize: Option<u32>,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
}

impl PacketOptions {
    /// Parse an option region starting at the front of `buf`.
    ///
    /// `buf` may extend past the region (the DATA payload follows the
    /// options); only `total_len` bytes are consumed. Returns `None` for
    /// any invariant violation - the caller counts the packet malformed.
    pub fn parse(buf: &[u8]) -> Option<PacketOptions> {
        let mut out = PacketOptions::default();

        // Mandatory leading OPT_LENGTH.
        if buf.len() < OPT_LENGTH_SIZE || buf[0] & OPT_MASK != OPT_LENGTH {
            return None;
        }
        if buf[1] as usize != OPT_LENGTH_SIZE {
            return None;
        }
        let total_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if total_len < OPT_LENGTH_SIZE || total_len > buf.len() {
            return None;
        }
        out.total_len = total_len;
        // OPT_LENGTH may itself carry the END flag (an empty chain).
        if buf[0] & OPT_END != 0 {
            return if total_len == OPT_LENGTH_SIZE {
                Some(out)
            } else {
                None
            };
        }

        let region = &buf[..total_len];
        let mut offset = OPT_LENGTH_SIZE;
        let mut entries = 1usize;
        loop {
            if offset + 2 > region.len() {
                return None;
            }
            entries += 1;
            if entries > PGM_MAX_OPTIONS {
                return None;
            }
            let opt_type = region[offset];
            let opt_len = region[offset + 1] as usize;
            if opt_len < 2 || offset + opt_len > region.len() {
                return None;
            }
            let body = &region[offset + 2..offset + opt_len];
            out.apply(opt_type & OPT_MASK, body)?;
            offset += opt_len;
            if opt_type & OPT_END != 0 {
                break;
            }
        }
        // The END entry must close the region exactly.
        if offset != total_len {
            return None;
        }
        Some(out)
    }

    fn apply(&mut self, opt_type: u8, body: &[u8]) -> Option<()> {
        match opt_type {
            OPT_LENGTH => return None, // only valid as the first entry
            OPT_FRAGMENT => {
                if body.len() != 13 {
                    return None;
                }
                self.fragment = Some(OptFragment {
                    first_sqn: u32::from_be_bytes(body[1..5].try_into().ok()?),
                    frag_off: u32::from_be_bytes(body[5..9].try_into().ok()?),
                    apdu_len: u32::from_be_bytes(body[9..13].try_into().ok()?),
                });
            }
            OPT_NAK_LIST => {
                if body.is_empty() || (body.len() - 1) % 4 != 0 {
                    return None;
                }
                let count = (body.len() - 1) / 4;
                if count > PGM_NAK_LIST_MAX {
                    return None;
                }
                self.nak_list = body[1..]
                    .chunks_exact(4)
                    .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
            }
            OPT_PARITY_PRM => {
                if body.len() != 5 {
                    return None;
                }
                self.parity_prm = Some(OptParityPrm {
                    flags: body[0],
                    tgs: u32::from_be_bytes(body[1..5].try_into().ok()?),
                });
            }
            OPT_PARITY_GRP => {
                if body.len() != 5 {
                    return None;
                }
                self.parity_grp = Some(u32::from_be_bytes(body[1..5].try_into().ok()?));
            }
            OPT_CURR_TGSIZE => {
                if body.len() != 5 {
                    return None;
                }
                self.curr_tgsize = Some(u32::from_be_bytes(body[1..5].try_into().ok()?));
            }
            OPT_SYN => self.syn = true,
            OPT_FIN => self.fin = true,
            OPT_RST => self.rst = true,
            _ => {
                // Unrecognized options are skipped, not fatal.
                log::debug!("[Options] skipping unknown option type {:#04x}", opt_type);
            }
        }
        Some(())
    }
}

// =======================================================================
// Builder
// =======================================================================

/// Serializes an option chain, patching OPT_LENGTH and the END flag on
/// [`OptionsBuilder::finish`].
#[derive(Debug)]
pub struct OptionsBuilder {
    buf: Vec<u8>,
    /// Offset of the type byte of the most recently appended entry.
    last_type_at: usize,
    entries: usize,
}

impl OptionsBuilder {
    pub fn new() -> Self {
        // OPT_LENGTH placeholder; total patched in finish().
        Self {
            buf: vec![OPT_LENGTH, OPT_LENGTH_SIZE as u8, 0, 0],
            last_type_at: 0,
            entries: 1,
        }
    }

    fn push_option(&mut self, opt_type: u8, body: &[u8]) -> &mut Self {
        self.last_type_at = self.buf.len();
        self.buf.push(opt_type);
        self.buf.push((2 + body.len()) as u8);
        self.buf.extend_from_slice(body);
        self.entries += 1;
        self
    }

    pub fn fragment(&mut self, frag: &OptFragment) -> &mut Self {
        let mut body = [0u8; 13];
        body[1..5].copy_from_slice(&frag.first_sqn.to_be_bytes());
        body[5..9].copy_from_slice(&frag.frag_off.to_be_bytes());
        body[9..13].copy_from_slice(&frag.apdu_len.to_be_bytes());
        self.push_option(OPT_FRAGMENT, &body)
    }

    /// Append OPT_NAK_LIST; `sqns` excludes the primary NAK sequence.
    pub fn nak_list(&mut self, sqns: &[u32]) -> &mut Self {
        debug_assert!(sqns.len() <= PGM_NAK_LIST_MAX);
        let mut body = Vec::with_capacity(1 + 4 * sqns.len());
        body.push(0);
        for sqn in sqns {
            body.extend_from_slice(&sqn.to_be_bytes());
        }
        self.push_option(OPT_NAK_LIST, &body)
    }

    pub fn parity_prm(&mut self, prm: &OptParityPrm) -> &mut Self {
        let mut body = [0u8; 5];
        body[0] = prm.flags;
        body[1..5].copy_from_slice(&prm.tgs.to_be_bytes());
        self.push_option(OPT_PARITY_PRM, &body)
    }

    pub fn parity_grp(&mut self, group: u32) -> &mut Self {
        let mut body = [0u8; 5];
        body[1..5].copy_from_slice(&group.to_be_bytes());
        self.push_option(OPT_PARITY_GRP, &body)
    }

    pub fn curr_tgsize(&mut self, size: u32) -> &mut Self {
        let mut body = [0u8; 5];
        body[1..5].copy_from_slice(&size.to_be_bytes());
        self.push_option(OPT_CURR_TGSIZE, &body)
    }

    pub fn syn(&mut self) -> &mut Self {
        self.push_option(OPT_SYN, &[0])
    }

    pub fn fin(&mut self) -> &mut Self {
        self.push_option(OPT_FIN, &[0])
    }

    pub fn rst(&mut self) -> &mut Self {
        self.push_option(OPT_RST, &[0])
    }

    /// Total region length the finished chain will occupy.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 1
    }

    /// Stamp the END flag and total length, returning the wire bytes.
    pub fn finish(mut self) -> Vec<u8> {
        self.buf[self.last_type_at] |= OPT_END;
        let total = self.buf.len() as u16;
        self.buf[2..4].copy_from_slice(&total.to_be_bytes());
        self.buf
    }
}

impl Default for OptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_fragment_roundtrip() {
        let frag = OptFragment {
            first_sqn: 200,
            frag_off: 1000,
            apdu_len: 3000,
        };
        let mut b = OptionsBuilder::new();
        b.fragment(&frag);
        let wire = b.finish();

        let parsed = PacketOptions::parse(&wire).expect("chain must parse");
        assert_eq!(parsed.total_len, wire.len());
        assert_eq!(parsed.fragment, Some(frag));
        assert!(parsed.nak_list.is_empty());
    }

    #[test]
    fn test_options_nak_list_roundtrip() {
        let sqns = [102u32, 103, 107];
        let mut b = OptionsBuilder::new();
        b.nak_list(&sqns);
        let wire = b.finish();

        let parsed = PacketOptions::parse(&wire).expect("chain must parse");
        assert_eq!(parsed.nak_list, sqns);
    }

    #[test]
    fn test_options_multi_entry_chain() {
        let mut b = OptionsBuilder::new();
        b.parity_prm(&OptParityPrm {
            flags: PARITY_PRM_PRO | PARITY_PRM_OND,
            tgs: 8,
        });
        b.syn();
        let wire = b.finish();

        let parsed = PacketOptions::parse(&wire).expect("chain must parse");
        assert_eq!(
            parsed.parity_prm,
            Some(OptParityPrm {
                flags: PARITY_PRM_PRO | PARITY_PRM_OND,
                tgs: 8
            })
        );
        assert!(parsed.syn);
        assert!(!parsed.fin);
    }

    #[test]
    fn test_options_trailing_payload_ignored() {
        let mut b = OptionsBuilder::new();
        b.fin();
        let mut wire = b.finish();
        let region = wire.len();
        wire.extend_from_slice(b"payload follows the option region");

        let parsed = PacketOptions::parse(&wire).expect("chain must parse");
        assert_eq!(parsed.total_len, region);
        assert!(parsed.fin);
    }

    #[test]
    fn test_options_missing_opt_length_rejected() {
        // A chain that opens with OPT_SYN instead of OPT_LENGTH.
        let wire = [OPT_SYN | OPT_END, 3, 0];
        assert!(PacketOptions::parse(&wire).is_none());
    }

    #[test]
    fn test_options_total_exceeds_buffer_rejected() {
        let mut b = OptionsBuilder::new();
        b.syn();
        let wire = b.finish();
        assert!(
            PacketOptions::parse(&wire[..wire.len() - 1]).is_none(),
            "truncated region must fail"
        );
    }

    #[test]
    fn test_options_unterminated_chain_rejected() {
        let mut b = OptionsBuilder::new();
        b.syn();
        let mut wire = b.finish();
        // Clear the END bit: the walk now runs off the advertised total.
        let idx = wire.len() - 3;
        wire[idx] &= OPT_MASK;
        assert!(PacketOptions::parse(&wire).is_none());
    }

    #[test]
    fn test_options_entry_cap_enforced() {
        // 17 entries overflows the 16-entry cap.
        let mut b = OptionsBuilder::new();
        for _ in 0..14 {
            b.syn();
        }
        b.fin();
        let wire = b.finish();
        assert!(PacketOptions::parse(&wire).is_some(), "16 entries is legal");

        let mut b = OptionsBuilder::new();
        for _ in 0..15 {
            b.syn();
        }
        b.fin();
        let wire = b.finish();
        assert!(PacketOptions::parse(&wire).is_none(), "17 entries is not");
    }

    #[test]
    fn test_options_nak_list_cap() {
        let sqns: Vec<u32> = (0..PGM_NAK_LIST_MAX as u32).collect();
        let mut b = OptionsBuilder::new();
        b.nak_list(&sqns);
        let parsed = PacketOptions::parse(&b.finish()).expect("62 sequences is legal");
        assert_eq!(parsed.nak_list.len(), PGM_NAK_LIST_MAX);
    }
}
