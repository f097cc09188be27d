// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Packet buffer shared between the windows and in-flight send state.
//!
//! An [`Skb`] owns one contiguous TPDU and the views parsed out of it:
//! fixed header, DATA header, optional fragment info, and the payload
//! range. Sharing across the transmit window, the retransmit queue, and
//! pending sends is by `Arc<Skb>`; mutable per-component state (NAK
//! expiries, retransmit counters, cached checksums) lives beside the
//! buffer in the owning window rather than inside it.

use std::time::Instant;

use crate::protocol::{
    DataInfo, OptFragment, PacketType, PgmHeader, Tsi, HDR_OPT_PARITY, HDR_OPT_VAR_PKTLEN,
};

/// One parsed data packet (ODATA/RDATA or a reconstructed original).
#[derive(Debug, Clone)]
pub struct Skb {
    /// Complete wire bytes; empty for FEC-reconstructed packets.
    tpdu: Vec<u8>,
    /// Offset of the TSDU within `tpdu`, or 0 when `tpdu` holds payload only.
    payload_offset: usize,
    pub header: PgmHeader,
    pub data: DataInfo,
    /// OPT_FRAGMENT, normalized away for single-fragment APDUs.
    pub fragment: Option<OptFragment>,
    /// OPT_PARITY_GRP: transmission group a parity packet repairs.
    pub parity_group: Option<u32>,
    pub sequence: u32,
    pub tsi: Tsi,
    pub tstamp: Instant,
}

impl Skb {
    /// Wrap a received or freshly encoded TPDU.
    pub fn from_tpdu(
        tsi: Tsi,
        header: PgmHeader,
        data: DataInfo,
        fragment: Option<OptFragment>,
        payload_offset: usize,
        tpdu: Vec<u8>,
        now: Instant,
    ) -> Skb {
        debug_assert!(payload_offset <= tpdu.len());
        Skb {
            tpdu,
            payload_offset,
            header,
            data,
            fragment,
            parity_group: None,
            sequence: data.data_sqn,
            tsi,
            tstamp: now,
        }
    }

    /// Tag a parity packet with its transmission group.
    pub fn with_parity_group(mut self, group: Option<u32>) -> Skb {
        self.parity_group = group;
        self
    }

    /// Build a buffer for a payload recovered by the parity decoder.
    ///
    /// No wire bytes exist for it, so the header is synthesized; such a
    /// buffer is only ever delivered upward, never retransmitted.
    pub fn reconstructed(
        tsi: Tsi,
        sequence: u32,
        payload: Vec<u8>,
        fragment: Option<OptFragment>,
        now: Instant,
    ) -> Skb {
        let mut header = PgmHeader::new(PacketType::Rdata, tsi.sport, 0, tsi.gsi);
        header.tsdu_length = payload.len() as u16;
        Skb {
            tpdu: payload,
            payload_offset: 0,
            header,
            data: DataInfo {
                data_sqn: sequence,
                data_trail: sequence,
            },
            fragment,
            parity_group: None,
            sequence,
            tsi,
            tstamp: now,
        }
    }

    /// TSDU bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.tpdu[self.payload_offset..]
    }

    /// TSDU length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.tpdu.len() - self.payload_offset
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Complete wire image (empty for reconstructed buffers).
    #[inline]
    pub fn tpdu(&self) -> &[u8] {
        &self.tpdu
    }

    /// Offset of the TSDU within the wire image.
    #[inline]
    pub fn payload_offset(&self) -> usize {
        self.payload_offset
    }

    /// Packet carries parity for its transmission group.
    #[inline]
    pub fn is_parity(&self) -> bool {
        self.header.options & HDR_OPT_PARITY != 0
    }

    /// Transmission group uses variable-length encoding.
    #[inline]
    pub fn is_var_pktlen(&self) -> bool {
        self.header.options & HDR_OPT_VAR_PKTLEN != 0
    }

    /// First sequence of the APDU this packet belongs to.
    #[inline]
    pub fn apdu_first_sqn(&self) -> u32 {
        self.fragment.map_or(self.sequence, |f| f.first_sqn)
    }

    /// Total APDU length this packet contributes to.
    #[inline]
    pub fn apdu_len(&self) -> usize {
        self.fragment
            .map_or(self.len(), |f| f.apdu_len as usize)
    }

    /// Drop the fragment header from a single-fragment APDU.
    pub fn normalize_single_fragment(&mut self) {
        if let Some(frag) = self.fragment {
            if frag.apdu_len as usize == self.len() {
                self.fragment = None;
            }
        }
    }
}
