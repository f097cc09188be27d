// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reed-Solomon forward error correction over transmission groups.
//!
//! Sequences are grouped into transmission groups of `k = 2^tg_sqn_shift`
//! originals plus up to `n - k` parity packets. Any `k` of the `n` total
//! recover the group. Parity is computed over payloads padded to a common
//! `parity_len`; with variable-length encoding (OPT_VAR_PKTLEN) the true
//! TSDU length rides in the trailing two bytes of each padded shard, so
//! reconstruction can trim the padding back off.
//!
//! The GF(2^8) codec is `reed-solomon-erasure`.

use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::Error;

/// FEC parameters as configured through the `UseFec` socket option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FecParams {
    /// Total packets per group (`n`), originals plus parity.
    pub block_size: u8,
    /// Originals per group (`k`); a power of two in 2..=128.
    pub group_size: u8,
    /// Parity packets transmitted proactively with each group.
    pub proactive_packets: u8,
    /// Answer parity NAKs with on-demand parity.
    pub ondemand_enabled: bool,
    /// Groups may mix packet lengths (trailing-length encoding).
    pub var_pktlen_enabled: bool,
}

impl FecParams {
    /// Validate the geometry: `k` a power of two in 2..=128,
    /// `k < n <= 255`, `proactive <= n - k`.
    pub fn validate(&self) -> Result<(), Error> {
        let k = self.group_size;
        let n = self.block_size;
        if !k.is_power_of_two() || !(2..=128).contains(&k) {
            return Err(Error::InvalidArgument);
        }
        if n <= k {
            return Err(Error::InvalidArgument);
        }
        if self.proactive_packets > n - k {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    /// Number of low bits naming the packet within its group.
    pub fn tg_sqn_shift(&self) -> u32 {
        u32::from(self.group_size).trailing_zeros()
    }
}

/// Mask selecting the group number of a sequence.
#[inline]
pub fn tg_sqn(sequence: u32, tg_sqn_shift: u32) -> u32 {
    sequence & !((1u32 << tg_sqn_shift) - 1)
}

/// Packet number within its transmission group.
#[inline]
pub fn pkt_sqn(sequence: u32, tg_sqn_shift: u32) -> u32 {
    sequence & ((1u32 << tg_sqn_shift) - 1)
}

/// Transmission-group encoder/decoder bound to one `(k, n)` geometry.
pub struct Fec {
    rs: ReedSolomon,
    k: usize,
    n: usize,
    var_pktlen: bool,
}

impl std::fmt::Debug for Fec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fec")
            .field("k", &self.k)
            .field("n", &self.n)
            .field("var_pktlen", &self.var_pktlen)
            .finish()
    }
}

impl Fec {
    pub fn new(params: &FecParams) -> Result<Fec, Error> {
        params.validate()?;
        let k = params.group_size as usize;
        let n = params.block_size as usize;
        let rs = ReedSolomon::new(k, n - k).map_err(|_| Error::InvalidArgument)?;
        Ok(Fec {
            rs,
            k,
            n,
            var_pktlen: params.var_pktlen_enabled,
        })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn parity_count(&self) -> usize {
        self.n - self.k
    }

    pub fn var_pktlen(&self) -> bool {
        self.var_pktlen
    }

    /// Zero-pad a payload to `parity_len`, stamping the trailing length
    /// bytes when variable-length encoding is on.
    pub fn pad_shard(&self, payload: &[u8], parity_len: usize) -> Vec<u8> {
        debug_assert!(self.shard_fits(payload.len(), parity_len));
        let mut shard = vec![0u8; parity_len];
        shard[..payload.len()].copy_from_slice(payload);
        if self.var_pktlen {
            let len = payload.len() as u16;
            shard[parity_len - 2..].copy_from_slice(&len.to_be_bytes());
        }
        shard
    }

    /// A payload of `len` bytes fits a shard of `parity_len`.
    pub fn shard_fits(&self, len: usize, parity_len: usize) -> bool {
        if self.var_pktlen {
            len + 2 <= parity_len
        } else {
            len == parity_len
        }
    }

    /// Compute the `n - k` parity shards over one group of originals.
    ///
    /// `originals` must hold exactly `k` payloads, each fitting
    /// `parity_len` (equal to it unless variable-length encoding is on).
    pub fn encode_parity(
        &self,
        originals: &[Vec<u8>],
        parity_len: usize,
    ) -> Result<Vec<Vec<u8>>, Error> {
        if originals.len() != self.k {
            return Err(Error::InvalidArgument);
        }
        let mut shards: Vec<Vec<u8>> = originals
            .iter()
            .map(|p| self.pad_shard(p, parity_len))
            .collect();
        shards.resize(self.n, vec![0u8; parity_len]);
        self.rs.encode(&mut shards).map_err(|e| {
            log::warn!("[Fec] parity encode failed: {:?}", e);
            Error::InvalidArgument
        })?;
        Ok(shards.split_off(self.k))
    }

    /// Parity over `k` equal-length blocks without padding or length
    /// stamping. Used for the fragment-header side channel that rides in
    /// parity packets.
    pub fn encode_blocks(&self, blocks: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, Error> {
        if blocks.len() != self.k || blocks.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let len = blocks[0].len();
        if len == 0 || blocks.iter().any(|b| b.len() != len) {
            return Err(Error::InvalidArgument);
        }
        let mut shards = blocks.to_vec();
        shards.resize(self.n, vec![0u8; len]);
        self.rs.encode(&mut shards).map_err(|e| {
            log::warn!("[Fec] block parity encode failed: {:?}", e);
            Error::InvalidArgument
        })?;
        Ok(shards.split_off(self.k))
    }

    /// Fill in the missing original shards of a group.
    ///
    /// `shards` is the full `n`-slot view (originals first, then parity),
    /// `None` where the packet has not arrived; present shards must
    /// already be padded to a common length. At least `k` slots must be
    /// present.
    pub fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> Result<(), Error> {
        if shards.len() != self.n {
            return Err(Error::InvalidArgument);
        }
        self.rs.reconstruct_data(shards).map_err(|e| {
            log::debug!("[Fec] reconstruct failed: {:?}", e);
            Error::Malformed
        })
    }

    /// Trim a recovered shard back to its true payload.
    ///
    /// With variable-length encoding the trailing two bytes carry the
    /// original TSDU length; a length exceeding the shard is corrupt and
    /// the caller drops the entire transmission group.
    pub fn recovered_payload(&self, mut shard: Vec<u8>) -> Result<Vec<u8>, Error> {
        if !self.var_pktlen {
            return Ok(shard);
        }
        let parity_len = shard.len();
        if parity_len < 2 {
            return Err(Error::Malformed);
        }
        let pktlen =
            u16::from_be_bytes([shard[parity_len - 2], shard[parity_len - 1]]) as usize;
        if pktlen > parity_len - 2 {
            log::warn!(
                "[Fec] invalid encoded packet length {} > {} in reconstructed packet",
                pktlen,
                parity_len - 2
            );
            return Err(Error::Malformed);
        }
        shard.truncate(pktlen);
        Ok(shard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(k: u8, n: u8) -> FecParams {
        FecParams {
            block_size: n,
            group_size: k,
            proactive_packets: 0,
            ondemand_enabled: true,
            var_pktlen_enabled: false,
        }
    }

    #[test]
    fn test_fec_params_validation() {
        assert!(params(4, 6).validate().is_ok());
        assert!(params(128, 255).validate().is_ok());

        assert!(params(3, 6).validate().is_err(), "k must be a power of two");
        assert!(params(4, 4).validate().is_err(), "n must exceed k");
        assert!(params(1, 4).validate().is_err(), "k below 2 is invalid");

        let mut p = params(4, 6);
        p.proactive_packets = 3;
        assert!(p.validate().is_err(), "proactive above n - k is invalid");
    }

    #[test]
    fn test_fec_tg_helpers() {
        let p = params(4, 6);
        assert_eq!(p.tg_sqn_shift(), 2);
        assert_eq!(tg_sqn(303, 2), 300);
        assert_eq!(pkt_sqn(303, 2), 3);
        assert_eq!(tg_sqn(300, 2), 300);
        assert_eq!(pkt_sqn(300, 2), 0);
    }

    #[test]
    fn test_fec_recover_one_missing() {
        // Scenario: k=4, n=6, originals 300..303, receiver misses 302.
        let fec = Fec::new(&params(4, 6)).expect("geometry is valid");
        let originals: Vec<Vec<u8>> = (0u8..4).map(|i| vec![i ^ 0x5a; 100]).collect();
        let parity = fec.encode_parity(&originals, 100).expect("encode parity");
        assert_eq!(parity.len(), 2);

        let mut shards: Vec<Option<Vec<u8>>> = vec![
            Some(originals[0].clone()),
            Some(originals[1].clone()),
            None, // 302 lost
            Some(originals[3].clone()),
            None, // parity 304 not received
            Some(parity[1].clone()),
        ];
        fec.reconstruct(&mut shards).expect("k of n present");
        let recovered = shards[2].take().expect("slot 2 recovered");
        assert_eq!(recovered, originals[2], "decode must restore the original");
    }

    #[test]
    fn test_fec_insufficient_shards_fails() {
        let fec = Fec::new(&params(4, 6)).unwrap();
        let originals: Vec<Vec<u8>> = (0u8..4).map(|i| vec![i; 10]).collect();
        let parity = fec.encode_parity(&originals, 10).unwrap();

        let mut shards: Vec<Option<Vec<u8>>> = vec![
            Some(originals[0].clone()),
            None,
            None,
            Some(originals[3].clone()),
            Some(parity[0].clone()),
            None,
        ];
        assert!(
            fec.reconstruct(&mut shards).is_err(),
            "3 of 6 present cannot recover k=4"
        );
    }

    #[test]
    fn test_fec_var_pktlen_roundtrip() {
        let mut p = params(4, 6);
        p.var_pktlen_enabled = true;
        let fec = Fec::new(&p).unwrap();

        // Mixed lengths; parity_len leaves room for the length tail.
        let payloads: Vec<Vec<u8>> = vec![vec![1; 50], vec![2; 98], vec![3; 10], vec![4; 77]];
        let parity_len = 100;
        let parity = fec.encode_parity(&payloads, parity_len).unwrap();

        let mut shards: Vec<Option<Vec<u8>>> = vec![
            Some(fec.pad_shard(&payloads[0], parity_len)),
            Some(fec.pad_shard(&payloads[1], parity_len)),
            None,
            Some(fec.pad_shard(&payloads[3], parity_len)),
            Some(parity[0].clone()),
            None,
        ];
        fec.reconstruct(&mut shards).expect("reconstruct");
        let recovered = fec
            .recovered_payload(shards[2].take().unwrap())
            .expect("trailing length is sane");
        assert_eq!(recovered, payloads[2], "length tail must trim padding");
    }

    #[test]
    fn test_fec_var_pktlen_corrupt_length_rejected() {
        let mut p = params(4, 6);
        p.var_pktlen_enabled = true;
        let fec = Fec::new(&p).unwrap();

        let mut shard = vec![0u8; 40];
        shard[38..].copy_from_slice(&500u16.to_be_bytes());
        assert!(
            fec.recovered_payload(shard).is_err(),
            "encoded length beyond the shard drops the group"
        );
    }
}
