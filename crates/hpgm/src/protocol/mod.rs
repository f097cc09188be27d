// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! PGM wire codec.
//!
//! Parses and emits the PGM packet family (SPM, ODATA, RDATA, NAK, N-NAK,
//! NCF, SPMR, POLL, POLR) together with the TLV option chain and the
//! Internet checksum. Every multi-byte field is network byte order on the
//! wire and host order in memory.
//!
//! Layout per packet:
//!
//! ```text
//! +------------+--------------------+-----------------+-------------+
//! | PGM header | type-specific body | option chain    | TSDU        |
//! | 16 bytes   | SPM / DATA / NAK   | iff OPT_PRESENT | DATA only   |
//! +------------+--------------------+-----------------+-------------+
//! ```

pub mod checksum;
pub mod data;
pub mod header;
pub mod nak;
pub mod nla;
pub mod options;
pub mod poll;
pub mod spm;

pub use checksum::{csum, csum_block_add, csum_fold, csum_partial, csum_verify};
pub use data::{encode_data, parse_data, reencode_rdata, DataInfo, ParsedData};
pub use header::{
    stamp_checksum, PacketType, PgmHeader, HDR_OPT_NETWORK, HDR_OPT_PARITY, HDR_OPT_PRESENT,
    HDR_OPT_VAR_PKTLEN,
};
pub use nak::{encode_nak, parse_nak, NakInfo};
pub use nla::{get_nla, nla_len, put_nla, AFI_IPV4, AFI_IPV6};
pub use options::{
    OptFragment, OptParityPrm, OptionsBuilder, PacketOptions, OPT_END, OPT_FRAGMENT, OPT_LENGTH,
    OPT_NAK_LIST, OPT_PARITY_PRM, PARITY_PRM_OND, PARITY_PRM_PRO,
};
pub use poll::{encode_poll, encode_polr, parse_poll, parse_polr, PollInfo, PolrInfo};
pub use spm::{encode_spm, encode_spmr, parse_spm, SpmInfo};

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

/// Length of a Global Source Identifier in bytes.
pub const GSI_LEN: usize = 6;

/// Global Source Identifier: 6 opaque bytes unique to a sender instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gsi(pub [u8; GSI_LEN]);

impl Gsi {
    /// Derive a fresh GSI from host identity and process state.
    ///
    /// A restarted source must present a new identity, so process id and
    /// wall-clock nanoseconds are folded in alongside the host address.
    pub fn generate() -> Gsi {
        let mut hasher = DefaultHasher::new();
        if let Ok(ip) = local_ip_address::local_ip() {
            ip.hash(&mut hasher);
        }
        process::id().hash(&mut hasher);
        if let Ok(elapsed) = SystemTime::now().duration_since(UNIX_EPOCH) {
            elapsed.subsec_nanos().hash(&mut hasher);
            elapsed.as_secs().hash(&mut hasher);
        }
        let word = hasher.finish();
        let bytes = word.to_be_bytes();
        Gsi([bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7]])
    }

    /// Derive a GSI from an explicit address (deterministic).
    pub fn from_addr(addr: IpAddr) -> Gsi {
        let mut hasher = DefaultHasher::new();
        addr.hash(&mut hasher);
        let bytes = hasher.finish().to_be_bytes();
        Gsi([bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7]])
    }
}

impl fmt::Display for Gsi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}.{}.{}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Transport Session Identifier: GSI plus source port.
///
/// Uniquely names one active sender; equality and hashing are byte-wise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tsi {
    pub gsi: Gsi,
    pub sport: u16,
}

impl Tsi {
    pub fn new(gsi: Gsi, sport: u16) -> Tsi {
        Tsi { gsi, sport }
    }
}

impl fmt::Display for Tsi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.gsi, self.sport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gsi_from_addr_deterministic() {
        let a = Gsi::from_addr("10.0.0.1".parse().unwrap());
        let b = Gsi::from_addr("10.0.0.1".parse().unwrap());
        let c = Gsi::from_addr("10.0.0.2".parse().unwrap());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_tsi_display() {
        let tsi = Tsi::new(Gsi([9, 8, 7, 6, 5, 4]), 7500);
        assert_eq!(tsi.to_string(), "9.8.7.6.5.4.7500");
    }

    #[test]
    fn test_tsi_equality_bytewise() {
        let gsi = Gsi([1, 1, 2, 2, 3, 3]);
        assert_eq!(Tsi::new(gsi, 10), Tsi::new(gsi, 10));
        assert_ne!(Tsi::new(gsi, 10), Tsi::new(gsi, 11));
    }
}
