// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-source peer records.
//!
//! A peer is created on the first valid packet from a new TSI and
//! destroyed after `peer_expiry` without traffic. It owns the source's
//! receive window plus the addressing state NAK generation needs. Peers
//! never hold a reference back to the socket; the socket's peer map is
//! the only owner and strictly outlives them.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::fec::FecParams;
use crate::protocol::Tsi;
use crate::window::ReceiveWindow;

/// Per-peer statistics, all monotonic.
#[derive(Debug, Default)]
pub struct PeerStats {
    pub packets: AtomicU64,
    pub bytes: AtomicU64,
    pub malformed: AtomicU64,
    pub duplicates: AtomicU64,
    pub naks_sent: AtomicU64,
    pub ncfs_received: AtomicU64,
    pub spms_received: AtomicU64,
}

/// Sentinel for "no SPM seen yet".
const SPM_SQN_NONE: u64 = u64::MAX;

/// State for one remote source, keyed by TSI.
#[derive(Debug)]
pub struct Peer {
    pub tsi: Tsi,
    pub rxw: Mutex<ReceiveWindow>,

    /// Last known source address; a packet from elsewhere updates the
    /// record but never replaces an established path (multipath source).
    pub source_nla: Mutex<IpAddr>,
    /// NLA advertised in SPMs; unicast NAK destination.
    pub advertised_nla: Mutex<Option<IpAddr>>,

    /// Highest SPM sequence seen, `SPM_SQN_NONE` before the first
    /// (replay guard).
    spm_sqn: AtomicU64,
    /// Deadline after which the peer is expired.
    pub expiry: Mutex<Instant>,
    /// Pending SPMR back-off deadline, if this receiver is waiting to
    /// ask for an SPM.
    pub spmr_expiry: Mutex<Option<Instant>>,

    /// Set while the peer sits in the delivery queue; avoids duplicate
    /// queue entries.
    pub pending_delivery: AtomicBool,
    /// Source signalled OPT_FIN or OPT_RST.
    pub closed: AtomicBool,

    pub stats: PeerStats,
}

impl Peer {
    pub fn new(
        tsi: Tsi,
        source_nla: IpAddr,
        rxw_sqns: u32,
        fec: Option<&FecParams>,
        expiry: Instant,
    ) -> Peer {
        log::debug!("[Peer] new peer {} from {}", tsi, source_nla);
        Peer {
            tsi,
            rxw: Mutex::new(ReceiveWindow::new(rxw_sqns, fec)),
            source_nla: Mutex::new(source_nla),
            advertised_nla: Mutex::new(None),
            spm_sqn: AtomicU64::new(SPM_SQN_NONE),
            expiry: Mutex::new(expiry),
            spmr_expiry: Mutex::new(None),
            pending_delivery: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stats: PeerStats::default(),
        }
    }

    /// Refresh liveness on any valid packet.
    pub fn touch(&self, expiry: Instant) {
        *self.expiry.lock() = expiry;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= *self.expiry.lock()
    }

    /// Destination for unicast NAKs: the advertised NLA when known,
    /// otherwise the path the data came from.
    pub fn nak_target(&self) -> IpAddr {
        let advertised = *self.advertised_nla.lock();
        advertised.unwrap_or_else(|| *self.source_nla.lock())
    }

    /// Accept an SPM sequence if it advances the replay guard.
    pub fn accept_spm_sqn(&self, sqn: u32) -> bool {
        let last = self.spm_sqn.load(Ordering::Acquire);
        if last != SPM_SQN_NONE && crate::window::seq::seq_lte(sqn, last as u32) {
            return false;
        }
        self.spm_sqn.store(u64::from(sqn), Ordering::Release);
        true
    }

    /// Try to claim the delivery-queue slot.
    pub fn claim_pending(&self) -> bool {
        !self.pending_delivery.swap(true, Ordering::AcqRel)
    }

    pub fn release_pending(&self) {
        self.pending_delivery.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Gsi;
    use std::time::Duration;

    fn peer() -> Peer {
        Peer::new(
            Tsi::new(Gsi([1, 2, 3, 4, 5, 6]), 7500),
            "10.0.0.1".parse().unwrap(),
            64,
            None,
            Instant::now() + Duration::from_secs(300),
        )
    }

    #[test]
    fn test_peer_expiry() {
        let p = peer();
        let now = Instant::now();
        assert!(!p.is_expired(now));
        assert!(p.is_expired(now + Duration::from_secs(301)));
        p.touch(now + Duration::from_secs(600));
        assert!(!p.is_expired(now + Duration::from_secs(301)));
    }

    #[test]
    fn test_peer_spm_replay_guard() {
        let p = peer();
        assert!(p.accept_spm_sqn(0), "sequence zero is a valid first SPM");
        assert!(!p.accept_spm_sqn(0), "zero replay rejected");
        assert!(p.accept_spm_sqn(5), "newer SPM accepted");
        assert!(!p.accept_spm_sqn(5), "duplicate rejected");
        assert!(!p.accept_spm_sqn(3), "stale rejected");
        assert!(p.accept_spm_sqn(6), "newer accepted");
    }

    #[test]
    fn test_peer_nak_target_prefers_advertised() {
        let p = peer();
        assert_eq!(p.nak_target(), "10.0.0.1".parse::<IpAddr>().unwrap());
        *p.advertised_nla.lock() = Some("192.168.9.9".parse().unwrap());
        assert_eq!(p.nak_target(), "192.168.9.9".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_peer_pending_claim_is_exclusive() {
        let p = peer();
        assert!(p.claim_pending());
        assert!(!p.claim_pending(), "second claim fails until released");
        p.release_pending();
        assert!(p.claim_pending());
    }
}
