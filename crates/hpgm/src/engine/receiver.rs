// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Receiver engine: TSI demultiplexing and NAK generation.
//!
//! Inbound downstream packets are demultiplexed by TSI into per-source
//! peers, each owning one receive window. Loss detection inside the
//! window schedules deferred NAKs; the timer sweep serializes them
//! (batching up to 63 sequences through OPT_NAK_LIST) and unicasts them
//! to the source's advertised NLA. Peers idle past `peer_expiry` are
//! torn down.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;

use crate::config::{PGM_HEADER_SIZE, PGM_NAK_LIST_MAX};
use crate::engine::peer::Peer;
use crate::engine::timer::fold_deadline;
use crate::engine::IoCtx;
use crate::fec::FecParams;
use crate::protocol::{
    encode_nak, encode_spmr, NakInfo, PacketOptions, ParsedData, PacketType, PgmHeader, SpmInfo,
    Tsi,
};
use crate::skb::Skb;
use crate::sock::SockConfig;
use crate::window::{NakConfig, RxwStatus};

/// Receiver half of a socket.
#[derive(Debug)]
pub struct ReceiverState {
    pub peers: DashMap<Tsi, Arc<Peer>>,
    delivery_tx: Sender<Tsi>,
    pub delivery_rx: Receiver<Tsi>,

    rxw_sqns: u32,
    fec: Option<FecParams>,
    peer_expiry: Duration,
    spmr_backoff: Duration,
    nak_cfg: NakConfig,
    passive: bool,
    abort_on_reset: bool,
    /// Raised when loss (or an RST) must surface through `recv`.
    pub reset_pending: AtomicBool,

    /// Session port carried as the sport of upstream packets.
    session_port: u16,
    group: IpAddr,
}

impl ReceiverState {
    pub fn new(config: &SockConfig, group: IpAddr, session_port: u16) -> ReceiverState {
        let (delivery_tx, delivery_rx) = unbounded();
        ReceiverState {
            peers: DashMap::new(),
            delivery_tx,
            delivery_rx,
            rxw_sqns: config.effective_rxw_sqns(),
            fec: config.fec,
            peer_expiry: config.peer_expiry,
            spmr_backoff: config.spmr_expiry,
            nak_cfg: config.nak_config(),
            passive: config.passive,
            abort_on_reset: config.abort_on_reset,
            reset_pending: AtomicBool::new(false),
            session_port,
            group,
        }
    }

    fn get_or_create(&self, tsi: Tsi, source: IpAddr, now: Instant) -> Arc<Peer> {
        if let Some(peer) = self.peers.get(&tsi) {
            return Arc::clone(peer.value());
        }
        let peer = Arc::new(Peer::new(
            tsi,
            source,
            self.rxw_sqns,
            self.fec.as_ref(),
            now + self.peer_expiry,
        ));
        self.peers.insert(tsi, Arc::clone(&peer));
        peer
    }

    /// Put a peer back on the delivery queue (recv found more work).
    pub fn requeue(&self, tsi: Tsi) -> Result<(), crossbeam::channel::TrySendError<Tsi>> {
        self.delivery_tx.try_send(tsi)
    }

    /// Queue a peer for delivery if its window has something to say.
    fn notify(&self, peer: &Arc<Peer>) {
        let ready = {
            let mut rxw = peer.rxw.lock();
            let ready = rxw.has_event;
            rxw.has_event = false;
            ready
        };
        if ready && peer.claim_pending() {
            if self.delivery_tx.send(peer.tsi).is_err() {
                peer.release_pending();
            }
        }
    }

    /// Wake blocked `recv` callers without claiming the pending slot;
    /// used when a reset must surface even though nothing is readable.
    fn interrupt(&self, tsi: Tsi) {
        let _ = self.delivery_tx.send(tsi);
    }

    /// Jittered back-off: uniform-ish in `(0, max]`, derived without a
    /// shared RNG.
    fn jitter(max: Duration, tsi: Tsi, salt: u64) -> Duration {
        let mut hasher = DefaultHasher::new();
        tsi.hash(&mut hasher);
        salt.hash(&mut hasher);
        let numerator = hasher.finish() % 1000 + 1;
        max.mul_f64(numerator as f64 / 1000.0)
    }

    fn nak_bo_expiry(&self, tsi: Tsi, now: Instant) -> Instant {
        static SALT: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let salt = SALT.fetch_add(1, Ordering::Relaxed);
        now + Self::jitter(self.nak_cfg.bo_ivl, tsi, salt)
    }

    // ====================================================================
    // Packet handlers
    // ====================================================================

    /// SPM: refresh window edges, advertised NLA, session flags.
    pub fn handle_spm(
        &self,
        tsi: Tsi,
        source: IpAddr,
        spm: &SpmInfo,
        opts: &PacketOptions,
        now: Instant,
        io: &IoCtx<'_>,
    ) {
        let peer = self.get_or_create(tsi, source, now);
        peer.touch(now + self.peer_expiry);
        peer.stats.spms_received.fetch_add(1, Ordering::Relaxed);

        if !peer.accept_spm_sqn(spm.spm_sqn) {
            peer.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            io.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            return;
        }

        *peer.advertised_nla.lock() = Some(spm.nla);
        // An SPM answers any SPMR we were backing off on.
        *peer.spmr_expiry.lock() = None;

        {
            let mut rxw = peer.rxw.lock();
            if let Some(prm) = &opts.parity_prm {
                let params = FecParams {
                    block_size: 255,
                    group_size: prm.tgs.min(128) as u8,
                    proactive_packets: 0,
                    ondemand_enabled: prm.flags & crate::protocol::PARITY_PRM_OND != 0,
                    var_pktlen_enabled: false,
                };
                if params.validate().is_ok() && rxw.enable_fec(&params) {
                    log::debug!("[Receiver] {} negotiated FEC k={}", tsi, prm.tgs);
                }
            }
            let added = rxw.update(spm.lead, spm.trail, self.nak_bo_expiry(tsi, now));
            if added > 0 {
                log::debug!("[Receiver] {} SPM opened {} placeholders", tsi, added);
            }
        }

        if opts.fin {
            peer.closed.store(true, Ordering::Release);
        }
        if opts.rst {
            peer.closed.store(true, Ordering::Release);
            if self.abort_on_reset {
                self.reset_pending.store(true, Ordering::Release);
                self.interrupt(tsi);
            }
        }
        self.notify(&peer);
    }

    /// ODATA/RDATA into the peer's receive window.
    pub fn handle_data(
        &self,
        tsi: Tsi,
        source: IpAddr,
        header: &PgmHeader,
        parsed: &ParsedData,
        tpdu: Vec<u8>,
        now: Instant,
        io: &IoCtx<'_>,
    ) {
        let peer = self.get_or_create(tsi, source, now);
        peer.touch(now + self.peer_expiry);
        peer.stats.packets.fetch_add(1, Ordering::Relaxed);
        peer.stats
            .bytes
            .fetch_add(tpdu.len() as u64, Ordering::Relaxed);

        {
            let recorded = *peer.source_nla.lock();
            if recorded != source {
                // Multipath source: note the alternate path, keep the
                // established record.
                log::debug!(
                    "[Receiver] {} data from alternate path {} (recorded {})",
                    tsi,
                    source,
                    recorded
                );
            }
        }

        let payload_offset = PGM_HEADER_SIZE + parsed.payload_offset;
        let skb = Skb::from_tpdu(
            tsi,
            *header,
            parsed.info,
            parsed.options.fragment,
            payload_offset,
            tpdu,
            now,
        )
        .with_parity_group(parsed.options.parity_grp);

        let status = {
            let mut rxw = peer.rxw.lock();
            rxw.add(skb, now, self.nak_bo_expiry(tsi, now))
        };
        match status {
            RxwStatus::Malformed => {
                peer.stats.malformed.fetch_add(1, Ordering::Relaxed);
                io.stats.malformed.fetch_add(1, Ordering::Relaxed);
            }
            RxwStatus::Duplicate => {
                peer.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                io.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }

        if parsed.options.fin {
            peer.closed.store(true, Ordering::Release);
        }

        // Data without a prior SPM leaves no NAK target; back off an
        // SPMR unless another receiver beats us to it.
        if !self.passive && peer.advertised_nla.lock().is_none() {
            let mut spmr = peer.spmr_expiry.lock();
            if spmr.is_none() {
                *spmr = Some(now + Self::jitter(self.spmr_backoff, tsi, 0x5b));
            }
        }

        self.notify(&peer);
    }

    /// NCF: the source saw a NAK; move matching slots to wait-data.
    pub fn handle_ncf(&self, tsi: Tsi, nak: &NakInfo, opts: &PacketOptions, now: Instant) {
        let Some(peer) = self.peers.get(&tsi).map(|p| Arc::clone(p.value())) else {
            return;
        };
        peer.touch(now + self.peer_expiry);
        peer.stats.ncfs_received.fetch_add(1, Ordering::Relaxed);

        let mut rxw = peer.rxw.lock();
        for &sequence in std::iter::once(&nak.sqn).chain(&opts.nak_list) {
            rxw.confirm(
                sequence,
                now + self.nak_cfg.rdata_ivl,
                self.nak_bo_expiry(tsi, now),
            );
        }
    }

    /// Another receiver's SPMR for one of our peers silences ours.
    pub fn handle_foreign_spmr(&self, tsi: Tsi) {
        if let Some(peer) = self.peers.get(&tsi) {
            *peer.spmr_expiry.lock() = None;
        }
    }

    /// POLL/POLR are counted; no DLR election here.
    pub fn handle_poll(&self, io: &IoCtx<'_>) {
        io.stats.polls_received.fetch_add(1, Ordering::Relaxed);
    }

    // ====================================================================
    // Timer sweep
    // ====================================================================

    /// Advance every peer's recovery machinery; returns the next
    /// receiver-side deadline.
    pub fn sweep(&self, now: Instant, io: &IoCtx<'_>) -> Option<Instant> {
        let mut deadline: Option<Instant> = None;
        let mut expired: Vec<Tsi> = Vec::new();

        for entry in self.peers.iter() {
            let peer = entry.value();
            if peer.is_expired(now) {
                expired.push(peer.tsi);
                continue;
            }

            let sweep = {
                let mut rxw = peer.rxw.lock();
                rxw.update_timers(now, &self.nak_cfg)
            };
            if !sweep.nak_list.is_empty() {
                if self.passive {
                    log::debug!(
                        "[Receiver] passive mode suppressed {} NAKs for {}",
                        sweep.nak_list.len(),
                        peer.tsi
                    );
                } else {
                    self.send_naks(peer, &sweep.nak_list, io);
                }
            }
            if sweep.newly_lost > 0 {
                log::debug!(
                    "[Receiver] {} gave up on {} sequences",
                    peer.tsi,
                    sweep.newly_lost
                );
                if self.abort_on_reset {
                    self.reset_pending.store(true, Ordering::Release);
                    self.interrupt(peer.tsi);
                }
                self.notify(peer);
            }

            // Pending SPMR?
            let spmr_due = {
                let mut spmr = peer.spmr_expiry.lock();
                match *spmr {
                    Some(when) if now >= when => {
                        *spmr = None;
                        true
                    }
                    _ => false,
                }
            };
            if spmr_due && peer.advertised_nla.lock().is_none() {
                self.send_spmr(peer, io);
            }

            deadline = fold_deadline(deadline, peer.rxw.lock().next_timer_deadline());
            deadline = fold_deadline(deadline, *peer.spmr_expiry.lock());
            deadline = fold_deadline(deadline, Some(*peer.expiry.lock()));
        }

        for tsi in expired {
            log::info!("[Receiver] peer {} expired, releasing window", tsi);
            self.peers.remove(&tsi);
        }

        deadline
    }

    /// Serialize and unicast NAKs, batching through OPT_NAK_LIST.
    fn send_naks(&self, peer: &Arc<Peer>, sequences: &[u32], io: &IoCtx<'_>) {
        let target = peer.nak_target();
        for chunk in sequences.chunks(1 + PGM_NAK_LIST_MAX) {
            let nak = NakInfo {
                sqn: chunk[0],
                src_nla: target,
                grp_nla: self.group,
            };
            let tpdu = encode_nak(
                PacketType::Nak,
                self.session_port,
                peer.tsi.sport,
                peer.tsi.gsi,
                &nak,
                &chunk[1..],
            );
            if let Some(wait) = io.try_rate(tpdu.len()) {
                log::debug!("[Receiver] NAK burst throttled for {:?}", wait);
                return;
            }
            match io.transport.send_unicast(target, &tpdu) {
                Ok(_) => {
                    io.stats.count_sent(tpdu.len());
                    io.stats.naks_sent.fetch_add(1, Ordering::Relaxed);
                    peer.stats
                        .naks_sent
                        .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    log::debug!("[Receiver] NAK to {} failed: {}", target, e);
                    return;
                }
            }
        }
    }

    /// Ask the source for an SPM (multicast so siblings can suppress
    /// theirs, unicast so it arrives even without loopback).
    fn send_spmr(&self, peer: &Arc<Peer>, io: &IoCtx<'_>) {
        let tpdu = encode_spmr(self.session_port, peer.tsi.sport, peer.tsi.gsi);
        if io.try_rate(tpdu.len() * 2).is_some() {
            return;
        }
        let _ = io.transport.send_to_group(&tpdu);
        let unicast_target = *peer.source_nla.lock();
        let _ = io.transport.send_unicast(unicast_target, &tpdu);
        io.stats.count_sent(tpdu.len() * 2);
        log::debug!("[Receiver] SPMR sent for {}", peer.tsi);
    }
}
