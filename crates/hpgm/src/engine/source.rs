// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Source engine: ODATA emission, SPM schedules, NAK servicing, repairs.
//!
//! Send path: the APDU is fragmented into TSDUs, each checksummed once
//! (the unfolded payload sum is retained for repairs), rate-checked, put
//! on the wire, and inserted into the transmit window. A rate-limited
//! non-blocking send parks its progress in the socket so the caller can
//! resume the same APDU with the same sequences.
//!
//! Repair path: inbound NAKs are validated, answered immediately with a
//! multicast NCF, and appended (deduplicated) to the retransmit queue;
//! the network thread drains the queue into RDATA using the cached
//! payload checksums.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::{SPM_FIN_COUNT, SPM_SYN_COUNT};
use crate::engine::IoCtx;
use crate::fec::{tg_sqn, Fec, FecParams};
use crate::protocol::{
    encode_data, encode_nak, encode_spm, DataInfo, Gsi, NakInfo, OptFragment, OptionsBuilder,
    OptParityPrm, PacketType, PgmHeader, SpmInfo, Tsi, HDR_OPT_NETWORK, HDR_OPT_PARITY,
    HDR_OPT_PRESENT, HDR_OPT_VAR_PKTLEN, PARITY_PRM_OND, PARITY_PRM_PRO,
};
use crate::skb::Skb;
use crate::sock::SockConfig;
use crate::window::rxw::encode_frag_block;
use crate::window::seq::seq_lt;
use crate::window::TransmitWindow;
use crate::Error;

/// SPM scheduling state.
#[derive(Debug)]
struct SpmSchedule {
    next_ambient: Instant,
    /// Index into the heartbeat array; `len` means exhausted.
    heartbeat_idx: usize,
    next_heartbeat: Option<Instant>,
    /// Leading SPMs still carrying OPT_SYN.
    syn_remaining: u32,
}

/// Progress of a rate-limited non-blocking send, resumed by the next
/// call with the same APDU.
#[derive(Debug)]
struct PartialSend {
    data: Vec<u8>,
    offset: usize,
    first_sqn: u32,
}

/// Outcome of one repair-drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    /// Queue empty.
    Idle,
    /// Bucket ran dry; retry after the wait.
    RateLimited(Duration),
}

/// Sender half of a socket.
#[derive(Debug)]
pub struct SourceState {
    pub txw: Mutex<TransmitWindow>,
    spm_sqn: AtomicU32,
    schedule: Mutex<SpmSchedule>,
    pending: Mutex<Option<PartialSend>>,
    /// Next on-demand parity index per open transmission group.
    ondemand_parity: Mutex<HashMap<u32, u8>>,

    tsi: Tsi,
    dport: u16,
    max_tsdu: usize,
    max_tsdu_fragment: usize,
    max_apdu: usize,
    ambient_ivl: Duration,
    heartbeat: Vec<Duration>,
    fec_params: Option<FecParams>,
    fec: Option<Fec>,
    tg_sqn_shift: u32,
}

impl SourceState {
    pub fn new(config: &SockConfig, tsi: Tsi, dport: u16, initial_sqn: u32) -> SourceState {
        let max_tsdu = config.max_tsdu();
        let max_fragments = crate::config::PGM_MAX_FRAGMENTS
            .min(config.effective_txw_sqns() as usize)
            .max(1);
        let fec = config.fec.as_ref().and_then(|p| Fec::new(p).ok());
        SourceState {
            txw: Mutex::new(TransmitWindow::new(config.effective_txw_sqns(), initial_sqn)),
            spm_sqn: AtomicU32::new(0),
            schedule: Mutex::new(SpmSchedule {
                next_ambient: Instant::now(),
                heartbeat_idx: config.heartbeat_spm.len(),
                next_heartbeat: None,
                syn_remaining: SPM_SYN_COUNT,
            }),
            pending: Mutex::new(None),
            ondemand_parity: Mutex::new(HashMap::new()),
            tsi,
            dport,
            max_tsdu,
            max_tsdu_fragment: config.max_tsdu_fragment(),
            max_apdu: crate::config::PGM_MAX_APDU
                .min(max_fragments * config.max_tsdu_fragment().max(1)),
            ambient_ivl: config.ambient_spm,
            heartbeat: config.heartbeat_spm.clone(),
            fec_params: config.fec,
            fec,
            tg_sqn_shift: config.fec.map_or(0, |p| p.tg_sqn_shift()),
        }
    }

    fn gsi(&self) -> Gsi {
        self.tsi.gsi
    }

    fn sport(&self) -> u16 {
        self.tsi.sport
    }

    /// Largest APDU `send` accepts.
    pub fn max_apdu(&self) -> usize {
        self.max_apdu
    }

    // ====================================================================
    // ODATA
    // ====================================================================

    /// Fragment and transmit one APDU.
    ///
    /// Returns the APDU length on success. In non-blocking mode a
    /// rate-limited call returns [`Error::RateLimited`] with progress
    /// parked; the caller resumes by sending the same APDU again.
    pub fn send_apdu(&self, data: &[u8], io: &IoCtx<'_>, noblock: bool) -> Result<usize, Error> {
        if data.is_empty() || data.len() > self.max_apdu {
            return Err(Error::InvalidArgument);
        }

        let mut pending = self.pending.lock();
        let (mut offset, first_sqn) = match pending.take() {
            Some(parked) => {
                if parked.data != data {
                    // A different APDU cannot jump the parked one.
                    *pending = Some(parked);
                    return Err(Error::WouldBlock);
                }
                (parked.offset, parked.first_sqn)
            }
            None => (0, self.txw.lock().next_lead()),
        };

        let fragmented = data.len() > self.max_tsdu;
        let max_frag = if fragmented {
            self.max_tsdu_fragment
        } else {
            self.max_tsdu
        };

        while offset < data.len() {
            let end = (offset + max_frag).min(data.len());
            let payload = &data[offset..end];
            let fragment = fragmented.then(|| OptFragment {
                first_sqn,
                frag_off: offset as u32,
                apdu_len: data.len() as u32,
            });

            let (sequence, trail) = {
                let txw = self.txw.lock();
                (txw.next_lead(), txw.trail())
            };
            let chain = fragment.map(|frag| {
                let mut b = OptionsBuilder::new();
                b.fragment(&frag);
                b.finish()
            });
            let hdr_flags = if self
                .fec_params
                .is_some_and(|p| p.var_pktlen_enabled)
            {
                HDR_OPT_VAR_PKTLEN
            } else {
                0
            };
            let info = DataInfo {
                data_sqn: sequence,
                data_trail: trail,
            };
            let (tpdu, payload_sum) = encode_data(
                PacketType::Odata,
                self.sport(),
                self.dport,
                self.gsi(),
                &info,
                hdr_flags,
                chain.as_deref(),
                payload,
            );

            if let Some(wait) = io.try_rate(tpdu.len()) {
                if noblock {
                    *pending = Some(PartialSend {
                        data: data.to_vec(),
                        offset,
                        first_sqn,
                    });
                    return Err(Error::RateLimited);
                }
                std::thread::sleep(wait);
                continue;
            }

            match io.transport.send_to_group(&tpdu) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if noblock {
                        *pending = Some(PartialSend {
                            data: data.to_vec(),
                            offset,
                            first_sqn,
                        });
                        return Err(Error::WouldBlock);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                    continue;
                }
                Err(e) => return Err(Error::System(e)),
            }
            io.stats.count_sent(tpdu.len());

            let mut header = PgmHeader::new(PacketType::Odata, self.sport(), self.dport, self.gsi());
            header.options = hdr_flags
                | if chain.is_some() {
                    HDR_OPT_PRESENT | HDR_OPT_NETWORK
                } else {
                    0
                };
            header.tsdu_length = payload.len() as u16;
            let payload_offset = tpdu.len() - payload.len();
            let skb = Skb::from_tpdu(
                self.tsi,
                header,
                info,
                fragment,
                payload_offset,
                tpdu,
                Instant::now(),
            );
            self.txw.lock().push(skb, payload_sum);
            offset = end;

            // Close of a transmission group triggers proactive parity.
            if self.fec_params.is_some()
                && crate::fec::pkt_sqn(sequence, self.tg_sqn_shift)
                    == (1u32 << self.tg_sqn_shift) - 1
            {
                self.send_proactive_parity(tg_sqn(sequence, self.tg_sqn_shift), io);
            }
        }

        *pending = None;
        drop(pending);
        Ok(data.len())
    }

    /// Arm the heartbeat schedule after fresh data; returns the first
    /// deadline so the caller can pull the socket timer forward.
    pub fn reset_heartbeat(&self, now: Instant) -> Option<Instant> {
        let mut sched = self.schedule.lock();
        sched.heartbeat_idx = 0;
        let first = self.heartbeat.first()?;
        let deadline = now + *first;
        sched.next_heartbeat = Some(deadline);
        Some(deadline)
    }

    // ====================================================================
    // SPM
    // ====================================================================

    /// Emit one SPM. `fin` marks graceful shutdown; `target` selects a
    /// unicast destination (SPMR replies) over the group.
    fn emit_spm(&self, fin: bool, target: Option<IpAddr>, io: &IoCtx<'_>) {
        let (trail, lead) = {
            let txw = self.txw.lock();
            (txw.trail(), txw.lead())
        };
        let syn = {
            let mut sched = self.schedule.lock();
            if sched.syn_remaining > 0 {
                sched.syn_remaining -= 1;
                true
            } else {
                false
            }
        };

        let mut b = OptionsBuilder::new();
        if syn {
            b.syn();
        }
        if fin {
            b.fin();
        }
        if let Some(params) = &self.fec_params {
            let mut flags = 0u8;
            if params.ondemand_enabled {
                flags |= PARITY_PRM_OND;
            }
            if params.proactive_packets > 0 {
                flags |= PARITY_PRM_PRO;
            }
            b.parity_prm(&OptParityPrm {
                flags,
                tgs: u32::from(params.group_size),
            });
        }
        let chain = if b.is_empty() { None } else { Some(b.finish()) };

        let spm = SpmInfo {
            spm_sqn: self.spm_sqn.fetch_add(1, Ordering::AcqRel),
            trail,
            lead,
            nla: io.transport.nla(),
        };
        let tpdu = encode_spm(self.sport(), self.dport, self.gsi(), &spm, chain.as_deref());

        // OPT_SYN SPMs bypass the limiter so session startup is never
        // throttled behind data.
        if !syn {
            if let Some(wait) = io.try_rate(tpdu.len()) {
                log::debug!("[Source] SPM rate-limited for {:?}", wait);
                return;
            }
        }
        let result = match target {
            Some(addr) => io.transport.send_unicast(addr, &tpdu),
            None => io.transport.send_to_group(&tpdu),
        };
        match result {
            Ok(_) => {
                io.stats.count_sent(tpdu.len());
                io.stats.spms_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => log::debug!("[Source] SPM send failed: {}", e),
        }
    }

    /// Run the SPM schedules; returns the next SPM deadline.
    pub fn timer_tick(&self, now: Instant, io: &IoCtx<'_>) -> Option<Instant> {
        let (ambient_due, heartbeat_due) = {
            let sched = self.schedule.lock();
            (
                now >= sched.next_ambient,
                sched.next_heartbeat.is_some_and(|t| now >= t),
            )
        };

        if ambient_due || heartbeat_due {
            self.emit_spm(false, None, io);
        }

        let mut sched = self.schedule.lock();
        if ambient_due {
            sched.next_ambient = now + self.ambient_ivl;
        }
        if heartbeat_due {
            sched.heartbeat_idx += 1;
            sched.next_heartbeat = self
                .heartbeat
                .get(sched.heartbeat_idx)
                .map(|ivl| now + *ivl);
            if sched.next_heartbeat.is_none() {
                log::debug!("[Source] heartbeat schedule exhausted, ambient takes over");
            }
        }

        let mut deadline = sched.next_ambient;
        if let Some(hb) = sched.next_heartbeat {
            deadline = deadline.min(hb);
        }
        Some(deadline)
    }

    /// Emit the closing OPT_FIN heartbeats.
    pub fn emit_fin_spms(&self, io: &IoCtx<'_>) {
        for _ in 0..SPM_FIN_COUNT {
            self.emit_spm(true, None, io);
        }
    }

    // ====================================================================
    // Upstream packets
    // ====================================================================

    /// Process an inbound NAK: validate, confirm with an NCF, queue the
    /// repairs.
    pub fn handle_nak(
        &self,
        header: &PgmHeader,
        nak: &NakInfo,
        list: &[u32],
        group: IpAddr,
        io: &IoCtx<'_>,
    ) {
        io.stats.naks_received.fetch_add(1, Ordering::Relaxed);
        if nak.src_nla != io.transport.nla() || nak.grp_nla != group {
            log::debug!(
                "[Source] NAK with foreign NLAs (src {}, grp {}), dropped",
                nak.src_nla,
                nak.grp_nla
            );
            io.stats.malformed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // NCF goes out first, data available or not: it tells every
        // receiver the request was seen.
        let ncf = encode_nak(
            PacketType::Ncf,
            self.sport(),
            self.dport,
            self.gsi(),
            nak,
            list,
        );
        if io.try_rate(ncf.len()).is_none() {
            match io.transport.send_to_group(&ncf) {
                Ok(_) => {
                    io.stats.count_sent(ncf.len());
                    io.stats.ncfs_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => log::debug!("[Source] NCF send failed: {}", e),
            }
        }

        let is_parity = header.options & HDR_OPT_PARITY != 0;
        let mut txw = self.txw.lock();
        for &sequence in std::iter::once(&nak.sqn).chain(list) {
            if is_parity {
                txw.retransmit_push(
                    tg_sqn(sequence, self.tg_sqn_shift),
                    true,
                    self.tg_sqn_shift,
                );
            } else {
                txw.retransmit_push(sequence, false, 0);
            }
        }
    }

    /// N-NAKs are informational traffic from a DLR: counted, never
    /// retransmitted.
    pub fn handle_nnak(&self, io: &IoCtx<'_>) {
        io.stats.nnaks_received.fetch_add(1, Ordering::Relaxed);
    }

    /// A late joiner asked for window state; answer with a unicast SPM.
    pub fn handle_spmr(&self, from: IpAddr, io: &IoCtx<'_>) {
        io.stats.spmrs_received.fetch_add(1, Ordering::Relaxed);
        self.emit_spm(false, Some(from), io);
    }

    // ====================================================================
    // Repairs
    // ====================================================================

    /// Drain the retransmit queue into RDATA until empty or throttled.
    pub fn drain_repairs(&self, io: &IoCtx<'_>) -> RepairOutcome {
        loop {
            let peeked = self.txw.lock().retransmit_try_peek();
            let Some((request, packet)) = peeked else {
                return RepairOutcome::Idle;
            };

            match packet {
                Some((skb, payload_sum)) => {
                    let trail = self.txw.lock().trail();
                    let rdata = crate::protocol::reencode_rdata(
                        skb.tpdu(),
                        skb.payload_offset(),
                        trail,
                        payload_sum,
                    );
                    if let Some(wait) = io.try_rate(rdata.len()) {
                        return RepairOutcome::RateLimited(wait);
                    }
                    match io.transport.send_to_group(&rdata) {
                        Ok(_) => {
                            io.stats.count_sent(rdata.len());
                            io.stats.retransmits_sent.fetch_add(1, Ordering::Relaxed);
                            self.txw.lock().retransmit_remove_head();
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            return RepairOutcome::RateLimited(Duration::from_millis(1));
                        }
                        Err(e) => {
                            log::warn!(
                                "[Source] RDATA({}) send failed: {}, dropping request",
                                request.sequence,
                                e
                            );
                            self.txw.lock().retransmit_discard_head();
                        }
                    }
                }
                None => match self.send_ondemand_parity(request.sequence, io) {
                    Ok(true) => self.txw.lock().retransmit_remove_head(),
                    Ok(false) => {
                        return RepairOutcome::RateLimited(
                            io.rate.lock().time_until_available(1500),
                        );
                    }
                    Err(e) => {
                        log::warn!(
                            "[Source] parity repair for group {} failed: {}, dropping",
                            request.sequence,
                            e
                        );
                        self.txw.lock().retransmit_discard_head();
                    }
                },
            }
        }
    }

    // ====================================================================
    // Parity generation
    // ====================================================================

    fn parity_packets(&self, group: u32) -> Result<(Vec<Vec<u8>>, Vec<Vec<u8>>, u32), Error> {
        let Some(codec) = &self.fec else {
            return Err(Error::InvalidArgument);
        };
        let k = codec.k() as u32;
        let (payloads, parity_len, frag_blocks, op_encoded) = {
            let txw = self.txw.lock();
            let payloads = txw.group_payloads(group, k).ok_or(Error::Bounds)?;
            let parity_len = txw
                .group_parity_len(group, k, codec.var_pktlen())
                .ok_or(Error::Bounds)?;
            let mut frag_blocks = Vec::with_capacity(k as usize);
            let mut op_encoded = false;
            for i in 0..k {
                let entry = txw.peek(group.wrapping_add(i)).ok_or(Error::Bounds)?;
                op_encoded |= entry.skb.fragment.is_some();
                frag_blocks.push(encode_frag_block(entry.skb.fragment.as_ref()));
            }
            (payloads, parity_len, frag_blocks, op_encoded)
        };
        let parity = codec.encode_parity(&payloads, parity_len)?;
        let frag_parity = if op_encoded {
            codec.encode_blocks(&frag_blocks)?
        } else {
            Vec::new()
        };
        Ok((parity, frag_parity, k))
    }

    fn send_parity_packet(
        &self,
        packet_type: PacketType,
        group: u32,
        index: u8,
        parity: &[Vec<u8>],
        frag_parity: &[Vec<u8>],
        k: u32,
        io: &IoCtx<'_>,
    ) -> Result<bool, Error> {
        let Some(shard) = parity.get(index as usize) else {
            return Err(Error::Bounds);
        };
        let sequence = group.wrapping_add(k).wrapping_add(u32::from(index));
        let trail = self.txw.lock().trail();

        let mut b = OptionsBuilder::new();
        b.parity_grp(group);
        if let Some(block) = frag_parity.get(index as usize) {
            // Parity over the fragment headers rides in this packet's
            // own OPT_FRAGMENT fields, raw bytes and all.
            b.fragment(&frag_from_block(block));
        }
        let chain = b.finish();

        let mut hdr_flags = HDR_OPT_PARITY;
        if self.fec.as_ref().is_some_and(Fec::var_pktlen) {
            hdr_flags |= HDR_OPT_VAR_PKTLEN;
        }
        let (tpdu, _) = encode_data(
            packet_type,
            self.sport(),
            self.dport,
            self.gsi(),
            &DataInfo {
                data_sqn: sequence,
                data_trail: trail,
            },
            hdr_flags,
            Some(&chain),
            shard,
        );

        if io.try_rate(tpdu.len()).is_some() {
            return Ok(false);
        }
        match io.transport.send_to_group(&tpdu) {
            Ok(_) => {
                io.stats.count_sent(tpdu.len());
                io.stats.parity_sent.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(Error::System(e)),
        }
    }

    /// Proactive parity for a just-completed group (best effort).
    fn send_proactive_parity(&self, group: u32, io: &IoCtx<'_>) {
        let Some(params) = &self.fec_params else { return };
        if params.proactive_packets == 0 {
            return;
        }
        let (parity, frag_parity, k) = match self.parity_packets(group) {
            Ok(p) => p,
            Err(e) => {
                log::debug!("[Source] proactive parity for {} unavailable: {}", group, e);
                return;
            }
        };
        for index in 0..params.proactive_packets {
            match self.send_parity_packet(
                PacketType::Odata,
                group,
                index,
                &parity,
                &frag_parity,
                k,
                io,
            ) {
                Ok(true) => {}
                Ok(false) => {
                    log::debug!("[Source] proactive parity throttled at index {}", index);
                    break;
                }
                Err(e) => {
                    log::debug!("[Source] proactive parity send failed: {}", e);
                    break;
                }
            }
        }
        self.prune_parity_state();
    }

    /// One on-demand parity packet answering a parity NAK.
    ///
    /// Returns `Ok(false)` when throttled (the request stays queued).
    fn send_ondemand_parity(&self, group: u32, io: &IoCtx<'_>) -> Result<bool, Error> {
        let Some(params) = &self.fec_params else {
            return Err(Error::InvalidArgument);
        };
        if !params.ondemand_enabled {
            return Err(Error::InvalidArgument);
        }
        let (parity, frag_parity, k) = self.parity_packets(group)?;

        let index = {
            let mut state = self.ondemand_parity.lock();
            let next = state.entry(group).or_insert(params.proactive_packets);
            let total = (params.block_size - params.group_size).max(1);
            if *next >= total {
                // Every parity index spent; start over.
                *next = params.proactive_packets.min(total - 1);
            }
            let index = *next;
            *next += 1;
            index
        };

        let sent =
            self.send_parity_packet(PacketType::Rdata, group, index, &parity, &frag_parity, k, io)?;
        if sent {
            self.prune_parity_state();
        }
        Ok(sent)
    }

    /// Forget on-demand parity counters for groups behind the trail.
    fn prune_parity_state(&self) {
        let trail = self.txw.lock().trail();
        let mut state = self.ondemand_parity.lock();
        if state.len() > 64 {
            state.retain(|&group, _| !seq_lt(group, trail));
        }
    }

    /// Next SPM deadline without emitting anything.
    pub fn next_deadline(&self) -> Instant {
        let sched = self.schedule.lock();
        let mut deadline = sched.next_ambient;
        if let Some(hb) = sched.next_heartbeat {
            deadline = deadline.min(hb);
        }
        deadline
    }

    /// Pending repair work exists.
    pub fn has_repairs(&self) -> bool {
        self.txw.lock().has_retransmit_pending()
    }
}

/// Reinterpret a 12-byte parity block as OPT_FRAGMENT field values.
fn frag_from_block(block: &[u8]) -> OptFragment {
    debug_assert_eq!(block.len(), 12);
    OptFragment {
        first_sqn: u32::from_be_bytes([block[0], block[1], block[2], block[3]]),
        frag_off: u32::from_be_bytes([block[4], block[5], block[6], block[7]]),
        apdu_len: u32::from_be_bytes([block[8], block[9], block[10], block[11]]),
    }
}
