// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Receive window: per-source reassembly and loss-recovery state machine.
//!
//! A bounded ring of slots indexed by `sequence % capacity`. `trail` is
//! the oldest slot kept, `commit_lead` the next sequence to deliver,
//! `lead` the newest slot allocated. Missing sequences hold placeholder
//! slots driving the NAK state machine:
//!
//! ```text
//!             nak_bo_expiry              nak_rpt_expiry
//!  back-off ---------------> wait-NCF ---------------> wait-data
//!      ^                         |                         |
//!      |   retries remaining     | NCF arrives             | data arrives
//!      +-------------------------+                         v
//!      |                                          have-data / have-parity
//!      |                                                   |
//!      |                                                   v readv()
//!      |                                              commit-data
//!      +--- retries exhausted --> lost-data
//! ```
//!
//! Three FIFO queues (back-off, wait-NCF, wait-data) order the pending
//! recovery work. Entries are `(sequence, expiry)` pairs validated
//! lazily against the slot's current state, so a slot that moved on
//! simply leaves a stale entry behind to be skipped.
//!
//! Transmission groups: a parity packet claims the first missing slot of
//! its group (state have-parity) and is shuffled aside when the original
//! shows up. Once any `k` of the group's `n` packets are in, the
//! Reed-Solomon decoder rebuilds the missing originals, fragment headers
//! included.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::{PGM_MAX_APDU, PGM_MAX_FRAGMENTS};
use crate::fec::{pkt_sqn, tg_sqn, Fec, FecParams};
use crate::protocol::OptFragment;
use crate::skb::Skb;
use crate::window::seq::{seq_count, seq_gt, seq_gte, seq_in_window, seq_lt, seq_lte};

/// Outcome of feeding one packet (or confirmation) into the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxwStatus {
    /// Advanced `lead` by exactly one.
    Appended,
    /// Filled a waiting placeholder.
    Inserted,
    /// Refreshed existing recovery state (NCF path).
    Updated,
    /// Advanced `lead` past one or more gaps; placeholders created.
    Missing,
    /// Sequence already present with data.
    Duplicate,
    /// Framing or option invariant broken.
    Malformed,
    /// Sequence outside the window or beyond the allowed jump.
    Bounds,
}

/// Per-slot recovery state with its variant payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    BackOff { nak_bo_expiry: Instant },
    WaitNcf { nak_rpt_expiry: Instant },
    WaitData { nak_rdata_expiry: Instant },
    HaveData,
    HaveParity,
    CommitData,
    LostData,
}

impl SlotState {
    fn is_recovery(self) -> bool {
        matches!(
            self,
            SlotState::BackOff { .. } | SlotState::WaitNcf { .. } | SlotState::WaitData { .. }
        )
    }
}

/// Ring occupant: arrived data, shuffled-in parity, or a placeholder
/// still chasing its packet.
#[derive(Debug)]
struct RxSlot {
    sequence: u32,
    skb: Option<Skb>,
    state: SlotState,
    ncf_retry_count: u32,
    data_retry_count: u32,
}

/// Retry and interval knobs for the NAK state machine.
#[derive(Debug, Clone, Copy)]
pub struct NakConfig {
    pub bo_ivl: Duration,
    pub rpt_ivl: Duration,
    pub rdata_ivl: Duration,
    pub ncf_retries: u32,
    pub data_retries: u32,
}

/// Work produced by one timer sweep.
#[derive(Debug, Default)]
pub struct TimerSweep {
    /// Sequences whose back-off (or data wait) expired; a NAK is due.
    pub nak_list: Vec<u32>,
    /// Slots newly declared unrecoverable.
    pub newly_lost: usize,
}

/// One delivered APDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Apdu {
    pub first_sqn: u32,
    pub data: Vec<u8>,
}

/// Per-source receive window.
#[derive(Debug)]
pub struct ReceiveWindow {
    slots: Vec<Option<RxSlot>>,
    capacity: u32,

    is_defined: bool,
    /// NAKs are constrained until the advertised trail moves past the
    /// first observed sequence.
    is_constrained: bool,
    rxw_trail: u32,
    rxw_trail_init: u32,

    trail: u32,
    commit_lead: u32,
    lead: u32,

    backoff_queue: VecDeque<(u32, Instant)>,
    wait_ncf_queue: VecDeque<(u32, Instant)>,
    wait_data_queue: VecDeque<(u32, Instant)>,

    fec: Option<Fec>,
    tg_sqn_shift: u32,

    /// Cumulative unrecovered sequences over the window's lifetime.
    pub cumulative_losses: u64,
    /// TSDU bytes currently held.
    pub size: usize,
    /// Data became deliverable (or loss observable) since last cleared.
    pub has_event: bool,
}

impl ReceiveWindow {
    pub fn new(sqns: u32, fec_params: Option<&FecParams>) -> Self {
        assert!(sqns > 0, "window must hold at least one sequence");
        let fec = fec_params.and_then(|p| Fec::new(p).ok());
        let tg_sqn_shift = if fec.is_some() {
            fec_params.map_or(0, FecParams::tg_sqn_shift)
        } else {
            0
        };
        let mut slots = Vec::with_capacity(sqns as usize);
        slots.resize_with(sqns as usize, || None);
        Self {
            slots,
            capacity: sqns,
            is_defined: false,
            is_constrained: true,
            rxw_trail: 0,
            rxw_trail_init: 0,
            trail: 0,
            commit_lead: 0,
            lead: 0,
            backoff_queue: VecDeque::new(),
            wait_ncf_queue: VecDeque::new(),
            wait_data_queue: VecDeque::new(),
            fec,
            tg_sqn_shift,
            cumulative_losses: 0,
            size: 0,
            has_event: false,
        }
    }

    /// Adopt FEC parameters advertised by the source (OPT_PARITY_PRM).
    ///
    /// Only honored before the window holds anything; regrouping live
    /// slots under a different shift is not possible.
    pub fn enable_fec(&mut self, params: &FecParams) -> bool {
        if self.fec.is_some() || (self.is_defined && !self.is_empty()) {
            return false;
        }
        match Fec::new(params) {
            Ok(fec) => {
                self.tg_sqn_shift = params.tg_sqn_shift();
                self.fec = Some(fec);
                true
            }
            Err(_) => false,
        }
    }

    /// FEC negotiated for this window.
    pub fn fec_enabled(&self) -> bool {
        self.fec.is_some()
    }

    // ====================================================================
    // Edges and basic queries
    // ====================================================================

    pub fn trail(&self) -> u32 {
        self.trail
    }

    pub fn lead(&self) -> u32 {
        self.lead
    }

    pub fn commit_lead(&self) -> u32 {
        self.commit_lead
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn len(&self) -> u32 {
        if !self.is_defined {
            return 0;
        }
        seq_count(self.trail, self.lead)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    fn next_lead(&self) -> u32 {
        self.lead.wrapping_add(1)
    }

    fn index(&self, sequence: u32) -> usize {
        (sequence % self.capacity) as usize
    }

    fn slot(&self, sequence: u32) -> Option<&RxSlot> {
        if !self.is_defined || self.is_empty() || !seq_in_window(sequence, self.trail, self.lead)
        {
            return None;
        }
        self.slots[self.index(sequence)]
            .as_ref()
            .filter(|s| s.sequence == sequence)
    }

    fn slot_mut(&mut self, sequence: u32) -> Option<&mut RxSlot> {
        if !self.is_defined || self.is_empty() || !seq_in_window(sequence, self.trail, self.lead)
        {
            return None;
        }
        let idx = self.index(sequence);
        self.slots[idx].as_mut().filter(|s| s.sequence == sequence)
    }

    fn state_of(&self, sequence: u32) -> Option<SlotState> {
        self.slot(sequence).map(|s| s.state)
    }

    /// Current state of a slot, if allocated.
    pub fn peek_state(&self, sequence: u32) -> Option<SlotState> {
        self.state_of(sequence)
    }

    /// Count of slots currently in commit-data.
    pub fn committed_count(&self) -> u32 {
        if !self.is_defined {
            return 0;
        }
        self.commit_lead.wrapping_sub(self.trail)
    }

    fn incoming_is_empty(&self) -> bool {
        !self.is_defined || seq_gt(self.commit_lead, self.lead)
    }

    fn tg_of(&self, sequence: u32) -> u32 {
        tg_sqn(sequence, self.tg_sqn_shift)
    }

    fn is_last_of_tg(&self, sequence: u32) -> bool {
        pkt_sqn(sequence, self.tg_sqn_shift) == (1u32 << self.tg_sqn_shift) - 1
    }

    // ====================================================================
    // add
    // ====================================================================

    /// Feed one ODATA/RDATA packet into the window.
    ///
    /// The first packet from a new peer defines the window. `nak_bo_expiry`
    /// seeds the back-off deadline of any placeholder this packet creates.
    pub fn add(&mut self, mut skb: Skb, now: Instant, nak_bo_expiry: Instant) -> RxwStatus {
        let _ = now;
        // Protocol sanity: advertised trail within half the space.
        if skb.sequence.wrapping_sub(skb.data.data_trail) >= (u32::MAX / 2) - 1 {
            return RxwStatus::Malformed;
        }
        if !skb.is_parity() {
            skb.normalize_single_fragment();
            if let Some(frag) = skb.fragment {
                if (frag.apdu_len as usize) < skb.len()
                    || seq_gt(frag.first_sqn, skb.sequence)
                    || frag.apdu_len as usize > PGM_MAX_APDU
                {
                    return RxwStatus::Malformed;
                }
            }
        }

        if !self.is_defined {
            self.define(skb.sequence.wrapping_sub(1));
        } else {
            self.update_trail(skb.data.data_trail);
        }

        if skb.is_parity() {
            return self.add_parity(skb, nak_bo_expiry);
        }

        if seq_lt(skb.sequence, self.commit_lead) {
            return if seq_gte(skb.sequence, self.trail) {
                RxwStatus::Duplicate
            } else {
                RxwStatus::Bounds
            };
        }

        if seq_lte(skb.sequence, self.lead) {
            self.has_event = true;
            return self.insert(skb);
        }

        if skb.sequence == self.next_lead() {
            self.has_event = true;
            return self.append(skb);
        }

        let status = self.add_placeholder_range(skb.sequence, nak_bo_expiry);
        if status != RxwStatus::Appended {
            return status;
        }
        self.has_event = true;
        match self.append(skb) {
            RxwStatus::Appended => RxwStatus::Missing,
            other => other,
        }
    }

    /// First packet of a session defines the window edges.
    fn define(&mut self, previous_lead: u32) {
        debug_assert!(!self.is_defined);
        self.lead = previous_lead;
        let first = previous_lead.wrapping_add(1);
        self.trail = first;
        self.commit_lead = first;
        self.rxw_trail = first;
        self.rxw_trail_init = first;
        self.is_defined = true;
        self.is_constrained = true;
    }

    /// Slide the trailing edge per an advertised transmit trail.
    fn update_trail(&mut self, txw_trail: u32) {
        if seq_lte(txw_trail, self.rxw_trail) {
            return;
        }
        // Advertised trail jumping more than half the space is bogus.
        if txw_trail.wrapping_sub(self.rxw_trail) >= (u32::MAX / 2) - 1 {
            return;
        }
        // Constrained until the advertised trail passes the first data
        // sequence: repairs for the pre-join era cannot be requested.
        if self.is_constrained {
            if seq_gt(txw_trail, self.rxw_trail_init) {
                self.is_constrained = false;
            } else {
                return;
            }
        }
        self.rxw_trail = txw_trail;

        if seq_lte(self.rxw_trail, self.trail) {
            return;
        }

        if self.is_empty() {
            // Nothing held: jump every edge forward, accounting the gap.
            let distance = u64::from(self.rxw_trail.wrapping_sub(self.trail));
            self.cumulative_losses += distance;
            self.trail = self.rxw_trail;
            self.commit_lead = self.rxw_trail;
            self.lead = self.rxw_trail.wrapping_sub(1);
            return;
        }

        // Declare unrecovered slots behind the new trail lost.
        let mut sequence = self.commit_lead;
        while seq_gt(self.rxw_trail, sequence) && seq_gte(self.lead, sequence) {
            let is_recovery = self
                .state_of(sequence)
                .is_some_and(SlotState::is_recovery);
            if is_recovery {
                self.declare_lost(sequence);
                self.has_event = true;
            }
            sequence = sequence.wrapping_add(1);
        }
    }

    /// Update window edges from an SPM.
    ///
    /// Returns the number of placeholders created (NAK state machines
    /// started). Defines the window when this is the first traffic seen.
    pub fn update(&mut self, txw_lead: u32, txw_trail: u32, nak_bo_expiry: Instant) -> usize {
        if !self.is_defined {
            self.define(txw_lead);
            return 0;
        }
        self.update_trail(txw_trail);
        self.update_lead(txw_lead, nak_bo_expiry)
    }

    fn update_lead(&mut self, txw_lead: u32, nak_bo_expiry: Instant) -> usize {
        if seq_lte(txw_lead, self.lead) {
            return 0;
        }
        // Committed packets pin the trail; cap the lead so the ring
        // cannot overwrite them.
        let lead = if self.committed_count() > 0
            && txw_lead.wrapping_sub(self.trail) >= self.capacity
        {
            let capped = self.trail.wrapping_add(self.capacity - 1);
            if capped == self.lead {
                return 0;
            }
            capped
        } else {
            txw_lead
        };

        let mut added = 0usize;
        while self.lead != lead {
            if self.is_full() {
                self.remove_trail();
            }
            self.add_placeholder(nak_bo_expiry);
            added += 1;
        }
        added
    }

    fn add_placeholder(&mut self, nak_bo_expiry: Instant) {
        debug_assert!(!self.is_full());
        self.lead = self.next_lead();
        let idx = self.index(self.lead);
        self.slots[idx] = Some(RxSlot {
            sequence: self.lead,
            skb: None,
            state: SlotState::BackOff { nak_bo_expiry },
            ncf_retry_count: 0,
            data_retry_count: 0,
        });
        self.backoff_queue.push_back((self.lead, nak_bo_expiry));
    }

    /// Grow the window with placeholders up to but excluding `sequence`.
    fn add_placeholder_range(&mut self, sequence: u32, nak_bo_expiry: Instant) -> RxwStatus {
        debug_assert!(seq_gt(sequence, self.lead));
        // A committed backlog large enough to collide with the new lead
        // means a slow consumer: bound the window instead of growing.
        let new_commit_sqns = sequence.wrapping_add(1).wrapping_sub(self.trail);
        if self.committed_count() > 0 && new_commit_sqns >= self.capacity {
            self.update_lead(sequence, nak_bo_expiry);
            return RxwStatus::Bounds;
        }
        while self.next_lead() != sequence {
            if self.is_full() {
                self.remove_trail();
            }
            self.add_placeholder(nak_bo_expiry);
        }
        if self.is_full() {
            self.remove_trail();
        }
        RxwStatus::Appended
    }

    /// Packet advances the leading edge by one.
    fn append(&mut self, skb: Skb) -> RxwStatus {
        debug_assert_eq!(skb.sequence, self.next_lead());
        if self.invalid_var_pktlen(&skb) || self.invalid_payload_op(&skb) {
            return RxwStatus::Malformed;
        }
        if self.is_full() {
            self.remove_trail();
        }
        self.lead = self.next_lead();

        // Later fragments of an APDU already declared lost drop on
        // arrival.
        if skb.fragment.is_some() && self.is_apdu_already_lost(&skb) {
            let sequence = skb.sequence;
            let idx = self.index(sequence);
            self.slots[idx] = Some(RxSlot {
                sequence,
                skb: None,
                state: SlotState::LostData,
                ncf_retry_count: 0,
                data_retry_count: 0,
            });
            self.cumulative_losses += 1;
            return RxwStatus::Bounds;
        }

        let state = if skb.is_parity() {
            SlotState::HaveParity
        } else {
            SlotState::HaveData
        };
        self.size += skb.len();
        let idx = self.index(skb.sequence);
        self.slots[idx] = Some(RxSlot {
            sequence: skb.sequence,
            skb: Some(skb),
            state,
            ncf_retry_count: 0,
            data_retry_count: 0,
        });
        RxwStatus::Appended
    }

    /// Packet fills (or duplicates) an existing slot.
    fn insert(&mut self, skb: Skb) -> RxwStatus {
        if self.invalid_var_pktlen(&skb) || self.invalid_payload_op(&skb) {
            return RxwStatus::Malformed;
        }
        let sequence = skb.sequence;
        let Some(state) = self.state_of(sequence) else {
            return RxwStatus::Bounds;
        };

        match state {
            SlotState::HaveData | SlotState::CommitData => return RxwStatus::Duplicate,
            SlotState::HaveParity => self.shuffle_parity(sequence),
            SlotState::LostData
            | SlotState::BackOff { .. }
            | SlotState::WaitNcf { .. }
            | SlotState::WaitData { .. } => {}
        }

        if skb.fragment.is_some() && self.is_apdu_already_lost(&skb) {
            self.declare_lost(sequence);
            return RxwStatus::Bounds;
        }

        if state == SlotState::LostData {
            log::debug!("[RxWindow] late repair recovered lost sequence {}", sequence);
        }
        self.size += skb.len();
        let group = self.tg_of(sequence);
        let idx = self.index(sequence);
        self.slots[idx] = Some(RxSlot {
            sequence,
            skb: Some(skb),
            state: SlotState::HaveData,
            ncf_retry_count: 0,
            data_retry_count: 0,
        });
        if self.fec.is_some() {
            self.try_reconstruct(group);
        }
        RxwStatus::Inserted
    }

    // ====================================================================
    // Parity handling
    // ====================================================================

    /// A parity packet claims the first missing slot of its group.
    fn add_parity(&mut self, skb: Skb, nak_bo_expiry: Instant) -> RxwStatus {
        if self.fec.is_none() {
            log::debug!("[RxWindow] parity packet without negotiated FEC, dropped");
            return RxwStatus::Malformed;
        }
        let group = skb.parity_group.unwrap_or_else(|| self.tg_of(skb.sequence));
        if pkt_sqn(group, self.tg_sqn_shift) != 0 {
            return RxwStatus::Malformed;
        }
        let group_last = group.wrapping_add((1u32 << self.tg_sqn_shift) - 1);

        if seq_lt(group, self.tg_of(self.commit_lead)) {
            return RxwStatus::Duplicate;
        }
        // Extend the window so every original of the group has a slot.
        if seq_gt(group_last, self.lead) {
            let status =
                self.add_placeholder_range(group_last.wrapping_add(1), nak_bo_expiry);
            if status != RxwStatus::Appended {
                return status;
            }
        }

        let Some(missing) = self.find_missing(group) else {
            return RxwStatus::Duplicate;
        };
        self.has_event = true;
        self.size += skb.len();
        let idx = self.index(missing);
        self.slots[idx] = Some(RxSlot {
            sequence: missing,
            skb: Some(skb),
            state: SlotState::HaveParity,
            ncf_retry_count: 0,
            data_retry_count: 0,
        });
        self.try_reconstruct(group);
        RxwStatus::Inserted
    }

    /// First slot of the group still chasing data, if any.
    fn find_missing(&self, group: u32) -> Option<u32> {
        let k = 1u32 << self.tg_sqn_shift;
        (0..k).map(|i| group.wrapping_add(i)).find(|&seq| {
            matches!(
                self.state_of(seq),
                Some(
                    SlotState::BackOff { .. }
                        | SlotState::WaitNcf { .. }
                        | SlotState::WaitData { .. }
                        | SlotState::LostData
                )
            )
        })
    }

    /// Move a parity packet out of a slot whose original arrived.
    fn shuffle_parity(&mut self, sequence: u32) {
        let parity_skb = self.slot_mut(sequence).and_then(|slot| slot.skb.take());
        let Some(parity_skb) = parity_skb else { return };
        let group = self.tg_of(sequence);
        let k = 1u32 << self.tg_sqn_shift;
        let target = (0..k).map(|i| group.wrapping_add(i)).find(|&seq| {
            seq != sequence
                && matches!(
                    self.state_of(seq),
                    Some(
                        SlotState::BackOff { .. }
                            | SlotState::WaitNcf { .. }
                            | SlotState::WaitData { .. }
                            | SlotState::LostData
                    )
                )
        });
        match target {
            Some(seq) => {
                let idx = self.index(seq);
                self.slots[idx] = Some(RxSlot {
                    sequence: seq,
                    skb: Some(parity_skb),
                    state: SlotState::HaveParity,
                    ncf_retry_count: 0,
                    data_retry_count: 0,
                });
            }
            None => {
                // Group is whole without it; parity is surplus.
                self.size -= parity_skb.len();
            }
        }
    }

    /// Decode the group once any `k` of its `n` packets are present.
    ///
    /// Returns whether missing originals were filled in.
    fn try_reconstruct(&mut self, group: u32) -> bool {
        let (k, n) = match self.fec.as_ref() {
            Some(f) => (f.k(), f.n()),
            None => return false,
        };
        if seq_lt(group, self.trail) {
            return false;
        }

        // Phase 1: snapshot the group.
        let mut shards: Vec<Option<Vec<u8>>> = vec![None; n];
        let mut frag_shards: Vec<Option<Vec<u8>>> = vec![None; n];
        let mut have = 0usize;
        let mut missing_any = false;
        let mut parity_len = 0usize;
        let mut op_encoded = false;
        for i in 0..k as u32 {
            let seq = group.wrapping_add(i);
            let Some(slot) = self.slot(seq) else {
                missing_any = true;
                continue;
            };
            match (slot.state, slot.skb.as_ref()) {
                (SlotState::HaveData | SlotState::CommitData, Some(skb)) => {
                    have += 1;
                    shards[i as usize] = Some(skb.payload().to_vec());
                    frag_shards[i as usize] = Some(encode_frag_block(skb.fragment.as_ref()));
                    op_encoded |= skb.fragment.is_some();
                }
                (SlotState::HaveParity, Some(skb)) => {
                    have += 1;
                    missing_any = true;
                    parity_len = skb.len();
                    let pkt = skb
                        .sequence
                        .wrapping_sub(group.wrapping_add(k as u32))
                        as usize;
                    if k + pkt < n {
                        shards[k + pkt] = Some(skb.payload().to_vec());
                        frag_shards[k + pkt] =
                            Some(encode_frag_block(skb.fragment.as_ref()));
                        op_encoded |= skb.fragment.is_some();
                    } else {
                        log::debug!(
                            "[RxWindow] parity packet {} outside geometry n={}",
                            skb.sequence,
                            n
                        );
                        have -= 1;
                    }
                }
                _ => missing_any = true,
            }
        }
        if !missing_any || have < k || parity_len == 0 {
            return false;
        }

        // Phase 2: pad and decode inside one immutable borrow of the codec.
        let mut corrupt = false;
        let mut recovered: Vec<(u32, Vec<u8>, Option<OptFragment>)> = Vec::new();
        {
            let Some(fec) = self.fec.as_ref() else {
                return false;
            };
            for shard in shards.iter_mut() {
                let Some(bytes) = shard else { continue };
                if bytes.len() == parity_len {
                    continue;
                }
                if !fec.shard_fits(bytes.len(), parity_len) {
                    corrupt = true;
                    break;
                }
                let payload = std::mem::take(bytes);
                *shard = Some(fec.pad_shard(&payload, parity_len));
            }
            if !corrupt && fec.reconstruct(&mut shards).is_err() {
                return false;
            }
            if !corrupt {
                let _ = fec.reconstruct(&mut frag_shards);
                for i in 0..k as u32 {
                    let seq = group.wrapping_add(i);
                    let filled = matches!(
                        self.state_of(seq),
                        Some(SlotState::HaveData | SlotState::CommitData)
                    );
                    if filled {
                        continue;
                    }
                    let Some(shard) = shards[i as usize].take() else {
                        corrupt = true;
                        break;
                    };
                    match fec.recovered_payload(shard) {
                        Ok(payload) => {
                            let fragment = if op_encoded {
                                frag_shards[i as usize]
                                    .take()
                                    .and_then(|b| decode_frag_block(&b))
                            } else {
                                None
                            };
                            recovered.push((seq, payload, fragment));
                        }
                        Err(_) => {
                            corrupt = true;
                            break;
                        }
                    }
                }
            }
        }
        if corrupt {
            log::warn!(
                "[RxWindow] dropping unrecoverable transmission group {}",
                group
            );
            self.drop_group(group);
            return false;
        }

        // Phase 3: install the recovered originals.
        let tsi = self.group_tsi(group);
        let now = recovered_timestamp(self, group);
        for (seq, payload, fragment) in recovered {
            let old_len = self
                .slot_mut(seq)
                .and_then(|s| s.skb.take())
                .map_or(0, |s| s.len());
            self.size -= old_len;
            let mut skb = Skb::reconstructed(tsi, seq, payload, fragment, now);
            skb.normalize_single_fragment();
            self.size += skb.len();
            let idx = self.index(seq);
            self.slots[idx] = Some(RxSlot {
                sequence: seq,
                skb: Some(skb),
                state: SlotState::HaveData,
                ncf_retry_count: 0,
                data_retry_count: 0,
            });
        }
        self.has_event = true;
        log::debug!("[RxWindow] reconstructed transmission group {}", group);
        true
    }

    /// Declare every unfilled slot of a corrupt group lost.
    fn drop_group(&mut self, group: u32) {
        let k = 1u32 << self.tg_sqn_shift;
        for i in 0..k {
            let seq = group.wrapping_add(i);
            let doomed = matches!(
                self.state_of(seq),
                Some(
                    SlotState::BackOff { .. }
                        | SlotState::WaitNcf { .. }
                        | SlotState::WaitData { .. }
                        | SlotState::HaveParity
                )
            );
            if doomed {
                self.declare_lost(seq);
            }
        }
        self.has_event = true;
    }

    fn group_tsi(&self, group: u32) -> crate::protocol::Tsi {
        let k = 1u32 << self.tg_sqn_shift;
        for i in 0..k {
            if let Some(slot) = self.slot(group.wrapping_add(i)) {
                if let Some(skb) = &slot.skb {
                    return skb.tsi;
                }
            }
        }
        crate::protocol::Tsi::new(crate::protocol::Gsi([0; 6]), 0)
    }

    fn invalid_var_pktlen(&self, skb: &Skb) -> bool {
        if self.fec.is_none() || skb.is_var_pktlen() {
            return false;
        }
        let group = self.tg_of(skb.sequence);
        if group == skb.sequence {
            return false;
        }
        match self.slot(group).and_then(|s| s.skb.as_ref()) {
            Some(first) => {
                !first.is_parity() && !first.is_var_pktlen() && first.len() != skb.len()
            }
            None => false,
        }
    }

    fn invalid_payload_op(&self, skb: &Skb) -> bool {
        if self.fec.is_none() || skb.is_parity() {
            return false;
        }
        let group = self.tg_of(skb.sequence);
        if group == skb.sequence {
            return false;
        }
        match self.slot(group).and_then(|s| s.skb.as_ref()) {
            Some(first) if !first.is_parity() => {
                first.fragment.is_some() != skb.fragment.is_some()
            }
            _ => false,
        }
    }

    /// An earlier fragment of this packet's APDU is already lost.
    fn is_apdu_already_lost(&self, skb: &Skb) -> bool {
        let Some(frag) = skb.fragment else {
            return false;
        };
        if frag.first_sqn == skb.sequence {
            return false;
        }
        match self.state_of(frag.first_sqn) {
            Some(SlotState::LostData) => true,
            Some(_) => false,
            // First fragment slid out of the window entirely.
            None => seq_lt(frag.first_sqn, self.trail),
        }
    }

    // ====================================================================
    // Trail removal
    // ====================================================================

    /// Remove the slot at `trail`.
    ///
    /// Crossing `commit_lead` evicts an undelivered sequence, which is a
    /// loss unless the slot was already accounted as lost.
    fn remove_trail(&mut self) {
        debug_assert!(!self.is_empty());
        let idx = self.index(self.trail);
        let slot = self.slots[idx].take();
        let mut was_lost = false;
        if let Some(slot) = slot {
            if let Some(skb) = &slot.skb {
                self.size -= skb.len();
            }
            was_lost = slot.state == SlotState::LostData;
        }
        if self.trail == self.commit_lead {
            self.commit_lead = self.commit_lead.wrapping_add(1);
            if !was_lost {
                self.cumulative_losses += 1;
            }
        }
        self.trail = self.trail.wrapping_add(1);
    }

    /// Release committed slots whose transmission group has fully
    /// committed (with FEC off every committed slot qualifies).
    pub fn remove_commit(&mut self) {
        while self.committed_count() > 0 {
            let group_end = self
                .tg_of(self.trail)
                .wrapping_add((1u32 << self.tg_sqn_shift) - 1);
            if seq_gte(group_end, self.commit_lead) {
                break;
            }
            self.remove_trail();
        }
    }

    // ====================================================================
    // Lost marking
    // ====================================================================

    fn declare_lost(&mut self, sequence: u32) {
        let removed_len = {
            let Some(slot) = self.slot_mut(sequence) else {
                return;
            };
            if matches!(slot.state, SlotState::LostData | SlotState::CommitData) {
                return;
            }
            slot.state = SlotState::LostData;
            slot.skb.take().map_or(0, |skb| skb.len())
        };
        self.size -= removed_len;
        self.cumulative_losses += 1;
    }

    /// Externally mark a sequence unrecoverable.
    ///
    /// Only meaningful while the slot is chasing recovery; data that
    /// already arrived is not "lost".
    pub fn lost(&mut self, sequence: u32) -> bool {
        if self.state_of(sequence).is_some_and(SlotState::is_recovery) {
            self.declare_lost(sequence);
            self.has_event = true;
            true
        } else {
            false
        }
    }

    // ====================================================================
    // NCF confirmation
    // ====================================================================

    /// Process an NCF: the source saw a NAK for this sequence.
    pub fn confirm(
        &mut self,
        sequence: u32,
        nak_rdata_expiry: Instant,
        nak_bo_expiry: Instant,
    ) -> RxwStatus {
        if !self.is_defined {
            return RxwStatus::Bounds;
        }
        if seq_lt(sequence, self.commit_lead) {
            return if seq_gte(sequence, self.trail) {
                RxwStatus::Duplicate
            } else {
                RxwStatus::Bounds
            };
        }
        if seq_gt(sequence, self.lead) {
            // NCF ahead of everything seen: extend the window and wait
            // for the repair directly.
            let status = self.add_placeholder_range(sequence.wrapping_add(1), nak_bo_expiry);
            if status != RxwStatus::Appended {
                return status;
            }
            if let Some(slot) = self.slot_mut(sequence) {
                slot.state = SlotState::WaitData { nak_rdata_expiry };
            }
            self.wait_data_queue.push_back((sequence, nak_rdata_expiry));
            return RxwStatus::Appended;
        }

        match self.state_of(sequence) {
            Some(SlotState::BackOff { .. } | SlotState::WaitNcf { .. }) => {
                if let Some(slot) = self.slot_mut(sequence) {
                    slot.state = SlotState::WaitData { nak_rdata_expiry };
                }
                self.wait_data_queue.push_back((sequence, nak_rdata_expiry));
                RxwStatus::Updated
            }
            Some(_) => RxwStatus::Duplicate,
            None => RxwStatus::Bounds,
        }
    }

    // ====================================================================
    // Timer sweep
    // ====================================================================

    /// Advance the NAK state machine to `now`.
    ///
    /// Returns the sequences for which a NAK is now due and how many
    /// slots ran out of retries.
    pub fn update_timers(&mut self, now: Instant, cfg: &NakConfig) -> TimerSweep {
        let mut sweep = TimerSweep::default();

        // back-off -> wait-NCF: the NAK goes on the wire.
        loop {
            let Some(&(sequence, expiry)) = self.backoff_queue.front() else {
                break;
            };
            let valid = matches!(
                self.state_of(sequence),
                Some(SlotState::BackOff { nak_bo_expiry }) if nak_bo_expiry == expiry
            );
            if !valid {
                self.backoff_queue.pop_front();
                continue;
            }
            if expiry > now {
                break;
            }
            self.backoff_queue.pop_front();
            let nak_rpt_expiry = now + cfg.rpt_ivl;
            if let Some(slot) = self.slot_mut(sequence) {
                slot.state = SlotState::WaitNcf { nak_rpt_expiry };
            }
            self.wait_ncf_queue.push_back((sequence, nak_rpt_expiry));
            sweep.nak_list.push(sequence);
        }

        // wait-NCF -> back-off (retry) or lost-data (exhausted).
        loop {
            let Some(&(sequence, expiry)) = self.wait_ncf_queue.front() else {
                break;
            };
            let valid = matches!(
                self.state_of(sequence),
                Some(SlotState::WaitNcf { nak_rpt_expiry }) if nak_rpt_expiry == expiry
            );
            if !valid {
                self.wait_ncf_queue.pop_front();
                continue;
            }
            if expiry > now {
                break;
            }
            self.wait_ncf_queue.pop_front();
            let exhausted = self
                .slot(sequence)
                .is_none_or(|s| s.ncf_retry_count + 1 > cfg.ncf_retries);
            if exhausted {
                log::debug!("[RxWindow] sequence {} lost: NCF retries exhausted", sequence);
                self.declare_lost(sequence);
                self.has_event = true;
                sweep.newly_lost += 1;
            } else {
                let nak_bo_expiry = now + cfg.bo_ivl;
                if let Some(slot) = self.slot_mut(sequence) {
                    slot.ncf_retry_count += 1;
                    slot.state = SlotState::BackOff { nak_bo_expiry };
                }
                self.backoff_queue.push_back((sequence, nak_bo_expiry));
            }
        }

        // wait-data -> wait-NCF (re-request) or lost-data (exhausted).
        loop {
            let Some(&(sequence, expiry)) = self.wait_data_queue.front() else {
                break;
            };
            let valid = matches!(
                self.state_of(sequence),
                Some(SlotState::WaitData { nak_rdata_expiry }) if nak_rdata_expiry == expiry
            );
            if !valid {
                self.wait_data_queue.pop_front();
                continue;
            }
            if expiry > now {
                break;
            }
            self.wait_data_queue.pop_front();
            let exhausted = self
                .slot(sequence)
                .is_none_or(|s| s.data_retry_count + 1 > cfg.data_retries);
            if exhausted {
                log::debug!(
                    "[RxWindow] sequence {} lost: RDATA retries exhausted",
                    sequence
                );
                self.declare_lost(sequence);
                self.has_event = true;
                sweep.newly_lost += 1;
            } else {
                let nak_rpt_expiry = now + cfg.rpt_ivl;
                if let Some(slot) = self.slot_mut(sequence) {
                    slot.data_retry_count += 1;
                    slot.state = SlotState::WaitNcf { nak_rpt_expiry };
                }
                self.wait_ncf_queue.push_back((sequence, nak_rpt_expiry));
                sweep.nak_list.push(sequence);
            }
        }

        sweep
    }

    /// Earliest pending state-machine deadline, if any.
    pub fn next_timer_deadline(&mut self) -> Option<Instant> {
        self.prune_stale_backoff();
        self.prune_stale_wait_ncf();
        self.prune_stale_wait_data();
        let heads = [
            self.backoff_queue.front().map(|&(_, t)| t),
            self.wait_ncf_queue.front().map(|&(_, t)| t),
            self.wait_data_queue.front().map(|&(_, t)| t),
        ];
        heads.into_iter().flatten().min()
    }

    fn prune_stale_backoff(&mut self) {
        while let Some(&(sequence, expiry)) = self.backoff_queue.front() {
            let valid = matches!(
                self.state_of(sequence),
                Some(SlotState::BackOff { nak_bo_expiry }) if nak_bo_expiry == expiry
            );
            if valid {
                break;
            }
            self.backoff_queue.pop_front();
        }
    }

    fn prune_stale_wait_ncf(&mut self) {
        while let Some(&(sequence, expiry)) = self.wait_ncf_queue.front() {
            let valid = matches!(
                self.state_of(sequence),
                Some(SlotState::WaitNcf { nak_rpt_expiry }) if nak_rpt_expiry == expiry
            );
            if valid {
                break;
            }
            self.wait_ncf_queue.pop_front();
        }
    }

    fn prune_stale_wait_data(&mut self) {
        while let Some(&(sequence, expiry)) = self.wait_data_queue.front() {
            let valid = matches!(
                self.state_of(sequence),
                Some(SlotState::WaitData { nak_rdata_expiry }) if nak_rdata_expiry == expiry
            );
            if valid {
                break;
            }
            self.wait_data_queue.pop_front();
        }
    }

    // ====================================================================
    // readv
    // ====================================================================

    /// Deliver contiguous APDUs starting at `commit_lead`.
    ///
    /// An empty result is end-of-window: nothing contiguous yet, or a
    /// loss boundary was just consumed (observable through
    /// [`cumulative_losses`](Self::cumulative_losses)).
    pub fn readv(&mut self, max_apdus: usize) -> Vec<Apdu> {
        let mut apdus = Vec::new();
        if max_apdus == 0 {
            return apdus;
        }
        // Release previously committed groups before reading more.
        self.remove_commit();

        while apdus.len() < max_apdus && !self.incoming_is_empty() {
            let head = self.commit_lead;
            let Some(state) = self.state_of(head) else {
                break;
            };
            match state {
                SlotState::HaveData => {
                    let first_sqn = self
                        .slot(head)
                        .and_then(|s| s.skb.as_ref())
                        .map_or(head, Skb::apdu_first_sqn);
                    if self.is_apdu_complete(first_sqn) {
                        match self.read_apdu() {
                            Some(apdu) => apdus.push(apdu),
                            None => break,
                        }
                    } else if self.state_of(self.commit_lead) == Some(SlotState::HaveData) {
                        // Genuinely pending; stop here.
                        break;
                    }
                    // Else the completeness check reclassified the head
                    // (loss); loop to surface the boundary.
                }
                SlotState::LostData => {
                    if apdus.is_empty() {
                        self.consume_loss_boundary();
                    }
                    break;
                }
                SlotState::HaveParity
                | SlotState::BackOff { .. }
                | SlotState::WaitNcf { .. }
                | SlotState::WaitData { .. } => {
                    // A recoverable group covering the head may unblock it.
                    if self.fec.is_some() && self.try_reconstruct(self.tg_of(head)) {
                        continue;
                    }
                    break;
                }
                SlotState::CommitData => break,
            }
        }
        apdus
    }

    /// Drop the contiguous lost run at the head of the incoming window.
    fn consume_loss_boundary(&mut self) {
        // Committed slots pinning the trail flush first.
        while self.committed_count() > 0 {
            self.remove_trail();
        }
        while self.state_of(self.commit_lead) == Some(SlotState::LostData) {
            debug_assert_eq!(self.trail, self.commit_lead);
            self.remove_trail();
        }
    }

    /// Commit and concatenate one complete APDU at `commit_lead`.
    fn read_apdu(&mut self) -> Option<Apdu> {
        let first_sqn = self.commit_lead;
        let apdu_len = {
            let skb = self.slot(first_sqn)?.skb.as_ref()?;
            debug_assert_eq!(skb.apdu_first_sqn(), first_sqn);
            skb.apdu_len()
        };
        let mut data = Vec::with_capacity(apdu_len);
        loop {
            let head = self.commit_lead;
            {
                let slot = self.slot_mut(head)?;
                let skb = slot.skb.as_ref()?;
                data.extend_from_slice(skb.payload());
                slot.state = SlotState::CommitData;
            }
            self.commit_lead = self.commit_lead.wrapping_add(1);
            if data.len() >= apdu_len {
                break;
            }
        }
        Some(Apdu { first_sqn, data })
    }

    /// Every TPDU of the APDU at `first_sqn` has arrived and is sane.
    ///
    /// When a recoverable transmission group covers a hole, the group is
    /// decoded and the check repeated. Walking into a lost fragment
    /// declares the whole APDU lost (all-or-nothing delivery).
    fn is_apdu_complete(&mut self, first_sqn: u32) -> bool {
        if self.slot(first_sqn).is_none() {
            // First fragment left the window; its tail cannot deliver.
            if seq_lt(first_sqn, self.trail) {
                self.declare_apdu_tail_lost(first_sqn);
            }
            return false;
        }
        let Some(apdu_len) = self
            .slot(first_sqn)
            .and_then(|s| s.skb.as_ref())
            .map(Skb::apdu_len)
        else {
            return false;
        };

        if apdu_len > PGM_MAX_APDU {
            self.declare_apdu_lost(first_sqn, apdu_len);
            return false;
        }

        let tg = self.tg_of(first_sqn);
        let mut sequence = first_sqn;
        let mut contiguous_tpdus = 0usize;
        let mut contiguous_size = 0usize;
        let mut check_parity = false;

        loop {
            let Some(state) = self.state_of(sequence) else {
                return false;
            };

            if !check_parity && state != SlotState::HaveData {
                let group_live = self.fec.is_some() && !seq_lt(tg, self.trail);
                if group_live {
                    check_parity = true;
                    if seq_lte(tg, self.commit_lead) {
                        contiguous_tpdus += self.commit_lead.wrapping_sub(tg) as usize;
                    }
                } else if state == SlotState::LostData {
                    self.declare_apdu_lost(first_sqn, apdu_len);
                    return false;
                } else {
                    return false;
                }
            }

            if check_parity {
                if matches!(state, SlotState::HaveData | SlotState::HaveParity) {
                    contiguous_tpdus += 1;
                }
                let k = self.fec.as_ref().map_or(usize::MAX, Fec::k);
                if contiguous_tpdus >= k {
                    if self.try_reconstruct(tg) {
                        return self.is_apdu_complete(first_sqn);
                    }
                    return false;
                }
            } else {
                let Some((fragment, len)) = self
                    .slot(sequence)
                    .and_then(|s| s.skb.as_ref())
                    .map(|skb| (skb.fragment, skb.len()))
                else {
                    return false;
                };
                // Single-packet APDU is complete by definition.
                let Some(frag) = fragment else {
                    return sequence == first_sqn;
                };
                if frag.first_sqn != first_sqn || frag.apdu_len as usize != apdu_len {
                    self.declare_apdu_lost(first_sqn, apdu_len);
                    return false;
                }
                contiguous_tpdus += 1;
                if contiguous_tpdus > PGM_MAX_FRAGMENTS {
                    self.declare_apdu_lost(first_sqn, apdu_len);
                    return false;
                }
                contiguous_size += len;
                if contiguous_size == apdu_len {
                    return true;
                }
                if contiguous_size > apdu_len {
                    self.declare_apdu_lost(first_sqn, apdu_len);
                    return false;
                }
            }

            sequence = sequence.wrapping_add(1);
            if seq_gt(sequence, self.lead) {
                return false;
            }
        }
    }

    /// All-or-nothing: mark every provable member of a doomed APDU lost.
    fn declare_apdu_lost(&mut self, first_sqn: u32, apdu_len: usize) {
        let mut sequence = first_sqn;
        let mut accounted = 0usize;
        let mut walked = 0usize;
        while walked <= PGM_MAX_FRAGMENTS && seq_lte(sequence, self.lead) {
            let Some(state) = self.state_of(sequence) else {
                break;
            };
            match state {
                SlotState::HaveData | SlotState::HaveParity => {
                    let (member, len) = self
                        .slot(sequence)
                        .and_then(|s| s.skb.as_ref())
                        .map_or((false, 0), |skb| {
                            (skb.apdu_first_sqn() == first_sqn, skb.len())
                        });
                    if !member {
                        break;
                    }
                    accounted += len;
                    self.declare_lost(sequence);
                }
                SlotState::BackOff { .. }
                | SlotState::WaitNcf { .. }
                | SlotState::WaitData { .. } => {
                    self.declare_lost(sequence);
                }
                SlotState::LostData => {}
                SlotState::CommitData => break,
            }
            if accounted >= apdu_len {
                break;
            }
            sequence = sequence.wrapping_add(1);
            walked += 1;
        }
        self.has_event = true;
    }

    /// Trailing fragments whose head is gone drop with it.
    fn declare_apdu_tail_lost(&mut self, first_sqn: u32) {
        let mut sequence = self.commit_lead;
        while seq_lte(sequence, self.lead) {
            let is_member = self
                .slot(sequence)
                .and_then(|s| s.skb.as_ref())
                .is_some_and(|skb| skb.apdu_first_sqn() == first_sqn);
            if !is_member {
                break;
            }
            self.declare_lost(sequence);
            sequence = sequence.wrapping_add(1);
        }
        self.has_event = true;
    }
}

// ========================================================================
// Fragment-header parity blocks
// ========================================================================

/// Serialized OPT_FRAGMENT fields carried through the parity code so
/// reconstruction can restore reassembly metadata.
pub const FRAG_BLOCK_LEN: usize = 12;

/// Serialize a fragment header (or an all-zero block) for parity coding.
pub fn encode_frag_block(frag: Option<&OptFragment>) -> Vec<u8> {
    let mut block = vec![0u8; FRAG_BLOCK_LEN];
    if let Some(frag) = frag {
        block[0..4].copy_from_slice(&frag.first_sqn.to_be_bytes());
        block[4..8].copy_from_slice(&frag.frag_off.to_be_bytes());
        block[8..12].copy_from_slice(&frag.apdu_len.to_be_bytes());
    }
    block
}

/// Inverse of [`encode_frag_block`]; an all-zero block means the packet
/// carried no fragment header.
pub fn decode_frag_block(block: &[u8]) -> Option<OptFragment> {
    if block.len() != FRAG_BLOCK_LEN {
        return None;
    }
    let apdu_len = u32::from_be_bytes(block[8..12].try_into().ok()?);
    if apdu_len == 0 {
        return None;
    }
    Some(OptFragment {
        first_sqn: u32::from_be_bytes(block[0..4].try_into().ok()?),
        frag_off: u32::from_be_bytes(block[4..8].try_into().ok()?),
        apdu_len,
    })
}

/// Timestamp for reconstructed buffers, borrowed from any group member.
fn recovered_timestamp(window: &ReceiveWindow, group: u32) -> Instant {
    let k = 1u32 << window.tg_sqn_shift;
    for i in 0..k {
        if let Some(slot) = window.slot(group.wrapping_add(i)) {
            if let Some(skb) = &slot.skb {
                return skb.tstamp;
            }
        }
    }
    Instant::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fec::FecParams;
    use crate::protocol::{
        encode_data, parse_data, DataInfo, Gsi, OptFragment, OptionsBuilder, PacketType,
        PgmHeader, Tsi, HDR_OPT_PARITY,
    };
    use crate::config::PGM_HEADER_SIZE;

    fn tsi() -> Tsi {
        Tsi::new(Gsi([1, 2, 3, 4, 5, 6]), 7500)
    }

    fn cfg() -> NakConfig {
        NakConfig {
            bo_ivl: Duration::from_millis(50),
            rpt_ivl: Duration::from_millis(200),
            rdata_ivl: Duration::from_millis(200),
            ncf_retries: 2,
            data_retries: 5,
        }
    }

    fn make_skb(sequence: u32, trail: u32, payload: &[u8]) -> Skb {
        make_skb_opts(sequence, trail, payload, None, 0, None)
    }

    fn make_frag_skb(sequence: u32, trail: u32, payload: &[u8], frag: OptFragment) -> Skb {
        make_skb_opts(sequence, trail, payload, Some(frag), 0, None)
    }

    fn make_skb_opts(
        sequence: u32,
        trail: u32,
        payload: &[u8],
        frag: Option<OptFragment>,
        hdr_flags: u8,
        parity_group: Option<u32>,
    ) -> Skb {
        let info = DataInfo {
            data_sqn: sequence,
            data_trail: trail,
        };
        let chain = if frag.is_some() || parity_group.is_some() {
            let mut b = OptionsBuilder::new();
            if let Some(frag) = &frag {
                b.fragment(frag);
            }
            if let Some(group) = parity_group {
                b.parity_grp(group);
            }
            Some(b.finish())
        } else {
            None
        };
        let (wire, _) = encode_data(
            PacketType::Odata,
            7500,
            7500,
            tsi().gsi,
            &info,
            hdr_flags,
            chain.as_deref(),
            payload,
        );
        let header = PgmHeader::parse(&wire).unwrap();
        let parsed = parse_data(&header, &wire[PGM_HEADER_SIZE..]).unwrap();
        Skb::from_tpdu(
            tsi(),
            header,
            parsed.info,
            parsed.options.fragment,
            PGM_HEADER_SIZE + parsed.payload_offset,
            wire,
            Instant::now(),
        )
        .with_parity_group(parsed.options.parity_grp)
    }

    fn add(window: &mut ReceiveWindow, skb: Skb) -> RxwStatus {
        let now = Instant::now();
        window.add(skb, now, now + Duration::from_millis(50))
    }

    #[test]
    fn test_rxw_single_odata_delivery() {
        // First packet defines the window and delivers immediately.
        let mut window = ReceiveWindow::new(64, None);
        let status = add(&mut window, make_skb(100, 90, b"hello"));
        assert_eq!(status, RxwStatus::Appended);
        assert_eq!(window.trail(), 100);
        assert_eq!(window.lead(), 100);

        let apdus = window.readv(16);
        assert_eq!(apdus.len(), 1);
        assert_eq!(apdus[0].first_sqn, 100);
        assert_eq!(apdus[0].data, b"hello");
        assert_eq!(window.peek_state(100), Some(SlotState::CommitData));
        assert_eq!(window.committed_count(), 1);
    }

    #[test]
    fn test_rxw_gap_and_fill() {
        // 100, 102, 101 arrive in that order.
        let mut window = ReceiveWindow::new(64, None);
        assert_eq!(add(&mut window, make_skb(100, 90, b"a")), RxwStatus::Appended);
        let apdus = window.readv(16);
        assert_eq!(apdus.len(), 1, "100 delivers before the gap appears");

        assert_eq!(add(&mut window, make_skb(102, 90, b"c")), RxwStatus::Missing);
        assert_eq!(
            window.peek_state(101).map(|s| matches!(s, SlotState::BackOff { .. })),
            Some(true),
            "placeholder for 101 must sit in back-off"
        );
        assert!(window.readv(16).is_empty(), "gap blocks delivery");

        assert_eq!(add(&mut window, make_skb(101, 90, b"b")), RxwStatus::Inserted);
        let apdus = window.readv(16);
        assert_eq!(apdus.len(), 2, "101 then 102 deliver in order");
        assert_eq!(apdus[0].first_sqn, 101);
        assert_eq!(apdus[1].first_sqn, 102);
    }

    #[test]
    fn test_rxw_duplicate_and_bounds() {
        let mut window = ReceiveWindow::new(64, None);
        add(&mut window, make_skb(100, 90, b"x"));
        assert_eq!(
            add(&mut window, make_skb(100, 90, b"x")),
            RxwStatus::Duplicate
        );

        window.readv(16);
        assert_eq!(
            add(&mut window, make_skb(100, 90, b"x")),
            RxwStatus::Duplicate,
            "still retained in commit state"
        );

        // A later readv releases the committed slot; the replay now
        // falls behind the trail.
        add(&mut window, make_skb(101, 90, b"y"));
        window.readv(16);
        assert_eq!(
            add(&mut window, make_skb(100, 90, b"x")),
            RxwStatus::Bounds,
            "released sequence is out of window"
        );
    }

    #[test]
    fn test_rxw_malformed_fragment_rejected() {
        let mut window = ReceiveWindow::new(64, None);
        // apdu_len smaller than the TSDU itself.
        let skb = make_frag_skb(
            100,
            90,
            &[0u8; 100],
            OptFragment {
                first_sqn: 100,
                frag_off: 0,
                apdu_len: 10,
            },
        );
        assert_eq!(add(&mut window, skb), RxwStatus::Malformed);
    }

    #[test]
    fn test_rxw_nak_generation_after_backoff() {
        // ODATA 100 then 103: placeholders 101, 102 back-off, then NAK.
        let mut window = ReceiveWindow::new(64, None);
        let now = Instant::now();
        let expiry = now + Duration::from_millis(50);
        window.add(make_skb(100, 90, b"a"), now, expiry);
        window.add(make_skb(103, 90, b"d"), now, expiry);

        assert!(window.next_timer_deadline().is_some());
        let sweep = window.update_timers(now + Duration::from_millis(50), &cfg());
        assert_eq!(sweep.nak_list, vec![101, 102], "one NAK batch for both gaps");
        assert!(matches!(
            window.peek_state(101),
            Some(SlotState::WaitNcf { .. })
        ));
    }

    #[test]
    fn test_rxw_confirm_moves_to_wait_data() {
        let mut window = ReceiveWindow::new(64, None);
        let now = Instant::now();
        let expiry = now + Duration::from_millis(50);
        window.add(make_skb(100, 90, b"a"), now, expiry);
        window.add(make_skb(102, 90, b"c"), now, expiry);
        window.update_timers(now + Duration::from_millis(50), &cfg());

        let status = window.confirm(
            101,
            now + Duration::from_millis(250),
            now + Duration::from_millis(100),
        );
        assert_eq!(status, RxwStatus::Updated);
        assert!(matches!(
            window.peek_state(101),
            Some(SlotState::WaitData { .. })
        ));

        // Repair arrives.
        assert_eq!(add(&mut window, make_skb(101, 90, b"b")), RxwStatus::Inserted);
        assert_eq!(window.readv(16).len(), 3);
    }

    #[test]
    fn test_rxw_ncf_retries_exhausted_lost() {
        let mut window = ReceiveWindow::new(64, None);
        let mut config = cfg();
        config.ncf_retries = 0;
        let now = Instant::now();
        window.add(make_skb(100, 90, b"a"), now, now + Duration::from_millis(50));
        window.add(make_skb(102, 90, b"c"), now, now + Duration::from_millis(50));

        // back-off fires, NAK sent.
        let sweep = window.update_timers(now + Duration::from_millis(60), &config);
        assert_eq!(sweep.nak_list, vec![101]);
        // NCF never arrives; zero retries allowed.
        let sweep = window.update_timers(now + Duration::from_millis(300), &config);
        assert_eq!(sweep.newly_lost, 1);
        assert_eq!(window.peek_state(101), Some(SlotState::LostData));
    }

    #[test]
    fn test_rxw_lost_rejects_have_data() {
        let mut window = ReceiveWindow::new(64, None);
        add(&mut window, make_skb(100, 90, b"a"));
        assert!(!window.lost(100), "arrived data cannot be marked lost");
        add(&mut window, make_skb(102, 90, b"c"));
        assert!(window.lost(101), "pending placeholder can");
    }

    #[test]
    fn test_rxw_fragment_reassembly() {
        // 3000-byte APDU over sequences 200..=202.
        let mut window = ReceiveWindow::new(64, None);
        for (seq, off) in [(200u32, 0u32), (201, 1000), (202, 2000)] {
            let frag = OptFragment {
                first_sqn: 200,
                frag_off: off,
                apdu_len: 3000,
            };
            let payload = vec![(seq % 251) as u8; 1000];
            assert_ne!(
                add(&mut window, make_frag_skb(seq, 190, &payload, frag)),
                RxwStatus::Malformed
            );
            if seq != 202 {
                assert!(window.readv(16).is_empty(), "APDU must deliver whole");
            }
        }
        let apdus = window.readv(16);
        assert_eq!(apdus.len(), 1);
        assert_eq!(apdus[0].first_sqn, 200);
        assert_eq!(apdus[0].data.len(), 3000);
        assert_eq!(&apdus[0].data[..1000], &vec![(200u32 % 251) as u8; 1000][..]);
        assert_eq!(&apdus[0].data[2000..], &vec![(202u32 % 251) as u8; 1000][..]);
    }

    #[test]
    fn test_rxw_lost_apdu_dependency_propagation() {
        // Fragments 200 and 202 arrive; 201 exhausts retries.
        let mut window = ReceiveWindow::new(64, None);
        let frag = |off| OptFragment {
            first_sqn: 200,
            frag_off: off,
            apdu_len: 3000,
        };
        add(&mut window, make_frag_skb(200, 190, &[1u8; 1000], frag(0)));
        add(&mut window, make_frag_skb(202, 190, &[3u8; 1000], frag(2000)));
        assert!(window.lost(201), "placeholder 201 marked lost");
        assert_eq!(window.cumulative_losses, 1);

        let apdus = window.readv(16);
        assert!(apdus.is_empty(), "loss boundary reports end-of-window");
        assert_eq!(
            window.cumulative_losses, 3,
            "dependency propagation accounts all three fragments"
        );

        // Boundary consumed; the window drains clean afterwards.
        assert!(window.readv(16).is_empty());
        add(&mut window, make_skb(203, 190, b"after"));
        let apdus = window.readv(16);
        assert_eq!(apdus.len(), 1);
        assert_eq!(apdus[0].first_sqn, 203);
        assert_eq!(window.cumulative_losses, 3, "no double counting");
    }

    #[test]
    fn test_rxw_trail_update_accounts_losses() {
        let mut window = ReceiveWindow::new(64, None);
        add(&mut window, make_skb(100, 95, b"a"));
        add(&mut window, make_skb(105, 95, b"f"));
        assert_eq!(window.cumulative_losses, 0);

        // Source advances its trail beyond the gap: 101..=104 are gone.
        // (Trail 103 first releases the startup constraint, then bites.)
        add(&mut window, make_skb(106, 103, b"g"));
        let losses = window.cumulative_losses;
        assert_eq!(losses, 2, "101 and 102 declared lost by trail advance");
        assert_eq!(window.peek_state(101), Some(SlotState::LostData));
        assert_eq!(window.peek_state(102), Some(SlotState::LostData));
    }

    #[test]
    fn test_rxw_update_from_spm_extends_lead() {
        let mut window = ReceiveWindow::new(64, None);
        let now = Instant::now();
        window.add(make_skb(50, 45, b"x"), now, now + Duration::from_millis(50));
        let added = window.update(55, 45, now + Duration::from_millis(50));
        assert_eq!(added, 5, "SPM lead 55 creates placeholders 51..=55");
        assert_eq!(window.lead(), 55);
        assert!(matches!(
            window.peek_state(53),
            Some(SlotState::BackOff { .. })
        ));
    }

    #[test]
    fn test_rxw_spm_defines_window_for_late_joiner() {
        let mut window = ReceiveWindow::new(64, None);
        let now = Instant::now();
        assert_eq!(window.update(200, 180, now), 0, "first SPM only defines");
        // Next ODATA appends cleanly at lead + 1.
        assert_eq!(add(&mut window, make_skb(201, 180, b"x")), RxwStatus::Appended);
    }

    #[test]
    fn test_rxw_fec_recovery() {
        // k=4, n=6: originals 300..=303, parity numbered 304..=305
        // repairing group 300. Receiver sees 300, 301, 303, 305.
        let params = FecParams {
            block_size: 6,
            group_size: 4,
            proactive_packets: 2,
            ondemand_enabled: false,
            var_pktlen_enabled: false,
        };
        let fec = Fec::new(&params).unwrap();
        let payloads: Vec<Vec<u8>> = (0u8..4).map(|i| vec![i + 1; 64]).collect();
        let parity = fec.encode_parity(&payloads, 64).unwrap();

        let mut window = ReceiveWindow::new(64, Some(&params));
        add(&mut window, make_skb(300, 290, &payloads[0]));
        add(&mut window, make_skb(301, 290, &payloads[1]));
        assert_eq!(
            add(&mut window, make_skb(303, 290, &payloads[3])),
            RxwStatus::Missing
        );

        let parity_skb = make_skb_opts(
            305,
            290,
            &parity[1],
            None,
            HDR_OPT_PARITY,
            Some(300),
        );
        assert_eq!(add(&mut window, parity_skb), RxwStatus::Inserted);

        let apdus = window.readv(16);
        assert_eq!(apdus.len(), 4, "reconstruction fills 302");
        assert_eq!(apdus[2].first_sqn, 302);
        assert_eq!(apdus[2].data, payloads[2], "decoded payload matches");
        assert_eq!(window.cumulative_losses, 0);
    }

    #[test]
    fn test_rxw_fec_insufficient_parity_waits() {
        let params = FecParams {
            block_size: 6,
            group_size: 4,
            proactive_packets: 2,
            ondemand_enabled: false,
            var_pktlen_enabled: false,
        };
        let mut window = ReceiveWindow::new(64, Some(&params));
        add(&mut window, make_skb(300, 290, &[1u8; 64]));
        add(&mut window, make_skb(303, 290, &[4u8; 64]));
        // Two of four originals: not recoverable yet.
        assert_eq!(window.readv(16).len(), 1, "only 300 delivers");
        assert!(matches!(
            window.peek_state(301),
            Some(SlotState::BackOff { .. })
        ));
    }

    #[test]
    fn test_rxw_window_ring_never_overlaps() {
        let mut window = ReceiveWindow::new(8, None);
        add(&mut window, make_skb(0, 0, b"z"));
        for seq in 1..40u32 {
            add(&mut window, make_skb(seq, seq.saturating_sub(4), b"z"));
            window.readv(16);
        }
        assert!(window.len() <= window.capacity());
        assert!(seq_lte(window.trail(), window.commit_lead()));
        assert!(seq_lte(window.commit_lead(), window.lead().wrapping_add(1)));
    }
}
