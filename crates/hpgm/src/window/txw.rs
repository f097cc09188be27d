// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transmit window: retained originals plus the retransmit request queue.
//!
//! A bounded ring of sent packets indexed by `sequence % capacity`.
//! `trail` is the oldest retained sequence, `lead` the newest produced;
//! `lead + 1` is the next sequence to assign. Each entry keeps the
//! unfolded payload checksum so repairs re-sum only the mutated header.
//!
//! The retransmit queue holds `(sequence, is_parity)` requests appended
//! by NAK processing on the network thread and drained into RDATA by the
//! timer path. Appends deduplicate against the queue tail; a request for
//! a sequence that already slid out of the window is dropped silently (a
//! NAK racing trail advance is routine, not an error).

use std::collections::VecDeque;
use std::sync::Arc;

use crate::skb::Skb;
use crate::window::seq::{seq_count, seq_in_window, seq_lt};

/// One queued repair request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitRequest {
    /// Requested sequence; for parity this is the transmission group.
    pub sequence: u32,
    /// Parity repair for the group rather than a selective original.
    pub is_parity: bool,
    /// Group geometry for parity requests (`k = 2^tg_sqn_shift`).
    pub tg_sqn_shift: u32,
}

/// Ring occupant.
#[derive(Debug)]
pub struct TxEntry {
    pub skb: Arc<Skb>,
    /// Unfolded Internet checksum over the TSDU.
    pub payload_sum: u32,
    /// Times this sequence has been repaired.
    pub retransmit_count: u32,
}

/// Bounded transmit window with retransmit bookkeeping.
#[derive(Debug)]
pub struct TransmitWindow {
    ring: Vec<Option<TxEntry>>,
    capacity: u32,
    trail: u32,
    lead: u32,
    retransmit_queue: VecDeque<RetransmitRequest>,
    /// Bytes of TSDU retained across the ring.
    size: usize,
}

impl TransmitWindow {
    /// Create a window of `sqns` sequences starting at `initial_sqn`.
    pub fn new(sqns: u32, initial_sqn: u32) -> Self {
        assert!(sqns > 0, "window must hold at least one sequence");
        let mut ring = Vec::with_capacity(sqns as usize);
        ring.resize_with(sqns as usize, || None);
        Self {
            ring,
            capacity: sqns,
            trail: initial_sqn,
            lead: initial_sqn.wrapping_sub(1),
            retransmit_queue: VecDeque::new(),
            size: 0,
        }
    }

    pub fn trail(&self) -> u32 {
        self.trail
    }

    pub fn lead(&self) -> u32 {
        self.lead
    }

    /// Sequence the next pushed packet must carry.
    pub fn next_lead(&self) -> u32 {
        self.lead.wrapping_add(1)
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn len(&self) -> u32 {
        seq_count(self.trail, self.lead)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    /// Retained TSDU bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    fn index(&self, sequence: u32) -> usize {
        (sequence % self.capacity) as usize
    }

    /// Insert the next produced packet.
    ///
    /// `skb.sequence` must equal [`next_lead`](Self::next_lead); the ring
    /// evicts its oldest occupant when full.
    pub fn push(&mut self, skb: Skb, payload_sum: u32) {
        debug_assert_eq!(skb.sequence, self.next_lead(), "sequences are assigned in order");
        if self.is_full() {
            self.evict_trail();
        }
        self.lead = self.lead.wrapping_add(1);
        self.size += skb.len();
        let idx = self.index(self.lead);
        self.ring[idx] = Some(TxEntry {
            skb: Arc::new(skb),
            payload_sum,
            retransmit_count: 0,
        });
    }

    fn evict_trail(&mut self) {
        let idx = self.index(self.trail);
        if let Some(entry) = self.ring[idx].take() {
            self.size -= entry.skb.len();
        }
        self.trail = self.trail.wrapping_add(1);
    }

    /// Look up a retained sequence; `None` when out of window.
    pub fn peek(&self, sequence: u32) -> Option<&TxEntry> {
        if self.is_empty() || !seq_in_window(sequence, self.trail, self.lead) {
            return None;
        }
        self.ring[self.index(sequence)].as_ref()
    }

    // ====================================================================
    // Retransmit queue
    // ====================================================================

    /// Queue a repair request, deduplicating against the queue tail.
    ///
    /// Returns whether the request was queued. Out-of-window sequences
    /// are dropped silently.
    pub fn retransmit_push(&mut self, sequence: u32, is_parity: bool, tg_sqn_shift: u32) -> bool {
        let request = RetransmitRequest {
            sequence,
            is_parity,
            tg_sqn_shift,
        };
        if self.retransmit_queue.back() == Some(&request) {
            return false;
        }
        if !is_parity && self.peek(sequence).is_none() {
            log::debug!(
                "[TxWindow] NAK for {} outside window [{}, {}], dropped",
                sequence,
                self.trail,
                self.lead
            );
            return false;
        }
        if is_parity && !self.group_complete(sequence, 1u32 << tg_sqn_shift) {
            log::debug!(
                "[TxWindow] parity NAK for group {} with incomplete originals, dropped",
                sequence
            );
            return false;
        }
        self.retransmit_queue.push_back(request);
        true
    }

    /// Head repair request with its retained packet, left in place.
    ///
    /// The packet reference is cloned out so emission happens outside the
    /// window lock; [`retransmit_remove_head`](Self::retransmit_remove_head)
    /// is called only after the repair is on the wire. Parity requests
    /// return no single packet; the source fetches the group instead.
    pub fn retransmit_try_peek(&mut self) -> Option<(RetransmitRequest, Option<(Arc<Skb>, u32)>)> {
        loop {
            let request = *self.retransmit_queue.front()?;
            if request.is_parity {
                if self.group_complete(request.sequence, 1u32 << request.tg_sqn_shift) {
                    return Some((request, None));
                }
                self.retransmit_queue.pop_front();
                continue;
            }
            if let Some(entry) = self.peek(request.sequence) {
                return Some((request, Some((Arc::clone(&entry.skb), entry.payload_sum))));
            }
            // The sequence slid out while queued; skip it.
            self.retransmit_queue.pop_front();
        }
    }

    /// Drop the head request after successful transmission and bump the
    /// slot's retransmit counter.
    pub fn retransmit_remove_head(&mut self) {
        if let Some(request) = self.retransmit_queue.pop_front() {
            if !request.is_parity {
                let idx = self.index(request.sequence);
                if seq_in_window(request.sequence, self.trail, self.lead) {
                    if let Some(entry) = self.ring[idx].as_mut() {
                        entry.retransmit_count += 1;
                    }
                }
            }
        }
    }

    /// Drop a head request that turned out to be unserviceable.
    pub fn retransmit_discard_head(&mut self) {
        self.retransmit_queue.pop_front();
    }

    pub fn has_retransmit_pending(&self) -> bool {
        !self.retransmit_queue.is_empty()
    }

    pub fn retransmit_queue_len(&self) -> usize {
        self.retransmit_queue.len()
    }

    // ====================================================================
    // Transmission groups
    // ====================================================================

    /// All `k` originals of a group are retained.
    pub fn group_complete(&self, tg_sqn: u32, k: u32) -> bool {
        if seq_lt(tg_sqn, self.trail) {
            return false;
        }
        (0..k).all(|i| self.peek(tg_sqn.wrapping_add(i)).is_some())
    }

    /// Payloads of a complete group, in packet order.
    pub fn group_payloads(&self, tg_sqn: u32, k: u32) -> Option<Vec<Vec<u8>>> {
        let mut payloads = Vec::with_capacity(k as usize);
        for i in 0..k {
            payloads.push(self.peek(tg_sqn.wrapping_add(i))?.skb.payload().to_vec());
        }
        Some(payloads)
    }

    /// Longest TSDU in a complete group (the parity length).
    pub fn group_parity_len(&self, tg_sqn: u32, k: u32, var_pktlen: bool) -> Option<usize> {
        let mut max = 0usize;
        for i in 0..k {
            max = max.max(self.peek(tg_sqn.wrapping_add(i))?.skb.len());
        }
        Some(if var_pktlen { max + 2 } else { max })
    }
}
