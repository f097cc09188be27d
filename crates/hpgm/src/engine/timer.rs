// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Timer substrate: one expiration scalar per socket.
//!
//! Every component computes its own next deadline; the socket's deadline
//! is the minimum over all of them, recomputed by the network thread on
//! each wakeup. No priority queue is needed - the event population is a
//! handful of categories per peer.
//!
//! A user thread that moves a deadline earlier (a send resetting the
//! heartbeat schedule, an option change) interrupts the network thread's
//! poll through the mio waker so the new deadline takes effect at once.

use std::time::{Duration, Instant};

use mio::Waker;
use parking_lot::Mutex;

/// Shared next-deadline scalar plus the poll interrupt.
#[derive(Debug)]
pub struct TimerCore {
    deadline: Mutex<Option<Instant>>,
    waker: Mutex<Option<Waker>>,
}

impl TimerCore {
    pub fn new() -> Self {
        Self {
            deadline: Mutex::new(None),
            waker: Mutex::new(None),
        }
    }

    /// Install the poll waker once the network thread is up.
    pub fn set_waker(&self, waker: Waker) {
        *self.waker.lock() = Some(waker);
    }

    /// Replace the deadline wholesale (network thread, post-recompute).
    pub fn store(&self, deadline: Option<Instant>) {
        *self.deadline.lock() = deadline;
    }

    /// Pull a deadline earlier from a user thread and interrupt the poll
    /// if that changed anything.
    pub fn reschedule(&self, candidate: Instant) {
        let mut deadline = self.deadline.lock();
        let earlier = deadline.map_or(true, |d| candidate < d);
        if !earlier {
            return;
        }
        *deadline = Some(candidate);
        drop(deadline);
        self.wake();
    }

    /// Interrupt the network thread's poll.
    pub fn wake(&self) {
        if let Some(waker) = self.waker.lock().as_ref() {
            if let Err(e) = waker.wake() {
                log::debug!("[Timer] waker failed: {}", e);
            }
        }
    }

    /// Current deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock()
    }

    /// Time until the deadline, saturating at zero. Backs TIME_REMAIN.
    pub fn time_remain(&self, now: Instant) -> Option<Duration> {
        self.deadline().map(|d| d.saturating_duration_since(now))
    }

    /// Poll timeout for the network thread.
    pub fn poll_timeout(&self, now: Instant) -> Option<Duration> {
        self.time_remain(now)
    }
}

impl Default for TimerCore {
    fn default() -> Self {
        Self::new()
    }
}

/// Fold an optional deadline into a running minimum.
#[inline]
pub fn fold_deadline(acc: Option<Instant>, candidate: Option<Instant>) -> Option<Instant> {
    match (acc, candidate) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
