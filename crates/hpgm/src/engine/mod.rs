// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Protocol engines and the network thread.
//!
//! One background thread per socket drives everything asynchronous:
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                       network thread                         |
//! |  poll(socket, waker, timeout=next_deadline)                  |
//! |    readable -> parse -> dispatch by TSI / packet direction   |
//! |    timeout  -> SPM schedules, NAK sweeps, repair drain       |
//! |    waker    -> a user thread moved a deadline earlier        |
//! |  recompute next_deadline = min(all component deadlines)      |
//! +--------------------------------------------------------------+
//! ```
//!
//! User threads call `send`/`recv` on the socket facade; the waker pipe
//! interrupts the poll whenever they reschedule timer work (a send
//! arming the heartbeat, an option change).

pub mod peer;
pub mod receiver;
pub mod source;
pub mod timer;

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;

use crate::config::{IPV4_HEADER_OVERHEAD, IPV6_HEADER_OVERHEAD, PGM_HEADER_SIZE};
use crate::congestion::TokenBucket;
use crate::protocol::{
    csum_verify, parse_data, parse_nak, parse_polr, parse_poll, parse_spm, PacketType, PgmHeader,
    Tsi,
};
use crate::sock::{SockInner, SockStats};
use crate::transport::UdpTransport;
use receiver::ReceiverState;
use source::{RepairOutcome, SourceState};
use timer::fold_deadline;

const SOCKET_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

/// Upper bound on one poll slice so shutdown is always noticed.
const MAX_IDLE: Duration = Duration::from_secs(1);

/// Shared send-path context threaded through the engines.
pub struct IoCtx<'a> {
    pub transport: &'a UdpTransport,
    pub rate: &'a Mutex<TokenBucket>,
    pub stats: &'a SockStats,
    /// IP + UDP overhead charged per datagram.
    pub ip_overhead: usize,
}

impl IoCtx<'_> {
    /// Admit one datagram of `tpdu_len` bytes against the rate limiter.
    ///
    /// `None` means admitted (tokens consumed); otherwise the wait until
    /// enough tokens accumulate.
    pub fn try_rate(&self, tpdu_len: usize) -> Option<Duration> {
        let wire = (tpdu_len + self.ip_overhead) as u64;
        let mut bucket = self.rate.lock();
        if bucket.try_consume(wire) {
            None
        } else {
            Some(bucket.time_until_available(wire))
        }
    }
}

/// Build the per-send context for a socket.
pub(crate) fn io_ctx<'a>(
    transport: &'a UdpTransport,
    rate: &'a Mutex<TokenBucket>,
    stats: &'a SockStats,
) -> IoCtx<'a> {
    let ip_overhead = if transport.group_addr().is_ipv6() {
        IPV6_HEADER_OVERHEAD
    } else {
        IPV4_HEADER_OVERHEAD
    };
    IoCtx {
        transport,
        rate,
        stats,
        ip_overhead,
    }
}

/// Network thread body; exits when the socket is destroyed.
pub(crate) fn run(inner: Arc<SockInner>) {
    let (transport, source, receiver, tsi) = {
        let transport = match inner.transport.lock().clone() {
            Some(t) => t,
            None => {
                log::error!("[Engine] started without a transport");
                return;
            }
        };
        let source = inner.source.lock().clone();
        let receiver = inner.receiver.lock().clone();
        let tsi = match *inner.tsi.lock() {
            Some(tsi) => tsi,
            None => {
                log::error!("[Engine] started without a TSI");
                return;
            }
        };
        (transport, source, receiver, tsi)
    };

    let std_sock = match transport.clone_socket() {
        Ok(s) => s,
        Err(e) => {
            log::error!("[Engine] socket clone failed: {}", e);
            return;
        }
    };
    let mut mio_sock = mio::net::UdpSocket::from_std(std_sock);
    let mut poll = match Poll::new() {
        Ok(p) => p,
        Err(e) => {
            log::error!("[Engine] poll creation failed: {}", e);
            return;
        }
    };
    if let Err(e) = poll
        .registry()
        .register(&mut mio_sock, SOCKET_TOKEN, Interest::READABLE)
    {
        log::error!("[Engine] socket registration failed: {}", e);
        return;
    }
    match Waker::new(poll.registry(), WAKER_TOKEN) {
        Ok(waker) => inner.timer.set_waker(waker),
        Err(e) => log::warn!("[Engine] no waker, timers degrade to polling: {}", e),
    }

    let io = io_ctx(&transport, &inner.rate, &inner.stats);
    let mut events = Events::with_capacity(128);
    let mut buf = vec![0u8; 64 * 1024];

    log::debug!("[Engine] thread running for {}", tsi);
    while !inner.destroyed.load(Ordering::Acquire) {
        let now = Instant::now();
        let timeout = inner
            .timer
            .poll_timeout(now)
            .map_or(MAX_IDLE, |d| d.min(MAX_IDLE));
        if let Err(e) = poll.poll(&mut events, Some(timeout)) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("[Engine] poll failed: {}", e);
            break;
        }
        if inner.destroyed.load(Ordering::Acquire) {
            break;
        }

        // Drain the socket completely before timer work.
        loop {
            match mio_sock.recv_from(&mut buf) {
                Ok((len, src)) => {
                    let now = Instant::now();
                    handle_packet(
                        &buf[..len],
                        src,
                        tsi,
                        source.as_deref(),
                        receiver.as_deref(),
                        &io,
                        now,
                    );
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!("[Engine] recv failed: {}", e);
                    break;
                }
            }
        }

        // Timer work and next-deadline recomputation.
        let now = Instant::now();
        let mut deadline = None;
        if let Some(source) = source.as_deref() {
            deadline = fold_deadline(deadline, source.timer_tick(now, &io));
            match source.drain_repairs(&io) {
                RepairOutcome::Idle => {}
                RepairOutcome::RateLimited(wait) => {
                    deadline = fold_deadline(deadline, Some(now + wait));
                }
            }
        }
        if let Some(receiver) = receiver.as_deref() {
            deadline = fold_deadline(deadline, receiver.sweep(now, &io));
        }
        inner.timer.store(deadline);
    }
    log::debug!("[Engine] thread exiting for {}", tsi);
}

/// Parse and dispatch one datagram.
fn handle_packet(
    data: &[u8],
    src: SocketAddr,
    our_tsi: Tsi,
    source: Option<&SourceState>,
    receiver: Option<&ReceiverState>,
    io: &IoCtx<'_>,
    now: Instant,
) {
    io.stats.packets_received.fetch_add(1, Ordering::Relaxed);
    io.stats
        .bytes_received
        .fetch_add(data.len() as u64, Ordering::Relaxed);

    let Some(header) = PgmHeader::parse(data) else {
        io.stats.malformed.fetch_add(1, Ordering::Relaxed);
        return;
    };
    if !csum_verify(data) {
        log::debug!("[Engine] checksum failure from {}", src);
        io.stats.checksum_errors.fetch_add(1, Ordering::Relaxed);
        io.stats.malformed.fetch_add(1, Ordering::Relaxed);
        return;
    }
    let body = &data[PGM_HEADER_SIZE..];

    match header.packet_type {
        PacketType::Spm => {
            let tsi = Tsi::new(header.gsi, header.sport);
            if tsi == our_tsi {
                return; // our own multicast loop
            }
            let Some(receiver) = receiver else { return };
            let Some((spm, opts)) = parse_spm(&header, body) else {
                io.stats.malformed.fetch_add(1, Ordering::Relaxed);
                return;
            };
            receiver.handle_spm(tsi, src.ip(), &spm, &opts, now, io);
        }
        PacketType::Odata | PacketType::Rdata => {
            let tsi = Tsi::new(header.gsi, header.sport);
            if tsi == our_tsi {
                return;
            }
            let Some(receiver) = receiver else { return };
            let Some(parsed) = parse_data(&header, body) else {
                io.stats.malformed.fetch_add(1, Ordering::Relaxed);
                return;
            };
            receiver.handle_data(tsi, src.ip(), &header, &parsed, data.to_vec(), now, io);
        }
        PacketType::Ncf => {
            let tsi = Tsi::new(header.gsi, header.sport);
            if tsi == our_tsi {
                return;
            }
            let Some(receiver) = receiver else { return };
            let Some((nak, opts)) = parse_nak(&header, body) else {
                io.stats.malformed.fetch_add(1, Ordering::Relaxed);
                return;
            };
            receiver.handle_ncf(tsi, &nak, &opts, now);
        }
        PacketType::Nak | PacketType::Nnak => {
            let Some(source) = source else { return };
            // A NAK names its target source in the header.
            if header.gsi != our_tsi.gsi || header.dport != our_tsi.sport {
                return;
            }
            let Some((nak, opts)) = parse_nak(&header, body) else {
                io.stats.malformed.fetch_add(1, Ordering::Relaxed);
                return;
            };
            if header.packet_type == PacketType::Nak {
                let group = io.transport.group_addr().ip();
                source.handle_nak(&header, &nak, &opts.nak_list, group, io);
            } else {
                source.handle_nnak(io);
            }
        }
        PacketType::Spmr => {
            if header.gsi == our_tsi.gsi && header.dport == our_tsi.sport {
                if let Some(source) = source {
                    source.handle_spmr(src.ip(), io);
                }
            } else if let Some(receiver) = receiver {
                // Someone else asked this source already; stop our own.
                receiver.handle_foreign_spmr(Tsi::new(header.gsi, header.dport));
            }
        }
        PacketType::Poll => {
            if parse_poll(body).is_some() {
                if let Some(receiver) = receiver {
                    receiver.handle_poll(io);
                }
            } else {
                io.stats.malformed.fetch_add(1, Ordering::Relaxed);
            }
        }
        PacketType::Polr => {
            if parse_polr(body).is_some() {
                io.stats.polls_received.fetch_add(1, Ordering::Relaxed);
            } else {
                io.stats.malformed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
