// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Socket facade: lifecycle, option plane, send/recv, errors.
//!
//! Lifecycle: `PgmSock::new` -> `set_option` -> `bind` -> `connect` ->
//! `send`/`recv` -> `close(flush)`. Close with `flush` emits up to three
//! OPT_FIN heartbeat SPMs before tearing the session down.
//!
//! Every public entry point takes the destroy lock for reading; `close`
//! marks the socket destroyed, wakes the network thread, then takes it
//! for writing to wait out concurrent callers. Afterwards everything
//! returns [`Error::BadDescriptor`].

mod options;

pub use options::{FilterMode, MembershipOp, SockConfig, SockOpt};

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::RecvTimeoutError;
use parking_lot::{Mutex, RwLock};

use crate::congestion::TokenBucket;
use crate::engine;
use crate::engine::receiver::ReceiverState;
use crate::engine::source::SourceState;
use crate::engine::timer::TimerCore;
use crate::protocol::{Gsi, Tsi};
use crate::transport::{TransportConfig, UdpTransport};
use crate::window::Apdu;

/// Error taxonomy: one value per condition.
#[derive(Debug)]
pub enum Error {
    /// Transient: the operation would block; retry later.
    WouldBlock,
    /// Transient: the rate limiter ran dry; retry after RATE_REMAIN.
    RateLimited,
    /// Socket closed or never bound.
    BadDescriptor,
    /// Unknown option, malformed option value, oversized APDU.
    InvalidArgument,
    /// Inbound packet failed a wire-format check (counted, internal).
    Malformed,
    /// Sequence already known (counted, internal).
    Duplicate,
    /// Sequence outside the window (counted, internal).
    Bounds,
    /// Resolution ambiguity at bind.
    NotUnique,
    /// Source reset (or unrecoverable loss with ABORT_ON_RESET).
    ConnectionReset,
    /// Underlying syscall failure.
    System(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::WouldBlock => write!(f, "Operation would block"),
            Error::RateLimited => write!(f, "Rate limited"),
            Error::BadDescriptor => write!(f, "Bad socket descriptor"),
            Error::InvalidArgument => write!(f, "Invalid argument"),
            Error::Malformed => write!(f, "Malformed packet"),
            Error::Duplicate => write!(f, "Duplicate packet"),
            Error::Bounds => write!(f, "Sequence out of window"),
            Error::NotUnique => write!(f, "Resolution not unique"),
            Error::ConnectionReset => write!(f, "Source reset"),
            Error::System(e) => write!(f, "System error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::System(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        match e.kind() {
            io::ErrorKind::WouldBlock => Error::WouldBlock,
            _ => Error::System(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// ========================================================================
// Statistics
// ========================================================================

/// Per-socket counters, shared with the network thread.
#[derive(Debug, Default)]
pub struct SockStats {
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub malformed: AtomicU64,
    pub checksum_errors: AtomicU64,
    pub duplicates: AtomicU64,
    pub spms_sent: AtomicU64,
    pub naks_sent: AtomicU64,
    pub naks_received: AtomicU64,
    pub nnaks_received: AtomicU64,
    pub ncfs_sent: AtomicU64,
    pub spmrs_received: AtomicU64,
    pub retransmits_sent: AtomicU64,
    pub parity_sent: AtomicU64,
    pub polls_received: AtomicU64,
}

impl SockStats {
    pub(crate) fn count_sent(&self, tpdu_len: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent
            .fetch_add(tpdu_len as u64, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the counters plus receiver loss accounting.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub malformed: u64,
    pub checksum_errors: u64,
    pub duplicates: u64,
    pub spms_sent: u64,
    pub naks_sent: u64,
    pub naks_received: u64,
    pub nnaks_received: u64,
    pub ncfs_sent: u64,
    pub spmrs_received: u64,
    pub retransmits_sent: u64,
    pub parity_sent: u64,
    pub polls_received: u64,
    pub cumulative_losses: u64,
}

impl StatsSnapshot {
    /// Share of received packets that failed validation.
    pub fn malformed_percent(&self) -> f64 {
        if self.packets_received == 0 {
            0.0
        } else {
            self.malformed as f64 * 100.0 / self.packets_received as f64
        }
    }
}

// ========================================================================
// Addressing and lifecycle
// ========================================================================

/// Bind address: the session (UDP encapsulation) port plus an optional
/// explicit GSI. Name resolution happens outside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgmSockAddr {
    pub port: u16,
    pub gsi: Option<Gsi>,
}

impl PgmSockAddr {
    /// Bind to a port with a generated GSI.
    pub fn any(port: u16) -> PgmSockAddr {
        PgmSockAddr { port, gsi: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Init,
    Bound,
    Connected,
    Closed,
}

/// Shared socket internals (facade + network thread).
pub(crate) struct SockInner {
    pub(crate) config: Mutex<SockConfig>,
    lifecycle: Mutex<Lifecycle>,
    pub(crate) destroy_lock: RwLock<()>,
    pub(crate) destroyed: AtomicBool,
    pub(crate) tsi: Mutex<Option<Tsi>>,
    pub(crate) transport: Mutex<Option<Arc<UdpTransport>>>,
    pub(crate) source: Mutex<Option<Arc<SourceState>>>,
    pub(crate) receiver: Mutex<Option<Arc<ReceiverState>>>,
    pub(crate) rate: Mutex<TokenBucket>,
    pub(crate) timer: TimerCore,
    pub(crate) stats: SockStats,
    engine: Mutex<Option<JoinHandle<()>>>,
}

/// Reliable-multicast socket.
///
/// # Example
///
/// ```rust,no_run
/// use hpgm::{PgmSock, PgmSockAddr, SockOpt, Result};
///
/// fn main() -> Result<()> {
///     let sock = PgmSock::new()?;
///     sock.set_option(SockOpt::RcvOnly(true))?;
///     sock.set_option(SockOpt::JoinGroup("239.192.0.1".parse().unwrap()))?;
///     sock.bind(PgmSockAddr::any(7500))?;
///     sock.connect()?;
///     let (data, tsi) = sock.recv_from()?;
///     println!("{} bytes from {}", data.len(), tsi);
///     sock.close(false)
/// }
/// ```
pub struct PgmSock {
    inner: Arc<SockInner>,
}

/// Poll slice while blocked in `recv`, so close and reset conditions
/// are noticed promptly.
const RECV_SLICE: Duration = Duration::from_millis(50);

/// Default session group when the caller never joined one.
const DEFAULT_GROUP: &str = "239.192.0.1";

impl PgmSock {
    /// Create an unbound socket with default options.
    pub fn new() -> Result<PgmSock> {
        Ok(PgmSock {
            inner: Arc::new(SockInner {
                config: Mutex::new(SockConfig::default()),
                lifecycle: Mutex::new(Lifecycle::Init),
                destroy_lock: RwLock::new(()),
                destroyed: AtomicBool::new(false),
                tsi: Mutex::new(None),
                transport: Mutex::new(None),
                source: Mutex::new(None),
                receiver: Mutex::new(None),
                rate: Mutex::new(TokenBucket::new(0)),
                timer: TimerCore::new(),
                stats: SockStats::default(),
                engine: Mutex::new(None),
            }),
        })
    }

    fn guard(&self) -> Result<parking_lot::RwLockReadGuard<'_, ()>> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Err(Error::BadDescriptor);
        }
        let guard = self.inner.destroy_lock.read();
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Err(Error::BadDescriptor);
        }
        Ok(guard)
    }

    // ====================================================================
    // Options
    // ====================================================================

    /// Apply one socket option.
    pub fn set_option(&self, opt: SockOpt) -> Result<()> {
        let _guard = self.guard()?;
        let mut config = self.inner.config.lock();
        config.apply(opt)?;

        // Past bind, membership changes go straight to the transport.
        if let Some(transport) = self.inner.transport.lock().clone() {
            for op in config.pending_membership.drain(..) {
                let result = match &op {
                    MembershipOp::Join(spec) => transport.join(spec),
                    MembershipOp::Leave(spec) => transport.leave(spec),
                    MembershipOp::Block { group, source } => {
                        transport.block_source(*group, *source)
                    }
                    MembershipOp::Unblock { group, source } => {
                        transport.unblock_source(*group, *source)
                    }
                };
                if let Err(e) = result {
                    log::warn!("[Sock] membership change {:?} failed: {}", op, e);
                    return Err(Error::System(e));
                }
            }
        }
        Ok(())
    }

    /// TIME_REMAIN: time until the next timer deadline.
    pub fn time_remain(&self) -> Result<Duration> {
        let _guard = self.guard()?;
        Ok(self
            .inner
            .timer
            .time_remain(Instant::now())
            .unwrap_or(Duration::ZERO))
    }

    /// RATE_REMAIN: time until `blocklen` bytes fit the rate budget.
    pub fn rate_remain(&self, blocklen: usize) -> Result<Duration> {
        let _guard = self.guard()?;
        Ok(self
            .inner
            .rate
            .lock()
            .time_until_available(blocklen as u64))
    }

    /// Configured maximum TPDU including the IP header.
    pub fn mtu(&self) -> Result<usize> {
        let _guard = self.guard()?;
        Ok(self.inner.config.lock().mtu)
    }

    /// Counter snapshot, including per-peer cumulative loss.
    pub fn stats(&self) -> Result<StatsSnapshot> {
        let _guard = self.guard()?;
        let s = &self.inner.stats;
        let mut snapshot = StatsSnapshot {
            packets_sent: s.packets_sent.load(Ordering::Relaxed),
            bytes_sent: s.bytes_sent.load(Ordering::Relaxed),
            packets_received: s.packets_received.load(Ordering::Relaxed),
            bytes_received: s.bytes_received.load(Ordering::Relaxed),
            malformed: s.malformed.load(Ordering::Relaxed),
            checksum_errors: s.checksum_errors.load(Ordering::Relaxed),
            duplicates: s.duplicates.load(Ordering::Relaxed),
            spms_sent: s.spms_sent.load(Ordering::Relaxed),
            naks_sent: s.naks_sent.load(Ordering::Relaxed),
            naks_received: s.naks_received.load(Ordering::Relaxed),
            nnaks_received: s.nnaks_received.load(Ordering::Relaxed),
            ncfs_sent: s.ncfs_sent.load(Ordering::Relaxed),
            spmrs_received: s.spmrs_received.load(Ordering::Relaxed),
            retransmits_sent: s.retransmits_sent.load(Ordering::Relaxed),
            parity_sent: s.parity_sent.load(Ordering::Relaxed),
            polls_received: s.polls_received.load(Ordering::Relaxed),
            cumulative_losses: 0,
        };
        if let Some(receiver) = self.inner.receiver.lock().clone() {
            for entry in receiver.peers.iter() {
                snapshot.cumulative_losses += entry.value().rxw.lock().cumulative_losses;
            }
        }
        Ok(snapshot)
    }

    // ====================================================================
    // Lifecycle
    // ====================================================================

    /// Bind the session: create the transport, pick the TSI, build the
    /// engines.
    pub fn bind(&self, addr: PgmSockAddr) -> Result<()> {
        let _guard = self.guard()?;
        let mut lifecycle = self.inner.lifecycle.lock();
        if *lifecycle != Lifecycle::Init {
            return Err(Error::InvalidArgument);
        }
        if addr.port == 0 {
            return Err(Error::InvalidArgument);
        }

        let mut config = self.inner.config.lock();
        if config.send_only && config.recv_only {
            return Err(Error::InvalidArgument);
        }
        if config.groups.is_empty() {
            let group = DEFAULT_GROUP.parse().map_err(|_| Error::InvalidArgument)?;
            config.apply(SockOpt::JoinGroup(group))?;
        }
        // Joins below cover everything queued so far.
        config.pending_membership.clear();

        let send_group = config.effective_send_group().ok_or(Error::InvalidArgument)?;
        let port = config.udp_encap_port.unwrap_or(addr.port);
        let transport = UdpTransport::new(&TransportConfig {
            port,
            send_group,
            recv_groups: config.groups.clone(),
            multicast_loop: config.multicast_loop,
            multicast_hops: config.multicast_hops,
            tos: config.tos,
            sndbuf: config.sndbuf,
            rcvbuf: config.rcvbuf,
        })
        .map_err(Error::System)?;
        let transport = Arc::new(transport);

        let gsi = addr.gsi.unwrap_or_else(Gsi::generate);
        let tsi = Tsi::new(gsi, addr.port);
        *self.inner.tsi.lock() = Some(tsi);

        *self.inner.rate.lock() = TokenBucket::new(config.txw_max_rte);

        if !config.recv_only {
            let initial_sqn = initial_sequence(tsi);
            *self.inner.source.lock() =
                Some(Arc::new(SourceState::new(&config, tsi, addr.port, initial_sqn)));
        }
        if !config.send_only {
            *self.inner.receiver.lock() = Some(Arc::new(ReceiverState::new(
                &config,
                send_group,
                addr.port,
            )));
        }
        *self.inner.transport.lock() = Some(transport);

        *lifecycle = Lifecycle::Bound;
        log::info!("[Sock] bound {} on port {}", tsi, port);
        Ok(())
    }

    /// Start the session: spawn the network thread and prime the first
    /// SPM.
    pub fn connect(&self) -> Result<()> {
        let _guard = self.guard()?;
        let mut lifecycle = self.inner.lifecycle.lock();
        if *lifecycle != Lifecycle::Bound {
            return Err(Error::BadDescriptor);
        }

        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("hpgm-engine".into())
            .spawn(move || engine::run(inner))
            .map_err(Error::System)?;
        *self.inner.engine.lock() = Some(handle);

        // First wakeup happens immediately: the SYN SPMs announce us.
        self.inner.timer.store(Some(Instant::now()));
        self.inner.timer.wake();

        *lifecycle = Lifecycle::Connected;
        Ok(())
    }

    // ====================================================================
    // Data path
    // ====================================================================

    /// Send one APDU to the group.
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        let _guard = self.guard()?;
        if *self.inner.lifecycle.lock() != Lifecycle::Connected {
            return Err(Error::BadDescriptor);
        }
        let source = self.inner.source.lock().clone().ok_or(Error::InvalidArgument)?;
        let transport = self
            .inner
            .transport
            .lock()
            .clone()
            .ok_or(Error::BadDescriptor)?;
        let noblock = self.inner.config.lock().noblock;

        let io = engine::io_ctx(&transport, &self.inner.rate, &self.inner.stats);
        let sent = source.send_apdu(data, &io, noblock)?;

        // Fresh data restarts the heartbeat schedule.
        if let Some(deadline) = source.reset_heartbeat(Instant::now()) {
            self.inner.timer.reschedule(deadline);
        }
        Ok(sent)
    }

    /// Receive one APDU.
    pub fn recv(&self) -> Result<Vec<u8>> {
        self.recv_from().map(|(data, _)| data)
    }

    /// Receive one APDU with its source TSI.
    pub fn recv_from(&self) -> Result<(Vec<u8>, Tsi)> {
        let _guard = self.guard()?;
        if *self.inner.lifecycle.lock() != Lifecycle::Connected {
            return Err(Error::BadDescriptor);
        }
        let receiver = self
            .inner
            .receiver
            .lock()
            .clone()
            .ok_or(Error::InvalidArgument)?;
        let noblock = self.inner.config.lock().noblock;

        loop {
            if self.inner.destroyed.load(Ordering::Acquire) {
                return Err(Error::BadDescriptor);
            }
            if receiver.reset_pending.swap(false, Ordering::AcqRel) {
                return Err(Error::ConnectionReset);
            }

            let tsi = if noblock {
                match receiver.delivery_rx.try_recv() {
                    Ok(tsi) => tsi,
                    Err(_) => return Err(Error::WouldBlock),
                }
            } else {
                // The delivery channel doubles as the wakeup: the
                // network thread sends on data, loss, and reset events.
                // Slices keep close() responsive.
                match receiver.delivery_rx.recv_timeout(RECV_SLICE) {
                    Ok(tsi) => tsi,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return Err(Error::BadDescriptor),
                }
            };

            let Some(peer) = receiver.peers.get(&tsi).map(|p| Arc::clone(p.value())) else {
                continue;
            };
            peer.release_pending();

            let mut apdus: Vec<Apdu> = {
                let mut rxw = peer.rxw.lock();
                let apdus = rxw.readv(1);
                // More behind this one? Keep the peer queued.
                if rxw.has_event
                    || matches!(
                        rxw.peek_state(rxw.commit_lead()),
                        Some(crate::window::SlotState::HaveData)
                    )
                {
                    rxw.has_event = false;
                    if peer.claim_pending() && receiver_requeue(&receiver, tsi).is_err() {
                        peer.release_pending();
                    }
                }
                apdus
            };

            if let Some(apdu) = apdus.pop() {
                return Ok((apdu.data, tsi));
            }
            // Nothing deliverable (a loss boundary, perhaps); loop on.
            if noblock {
                return Err(Error::WouldBlock);
            }
        }
    }

    // ====================================================================
    // Close
    // ====================================================================

    /// Tear the session down. With `flush`, up to three OPT_FIN SPMs
    /// announce the shutdown first.
    pub fn close(&self, flush: bool) -> Result<()> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Ok(());
        }

        if flush {
            let source = self.inner.source.lock().clone();
            let transport = self.inner.transport.lock().clone();
            if let (Some(source), Some(transport)) = (source, transport) {
                let io = engine::io_ctx(&transport, &self.inner.rate, &self.inner.stats);
                source.emit_fin_spms(&io);
            }
        }

        self.inner.destroyed.store(true, Ordering::Release);
        self.inner.timer.wake();
        if let Some(handle) = self.inner.engine.lock().take() {
            if handle.join().is_err() {
                log::warn!("[Sock] engine thread panicked during close");
            }
        }

        // Wait out concurrent entry points, then drop the session state.
        let _writer = self.inner.destroy_lock.write();
        *self.inner.lifecycle.lock() = Lifecycle::Closed;
        *self.inner.transport.lock() = None;
        *self.inner.source.lock() = None;
        *self.inner.receiver.lock() = None;
        log::info!("[Sock] closed");
        Ok(())
    }
}

impl Drop for PgmSock {
    fn drop(&mut self) {
        if !self.inner.destroyed.load(Ordering::Acquire) {
            let _ = self.close(false);
        }
    }
}

/// Requeue a peer for another delivery pass.
fn receiver_requeue(
    receiver: &Arc<ReceiverState>,
    tsi: Tsi,
) -> std::result::Result<(), crossbeam::channel::TrySendError<Tsi>> {
    receiver.requeue(tsi)
}

/// Starting sequence for a fresh session, derived from the TSI so two
/// rapid restarts do not replay a window.
fn initial_sequence(tsi: Tsi) -> u32 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    tsi.hash(&mut hasher);
    if let Ok(elapsed) = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        elapsed.subsec_nanos().hash(&mut hasher);
    }
    hasher.finish() as u32
}
