// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Socket option plane.
//!
//! Every recognized option is a typed [`SockOpt`] variant applied
//! through [`SockConfig::apply`], which enforces the documented bounds:
//! window sizes below half the sequence space, positive intervals,
//! `PEER_EXPIRY >= 2 x AMBIENT_SPM`, `SPMR_EXPIRY < AMBIENT_SPM`, retry
//! caps in 1..=255, FEC geometry constraints.
//!
//! Options are accepted until `bind`; membership options double as
//! runtime calls once the transport exists.

use std::net::IpAddr;
use std::time::Duration;

use crate::config::{
    DEFAULT_AMBIENT_SPM, DEFAULT_HEARTBEAT_SPM, DEFAULT_MAX_TPDU, DEFAULT_NAK_BO_IVL,
    DEFAULT_NAK_DATA_RETRIES, DEFAULT_NAK_NCF_RETRIES, DEFAULT_NAK_RDATA_IVL,
    DEFAULT_NAK_RPT_IVL, DEFAULT_PEER_EXPIRY, DEFAULT_RXW_SQNS, DEFAULT_SPMR_EXPIRY,
    DEFAULT_TXW_SQNS, PGM_MAX_WINDOW_SQNS, PGM_MIN_MTU_IPV4, PGM_MIN_MTU_IPV6,
};
use crate::fec::FecParams;
use crate::transport::{tos_from_dscp, GroupSpec};
use crate::window::NakConfig;
use crate::Error;

/// Source-filter batch modes for `MsFilter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Include,
    Exclude,
}

/// Typed socket options.
#[derive(Debug, Clone)]
pub enum SockOpt {
    /// Maximum TPDU including the IP header.
    Mtu(usize),
    MulticastLoop(bool),
    MulticastHops(u8),
    /// Raw TOS byte on outbound datagrams.
    Tos(u32),
    /// DSCP codepoint (0..=63), mapped onto the TOS byte.
    Dscp(u8),
    SndBuf(usize),
    RcvBuf(usize),

    /// Period of ambient SPMs.
    AmbientSpm(Duration),
    /// Heartbeat back-off schedule applied after data.
    HeartbeatSpm(Vec<Duration>),

    TxwSqns(u32),
    TxwSecs(Duration),
    /// Peak transmit rate in bytes per second; also sizes the token
    /// bucket.
    TxwMaxRte(u64),
    RxwSqns(u32),
    RxwSecs(Duration),
    RxwMaxRte(u64),

    PeerExpiry(Duration),
    SpmrExpiry(Duration),
    NakBoIvl(Duration),
    NakRptIvl(Duration),
    NakRdataIvl(Duration),
    NakDataRetries(u8),
    NakNcfRetries(u8),

    UseFec(FecParams),
    /// Congestion-control extension hook; accepted and stored, drives
    /// nothing.
    UsePgmcc(bool),

    SendOnly(bool),
    RcvOnly(bool),
    /// Receive without ever emitting NAKs.
    Passive(bool),
    AbortOnReset(bool),
    NoBlock(bool),

    JoinGroup(IpAddr),
    LeaveGroup(IpAddr),
    JoinSourceGroup { group: IpAddr, source: IpAddr },
    LeaveSourceGroup { group: IpAddr, source: IpAddr },
    BlockSource { group: IpAddr, source: IpAddr },
    UnblockSource { group: IpAddr, source: IpAddr },
    MsFilter {
        group: IpAddr,
        mode: FilterMode,
        sources: Vec<IpAddr>,
    },

    /// Destination group for outbound data (defaults to the first
    /// joined group).
    SendGroup(IpAddr),
    /// UDP encapsulation port override for `bind`.
    UdpEncapPort(u16),
}

/// Membership changes deferred until the transport exists.
#[derive(Debug, Clone)]
pub enum MembershipOp {
    Join(GroupSpec),
    Leave(GroupSpec),
    Block { group: IpAddr, source: IpAddr },
    Unblock { group: IpAddr, source: IpAddr },
}

/// Accumulated socket configuration.
#[derive(Debug, Clone)]
pub struct SockConfig {
    pub mtu: usize,
    pub multicast_loop: bool,
    pub multicast_hops: u8,
    pub tos: Option<u32>,
    pub sndbuf: Option<usize>,
    pub rcvbuf: Option<usize>,

    pub ambient_spm: Duration,
    pub heartbeat_spm: Vec<Duration>,

    txw_sqns: Option<u32>,
    txw_secs: Option<Duration>,
    pub txw_max_rte: u64,
    rxw_sqns: Option<u32>,
    rxw_secs: Option<Duration>,
    pub rxw_max_rte: u64,

    pub peer_expiry: Duration,
    pub spmr_expiry: Duration,
    pub nak_bo_ivl: Duration,
    pub nak_rpt_ivl: Duration,
    pub nak_rdata_ivl: Duration,
    pub nak_data_retries: u8,
    pub nak_ncf_retries: u8,

    pub fec: Option<FecParams>,
    pub pgmcc: bool,

    pub send_only: bool,
    pub recv_only: bool,
    pub passive: bool,
    pub abort_on_reset: bool,
    pub noblock: bool,

    pub groups: Vec<GroupSpec>,
    pub send_group: Option<IpAddr>,
    pub udp_encap_port: Option<u16>,
    /// Membership operations arriving after bind, for the facade to
    /// forward to the live transport.
    pub pending_membership: Vec<MembershipOp>,
}

impl Default for SockConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MAX_TPDU,
            multicast_loop: true,
            multicast_hops: 16,
            tos: None,
            sndbuf: None,
            rcvbuf: None,
            ambient_spm: DEFAULT_AMBIENT_SPM,
            heartbeat_spm: DEFAULT_HEARTBEAT_SPM.to_vec(),
            txw_sqns: None,
            txw_secs: None,
            txw_max_rte: 0,
            rxw_sqns: None,
            rxw_secs: None,
            rxw_max_rte: 0,
            peer_expiry: DEFAULT_PEER_EXPIRY,
            spmr_expiry: DEFAULT_SPMR_EXPIRY,
            nak_bo_ivl: DEFAULT_NAK_BO_IVL,
            nak_rpt_ivl: DEFAULT_NAK_RPT_IVL,
            nak_rdata_ivl: DEFAULT_NAK_RDATA_IVL,
            nak_data_retries: DEFAULT_NAK_DATA_RETRIES,
            nak_ncf_retries: DEFAULT_NAK_NCF_RETRIES,
            fec: None,
            pgmcc: false,
            send_only: false,
            recv_only: false,
            passive: false,
            abort_on_reset: false,
            noblock: false,
            groups: Vec::new(),
            send_group: None,
            udp_encap_port: None,
            pending_membership: Vec::new(),
        }
    }
}

impl SockConfig {
    /// Apply one option with full validation.
    pub fn apply(&mut self, opt: SockOpt) -> Result<(), Error> {
        match opt {
            SockOpt::Mtu(mtu) => {
                let min = if self.prefers_ipv6() {
                    PGM_MIN_MTU_IPV6
                } else {
                    PGM_MIN_MTU_IPV4
                };
                if mtu < min {
                    return Err(Error::InvalidArgument);
                }
                self.mtu = mtu;
            }
            SockOpt::MulticastLoop(on) => self.multicast_loop = on,
            SockOpt::MulticastHops(hops) => self.multicast_hops = hops,
            SockOpt::Tos(tos) => self.tos = Some(tos),
            SockOpt::Dscp(dscp) => {
                if dscp > 0x3f {
                    return Err(Error::InvalidArgument);
                }
                self.tos = Some(tos_from_dscp(dscp));
            }
            SockOpt::SndBuf(bytes) => self.sndbuf = Some(bytes),
            SockOpt::RcvBuf(bytes) => self.rcvbuf = Some(bytes),

            SockOpt::AmbientSpm(ivl) => {
                if ivl.is_zero() {
                    return Err(Error::InvalidArgument);
                }
                self.ambient_spm = ivl;
            }
            SockOpt::HeartbeatSpm(schedule) => {
                if schedule.is_empty() || schedule.iter().any(Duration::is_zero) {
                    return Err(Error::InvalidArgument);
                }
                self.heartbeat_spm = schedule;
            }

            SockOpt::TxwSqns(sqns) => {
                if sqns == 0 || sqns >= PGM_MAX_WINDOW_SQNS {
                    return Err(Error::InvalidArgument);
                }
                self.txw_sqns = Some(sqns);
            }
            SockOpt::TxwSecs(secs) => {
                if secs.is_zero() {
                    return Err(Error::InvalidArgument);
                }
                self.txw_secs = Some(secs);
            }
            SockOpt::TxwMaxRte(rate) => self.txw_max_rte = rate,
            SockOpt::RxwSqns(sqns) => {
                if sqns == 0 || sqns >= PGM_MAX_WINDOW_SQNS {
                    return Err(Error::InvalidArgument);
                }
                self.rxw_sqns = Some(sqns);
            }
            SockOpt::RxwSecs(secs) => {
                if secs.is_zero() {
                    return Err(Error::InvalidArgument);
                }
                self.rxw_secs = Some(secs);
            }
            SockOpt::RxwMaxRte(rate) => self.rxw_max_rte = rate,

            SockOpt::PeerExpiry(ivl) => {
                if ivl < 2 * self.ambient_spm {
                    return Err(Error::InvalidArgument);
                }
                self.peer_expiry = ivl;
            }
            SockOpt::SpmrExpiry(ivl) => {
                if ivl >= self.ambient_spm {
                    return Err(Error::InvalidArgument);
                }
                self.spmr_expiry = ivl;
            }
            SockOpt::NakBoIvl(ivl) => {
                if ivl.is_zero() {
                    return Err(Error::InvalidArgument);
                }
                self.nak_bo_ivl = ivl;
            }
            SockOpt::NakRptIvl(ivl) => {
                if ivl.is_zero() {
                    return Err(Error::InvalidArgument);
                }
                self.nak_rpt_ivl = ivl;
            }
            SockOpt::NakRdataIvl(ivl) => {
                if ivl.is_zero() {
                    return Err(Error::InvalidArgument);
                }
                self.nak_rdata_ivl = ivl;
            }
            SockOpt::NakDataRetries(n) => {
                if n == 0 {
                    return Err(Error::InvalidArgument);
                }
                self.nak_data_retries = n;
            }
            SockOpt::NakNcfRetries(n) => {
                if n == 0 {
                    return Err(Error::InvalidArgument);
                }
                self.nak_ncf_retries = n;
            }

            SockOpt::UseFec(params) => {
                params.validate()?;
                self.fec = Some(params);
            }
            SockOpt::UsePgmcc(on) => self.pgmcc = on,

            SockOpt::SendOnly(on) => self.send_only = on,
            SockOpt::RcvOnly(on) => self.recv_only = on,
            SockOpt::Passive(on) => self.passive = on,
            SockOpt::AbortOnReset(on) => self.abort_on_reset = on,
            SockOpt::NoBlock(on) => self.noblock = on,

            SockOpt::JoinGroup(group) => {
                let spec = GroupSpec {
                    group,
                    source: None,
                };
                self.groups.push(spec);
                self.pending_membership.push(MembershipOp::Join(spec));
            }
            SockOpt::LeaveGroup(group) => {
                self.groups.retain(|g| g.group != group || g.source.is_some());
                self.pending_membership.push(MembershipOp::Leave(GroupSpec {
                    group,
                    source: None,
                }));
            }
            SockOpt::JoinSourceGroup { group, source } => {
                let spec = GroupSpec {
                    group,
                    source: Some(source),
                };
                self.groups.push(spec);
                self.pending_membership.push(MembershipOp::Join(spec));
            }
            SockOpt::LeaveSourceGroup { group, source } => {
                self.groups
                    .retain(|g| g.group != group || g.source != Some(source));
                self.pending_membership.push(MembershipOp::Leave(GroupSpec {
                    group,
                    source: Some(source),
                }));
            }
            SockOpt::BlockSource { group, source } => {
                self.pending_membership
                    .push(MembershipOp::Block { group, source });
            }
            SockOpt::UnblockSource { group, source } => {
                self.pending_membership
                    .push(MembershipOp::Unblock { group, source });
            }
            SockOpt::MsFilter {
                group,
                mode,
                sources,
            } => {
                // Batch filter expands into per-source operations.
                match mode {
                    FilterMode::Include => {
                        self.groups.retain(|g| g.group != group);
                        for source in sources {
                            let spec = GroupSpec {
                                group,
                                source: Some(source),
                            };
                            self.groups.push(spec);
                            self.pending_membership.push(MembershipOp::Join(spec));
                        }
                    }
                    FilterMode::Exclude => {
                        for source in sources {
                            self.pending_membership
                                .push(MembershipOp::Block { group, source });
                        }
                    }
                }
            }

            SockOpt::SendGroup(group) => {
                if !group.is_multicast() {
                    return Err(Error::InvalidArgument);
                }
                self.send_group = Some(group);
            }
            SockOpt::UdpEncapPort(port) => {
                if port == 0 {
                    return Err(Error::InvalidArgument);
                }
                self.udp_encap_port = Some(port);
            }
        }
        Ok(())
    }

    fn prefers_ipv6(&self) -> bool {
        self.send_group.map_or(false, |g| g.is_ipv6())
            || self.groups.first().is_some_and(|g| g.group.is_ipv6())
    }

    /// Destination group, defaulting to the first joined group.
    pub fn effective_send_group(&self) -> Option<IpAddr> {
        self.send_group.or_else(|| self.groups.first().map(|g| g.group))
    }

    /// TSDU capacity of one TPDU without options.
    pub fn max_tsdu(&self) -> usize {
        let overhead = if self.prefers_ipv6() {
            crate::config::IPV6_HEADER_OVERHEAD
        } else {
            crate::config::IPV4_HEADER_OVERHEAD
        };
        self.mtu
            .saturating_sub(overhead)
            .saturating_sub(crate::config::PGM_HEADER_SIZE)
            .saturating_sub(crate::config::PGM_DATA_HEADER_SIZE)
    }

    /// TSDU capacity when an OPT_FRAGMENT chain is present.
    pub fn max_tsdu_fragment(&self) -> usize {
        // OPT_LENGTH (4) + OPT_FRAGMENT (15).
        self.max_tsdu().saturating_sub(19)
    }

    /// Transmit window size: explicit sequences win, then seconds x rate,
    /// then the default.
    pub fn effective_txw_sqns(&self) -> u32 {
        derived_sqns(
            self.txw_sqns,
            self.txw_secs,
            self.txw_max_rte,
            self.max_tsdu(),
            DEFAULT_TXW_SQNS,
        )
    }

    /// Receive window size, same derivation as the transmit side.
    pub fn effective_rxw_sqns(&self) -> u32 {
        derived_sqns(
            self.rxw_sqns,
            self.rxw_secs,
            self.rxw_max_rte,
            self.max_tsdu(),
            DEFAULT_RXW_SQNS,
        )
    }

    /// NAK state-machine knobs for the receive windows.
    pub fn nak_config(&self) -> NakConfig {
        NakConfig {
            bo_ivl: self.nak_bo_ivl,
            rpt_ivl: self.nak_rpt_ivl,
            rdata_ivl: self.nak_rdata_ivl,
            ncf_retries: u32::from(self.nak_ncf_retries),
            data_retries: u32::from(self.nak_data_retries),
        }
    }
}

fn derived_sqns(
    explicit: Option<u32>,
    secs: Option<Duration>,
    rate: u64,
    max_tsdu: usize,
    fallback: u32,
) -> u32 {
    if let Some(sqns) = explicit {
        return sqns;
    }
    if let (Some(secs), true, true) = (secs, rate > 0, max_tsdu > 0) {
        let sqns = (secs.as_secs_f64() * rate as f64 / max_tsdu as f64).ceil() as u64;
        let sqns = sqns.clamp(1, u64::from(PGM_MAX_WINDOW_SQNS - 1));
        return sqns as u32;
    }
    fallback
}
