// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # HPGM - Reliable Multicast Transport
//!
//! A pure Rust implementation of the PGM (Pragmatic General Multicast,
//! RFC 3208) transport protocol: reliable, ordered, source-identified
//! delivery of datagrams to a multicast group with NAK-based selective
//! loss recovery and optional Reed-Solomon forward error correction.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hpgm::{PgmSock, PgmSockAddr, SockOpt, Result};
//!
//! fn main() -> Result<()> {
//!     let sock = PgmSock::new()?;
//!     sock.set_option(SockOpt::SendOnly(true))?;
//!     sock.set_option(SockOpt::TxwSqns(1000))?;
//!     sock.bind(PgmSockAddr::any(7500))?;
//!     sock.connect()?;
//!
//!     sock.send(b"hello, group")?;
//!     sock.close(true)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +-------------------------------------------------------------------+
//! |                        Application Layer                          |
//! |             PgmSock::send / PgmSock::recv / options               |
//! +-------------------------------------------------------------------+
//! |                         Protocol Engines                          |
//! |  Source (SPM, ODATA, RDATA repair)  |  Receiver (demux, NAK, NCF) |
//! +-------------------------------------------------------------------+
//! |                          Window Layer                             |
//! |  TransmitWindow (retransmit queue)  |  ReceiveWindow (state machine)|
//! +-------------------------------------------------------------------+
//! |                        Transport Layer                            |
//! |        UDP multicast send/recv | rate control | timers            |
//! +-------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`PgmSock`] | Socket facade: lifecycle, options, send/recv |
//! | [`SockOpt`] | Typed socket option plane |
//! | [`Tsi`] | Transport session identifier (GSI + source port) |
//! | [`Error`] | Error taxonomy shared by every fallible operation |
//!
//! ## Modules Overview
//!
//! - [`sock`] - Socket facade (start here)
//! - [`protocol`] - PGM wire codec (headers, options, checksum)
//! - [`window`] - Transmit and receive windows
//! - [`engine`] - Source/receiver engines, timers, network thread
//! - [`transport`] - UDP multicast socket plumbing
//!
//! ## See Also
//!
//! - [RFC 3208](https://www.rfc-editor.org/rfc/rfc3208) - PGM Reliable
//!   Transport Protocol Specification

/// Protocol constants and tunable defaults.
pub mod config;
/// Token-bucket rate limiting for outbound traffic.
pub mod congestion;
/// Source/receiver engines, peer table, timer substrate, network thread.
pub mod engine;
/// Reed-Solomon forward error correction over transmission groups.
pub mod fec;
/// PGM wire codec: header, type bodies, TLV options, checksum, NLAs.
pub mod protocol;
/// Packet buffer shared between windows and in-flight send state.
pub mod skb;
/// Socket facade, option plane, and error taxonomy.
pub mod sock;
/// UDP multicast socket plumbing.
pub mod transport;
/// Sequence arithmetic, transmit window, receive window.
pub mod window;

pub use fec::FecParams;
pub use protocol::{Gsi, Tsi};
pub use sock::{Error, FilterMode, PgmSock, PgmSockAddr, Result, SockOpt, StatsSnapshot};
pub use transport::GroupSpec;
