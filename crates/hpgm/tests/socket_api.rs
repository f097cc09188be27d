// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Socket facade: lifecycle ordering, the option plane, and a loopback
//! end-to-end session.
//!
//! The end-to-end tests need working multicast loopback; environments
//! without it (some containers) skip them with a note instead of
//! failing.

use std::time::{Duration, Instant};

use hpgm::{Error, Gsi, PgmSock, PgmSockAddr, SockOpt};

fn group() -> std::net::IpAddr {
    "239.192.54.33".parse().unwrap()
}

/// Poll a non-blocking receiver until a deadline.
fn recv_with_deadline(sock: &PgmSock, deadline: Duration) -> Option<Vec<u8>> {
    let until = Instant::now() + deadline;
    while Instant::now() < until {
        match sock.recv() {
            Ok(data) => return Some(data),
            Err(Error::WouldBlock) => std::thread::sleep(Duration::from_millis(5)),
            Err(e) => panic!("recv failed: {}", e),
        }
    }
    None
}

#[test]
fn test_lifecycle_ordering_enforced() {
    let sock = PgmSock::new().expect("socket");
    assert!(
        matches!(sock.connect(), Err(Error::BadDescriptor)),
        "connect before bind fails"
    );
    assert!(matches!(
        sock.bind(PgmSockAddr::any(0)),
        Err(Error::InvalidArgument)
    ));
    sock.close(false).expect("close");
    assert!(matches!(
        sock.bind(PgmSockAddr::any(7500)),
        Err(Error::BadDescriptor)
    ));
}

#[test]
fn test_option_plane_queries() {
    let sock = PgmSock::new().unwrap();
    sock.set_option(SockOpt::Mtu(9000)).unwrap();
    assert_eq!(sock.mtu().unwrap(), 9000);

    // No timer armed yet.
    assert_eq!(sock.time_remain().unwrap(), Duration::ZERO);

    // Unlimited bucket: anything fits immediately.
    assert_eq!(sock.rate_remain(1_000_000).unwrap(), Duration::ZERO);

    let stats = sock.stats().unwrap();
    assert_eq!(stats.packets_sent, 0);
    assert_eq!(stats.malformed_percent(), 0.0);
}

#[test]
fn test_end_to_end_loopback_delivery() {
    std::env::set_var("HPGM_MULTICAST_IF", "127.0.0.1");

    let sender = PgmSock::new().unwrap();
    sender.set_option(SockOpt::SendOnly(true)).unwrap();
    sender.set_option(SockOpt::TxwSqns(256)).unwrap();
    sender.set_option(SockOpt::JoinGroup(group())).unwrap();
    if let Err(e) = sender.bind(PgmSockAddr {
        port: 37522,
        gsi: Some(Gsi([1, 1, 1, 1, 1, 1])),
    }) {
        eprintln!("skipping: multicast unavailable: {}", e);
        return;
    }
    sender.connect().unwrap();

    let receiver = PgmSock::new().unwrap();
    receiver.set_option(SockOpt::RcvOnly(true)).unwrap();
    receiver.set_option(SockOpt::RxwSqns(256)).unwrap();
    receiver.set_option(SockOpt::NoBlock(true)).unwrap();
    receiver.set_option(SockOpt::JoinGroup(group())).unwrap();
    if let Err(e) = receiver.bind(PgmSockAddr {
        port: 37522,
        gsi: Some(Gsi([2, 2, 2, 2, 2, 2])),
    }) {
        eprintln!("skipping: multicast unavailable: {}", e);
        return;
    }
    receiver.connect().unwrap();

    // Give both engines a beat to come up.
    std::thread::sleep(Duration::from_millis(50));

    match sender.send(b"hello, multicast group") {
        Ok(sent) => assert_eq!(sent, 22),
        Err(e) => {
            eprintln!("skipping: multicast send unavailable: {}", e);
            return;
        }
    }

    match recv_with_deadline(&receiver, Duration::from_secs(5)) {
        Some(data) => assert_eq!(data, b"hello, multicast group"),
        None => {
            // Loopback delivery can be unavailable even when binds work.
            eprintln!("skipping: no loopback delivery observed");
            return;
        }
    }

    let stats = sender.stats().unwrap();
    assert!(stats.packets_sent >= 1);

    sender.close(true).expect("flush close");
    receiver.close(false).expect("close");
}

#[test]
fn test_end_to_end_multi_fragment_apdu() {
    std::env::set_var("HPGM_MULTICAST_IF", "127.0.0.1");
    let group: std::net::IpAddr = "239.192.54.34".parse().unwrap();

    let sender = PgmSock::new().unwrap();
    sender.set_option(SockOpt::SendOnly(true)).unwrap();
    sender.set_option(SockOpt::JoinGroup(group)).unwrap();
    if sender
        .bind(PgmSockAddr {
            port: 37524,
            gsi: Some(Gsi([3, 3, 3, 3, 3, 3])),
        })
        .is_err()
    {
        eprintln!("skipping: multicast unavailable");
        return;
    }
    sender.connect().unwrap();

    let receiver = PgmSock::new().unwrap();
    receiver.set_option(SockOpt::RcvOnly(true)).unwrap();
    receiver.set_option(SockOpt::NoBlock(true)).unwrap();
    receiver.set_option(SockOpt::JoinGroup(group)).unwrap();
    if receiver
        .bind(PgmSockAddr {
            port: 37524,
            gsi: Some(Gsi([4, 4, 4, 4, 4, 4])),
        })
        .is_err()
    {
        eprintln!("skipping: multicast unavailable");
        return;
    }
    receiver.connect().unwrap();
    std::thread::sleep(Duration::from_millis(50));

    // Larger than one TPDU: fragments with OPT_FRAGMENT, reassembled on
    // the far side into a single APDU.
    let apdu: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    if sender.send(&apdu).is_err() {
        eprintln!("skipping: multicast send unavailable");
        return;
    }

    match recv_with_deadline(&receiver, Duration::from_secs(5)) {
        Some(data) => assert_eq!(data, apdu, "reassembled APDU matches"),
        None => eprintln!("skipping: no loopback delivery observed"),
    }

    sender.close(false).unwrap();
    receiver.close(false).unwrap();
}
