// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP transport for PGM multicast send/receive.
//!
//! Consolidates socket construction, multicast group management, and the
//! send paths. One socket carries everything: it is bound to the session
//! port with SO_REUSEADDR, joined to the receive group set, and used for
//! both multicast data and unicast repair-path traffic. The network
//! thread registers a cloned handle with mio for readiness.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};

/// One multicast group membership, optionally source-specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupSpec {
    pub group: IpAddr,
    /// SSM source filter; `None` for any-source membership.
    pub source: Option<IpAddr>,
}

/// Everything `UdpTransport::new` needs, distilled from the option plane.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// UDP encapsulation port (the PGM dport).
    pub port: u16,
    /// Destination group for outbound data.
    pub send_group: IpAddr,
    /// Subscribed groups.
    pub recv_groups: Vec<GroupSpec>,
    pub multicast_loop: bool,
    pub multicast_hops: u8,
    pub tos: Option<u32>,
    pub sndbuf: Option<usize>,
    pub rcvbuf: Option<usize>,
}

/// UDP transport for bidirectional multicast communication.
#[derive(Debug)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    group_addr: SocketAddr,
    /// Primary interface address, advertised as this node's NLA.
    nla: IpAddr,
    port: u16,
}

impl UdpTransport {
    /// Create the session socket, join the receive groups, and apply the
    /// per-socket transmission options.
    pub fn new(config: &TransportConfig) -> io::Result<UdpTransport> {
        let ipv6 = config.send_group.is_ipv6();
        let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;

        if let Some(bytes) = config.sndbuf {
            socket.set_send_buffer_size(bytes)?;
        }
        if let Some(bytes) = config.rcvbuf {
            socket.set_recv_buffer_size(bytes)?;
        }

        let bind_addr: SocketAddr = if ipv6 {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), config.port)
        } else {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port)
        };
        socket.bind(&bind_addr.into())?;

        let iface = primary_interface();
        for spec in &config.recv_groups {
            join_group(&socket, spec, iface)?;
        }

        match config.send_group {
            IpAddr::V4(_) => {
                if let IpAddr::V4(v4) = iface {
                    // Pin outbound multicast to the advertised interface.
                    if let Err(e) = socket.set_multicast_if_v4(&v4) {
                        log::debug!("[UDP] set_multicast_if_v4({}) failed: {}", v4, e);
                    }
                }
                socket.set_multicast_loop_v4(config.multicast_loop)?;
                socket.set_multicast_ttl_v4(u32::from(config.multicast_hops))?;
                if let Some(tos) = config.tos {
                    if let Err(e) = socket.set_tos(tos) {
                        log::debug!("[UDP] set_tos({:#04x}) failed (non-fatal): {}", tos, e);
                    }
                }
            }
            IpAddr::V6(_) => {
                socket.set_multicast_loop_v6(config.multicast_loop)?;
                socket.set_multicast_hops_v6(u32::from(config.multicast_hops))?;
            }
        }

        let socket: UdpSocket = socket.into();
        socket.set_nonblocking(true)?;
        log::debug!(
            "[UDP] bound {} groups={} iface={}",
            bind_addr,
            config.recv_groups.len(),
            iface
        );

        Ok(UdpTransport {
            socket: Arc::new(socket),
            group_addr: SocketAddr::new(config.send_group, config.port),
            nla: iface,
            port: config.port,
        })
    }

    /// Interface address advertised in SPMs and validated in NAKs.
    pub fn nla(&self) -> IpAddr {
        self.nla
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn group_addr(&self) -> SocketAddr {
        self.group_addr
    }

    /// Multicast one TPDU to the session group.
    pub fn send_to_group(&self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send_to(buf, self.group_addr)
    }

    /// Unicast one TPDU to a peer on the session port.
    pub fn send_unicast(&self, addr: IpAddr, buf: &[u8]) -> io::Result<usize> {
        self.socket.send_to(buf, SocketAddr::new(addr, self.port))
    }

    /// Clone the socket handle for mio registration.
    pub fn clone_socket(&self) -> io::Result<UdpSocket> {
        self.socket.try_clone()
    }

    /// Join an additional group at runtime.
    pub fn join(&self, spec: &GroupSpec) -> io::Result<()> {
        let socket = self.as_socket2()?;
        let result = join_group(&socket, spec, self.nla);
        std::mem::forget(socket);
        result
    }

    /// Leave a group at runtime.
    pub fn leave(&self, spec: &GroupSpec) -> io::Result<()> {
        let socket = self.as_socket2()?;
        let result = leave_group(&socket, spec, self.nla);
        std::mem::forget(socket);
        result
    }

    /// Block a source within an any-source membership.
    pub fn block_source(&self, group: IpAddr, source: IpAddr) -> io::Result<()> {
        self.source_filter(group, source, libc::IP_BLOCK_SOURCE)
    }

    /// Re-admit a previously blocked source.
    pub fn unblock_source(&self, group: IpAddr, source: IpAddr) -> io::Result<()> {
        self.source_filter(group, source, libc::IP_UNBLOCK_SOURCE)
    }

    #[cfg(unix)]
    fn source_filter(&self, group: IpAddr, source: IpAddr, op: libc::c_int) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;

        let (IpAddr::V4(group), IpAddr::V4(source)) = (group, source) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "source filters are IPv4-only",
            ));
        };
        let IpAddr::V4(iface) = self.nla else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no IPv4 interface for source filter",
            ));
        };
        let mreq = libc::ip_mreq_source {
            imr_multiaddr: libc::in_addr {
                s_addr: u32::from_ne_bytes(group.octets()),
            },
            imr_sourceaddr: libc::in_addr {
                s_addr: u32::from_ne_bytes(source.octets()),
            },
            imr_interface: libc::in_addr {
                s_addr: u32::from_ne_bytes(iface.octets()),
            },
        };
        let rc = unsafe {
            libc::setsockopt(
                self.socket.as_raw_fd(),
                libc::IPPROTO_IP,
                op,
                std::ptr::addr_of!(mreq).cast(),
                std::mem::size_of::<libc::ip_mreq_source>() as libc::socklen_t,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn source_filter(&self, _group: IpAddr, _source: IpAddr, _op: i32) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "source filters unsupported on this platform",
        ))
    }

    /// Borrow the handle as a socket2 socket for option calls.
    ///
    /// The returned socket aliases the descriptor; callers must
    /// `mem::forget` it instead of letting it close the fd.
    #[cfg(unix)]
    fn as_socket2(&self) -> io::Result<Socket> {
        use std::os::unix::io::{AsRawFd, FromRawFd};
        Ok(unsafe { Socket::from_raw_fd(self.socket.as_raw_fd()) })
    }

    #[cfg(not(unix))]
    fn as_socket2(&self) -> io::Result<Socket> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "runtime group management is unix-only",
        ))
    }
}

/// Pick the primary non-loopback interface for the advertised NLA.
///
/// `HPGM_MULTICAST_IF` overrides discovery (testing, multi-homed hosts).
pub fn primary_interface() -> IpAddr {
    if let Ok(var) = std::env::var("HPGM_MULTICAST_IF") {
        if let Ok(addr) = var.parse::<IpAddr>() {
            log::debug!("[UDP] using HPGM_MULTICAST_IF override: {}", addr);
            return addr;
        }
    }
    match local_ip_address::local_ip() {
        Ok(addr) => addr,
        Err(e) => {
            log::debug!("[UDP] interface discovery failed ({}), using loopback", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

fn join_group(socket: &Socket, spec: &GroupSpec, iface: IpAddr) -> io::Result<()> {
    match (spec.group, spec.source) {
        (IpAddr::V4(group), None) => {
            let iface = match iface {
                IpAddr::V4(v4) => v4,
                IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
            };
            match socket.join_multicast_v4(&group, &iface) {
                Ok(()) => {}
                // Already a member on this interface; harmless.
                Err(e) if e.raw_os_error() == Some(libc::EADDRINUSE) => {
                    log::debug!("[UDP] join {} already member, skipping", group);
                }
                Err(e) => return Err(e),
            }
        }
        (IpAddr::V4(group), Some(IpAddr::V4(source))) => {
            let iface = match iface {
                IpAddr::V4(v4) => v4,
                IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
            };
            socket.join_ssm_v4(&source, &group, &iface)?;
        }
        (IpAddr::V6(group), None) => {
            socket.join_multicast_v6(&group, 0)?;
        }
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "mixed-family or IPv6 SSM memberships are not supported",
            ));
        }
    }
    log::debug!("[UDP] joined {:?}", spec);
    Ok(())
}

fn leave_group(socket: &Socket, spec: &GroupSpec, iface: IpAddr) -> io::Result<()> {
    match (spec.group, spec.source) {
        (IpAddr::V4(group), None) => {
            let iface = match iface {
                IpAddr::V4(v4) => v4,
                IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
            };
            socket.leave_multicast_v4(&group, &iface)
        }
        (IpAddr::V4(group), Some(IpAddr::V4(source))) => {
            let iface = match iface {
                IpAddr::V4(v4) => v4,
                IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
            };
            socket.leave_ssm_v4(&source, &group, &iface)
        }
        (IpAddr::V6(group), None) => socket.leave_multicast_v6(&group, 0),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "mixed-family or IPv6 SSM memberships are not supported",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config(port: u16) -> TransportConfig {
        TransportConfig {
            port,
            send_group: "239.192.7.7".parse().unwrap(),
            recv_groups: vec![GroupSpec {
                group: "239.192.7.7".parse().unwrap(),
                source: None,
            }],
            multicast_loop: true,
            multicast_hops: 1,
            tos: None,
            sndbuf: None,
            rcvbuf: None,
        }
    }

    #[test]
    fn test_transport_bind_and_loopback_send() {
        let transport = match UdpTransport::new(&loopback_config(37411)) {
            Ok(t) => t,
            Err(e) => {
                // Multicast may be unavailable in constrained sandboxes.
                eprintln!("skipping: multicast unavailable: {}", e);
                return;
            }
        };
        let sent = transport
            .send_to_group(b"ping")
            .expect("multicast send on loopback");
        assert_eq!(sent, 4);
    }

    #[test]
    fn test_transport_unicast_send() {
        let transport = match UdpTransport::new(&loopback_config(37413)) {
            Ok(t) => t,
            Err(e) => {
                eprintln!("skipping: multicast unavailable: {}", e);
                return;
            }
        };
        let receiver = UdpSocket::bind("127.0.0.1:37513").expect("bind receiver");
        let target: IpAddr = "127.0.0.1".parse().unwrap();
        // Unicast goes to the session port; rebind target for the test.
        transport
            .socket
            .send_to(b"nak", SocketAddr::new(target, 37513))
            .expect("unicast send");
        let mut buf = [0u8; 16];
        receiver
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let (len, _) = receiver.recv_from(&mut buf).expect("receive unicast");
        assert_eq!(&buf[..len], b"nak");
    }

    #[test]
    fn test_primary_interface_override() {
        std::env::set_var("HPGM_MULTICAST_IF", "10.1.2.3");
        assert_eq!(primary_interface(), "10.1.2.3".parse::<IpAddr>().unwrap());
        std::env::remove_var("HPGM_MULTICAST_IF");
    }
}
