//! tokio UDP transport.
//!
//! Two socket flavours back the stack: a multicast socket joined to
//! 224.0.23.12 for discovery and routing traffic, and a plain unicast
//! socket for control and tunneling. The multicast socket is built through
//! `socket2` so SO_REUSEADDR can be set before binding, letting several
//! clients on one host share the discovery group.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::error::Result;
use crate::net::transport::{AsyncTransport, NetProvider};
use crate::protocol::constants::{KNXNETIP_MULTICAST_ADDR, KNXNETIP_PORT};

/// UDP transport over a tokio socket.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind a unicast socket to an ephemeral local port.
    pub async fn bind() -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        log::debug!("udp socket bound to {}", socket.local_addr()?);
        Ok(Self { socket })
    }

    /// Build a discovery socket: reusable, bound to an ephemeral port and
    /// joined to the KNXnet/IP multicast group on all interfaces.
    pub fn multicast() -> Result<Self> {
        let raw = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        raw.set_reuse_address(true)?;
        raw.set_nonblocking(true)?;
        raw.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;

        let socket = UdpSocket::from_std(raw.into())?;
        socket.join_multicast_v4(KNXNETIP_MULTICAST_ADDR, Ipv4Addr::UNSPECIFIED)?;
        log::debug!(
            "discovery socket bound to {}, joined {}",
            socket.local_addr()?,
            KNXNETIP_MULTICAST_ADDR
        );
        Ok(Self { socket })
    }

    /// The discovery group's well-known endpoint.
    pub const fn multicast_endpoint() -> SocketAddrV4 {
        SocketAddrV4::new(KNXNETIP_MULTICAST_ADDR, KNXNETIP_PORT)
    }
}

impl AsyncTransport for UdpTransport {
    async fn send_to(&mut self, data: &[u8], addr: SocketAddrV4) -> Result<()> {
        self.socket.send_to(data, SocketAddr::V4(addr)).await?;
        Ok(())
    }

    async fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddrV4)> {
        loop {
            let (n, from) = self.socket.recv_from(buf).await?;
            match from {
                SocketAddr::V4(v4) => return Ok((n, v4)),
                // KNXnet/IP is IPv4-only; anything else is noise.
                SocketAddr::V6(v6) => log::debug!("ignoring datagram from IPv6 source {v6}"),
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddrV4> {
        match self.socket.local_addr() {
            Ok(SocketAddr::V4(v4)) => Some(v4),
            _ => None,
        }
    }
}

/// Production [`NetProvider`] backed by tokio UDP sockets.
#[derive(Debug, Default)]
pub struct UdpProvider;

impl NetProvider for UdpProvider {
    type Transport = UdpTransport;

    async fn discovery(&mut self) -> Result<UdpTransport> {
        UdpTransport::multicast()
    }

    async fn unicast(&mut self) -> Result<UdpTransport> {
        UdpTransport::bind().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unicast_loopback() {
        let mut a = UdpTransport::bind().await.unwrap();
        let mut b = UdpTransport::bind().await.unwrap();
        let b_addr = SocketAddrV4::new(
            Ipv4Addr::LOCALHOST,
            b.local_addr().unwrap().port(),
        );

        a.send_to(&[0x06, 0x10], b_addr).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x06, 0x10]);
    }

    #[tokio::test]
    async fn test_multicast_socket_binds() {
        // Joining the group requires a configured interface, so just verify
        // the socket comes up with a local address.
        if let Ok(t) = UdpTransport::multicast() {
            assert!(t.local_addr().is_some());
        }
    }
}
