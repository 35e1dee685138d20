//! Network transport abstraction.
//!
//! The connection task depends on these traits instead of concrete sockets,
//! which keeps the protocol logic testable without network hardware and the
//! socket implementations swappable.
//!
//! [`AsyncTransport`] is a minimal datagram interface: fire-and-forget send,
//! awaitable receive. [`NetProvider`] hands out fresh transports (a
//! multicast-capable socket for discovery, a unicast socket for control and
//! tunneling traffic) because the connection task closes and reopens sockets
//! across reconnect cycles.
//!
//! The futures are declared `Send` so a provider-generic connection task can
//! be spawned onto a multithreaded runtime.

use core::future::Future;
use std::net::SocketAddrV4;

use crate::error::Result;

/// Asynchronous datagram transport.
pub trait AsyncTransport: Send + 'static {
    /// Send a datagram to the given endpoint. Fire-and-forget: a successful
    /// return means the datagram was handed to the network, not delivered.
    fn send_to(
        &mut self,
        data: &[u8],
        addr: SocketAddrV4,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Receive the next datagram into `buf`, returning the byte count and
    /// the remote endpoint. Pends until a datagram arrives.
    fn recv_from(
        &mut self,
        buf: &mut [u8],
    ) -> impl Future<Output = Result<(usize, SocketAddrV4)>> + Send;

    /// Local endpoint the transport is bound to, when known.
    fn local_addr(&self) -> Option<SocketAddrV4> {
        None
    }
}

/// Source of transports for the connection task.
pub trait NetProvider: Send + 'static {
    /// The transport type this provider hands out.
    type Transport: AsyncTransport;

    /// A multicast-capable socket joined to the KNXnet/IP discovery group.
    fn discovery(&mut self) -> impl Future<Output = Result<Self::Transport>> + Send;

    /// A unicast socket for control and tunneling traffic.
    fn unicast(&mut self) -> impl Future<Output = Result<Self::Transport>> + Send;
}
