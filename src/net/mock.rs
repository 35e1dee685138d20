//! Mock transport for testing.
//!
//! A channel-backed [`AsyncTransport`]: tests inject inbound datagrams and
//! observe outbound ones through a [`MockHandle`], while the connection task
//! blocks on `recv_from` exactly as it would on a real socket. Sent packets
//! carry a send timestamp so pacing behaviour can be asserted under paused
//! tokio time.
//!
//! ```rust,no_run
//! use knx_link::net::{mock_pair, AsyncTransport};
//! # async fn demo() {
//! let (mut transport, handle) = mock_pair();
//!
//! handle.inject(vec![0x06, 0x10], "192.168.1.10:3671".parse().unwrap());
//! let mut buf = [0u8; 512];
//! let (n, from) = transport.recv_from(&mut buf).await.unwrap();
//! # }
//! ```

use std::collections::VecDeque;
use std::net::SocketAddrV4;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{KnxError, Result};
use crate::net::transport::{AsyncTransport, NetProvider};

/// A datagram captured from the transport's send side.
#[derive(Debug, Clone)]
pub struct SentPacket {
    /// The raw bytes handed to the transport
    pub data: Vec<u8>,
    /// Destination endpoint
    pub to: SocketAddrV4,
    /// Tokio time at the moment of the send
    pub at: Instant,
}

/// Channel-backed transport half.
#[derive(Debug)]
pub struct MockTransport {
    inbound: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddrV4)>,
    sent: mpsc::UnboundedSender<SentPacket>,
}

/// Test-side handle: inject inbound traffic, observe outbound traffic.
#[derive(Debug)]
pub struct MockHandle {
    inbound: mpsc::UnboundedSender<(Vec<u8>, SocketAddrV4)>,
    sent: mpsc::UnboundedReceiver<SentPacket>,
}

/// Create a connected transport/handle pair.
pub fn mock_pair() -> (MockTransport, MockHandle) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    (
        MockTransport {
            inbound: inbound_rx,
            sent: sent_tx,
        },
        MockHandle {
            inbound: inbound_tx,
            sent: sent_rx,
        },
    )
}

impl MockHandle {
    /// Queue a datagram for the transport's next `recv_from`.
    pub fn inject(&self, data: Vec<u8>, from: SocketAddrV4) {
        // A dropped transport means the task under test has shut down;
        // the injection is simply lost, like a datagram to a closed socket.
        let _ = self.inbound.send((data, from));
    }

    /// Await the next packet the task sends.
    pub async fn next_sent(&mut self) -> SentPacket {
        self.sent.recv().await.expect("transport dropped")
    }

    /// Pop an already-sent packet without waiting, if any.
    pub fn try_sent(&mut self) -> Option<SentPacket> {
        self.sent.try_recv().ok()
    }
}

impl AsyncTransport for MockTransport {
    async fn send_to(&mut self, data: &[u8], addr: SocketAddrV4) -> Result<()> {
        let _ = self.sent.send(SentPacket {
            data: data.to_vec(),
            to: addr,
            at: Instant::now(),
        });
        Ok(())
    }

    async fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddrV4)> {
        match self.inbound.recv().await {
            Some((data, from)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok((n, from))
            }
            // Handle dropped: behave like a socket that never hears anything.
            None => std::future::pending().await,
        }
    }
}

/// [`NetProvider`] handing out pre-wired mock transports in FIFO order.
///
/// Queue one transport per socket the scenario will open: discovery first
/// when the configuration requires a search, then the unicast control
/// socket, then further control sockets for reconnect cycles.
#[derive(Debug, Default)]
pub struct MockProvider {
    transports: VecDeque<MockTransport>,
}

impl MockProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next transport the task will be handed.
    pub fn push(&mut self, transport: MockTransport) {
        self.transports.push_back(transport);
    }

    fn next(&mut self) -> Result<MockTransport> {
        self.transports.pop_front().ok_or_else(|| {
            KnxError::Socket(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no mock transport queued",
            ))
        })
    }
}

impl NetProvider for MockProvider {
    type Transport = MockTransport;

    async fn discovery(&mut self) -> Result<MockTransport> {
        self.next()
    }

    async fn unicast(&mut self) -> Result<MockTransport> {
        self.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn gateway() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), 3671)
    }

    #[tokio::test]
    async fn test_inject_and_receive() {
        let (mut transport, handle) = mock_pair();
        handle.inject(vec![0x01, 0x02, 0x03], gateway());

        let mut buf = [0u8; 16];
        let (n, from) = transport.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x01, 0x02, 0x03]);
        assert_eq!(from, gateway());
    }

    #[tokio::test]
    async fn test_send_is_observable() {
        let (mut transport, mut handle) = mock_pair();
        transport.send_to(&[0xAA, 0xBB], gateway()).await.unwrap();

        let sent = handle.next_sent().await;
        assert_eq!(sent.data, vec![0xAA, 0xBB]);
        assert_eq!(sent.to, gateway());
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let (mut transport, handle) = mock_pair();
        handle.inject(vec![0x01], gateway());
        handle.inject(vec![0x02], gateway());

        let mut buf = [0u8; 16];
        transport.recv_from(&mut buf).await.unwrap();
        assert_eq!(buf[0], 0x01);
        transport.recv_from(&mut buf).await.unwrap();
        assert_eq!(buf[0], 0x02);
    }

    #[tokio::test]
    async fn test_provider_hands_out_in_order() {
        let (t1, _h1) = mock_pair();
        let (t2, _h2) = mock_pair();
        let mut provider = MockProvider::new();
        provider.push(t1);
        provider.push(t2);

        assert!(provider.discovery().await.is_ok());
        assert!(provider.unicast().await.is_ok());
        assert!(provider.unicast().await.is_err());
    }
}
