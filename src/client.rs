//! High-level KNX client.
//!
//! [`KnxClient`] is a cloneable handle to the connection task spawned by
//! [`ClientBuilder::build`]. Requests travel to the task over a command
//! channel; each caller suspends on a oneshot until the task resolves it
//! with the matching acknowledgement (and, for reads, the group response),
//! or until the configured request timeout elapses.
//!
//! # Example
//!
//! ```no_run
//! use knx_link::{ApduPayload, GroupAddress, KnxClient};
//!
//! # async fn demo() -> knx_link::Result<()> {
//! let client = KnxClient::builder().build();
//! client.connect().await?;
//!
//! let light = GroupAddress::new(1, 2, 3)?;
//! client.write(light, ApduPayload::Small(1)).await?;
//! let value = client.read(light).await?;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddrV4;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::addressing::{GroupAddress, IndividualAddress};
use crate::config::ClientConfig;
use crate::error::{KnxError, Result};
use crate::net::transport::NetProvider;
use crate::net::udp::UdpProvider;
use crate::protocol::builder::DatagramBuilder;
use crate::protocol::cemi::ApduPayload;
use crate::tunnel::{Command, GroupRequest, KnxEvent, Tunnel};

/// Capacity of the observable-event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Handle to a running KNX connection.
///
/// Cloning is cheap; all clones talk to the same connection task. Dropping
/// the last clone stops the task after a best-effort disconnect.
#[derive(Debug, Clone)]
pub struct KnxClient {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<KnxEvent>,
    builder: DatagramBuilder,
    two_level: bool,
    request_timeout: Duration,
}

impl KnxClient {
    /// Start configuring a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Initiate the search → connect path and wait for the tunnel to come
    /// up. While the client wants to be connected, the connection task keeps
    /// re-establishing the tunnel after failures on its own.
    ///
    /// This call itself has no timeout (a search plus connect cycle can
    /// legitimately take tens of seconds); wrap it in
    /// [`tokio::time::timeout`] to bound it.
    pub async fn connect(&self) -> Result<()> {
        let mut events = self.events.subscribe();
        self.send(Command::Connect)?;
        loop {
            match events.recv().await {
                Ok(KnxEvent::Online) => return Ok(()),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(KnxError::ConnectionLost),
            }
        }
    }

    /// Tear the tunnel down and stop reconnecting. Pending requests are
    /// rejected by the connection task.
    pub async fn disconnect(&self) -> Result<()> {
        let mut events = self.events.subscribe();
        self.send(Command::Disconnect)?;
        loop {
            match events.recv().await {
                Ok(KnxEvent::Offline) => return Ok(()),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(KnxError::ConnectionLost),
            }
        }
    }

    /// Read a group value: sends GroupValue_Read and resolves with the raw
    /// payload of the first GroupValue_Response for the address.
    pub async fn read(&self, addr: GroupAddress) -> Result<Vec<u8>> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let (value_tx, value_rx) = oneshot::channel();
        self.send(Command::Group(GroupRequest {
            datagram: self.builder.read_request(addr),
            ack: ack_tx,
            read_waiter: Some((addr.raw(), value_tx)),
        }))?;

        tokio::time::timeout(self.request_timeout, async {
            ack_rx.await.map_err(|_| KnxError::ConnectionLost)??;
            value_rx.await.map_err(|_| KnxError::ConnectionLost)
        })
        .await
        .map_err(|_| KnxError::NoResponse)?
    }

    /// Write an externally encoded group value. Resolves once the gateway
    /// acknowledges the tunneling request.
    pub async fn write(&self, addr: GroupAddress, payload: ApduPayload) -> Result<()> {
        let datagram = self.builder.write_request(addr, payload)?;
        self.submit_acked(|ack| GroupRequest {
            datagram,
            ack,
            read_waiter: None,
        })
        .await
    }

    /// Write raw payload bytes with an explicit bit length, bypassing any
    /// datapoint encoding.
    pub async fn write_raw(&self, addr: GroupAddress, data: &[u8], bit_length: u8) -> Result<()> {
        let datagram = self.builder.write_raw_request(addr, data, bit_length)?;
        self.submit_acked(|ack| GroupRequest {
            datagram,
            ack,
            read_waiter: None,
        })
        .await
    }

    /// Answer a group read observed on the bus with GroupValue_Response.
    pub async fn respond(&self, addr: GroupAddress, payload: ApduPayload) -> Result<()> {
        let datagram = self.builder.respond_request(addr, payload)?;
        self.submit_acked(|ack| GroupRequest {
            datagram,
            ack,
            read_waiter: None,
        })
        .await
    }

    /// Subscribe to connection and group-telegram events.
    pub fn subscribe(&self) -> broadcast::Receiver<KnxEvent> {
        self.events.subscribe()
    }

    /// Parse a group address in this client's configured textual format.
    pub fn parse_group(&self, text: &str) -> Result<GroupAddress> {
        GroupAddress::parse(text, self.two_level)
    }

    /// Format a group address in this client's configured textual format.
    pub fn format_group(&self, addr: GroupAddress) -> String {
        addr.format(self.two_level)
    }

    async fn submit_acked<F>(&self, make: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> GroupRequest,
    {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(Command::Group(make(ack_tx)))?;
        tokio::time::timeout(self.request_timeout, ack_rx)
            .await
            .map_err(|_| KnxError::NoResponse)?
            .map_err(|_| KnxError::ConnectionLost)?
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.commands
            .send(cmd)
            .map_err(|_| KnxError::ConnectionLost)
    }
}

/// Builder for [`KnxClient`].
#[derive(Debug, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Start from an explicit configuration.
    pub fn from_config(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Skip discovery and connect straight to this gateway endpoint.
    pub fn gateway(mut self, endpoint: SocketAddrV4) -> Self {
        self.config.remote_endpoint = Some(endpoint);
        self
    }

    /// Accept only gateways advertising this individual address during
    /// discovery; `None` accepts any responder.
    pub fn gateway_filter(mut self, addr: Option<IndividualAddress>) -> Self {
        self.config.phys_server_addr = addr;
        self
    }

    /// Source individual address stamped into outbound frames.
    pub fn physical_address(mut self, addr: IndividualAddress) -> Self {
        self.config.phys_addr = addr;
        self
    }

    /// Use the two-level `Main/Sub` group address format.
    pub fn two_level_addressing(mut self, two_level: bool) -> Self {
        self.config.two_level_addressing = two_level;
        self
    }

    /// Control the link-layer acknowledge request bit on outbound frames.
    pub fn suppress_ack(mut self, suppress: bool) -> Self {
        self.config.suppress_ack_ldatareq = suppress;
        self
    }

    /// Send group operations as multicast routing indications instead of
    /// acknowledged tunneling requests.
    pub fn routing_mode(mut self) -> Self {
        self.config.use_tunneling = false;
        self
    }

    /// Timeout applied to each request future.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Spawn the connection task on tokio UDP sockets.
    ///
    /// Must be called within a tokio runtime.
    pub fn build(self) -> KnxClient {
        self.build_with(UdpProvider)
    }

    /// Spawn the connection task on a custom transport provider. Tests use
    /// this with the [`mock`](crate::net::mock) provider.
    ///
    /// Must be called within a tokio runtime.
    pub fn build_with<P: NetProvider>(self, provider: P) -> KnxClient {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let client = KnxClient {
            commands: command_tx,
            events: event_tx.clone(),
            builder: DatagramBuilder::new(&self.config),
            two_level: self.config.two_level_addressing,
            request_timeout: self.config.request_timeout,
        };
        tokio::spawn(Tunnel::new(self.config, provider, command_rx, event_tx).run());
        client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::mock::MockProvider;

    #[test]
    fn test_builder_options_reach_config() {
        let builder = KnxClient::builder()
            .gateway("192.168.1.10:3671".parse().unwrap())
            .gateway_filter(None)
            .two_level_addressing(true)
            .suppress_ack(false)
            .request_timeout(Duration::from_secs(1));
        let config = &builder.config;
        assert_eq!(config.remote_endpoint.unwrap().port(), 3671);
        assert!(config.phys_server_addr.is_none());
        assert!(config.two_level_addressing);
        assert!(!config.suppress_ack_ldatareq);
        assert_eq!(config.request_timeout, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_write_rejects_bad_payload_synchronously() {
        let client = KnxClient::builder().build_with(MockProvider::new());
        let addr = GroupAddress::new(1, 2, 3).unwrap();
        let result = client
            .write(addr, ApduPayload::Bytes(vec![0u8; 15]))
            .await;
        assert!(matches!(result, Err(KnxError::BadApduLength(15))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out_while_disconnected() {
        let client = KnxClient::builder().build_with(MockProvider::new());
        let addr = GroupAddress::new(1, 2, 3).unwrap();
        // Never connected: the request queues and the future elapses.
        let result = client.write(addr, ApduPayload::Small(1)).await;
        assert!(matches!(result, Err(KnxError::NoResponse)));
    }

    #[test]
    fn test_group_format_helpers() {
        // No runtime needed for the pure helpers; build the handle fields
        // via the builder path inside a runtime.
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let client = rt.block_on(async {
            KnxClient::builder()
                .two_level_addressing(true)
                .build_with(MockProvider::new())
        });
        let addr = client.parse_group("1/234").unwrap();
        assert_eq!(client.format_group(addr), "1/234");
        assert!(client.parse_group("1/2/3").is_err());
    }
}
