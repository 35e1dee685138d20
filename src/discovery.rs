//! Standalone gateway discovery.
//!
//! A one-shot multicast sweep, independent of the connection task: send one
//! SEARCH_REQUEST to 224.0.23.12:3671 and collect every gateway that
//! answers within the timeout. Useful for CLI tooling and for picking an
//! endpoint to pass to
//! [`ClientBuilder::gateway`](crate::client::ClientBuilder::gateway).

use std::net::SocketAddrV4;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};

use crate::addressing::IndividualAddress;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::net::transport::AsyncTransport;
use crate::net::udp::UdpTransport;
use crate::protocol::builder::DatagramBuilder;
use crate::protocol::constants::MAX_FRAME_SIZE;
use crate::protocol::services::{Body, Frame};

/// A gateway that answered the search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gateway {
    /// Control endpoint to connect to
    pub endpoint: SocketAddrV4,
    /// Individual address the gateway advertises
    pub individual_addr: IndividualAddress,
    /// Friendly device name
    pub name: String,
    /// Serial number
    pub serial_number: [u8; 6],
}

/// Sweep the local network for KNXnet/IP gateways.
///
/// Collects all distinct responders until `timeout` elapses. An empty vec
/// means nobody answered; socket failures surface as errors.
pub async fn discover_gateways(timeout: Duration) -> Result<Vec<Gateway>> {
    let mut socket = UdpTransport::multicast()?;
    let builder = DatagramBuilder::new(&ClientConfig::default());

    let request = builder.search_request().frame.encode()?;
    socket
        .send_to(&request, UdpTransport::multicast_endpoint())
        .await?;

    let deadline = Instant::now() + timeout;
    let mut gateways: Vec<Gateway> = Vec::new();
    let mut buf = vec![0u8; MAX_FRAME_SIZE];

    loop {
        let (n, from) = tokio::select! {
            r = socket.recv_from(&mut buf) => r?,
            _ = sleep_until(deadline) => break,
        };

        let mut frame = match Frame::parse(&buf[..n]) {
            Ok(f) => f,
            Err(e) => {
                log::debug!("ignoring malformed search answer from {from}: {e}");
                continue;
            }
        };
        frame.patch_nat(from);

        if let Body::SearchResponse {
            control,
            device_info,
        } = frame.body
        {
            let gateway = Gateway {
                endpoint: control.endpoint,
                individual_addr: device_info.individual_addr,
                name: device_info.name(),
                serial_number: device_info.serial_number,
            };
            if !gateways.iter().any(|g| g.endpoint == gateway.endpoint) {
                log::info!(
                    "found gateway {} \"{}\" at {}",
                    gateway.individual_addr,
                    gateway.name,
                    gateway.endpoint
                );
                gateways.push(gateway);
            }
        }
    }

    Ok(gateways)
}
