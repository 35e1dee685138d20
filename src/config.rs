//! Client configuration.

use std::net::SocketAddrV4;
use std::time::Duration;

use crate::addressing::IndividualAddress;

/// Configuration for a [`KnxClient`](crate::client::KnxClient).
///
/// The defaults match a stock installation: discover the gateway via
/// multicast, filter on the conventional gateway address `1.1.220`, stamp
/// outbound frames with the unassigned source `15.15.15`, tunnel with
/// acknowledgements.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Gateway control endpoint. When set, discovery is skipped and the
    /// connection goes straight to this endpoint.
    pub remote_endpoint: Option<SocketAddrV4>,
    /// Discovery filter: only gateways advertising this individual address
    /// are accepted. `None` accepts any responder.
    pub phys_server_addr: Option<IndividualAddress>,
    /// Source individual address stamped into outbound cEMI frames.
    pub phys_addr: IndividualAddress,
    /// Textual group-address format: `Main/Sub` when true, `Main/Middle/Sub`
    /// otherwise.
    pub two_level_addressing: bool,
    /// When false, outbound `L_Data.req` frames request a link-layer
    /// acknowledgement (ctrl1 bit 1).
    pub suppress_ack_ldatareq: bool,
    /// When false, outbound group operations go out as multicast
    /// ROUTING_INDICATION frames with no acknowledgement leg.
    pub use_tunneling: bool,
    /// How long request futures wait for their completion event.
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            remote_endpoint: None,
            phys_server_addr: Some(IndividualAddress::new(1, 1, 220).expect("valid address")),
            phys_addr: IndividualAddress::new(15, 15, 15).expect("valid address"),
            two_level_addressing: false,
            suppress_ack_ldatareq: true,
            use_tunneling: true,
            request_timeout: Duration::from_millis(5000),
        }
    }
}
