//! Datagram assembly.
//!
//! [`DatagramBuilder`] turns the per-session options into ready-to-send
//! [`Frame`] skeletons and rewrites tunneling-request skeletons into group
//! read / write / respond / raw-write operations. Every datagram carries a
//! fresh correlation id which the connection task uses to route the matching
//! acknowledgement back to the originating caller.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::addressing::GroupAddress;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::protocol::cemi::{Apci, Apdu, ApduPayload, CemiFrame};
use crate::protocol::frame::{ConnState, ConnectionHeader, Cri, Hpai};
use crate::protocol::services::{Body, Frame};

/// Process-wide correlation id source.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A frame paired with its correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct Datagram {
    /// Correlation id linking the eventual acknowledgement to the caller
    pub id: u64,
    /// The frame to send
    pub frame: Frame,
}

impl Datagram {
    fn new(body: Body) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            frame: Frame::new(body),
        }
    }
}

/// Builds service frames from the session options.
#[derive(Debug, Clone)]
pub struct DatagramBuilder {
    phys_addr: crate::addressing::IndividualAddress,
    suppress_ack: bool,
    use_tunneling: bool,
}

impl DatagramBuilder {
    /// Capture the relevant options from the client configuration.
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            phys_addr: config.phys_addr,
            suppress_ack: config.suppress_ack_ldatareq,
            use_tunneling: config.use_tunneling,
        }
    }

    /// Whether group operations are built for tunneling (true) or routing.
    pub fn is_tunneling(&self) -> bool {
        self.use_tunneling
    }

    /// SEARCH_REQUEST with NAT endpoints.
    pub fn search_request(&self) -> Datagram {
        Datagram::new(Body::SearchRequest {
            control: Hpai::nat(),
            data: Hpai::nat(),
            cri: Cri::tunnel_link_layer(),
        })
    }

    /// CONNECT_REQUEST with NAT endpoints, requesting a link-layer tunnel.
    pub fn connect_request(&self) -> Datagram {
        Datagram::new(Body::ConnectRequest {
            control: Hpai::nat(),
            data: Hpai::nat(),
            cri: Cri::tunnel_link_layer(),
        })
    }

    /// CONNECTIONSTATE_REQUEST for the given channel.
    pub fn connectionstate_request(&self, channel_id: u8) -> Datagram {
        Datagram::new(Body::ConnectionstateRequest {
            state: ConnState::new(channel_id, 0),
            control: Hpai::nat(),
        })
    }

    /// DISCONNECT_REQUEST for the given channel.
    pub fn disconnect_request(&self, channel_id: u8) -> Datagram {
        Datagram::new(Body::DisconnectRequest {
            state: ConnState::new(channel_id, 0),
            control: Hpai::nat(),
        })
    }

    /// TUNNELING_ACK echoing the given sequence number.
    pub fn tunneling_ack(&self, channel_id: u8, sequence: u8, status: u8) -> Datagram {
        Datagram::new(Body::TunnelingAck {
            header: ConnectionHeader::new(channel_id, sequence, status),
        })
    }

    /// Group-operation skeleton: a tunneling request (or routing indication)
    /// carrying an `L_Data` frame with safe defaults. The channel id and
    /// sequence number are stamped by the connection task at dispatch.
    fn group_skeleton(&self) -> Datagram {
        let cemi = if self.use_tunneling {
            let mut cemi = CemiFrame::ldata_req(self.phys_addr);
            cemi.ctrl1.set_ack_requested(!self.suppress_ack);
            cemi
        } else {
            // Routing frames travel as indications; nobody confirms them.
            CemiFrame::ldata_ind(self.phys_addr)
        };

        if self.use_tunneling {
            Datagram::new(Body::TunnelingRequest {
                header: ConnectionHeader::new(0, 0, 0),
                cemi,
            })
        } else {
            Datagram::new(Body::RoutingIndication { cemi })
        }
    }

    fn with_cemi(
        &self,
        dest: GroupAddress,
        apci: Apci,
        payload: ApduPayload,
    ) -> Datagram {
        let mut dg = self.group_skeleton();
        let cemi = match &mut dg.frame.body {
            Body::TunnelingRequest { cemi, .. } | Body::RoutingIndication { cemi } => cemi,
            _ => unreachable!("group skeleton is always a cEMI body"),
        };
        cemi.destination = dest.raw();
        cemi.ctrl2.set_group_address(true);
        cemi.apdu = Some(Apdu {
            tpci: 0,
            apci,
            payload,
        });
        dg
    }

    /// GroupValue_Read request for the given address.
    pub fn read_request(&self, dest: GroupAddress) -> Datagram {
        self.with_cemi(dest, Apci::GroupValueRead, ApduPayload::Small(0))
    }

    /// GroupValue_Write with an externally encoded payload.
    pub fn write_request(&self, dest: GroupAddress, payload: ApduPayload) -> Result<Datagram> {
        Self::validate(&payload)?;
        Ok(self.with_cemi(dest, Apci::GroupValueWrite, payload))
    }

    /// GroupValue_Response with an externally encoded payload.
    pub fn respond_request(&self, dest: GroupAddress, payload: ApduPayload) -> Result<Datagram> {
        Self::validate(&payload)?;
        Ok(self.with_cemi(dest, Apci::GroupValueResponse, payload))
    }

    /// GroupValue_Write from raw bytes, bypassing any datapoint encoding.
    pub fn write_raw_request(
        &self,
        dest: GroupAddress,
        data: &[u8],
        bit_length: u8,
    ) -> Result<Datagram> {
        let payload = ApduPayload::from_raw(data, bit_length)?;
        Ok(self.with_cemi(dest, Apci::GroupValueWrite, payload))
    }

    fn validate(payload: &ApduPayload) -> Result<()> {
        match payload {
            ApduPayload::Small(v) if *v > 0x3F => Err(crate::error::KnxError::PayloadNotEncodable),
            ApduPayload::Bytes(b) if b.is_empty() || b.len() > 14 => {
                Err(crate::error::KnxError::BadApduLength(b.len()))
            }
            _ => Ok(()),
        }
    }
}
