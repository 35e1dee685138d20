//! KNXnet/IP service frames.
//!
//! [`Frame`] pairs the common header with a [`Body`] variant per service
//! type, so dispatch on inbound traffic is an exhaustive `match` and the
//! write path assembles sub-structures in the same order the read path
//! expects them. The header's total length is always computed from the
//! structural walk, never trusted from the caller.
//!
//! ## Protocol Flow
//!
//! ```text
//! Client                          Gateway
//!   |                                |
//!   |------- SEARCH_REQUEST -------->|  (multicast)
//!   |<------ SEARCH_RESPONSE --------|
//!   |                                |
//!   |------- CONNECT_REQUEST ------->|
//!   |<------ CONNECT_RESPONSE -------|
//!   |                                |
//!   |------ TUNNELING_REQUEST ------>|
//!   |<------ TUNNELING_ACK ----------|
//!   |                                |
//!   |--- CONNECTIONSTATE_REQUEST --->|  (every 45 s)
//!   |<-- CONNECTIONSTATE_RESPONSE ---|
//!   |                                |
//!   |------ DISCONNECT_REQUEST ----->|
//!   |<----- DISCONNECT_RESPONSE -----|
//! ```

use std::net::SocketAddrV4;

use crate::error::{KnxError, Result};
use crate::protocol::cemi::CemiFrame;
use crate::protocol::constants::ServiceType;
use crate::protocol::frame::{ConnState, ConnectionHeader, Crd, Cri, DeviceInfoDib, Hpai, KnxnetIpHeader};

/// Service-typed frame body.
///
/// One variant per supported service; the layout of each mirrors the
/// dispatch table of the KNXnet/IP core and tunneling specifications.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Gateway discovery request: discovery HPAI, tunnel HPAI, CRI.
    SearchRequest {
        /// Endpoint the gateway should answer to (NAT form permitted)
        control: Hpai,
        /// Tunnel endpoint advertised alongside the discovery endpoint
        data: Hpai,
        /// Requested connection type
        cri: Cri,
    },
    /// Gateway discovery response.
    SearchResponse {
        /// The gateway's control endpoint
        control: Hpai,
        /// Device self-description
        device_info: DeviceInfoDib,
    },
    /// Tunnel connection request.
    ConnectRequest {
        /// Control endpoint (NAT form permitted)
        control: Hpai,
        /// Data endpoint (NAT form permitted)
        data: Hpai,
        /// Requested connection type and layer
        cri: Cri,
    },
    /// Tunnel connection response.
    ConnectResponse {
        /// Assigned channel and status
        state: ConnState,
        /// Gateway data endpoint, present when the status permits
        data_endpoint: Option<Hpai>,
        /// Connection response data, present when the status permits
        crd: Option<Crd>,
    },
    /// Heartbeat request.
    ConnectionstateRequest {
        /// Channel id (status byte is reserved zero)
        state: ConnState,
        /// Our control endpoint
        control: Hpai,
    },
    /// Heartbeat response.
    ConnectionstateResponse {
        /// Channel id and status
        state: ConnState,
    },
    /// Disconnect request.
    DisconnectRequest {
        /// Channel id (status byte is reserved zero)
        state: ConnState,
        /// Our control endpoint
        control: Hpai,
    },
    /// Disconnect response.
    DisconnectResponse {
        /// Channel id and status
        state: ConnState,
    },
    /// Tunneled cEMI frame.
    TunnelingRequest {
        /// Channel and sequence number
        header: ConnectionHeader,
        /// The transported cEMI frame
        cemi: CemiFrame,
    },
    /// Per-sequence acknowledgement; status travels in the header.
    TunnelingAck {
        /// Channel, sequence and status
        header: ConnectionHeader,
    },
    /// Multicast cEMI frame, unacknowledged.
    RoutingIndication {
        /// The transported cEMI frame
        cemi: CemiFrame,
    },
}

/// A complete KNXnet/IP frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Service-typed body; the header is derived from it on encode.
    pub body: Body,
}

impl Frame {
    /// Wrap a body into a frame.
    pub fn new(body: Body) -> Self {
        Self { body }
    }

    /// The service type identifying this frame's body.
    pub fn service_type(&self) -> ServiceType {
        match &self.body {
            Body::SearchRequest { .. } => ServiceType::SearchRequest,
            Body::SearchResponse { .. } => ServiceType::SearchResponse,
            Body::ConnectRequest { .. } => ServiceType::ConnectRequest,
            Body::ConnectResponse { .. } => ServiceType::ConnectResponse,
            Body::ConnectionstateRequest { .. } => ServiceType::ConnectionstateRequest,
            Body::ConnectionstateResponse { .. } => ServiceType::ConnectionstateResponse,
            Body::DisconnectRequest { .. } => ServiceType::DisconnectRequest,
            Body::DisconnectResponse { .. } => ServiceType::DisconnectResponse,
            Body::TunnelingRequest { .. } => ServiceType::TunnelingRequest,
            Body::TunnelingAck { .. } => ServiceType::TunnelingAck,
            Body::RoutingIndication { .. } => ServiceType::RoutingIndication,
        }
    }

    /// Parse a complete frame from a datagram.
    ///
    /// # Errors
    ///
    /// `IncompletePacket` when the buffer is shorter than the header's total
    /// length; the per-structure errors of the body otherwise.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let header = KnxnetIpHeader::parse(data)?;
        let total = header.total_length as usize;
        if total < KnxnetIpHeader::SIZE {
            return Err(KnxError::InvalidFrame);
        }
        if data.len() < total {
            return Err(KnxError::IncompletePacket);
        }
        let body = &data[KnxnetIpHeader::SIZE..total];

        let body = match header.service_type {
            ServiceType::SearchRequest => Self::parse_endpoint_request(body, true)?,
            ServiceType::SearchResponse => {
                let control = Hpai::parse(body)?;
                let device_info = DeviceInfoDib::parse(&body[Hpai::SIZE..])?;
                Body::SearchResponse {
                    control,
                    device_info,
                }
            }
            ServiceType::ConnectRequest => Self::parse_endpoint_request(body, false)?,
            ServiceType::ConnectResponse => {
                let state = ConnState::parse(body)?;
                let rest = &body[ConnState::SIZE..];
                let data_endpoint = if rest.len() >= Hpai::SIZE {
                    Some(Hpai::parse(rest)?)
                } else {
                    None
                };
                let crd = if rest.len() >= Hpai::SIZE + Crd::SIZE {
                    Some(Crd::parse(&rest[Hpai::SIZE..])?)
                } else {
                    None
                };
                Body::ConnectResponse {
                    state,
                    data_endpoint,
                    crd,
                }
            }
            ServiceType::ConnectionstateRequest => {
                let (state, control) = Self::parse_state_request(body)?;
                Body::ConnectionstateRequest { state, control }
            }
            ServiceType::ConnectionstateResponse => Body::ConnectionstateResponse {
                state: ConnState::parse(body)?,
            },
            ServiceType::DisconnectRequest => {
                let (state, control) = Self::parse_state_request(body)?;
                Body::DisconnectRequest { state, control }
            }
            ServiceType::DisconnectResponse => Body::DisconnectResponse {
                state: ConnState::parse(body)?,
            },
            ServiceType::TunnelingRequest => {
                let header = ConnectionHeader::parse(body)?;
                let (cemi, _) = CemiFrame::parse(&body[ConnectionHeader::SIZE..])?;
                Body::TunnelingRequest { header, cemi }
            }
            ServiceType::TunnelingAck => Body::TunnelingAck {
                header: ConnectionHeader::parse(body)?,
            },
            ServiceType::RoutingIndication => {
                let (cemi, _) = CemiFrame::parse(body)?;
                Body::RoutingIndication { cemi }
            }
        };

        Ok(Self { body })
    }

    /// SEARCH_REQUEST and CONNECT_REQUEST share the HPAI+HPAI+CRI layout;
    /// a bare discovery HPAI (the minimal on-wire search form) is accepted
    /// with the remaining structures defaulted.
    fn parse_endpoint_request(body: &[u8], search: bool) -> Result<Body> {
        let control = Hpai::parse(body)?;
        let (data, cri) = if body.len() >= 2 * Hpai::SIZE + Cri::SIZE {
            (
                Hpai::parse(&body[Hpai::SIZE..])?,
                Cri::parse(&body[2 * Hpai::SIZE..])?,
            )
        } else {
            (Hpai::nat(), Cri::default())
        };
        Ok(if search {
            Body::SearchRequest { control, data, cri }
        } else {
            Body::ConnectRequest { control, data, cri }
        })
    }

    /// CONNECTIONSTATE_REQUEST and DISCONNECT_REQUEST: channel id, reserved
    /// byte, then the sender's control endpoint.
    fn parse_state_request(body: &[u8]) -> Result<(ConnState, Hpai)> {
        let state = ConnState::parse(body)?;
        let control = if body.len() >= ConnState::SIZE + Hpai::SIZE {
            Hpai::parse(&body[ConnState::SIZE..])?
        } else {
            Hpai::nat()
        };
        Ok((state, control))
    }

    /// Total encoded size in bytes, header included.
    pub fn length(&self) -> usize {
        KnxnetIpHeader::SIZE
            + match &self.body {
                Body::SearchRequest { .. } | Body::ConnectRequest { .. } => {
                    2 * Hpai::SIZE + Cri::SIZE
                }
                Body::SearchResponse { .. } => Hpai::SIZE + DeviceInfoDib::SIZE,
                Body::ConnectResponse {
                    data_endpoint, crd, ..
                } => {
                    ConnState::SIZE
                        + data_endpoint.map_or(0, |_| Hpai::SIZE)
                        + crd.map_or(0, |_| Crd::SIZE)
                }
                Body::ConnectionstateRequest { .. } | Body::DisconnectRequest { .. } => {
                    ConnState::SIZE + Hpai::SIZE
                }
                Body::ConnectionstateResponse { .. } | Body::DisconnectResponse { .. } => {
                    ConnState::SIZE
                }
                Body::TunnelingRequest { cemi, .. } => ConnectionHeader::SIZE + cemi.length(),
                Body::TunnelingAck { .. } => ConnectionHeader::SIZE,
                Body::RoutingIndication { cemi } => cemi.length(),
            }
    }

    /// Encode the frame into a fresh buffer.
    ///
    /// The header's total length is derived from the body walk, so
    /// `encode().len() == length()` always holds.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let total = self.length();
        let mut buf = vec![0u8; total];

        let header = KnxnetIpHeader::new(self.service_type(), (total - KnxnetIpHeader::SIZE) as u16);
        header.encode(&mut buf)?;

        let mut offset = KnxnetIpHeader::SIZE;
        match &self.body {
            Body::SearchRequest { control, data, cri }
            | Body::ConnectRequest { control, data, cri } => {
                offset += control.encode(&mut buf[offset..])?;
                offset += data.encode(&mut buf[offset..])?;
                offset += cri.encode(&mut buf[offset..])?;
            }
            Body::SearchResponse {
                control,
                device_info,
            } => {
                offset += control.encode(&mut buf[offset..])?;
                offset += device_info.encode(&mut buf[offset..])?;
            }
            Body::ConnectResponse {
                state,
                data_endpoint,
                crd,
            } => {
                offset += state.encode(&mut buf[offset..])?;
                if let Some(ep) = data_endpoint {
                    offset += ep.encode(&mut buf[offset..])?;
                }
                if let Some(crd) = crd {
                    offset += crd.encode(&mut buf[offset..])?;
                }
            }
            Body::ConnectionstateRequest { state, control }
            | Body::DisconnectRequest { state, control } => {
                offset += state.encode(&mut buf[offset..])?;
                offset += control.encode(&mut buf[offset..])?;
            }
            Body::ConnectionstateResponse { state } | Body::DisconnectResponse { state } => {
                offset += state.encode(&mut buf[offset..])?;
            }
            Body::TunnelingRequest { header, cemi } => {
                offset += header.encode(&mut buf[offset..])?;
                offset += cemi.encode(&mut buf[offset..])?;
            }
            Body::TunnelingAck { header } => {
                offset += header.encode(&mut buf[offset..])?;
            }
            Body::RoutingIndication { cemi } => {
                offset += cemi.encode(&mut buf[offset..])?;
            }
        }

        debug_assert_eq!(offset, total);
        Ok(buf)
    }

    /// Channel id carried by this frame's connection structures, if any.
    ///
    /// Inbound frames whose channel does not match the session are dropped
    /// silently.
    pub fn channel_id(&self) -> Option<u8> {
        match &self.body {
            Body::ConnectResponse { state, .. }
            | Body::ConnectionstateRequest { state, .. }
            | Body::ConnectionstateResponse { state }
            | Body::DisconnectRequest { state, .. }
            | Body::DisconnectResponse { state } => Some(state.channel_id),
            Body::TunnelingRequest { header, .. } | Body::TunnelingAck { header } => {
                Some(header.channel_id)
            }
            _ => None,
        }
    }

    /// Replace NAT-form HPAIs with the datagram's source endpoint.
    pub fn patch_nat(&mut self, sender: SocketAddrV4) {
        match &mut self.body {
            Body::SearchRequest { control, data, .. }
            | Body::ConnectRequest { control, data, .. } => {
                *control = control.or_sender(sender);
                *data = data.or_sender(sender);
            }
            Body::SearchResponse { control, .. } => {
                *control = control.or_sender(sender);
            }
            Body::ConnectResponse { data_endpoint, .. } => {
                if let Some(ep) = data_endpoint {
                    *ep = ep.or_sender(sender);
                }
            }
            Body::ConnectionstateRequest { control, .. }
            | Body::DisconnectRequest { control, .. } => {
                *control = control.or_sender(sender);
            }
            _ => {}
        }
    }
}
