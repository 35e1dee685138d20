//! KNXnet/IP protocol constants and identifier enums.

use std::net::Ipv4Addr;

/// KNXnet/IP protocol version 1.0
pub const KNXNETIP_VERSION_10: u8 = 0x10;

/// Standard KNXnet/IP header length (6 bytes)
pub const HEADER_SIZE_10: u8 = 0x06;

/// Standard UDP port for KNXnet/IP communication
pub const KNXNETIP_PORT: u16 = 3671;

/// KNXnet/IP system setup multicast address (discovery and routing)
pub const KNXNETIP_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(224, 0, 23, 12);

/// Maximum size of a KNXnet/IP frame this stack will build or accept
pub const MAX_FRAME_SIZE: usize = 512;

// =============================================================================
// Service Type Identifiers
// =============================================================================

/// KNXnet/IP service type identifiers recognised by this stack.
///
/// The service type is the frame's tag: the body layout is dispatched on it
/// exhaustively, so an identifier outside this set fails the decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ServiceType {
    /// `SEARCH_REQUEST` - gateway discovery request (multicast)
    SearchRequest = 0x0201,
    /// `SEARCH_RESPONSE` - gateway discovery response
    SearchResponse = 0x0202,
    /// `CONNECT_REQUEST` - tunnel connection request
    ConnectRequest = 0x0205,
    /// `CONNECT_RESPONSE` - tunnel connection response
    ConnectResponse = 0x0206,
    /// `CONNECTIONSTATE_REQUEST` - heartbeat
    ConnectionstateRequest = 0x0207,
    /// `CONNECTIONSTATE_RESPONSE` - heartbeat reply
    ConnectionstateResponse = 0x0208,
    /// `DISCONNECT_REQUEST`
    DisconnectRequest = 0x0209,
    /// `DISCONNECT_RESPONSE`
    DisconnectResponse = 0x020A,
    /// `TUNNELING_REQUEST` - cEMI frame through the tunnel
    TunnelingRequest = 0x0420,
    /// `TUNNELING_ACK` - per-sequence acknowledgement
    TunnelingAck = 0x0421,
    /// `ROUTING_INDICATION` - multicast cEMI frame, unacknowledged
    RoutingIndication = 0x0530,
}

impl ServiceType {
    /// Convert a u16 to `ServiceType`
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0201 => Some(Self::SearchRequest),
            0x0202 => Some(Self::SearchResponse),
            0x0205 => Some(Self::ConnectRequest),
            0x0206 => Some(Self::ConnectResponse),
            0x0207 => Some(Self::ConnectionstateRequest),
            0x0208 => Some(Self::ConnectionstateResponse),
            0x0209 => Some(Self::DisconnectRequest),
            0x020A => Some(Self::DisconnectResponse),
            0x0420 => Some(Self::TunnelingRequest),
            0x0421 => Some(Self::TunnelingAck),
            0x0530 => Some(Self::RoutingIndication),
            _ => None,
        }
    }

    /// Convert `ServiceType` to u16
    pub const fn to_u16(self) -> u16 {
        self as u16
    }
}

// =============================================================================
// Connection Type Codes
// =============================================================================

/// Connection type for `DEVICE_MGMT_CONNECTION` (accepted on read only)
pub const DEVICE_MGMT_CONNECTION: u8 = 0x03;

/// Connection type for `TUNNEL_CONNECTION`
pub const TUNNEL_CONNECTION: u8 = 0x04;

/// KNX layer for link-layer tunneling
pub const TUNNEL_LINKLAYER: u8 = 0x02;

// =============================================================================
// Host Protocol Codes
// =============================================================================

/// IPv4 UDP protocol
pub const IPV4_UDP: u8 = 0x01;

/// IPv4 TCP protocol (rejected on read)
pub const IPV4_TCP: u8 = 0x02;

// =============================================================================
// Description Information Block types
// =============================================================================

/// DIB description type for device information
pub const DIB_DEVICE_INFO: u8 = 0x01;

// =============================================================================
// Error Codes
// =============================================================================

/// Error code for successful operation
pub const E_NO_ERROR: u8 = 0x00;

/// Error code for connection type not supported
pub const E_CONNECTION_TYPE: u8 = 0x22;

/// Error code for connection option not supported
pub const E_CONNECTION_OPTION: u8 = 0x23;

/// Error code for no more connections available
pub const E_NO_MORE_CONNECTIONS: u8 = 0x24;

/// Error code for data connection error
pub const E_DATA_CONNECTION: u8 = 0x26;

/// Error code for KNX connection error
pub const E_KNX_CONNECTION: u8 = 0x27;

/// Error code for tunneling layer not supported
pub const E_TUNNELING_LAYER: u8 = 0x29;

// =============================================================================
// cEMI Message Codes
// =============================================================================

/// cEMI message codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CemiMessageCode {
    /// `L_Raw.req` - Raw frame request
    LRawReq = 0x10,
    /// `L_Data.req` - Data request
    LDataReq = 0x11,
    /// `L_Poll_Data.req` - Poll data request
    LPollDataReq = 0x13,
    /// `L_Poll_Data.con` - Poll data confirmation
    LPollDataCon = 0x25,
    /// `L_Data.ind` - Data indication
    LDataInd = 0x29,
    /// `L_Busmon.ind` - Bus monitor indication
    LBusmonInd = 0x2B,
    /// `L_Raw.ind` - Raw frame indication
    LRawInd = 0x2D,
    /// `L_Data.con` - Data confirmation
    LDataCon = 0x2E,
    /// `L_Raw.con` - Raw frame confirmation
    LRawCon = 0x2F,
}

impl CemiMessageCode {
    /// Convert u8 to `CemiMessageCode`
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x10 => Some(Self::LRawReq),
            0x11 => Some(Self::LDataReq),
            0x13 => Some(Self::LPollDataReq),
            0x25 => Some(Self::LPollDataCon),
            0x29 => Some(Self::LDataInd),
            0x2B => Some(Self::LBusmonInd),
            0x2D => Some(Self::LRawInd),
            0x2E => Some(Self::LDataCon),
            0x2F => Some(Self::LRawCon),
            _ => None,
        }
    }

    /// Convert `CemiMessageCode` to u8
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// L_Data primitives carry a full service body with an APDU.
    pub const fn is_ldata(self) -> bool {
        matches!(self, Self::LDataReq | Self::LDataInd | Self::LDataCon)
    }
}

// =============================================================================
// KNX Priority
// =============================================================================

/// KNX message priority levels (cEMI control field 1, bits 3-2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Priority {
    /// System priority
    System = 0b00,
    /// Normal priority
    Normal = 0b01,
    /// Urgent priority
    Urgent = 0b10,
    /// Low priority (default for group communication)
    #[default]
    Low = 0b11,
}

impl Priority {
    /// Convert u8 to Priority
    pub const fn from_u8(value: u8) -> Self {
        match value & 0b11 {
            0b00 => Self::System,
            0b01 => Self::Normal,
            0b10 => Self::Urgent,
            _ => Self::Low,
        }
    }

    /// Convert Priority to u8
    pub const fn to_u8(self) -> u8 {
        self as u8
    }
}
