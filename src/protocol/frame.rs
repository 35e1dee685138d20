//! KNXnet/IP wire structures below the service level.
//!
//! Everything here is a fixed-size, length-prefixed structure: the common
//! header, HPAI endpoints, connection request/response information blocks,
//! the tunneling connection header and the device-info DIB. Each type
//! offers `parse(&[u8]) -> Result<Self>` and `encode(&self, &mut [u8]) ->
//! Result<usize>` over big-endian bytes, plus a `SIZE` constant for
//! pre-sizing. Service bodies compose these in [`super::services`].

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::addressing::IndividualAddress;
use crate::error::{KnxError, Result};
use crate::protocol::constants::{
    ServiceType, DIB_DEVICE_INFO, HEADER_SIZE_10, IPV4_UDP, KNXNETIP_VERSION_10,
    TUNNEL_CONNECTION, TUNNEL_LINKLAYER,
};

/// KNXnet/IP frame header (6 bytes)
///
/// ```text
/// ┌──────────────┬──────────────┬─────────────────────┐
/// │ Header Len   │ Protocol Ver │  Service Type ID    │
/// │   (1 byte)   │   (1 byte)   │     (2 bytes)       │
/// ├──────────────┴──────────────┴─────────────────────┤
/// │           Total Length (2 bytes)                   │
/// └────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnxnetIpHeader {
    /// Service type identifier
    pub service_type: ServiceType,
    /// Total length of frame (header + body)
    pub total_length: u16,
}

impl KnxnetIpHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = 6;

    /// Create a new header for a body of the given length.
    pub const fn new(service_type: ServiceType, body_length: u16) -> Self {
        Self {
            service_type,
            total_length: Self::SIZE as u16 + body_length,
        }
    }

    /// Parse a header from a byte slice.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(KnxError::IncompletePacket);
        }
        if data[0] != HEADER_SIZE_10 {
            return Err(KnxError::InvalidFrame);
        }
        if data[1] != KNXNETIP_VERSION_10 {
            return Err(KnxError::UnsupportedVersion(data[1]));
        }

        let raw_service = u16::from_be_bytes([data[2], data[3]]);
        let service_type =
            ServiceType::from_u16(raw_service).ok_or(KnxError::UnknownServiceType(raw_service))?;
        let total_length = u16::from_be_bytes([data[4], data[5]]);

        Ok(Self {
            service_type,
            total_length,
        })
    }

    /// Encode the header into a byte buffer.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < Self::SIZE {
            return Err(KnxError::BufferTooSmall);
        }
        buf[0] = HEADER_SIZE_10;
        buf[1] = KNXNETIP_VERSION_10;
        buf[2..4].copy_from_slice(&self.service_type.to_u16().to_be_bytes());
        buf[4..6].copy_from_slice(&self.total_length.to_be_bytes());
        Ok(Self::SIZE)
    }

    /// Expected body length according to the header.
    pub const fn body_length(&self) -> u16 {
        self.total_length.saturating_sub(Self::SIZE as u16)
    }
}

/// Host Protocol Address Information (HPAI)
///
/// An on-wire endpoint: protocol code plus IPv4 address and port. The
/// address `0.0.0.0:0` is the NAT form, meaning "reply to the datagram's
/// source endpoint"; [`Hpai::or_sender`] performs that substitution.
///
/// ```text
/// ┌──────────────┬──────────────┬─────────────────────┐
/// │ Structure Len│ Host Protocol│   IP Address        │
/// │   (1 byte)   │   (1 byte)   │   (4 bytes IPv4)    │
/// ├──────────────┴──────────────┴─────────────────────┤
/// │                Port (2 bytes)                      │
/// └────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hpai {
    /// IPv4 endpoint (always UDP; TCP is rejected on read)
    pub endpoint: SocketAddrV4,
}

impl Hpai {
    /// Size of HPAI structure for IPv4
    pub const SIZE: usize = 8;

    /// Create an HPAI for the given IPv4 UDP endpoint.
    pub const fn new(endpoint: SocketAddrV4) -> Self {
        Self { endpoint }
    }

    /// The NAT form: 0.0.0.0:0, to be filled in by the peer.
    pub const fn nat() -> Self {
        Self {
            endpoint: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        }
    }

    /// True for the 0.0.0.0:0 NAT form.
    pub fn is_unspecified(&self) -> bool {
        self.endpoint.ip().is_unspecified() && self.endpoint.port() == 0
    }

    /// Substitute the sender's endpoint when this HPAI is in NAT form.
    pub fn or_sender(self, sender: SocketAddrV4) -> Self {
        if self.is_unspecified() {
            Self { endpoint: sender }
        } else {
            self
        }
    }

    /// Parse HPAI from bytes.
    ///
    /// # Errors
    ///
    /// `UnsupportedTransport` for any host protocol other than IPv4/UDP
    /// (notably TCP, 0x02).
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(KnxError::IncompletePacket);
        }
        if data[0] != Self::SIZE as u8 {
            return Err(KnxError::InvalidFrame);
        }
        // TCP (0x02) and anything else: this stack is IPv4/UDP only.
        if data[1] != IPV4_UDP {
            return Err(KnxError::UnsupportedTransport(data[1]));
        }

        let ip = Ipv4Addr::new(data[2], data[3], data[4], data[5]);
        let port = u16::from_be_bytes([data[6], data[7]]);
        Ok(Self {
            endpoint: SocketAddrV4::new(ip, port),
        })
    }

    /// Encode HPAI into bytes.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < Self::SIZE {
            return Err(KnxError::BufferTooSmall);
        }
        buf[0] = Self::SIZE as u8;
        buf[1] = IPV4_UDP;
        buf[2..6].copy_from_slice(&self.endpoint.ip().octets());
        buf[6..8].copy_from_slice(&self.endpoint.port().to_be_bytes());
        Ok(Self::SIZE)
    }
}

/// Connection Request Information (CRI)
///
/// Four bytes requesting a tunnel on the link layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cri {
    /// Connection type (`TUNNEL_CONNECTION`; `DEVICE_MGMT` accepted on read)
    pub connection_type: u8,
    /// KNX layer (`TUNNEL_LINKLAYER`)
    pub knx_layer: u8,
}

impl Cri {
    /// Size of the CRI structure
    pub const SIZE: usize = 4;

    /// CRI for a link-layer tunnel connection.
    pub const fn tunnel_link_layer() -> Self {
        Self {
            connection_type: TUNNEL_CONNECTION,
            knx_layer: TUNNEL_LINKLAYER,
        }
    }

    /// Parse CRI from bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(KnxError::IncompletePacket);
        }
        if data[0] != Self::SIZE as u8 {
            return Err(KnxError::InvalidFrame);
        }
        Ok(Self {
            connection_type: data[1],
            knx_layer: data[2],
        })
    }

    /// Encode CRI into bytes.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < Self::SIZE {
            return Err(KnxError::BufferTooSmall);
        }
        buf[0] = Self::SIZE as u8;
        buf[1] = self.connection_type;
        buf[2] = self.knx_layer;
        buf[3] = 0x00; // reserved
        Ok(Self::SIZE)
    }
}

impl Default for Cri {
    fn default() -> Self {
        Self::tunnel_link_layer()
    }
}

/// Connection Response Data block (CRD)
///
/// Mirrors the CRI in a CONNECT_RESPONSE; for tunnel connections the two
/// trailing bytes carry the individual address the gateway assigned us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crd {
    /// Connection type echoed by the gateway
    pub connection_type: u8,
    /// Individual address assigned to this tunnel
    pub assigned_addr: IndividualAddress,
}

impl Crd {
    /// Size of the CRD structure
    pub const SIZE: usize = 4;

    /// Parse CRD from bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(KnxError::IncompletePacket);
        }
        if data[0] != Self::SIZE as u8 {
            return Err(KnxError::InvalidFrame);
        }
        Ok(Self {
            connection_type: data[1],
            assigned_addr: IndividualAddress::from(u16::from_be_bytes([data[2], data[3]])),
        })
    }

    /// Encode CRD into bytes.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < Self::SIZE {
            return Err(KnxError::BufferTooSmall);
        }
        buf[0] = Self::SIZE as u8;
        buf[1] = self.connection_type;
        buf[2..4].copy_from_slice(&self.assigned_addr.raw().to_be_bytes());
        Ok(Self::SIZE)
    }
}

/// Channel id + status pair
///
/// The two-byte lead of CONNECT_RESPONSE, CONNECTIONSTATE and DISCONNECT
/// bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnState {
    /// Communication channel ID
    pub channel_id: u8,
    /// Status code (0 = NO_ERROR)
    pub status: u8,
}

impl ConnState {
    /// Size of the structure
    pub const SIZE: usize = 2;

    /// Create a new channel/status pair.
    pub const fn new(channel_id: u8, status: u8) -> Self {
        Self { channel_id, status }
    }

    /// Parse from bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(KnxError::IncompletePacket);
        }
        Ok(Self {
            channel_id: data[0],
            status: data[1],
        })
    }

    /// Encode into bytes.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < Self::SIZE {
            return Err(KnxError::BufferTooSmall);
        }
        buf[0] = self.channel_id;
        buf[1] = self.status;
        Ok(Self::SIZE)
    }

    /// Status is NO_ERROR.
    pub const fn is_ok(&self) -> bool {
        self.status == 0
    }
}

/// Tunneling connection header
///
/// Leads every TUNNELING_REQUEST and TUNNELING_ACK body. The fourth byte is
/// reserved (zero) in requests and carries the status in acknowledgements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHeader {
    /// Communication channel ID
    pub channel_id: u8,
    /// 8-bit sequence counter, wraps modulo 256
    pub sequence: u8,
    /// Status (ACK) or reserved (request)
    pub status: u8,
}

impl ConnectionHeader {
    /// Size of the structure
    pub const SIZE: usize = 4;

    /// Create a new connection header.
    pub const fn new(channel_id: u8, sequence: u8, status: u8) -> Self {
        Self {
            channel_id,
            sequence,
            status,
        }
    }

    /// Parse from bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(KnxError::IncompletePacket);
        }
        if data[0] != Self::SIZE as u8 {
            return Err(KnxError::InvalidFrame);
        }
        Ok(Self {
            channel_id: data[1],
            sequence: data[2],
            status: data[3],
        })
    }

    /// Encode into bytes.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < Self::SIZE {
            return Err(KnxError::BufferTooSmall);
        }
        buf[0] = Self::SIZE as u8;
        buf[1] = self.channel_id;
        buf[2] = self.sequence;
        buf[3] = self.status;
        Ok(Self::SIZE)
    }
}

/// Device information DIB (54 bytes)
///
/// Carried in SEARCH_RESPONSE. Only description type 0x01 (device info) is
/// accepted; the discovery filter matches on [`DeviceInfoDib::individual_addr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfoDib {
    /// KNX medium code (TP1, PL110, RF, IP)
    pub knx_medium: u8,
    /// Device status bits (bit 0 = programming mode)
    pub device_status: u8,
    /// Individual address the gateway advertises
    pub individual_addr: IndividualAddress,
    /// Project installation identifier
    pub project_installation_id: u16,
    /// Serial number
    pub serial_number: [u8; 6],
    /// Routing multicast address the gateway listens on
    pub routing_multicast: Ipv4Addr,
    /// MAC address
    pub mac_address: [u8; 6],
    /// Friendly name, zero-terminated or padded ASCII
    pub friendly_name: [u8; 30],
}

impl DeviceInfoDib {
    /// Size of the device-info DIB
    pub const SIZE: usize = 54;

    /// Parse from bytes.
    ///
    /// # Errors
    ///
    /// `UnknownDescription` when the description type byte is not 0x01.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(KnxError::IncompletePacket);
        }
        if data[0] != Self::SIZE as u8 {
            return Err(KnxError::InvalidFrame);
        }
        if data[1] != DIB_DEVICE_INFO {
            return Err(KnxError::UnknownDescription(data[1]));
        }

        let mut serial_number = [0u8; 6];
        serial_number.copy_from_slice(&data[8..14]);
        let mut mac_address = [0u8; 6];
        mac_address.copy_from_slice(&data[18..24]);
        let mut friendly_name = [0u8; 30];
        friendly_name.copy_from_slice(&data[24..54]);

        Ok(Self {
            knx_medium: data[2],
            device_status: data[3],
            individual_addr: IndividualAddress::from(u16::from_be_bytes([data[4], data[5]])),
            project_installation_id: u16::from_be_bytes([data[6], data[7]]),
            serial_number,
            routing_multicast: Ipv4Addr::new(data[14], data[15], data[16], data[17]),
            mac_address,
            friendly_name,
        })
    }

    /// Encode into bytes.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < Self::SIZE {
            return Err(KnxError::BufferTooSmall);
        }
        buf[0] = Self::SIZE as u8;
        buf[1] = DIB_DEVICE_INFO;
        buf[2] = self.knx_medium;
        buf[3] = self.device_status;
        buf[4..6].copy_from_slice(&self.individual_addr.raw().to_be_bytes());
        buf[6..8].copy_from_slice(&self.project_installation_id.to_be_bytes());
        buf[8..14].copy_from_slice(&self.serial_number);
        buf[14..18].copy_from_slice(&self.routing_multicast.octets());
        buf[18..24].copy_from_slice(&self.mac_address);
        buf[24..54].copy_from_slice(&self.friendly_name);
        Ok(Self::SIZE)
    }

    /// Friendly name with trailing NUL padding removed.
    pub fn name(&self) -> String {
        let end = self
            .friendly_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.friendly_name.len());
        String::from_utf8_lossy(&self.friendly_name[..end]).into_owned()
    }
}
