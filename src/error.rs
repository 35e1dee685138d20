//! Error types for KNX operations.
//!
//! A single crate-wide error enum keeps the decode, protocol, transport and
//! API failure modes in one place. Decode errors are non-fatal to the
//! connection: the offending frame is logged and dropped.

use core::fmt;

/// Result type alias for KNX operations.
pub type Result<T> = core::result::Result<T, KnxError>;

/// KNX protocol error.
#[derive(Debug)]
pub enum KnxError {
    // -- Decode errors ------------------------------------------------------
    /// Buffer ends before the structure it claims to contain.
    IncompletePacket,
    /// Structure length or constant field does not match the wire format.
    InvalidFrame,
    /// KNXnet/IP protocol version other than 1.0.
    UnsupportedVersion(u8),
    /// Service type identifier outside the supported set.
    UnknownServiceType(u16),
    /// HPAI carrying a host protocol other than IPv4/UDP (e.g. TCP).
    UnsupportedTransport(u8),
    /// DIB with a description type other than device info.
    UnknownDescription(u8),
    /// cEMI message code outside the known set.
    UnknownMessageCode(u8),
    /// APDU length byte outside the encodable range.
    BadApduLength(usize),
    /// Payload is neither a 6-bit value nor a 1..=14 byte buffer.
    PayloadNotEncodable,
    /// Destination buffer too small for the encoded structure.
    BufferTooSmall,

    // -- Addressing errors --------------------------------------------------
    /// Address text does not parse in the requested format.
    InvalidAddress,
    /// Address component exceeds its bit width.
    AddressOutOfRange,

    // -- Protocol / connection errors ---------------------------------------
    /// Gateway refused the connection with the given status code.
    ConnectRefused(u8),
    /// Gateway reported `E_NO_MORE_CONNECTIONS`.
    NoMoreConnections,
    /// A connection-level exchange timed out.
    ConnectionTimeout,
    /// The tunnel was torn down while requests were outstanding.
    ConnectionLost,
    /// Operation requires an established tunnel.
    NotConnected,
    /// TUNNELING_ACK carried a non-zero status after retry.
    AckFailed(u8),
    /// No acknowledgement or response arrived within the request timeout.
    NoResponse,

    // -- Transport errors ---------------------------------------------------
    /// Underlying socket failure.
    Socket(std::io::Error),
}

impl KnxError {
    /// True for errors raised while decoding an inbound frame. These never
    /// tear down the connection; the frame is dropped.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            KnxError::IncompletePacket
                | KnxError::InvalidFrame
                | KnxError::UnsupportedVersion(_)
                | KnxError::UnknownServiceType(_)
                | KnxError::UnsupportedTransport(_)
                | KnxError::UnknownDescription(_)
                | KnxError::UnknownMessageCode(_)
                | KnxError::BadApduLength(_)
        )
    }
}

impl fmt::Display for KnxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KnxError::IncompletePacket => write!(f, "incomplete packet"),
            KnxError::InvalidFrame => write!(f, "invalid frame structure"),
            KnxError::UnsupportedVersion(v) => {
                write!(f, "unsupported KNXnet/IP version {v:#04x}")
            }
            KnxError::UnknownServiceType(st) => write!(f, "unknown service type {st:#06x}"),
            KnxError::UnsupportedTransport(p) => {
                write!(f, "unsupported host protocol {p:#04x} (only IPv4/UDP)")
            }
            KnxError::UnknownDescription(t) => write!(f, "unknown DIB description type {t:#04x}"),
            KnxError::UnknownMessageCode(c) => write!(f, "unknown cEMI message code {c:#04x}"),
            KnxError::BadApduLength(l) => write!(f, "APDU length {l} outside 1..=15"),
            KnxError::PayloadNotEncodable => write!(f, "payload not encodable into an APDU"),
            KnxError::BufferTooSmall => write!(f, "buffer too small"),
            KnxError::InvalidAddress => write!(f, "invalid KNX address"),
            KnxError::AddressOutOfRange => write!(f, "KNX address component out of range"),
            KnxError::ConnectRefused(status) => {
                write!(f, "gateway refused connection (status {status:#04x})")
            }
            KnxError::NoMoreConnections => write!(f, "gateway has no free tunnel connections"),
            KnxError::ConnectionTimeout => write!(f, "connection exchange timed out"),
            KnxError::ConnectionLost => write!(f, "tunnel connection lost"),
            KnxError::NotConnected => write!(f, "not connected to a gateway"),
            KnxError::AckFailed(status) => {
                write!(f, "tunneling request rejected (status {status:#04x})")
            }
            KnxError::NoResponse => write!(f, "no response"),
            KnxError::Socket(e) => write!(f, "socket error: {e}"),
        }
    }
}

impl std::error::Error for KnxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KnxError::Socket(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for KnxError {
    fn from(e: std::io::Error) -> Self {
        KnxError::Socket(e)
    }
}
