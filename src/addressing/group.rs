//! KNX Group Address implementation.
//!
//! Group addresses represent logical groupings of devices for functional
//! control. Two textual formats exist over the same 16 bits:
//! - 3-level: Main/Middle/Sub (5/3/8 bits, e.g. "1/2/3") - most common
//! - 2-level: Main/Sub (5/11 bits, e.g. "1/234")
//!
//! The format is a per-session setting; both [`GroupAddress::parse`] and
//! [`GroupAddress::format`] take it as an explicit parameter.

use crate::error::{KnxError, Result};
use core::fmt;

/// KNX Group Address
///
/// # Examples
///
/// ```
/// use knx_link::GroupAddress;
///
/// let addr = GroupAddress::new(1, 2, 3).unwrap();
/// assert_eq!(addr.to_string(), "1/2/3");
///
/// let addr = GroupAddress::from(0x0A03u16);
/// assert_eq!(addr.main(), 1);
/// assert_eq!(addr.middle(), 2);
/// assert_eq!(addr.sub(), 3);
///
/// // Explicit-format parsing round-trips exactly
/// let addr = GroupAddress::parse("1/234", true).unwrap();
/// assert_eq!(addr.format(true), "1/234");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupAddress {
    raw: u16,
}

impl GroupAddress {
    /// Maximum main group value (5 bits)
    pub const MAX_MAIN: u8 = 31;
    /// Maximum middle group value (3 bits)
    pub const MAX_MIDDLE: u8 = 7;
    /// Maximum sub value for 2-level format (11 bits)
    pub const MAX_SUB_2LEVEL: u16 = 2047;

    /// Create a new 3-level Group Address (Main/Middle/Sub).
    ///
    /// # Errors
    ///
    /// Returns `KnxError::AddressOutOfRange` if any component is out of range.
    pub fn new(main: u8, middle: u8, sub: u8) -> Result<Self> {
        if main > Self::MAX_MAIN || middle > Self::MAX_MIDDLE {
            return Err(KnxError::AddressOutOfRange);
        }
        let raw = (u16::from(main) << 11) | (u16::from(middle) << 8) | u16::from(sub);
        Ok(Self { raw })
    }

    /// Create a new 2-level Group Address (Main/Sub).
    ///
    /// # Errors
    ///
    /// Returns `KnxError::AddressOutOfRange` if any component is out of range.
    pub fn new_2level(main: u8, sub: u16) -> Result<Self> {
        if main > Self::MAX_MAIN || sub > Self::MAX_SUB_2LEVEL {
            return Err(KnxError::AddressOutOfRange);
        }
        let raw = (u16::from(main) << 11) | sub;
        Ok(Self { raw })
    }

    /// Parse from text in the requested format.
    ///
    /// `two_level` selects between "Main/Sub" and "Main/Middle/Sub"; text in
    /// the other format is rejected so that `parse` and [`format`](Self::format)
    /// are exact inverses.
    pub fn parse(s: &str, two_level: bool) -> Result<Self> {
        let mut parts = s.split('/');
        let main: u8 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or(KnxError::InvalidAddress)?;

        let addr = if two_level {
            let sub: u16 = parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or(KnxError::InvalidAddress)?;
            Self::new_2level(main, sub)?
        } else {
            let middle: u8 = parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or(KnxError::InvalidAddress)?;
            let sub: u8 = parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or(KnxError::InvalidAddress)?;
            Self::new(main, middle, sub)?
        };

        if parts.next().is_some() {
            return Err(KnxError::InvalidAddress);
        }
        Ok(addr)
    }

    /// Format in the requested textual form.
    pub fn format(&self, two_level: bool) -> String {
        if two_level {
            format!("{}/{}", self.main(), self.sub_2level())
        } else {
            format!("{}/{}/{}", self.main(), self.middle(), self.sub())
        }
    }

    /// Get the raw u16 representation of the address.
    #[inline]
    pub const fn raw(self) -> u16 {
        self.raw
    }

    /// Get the main group component (0-31).
    #[inline]
    pub const fn main(self) -> u8 {
        ((self.raw >> 11) & 0x1F) as u8
    }

    /// Get the middle group component for 3-level format (0-7).
    #[inline]
    pub const fn middle(self) -> u8 {
        ((self.raw >> 8) & 0x07) as u8
    }

    /// Get the sub group component for 3-level format (0-255).
    #[inline]
    pub const fn sub(self) -> u8 {
        (self.raw & 0xFF) as u8
    }

    /// Get the sub group component for 2-level format (0-2047).
    #[inline]
    pub const fn sub_2level(self) -> u16 {
        self.raw & 0x07FF
    }

    /// Encode the address into a byte buffer (big-endian).
    #[inline]
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < 2 {
            return Err(KnxError::BufferTooSmall);
        }
        buf[0..2].copy_from_slice(&self.raw.to_be_bytes());
        Ok(2)
    }

    /// Decode an address from a byte buffer (big-endian).
    #[inline]
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(KnxError::IncompletePacket);
        }
        Ok(Self {
            raw: u16::from_be_bytes([buf[0], buf[1]]),
        })
    }
}

impl From<u16> for GroupAddress {
    #[inline]
    fn from(raw: u16) -> Self {
        Self { raw }
    }
}

impl From<GroupAddress> for u16 {
    #[inline]
    fn from(addr: GroupAddress) -> u16 {
        addr.raw
    }
}

impl fmt::Display for GroupAddress {
    /// Format as 3-level address by default
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.main(), self.middle(), self.sub())
    }
}

impl core::str::FromStr for GroupAddress {
    type Err = KnxError;

    /// Parse with format auto-detection (two parts = 2-level, three = 3-level).
    fn from_str(s: &str) -> Result<Self> {
        match s.split('/').count() {
            2 => Self::parse(s, true),
            3 => Self::parse(s, false),
            _ => Err(KnxError::InvalidAddress),
        }
    }
}
