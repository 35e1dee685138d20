//! Common External Message Interface (cEMI) implementation.
//!
//! cEMI is the KNX frame body transported inside tunneling requests and
//! routing indications. This module owns the two bit-packed control bytes,
//! the TPCI/APCI/data word and the APDU payload placement rule; these are
//! the only places in the stack where fields cross byte boundaries, so they
//! are expressed as tagged records with explicit shifts and masks rather
//! than a general bit-stream reader.
//!
//! ## Frame Structure
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ Message Code (1 byte)                    │
//! ├──────────────────────────────────────────┤
//! │ Additional Info Length (1 byte)          │
//! ├──────────────────────────────────────────┤
//! │ Additional Info (variable, usually none) │
//! ├──────────────────────────────────────────┤
//! │ Service Information (L_Data)             │
//! │  ├─ Control Field 1 (1 byte)             │
//! │  ├─ Control Field 2 (1 byte)             │
//! │  ├─ Source Address (2 bytes)             │
//! │  ├─ Destination Address (2 bytes)        │
//! │  ├─ APDU Length L (1 byte)               │
//! │  └─ TPCI/APCI word + data (L+1 bytes)    │
//! └──────────────────────────────────────────┘
//! ```

use crate::addressing::{GroupAddress, IndividualAddress};
use crate::error::{KnxError, Result};
use crate::protocol::constants::{CemiMessageCode, Priority};

/// Control Field 1 of `L_Data` frame
///
/// ```text
/// Bit 7: Frame Type (0=extended, 1=standard)
/// Bit 6: Reserved
/// Bit 5: Repeat (0=repeat, 1=do not repeat)
/// Bit 4: System Broadcast (0=system, 1=broadcast)
/// Bit 3-2: Priority (00=system, 01=normal, 10=urgent, 11=low)
/// Bit 1: Acknowledge Request (0=no ack, 1=ack requested)
/// Bit 0: Confirm (0=no error, 1=error)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlField1 {
    raw: u8,
}

impl From<u8> for ControlField1 {
    #[inline]
    fn from(raw: u8) -> Self {
        Self { raw }
    }
}

impl From<ControlField1> for u8 {
    #[inline]
    fn from(ctrl: ControlField1) -> u8 {
        ctrl.raw
    }
}

impl ControlField1 {
    /// Create a new Control Field 1
    pub const fn new(
        standard_frame: bool,
        do_not_repeat: bool,
        broadcast: bool,
        priority: Priority,
        ack_requested: bool,
        confirm_error: bool,
    ) -> Self {
        let mut raw = 0u8;
        if standard_frame {
            raw |= 0x80;
        }
        if do_not_repeat {
            raw |= 0x20;
        }
        if broadcast {
            raw |= 0x10;
        }
        raw |= (priority.to_u8() & 0x03) << 2;
        if ack_requested {
            raw |= 0x02;
        }
        if confirm_error {
            raw |= 0x01;
        }
        Self { raw }
    }

    /// Get raw byte value
    #[inline]
    pub const fn raw(self) -> u8 {
        self.raw
    }

    /// Check if frame is standard (true) or extended (false)
    #[inline]
    pub const fn is_standard_frame(self) -> bool {
        (self.raw & 0x80) != 0
    }

    /// Check if repeat flag is set (do not repeat if true)
    #[inline]
    pub const fn do_not_repeat(self) -> bool {
        (self.raw & 0x20) != 0
    }

    /// Check if this is a broadcast frame
    #[inline]
    pub const fn is_broadcast(self) -> bool {
        (self.raw & 0x10) != 0
    }

    /// Get priority
    #[inline]
    pub const fn priority(self) -> Priority {
        Priority::from_u8((self.raw >> 2) & 0x03)
    }

    /// Check if acknowledge is requested
    #[inline]
    pub const fn ack_requested(self) -> bool {
        (self.raw & 0x02) != 0
    }

    /// Set the acknowledge-request bit
    pub fn set_ack_requested(&mut self, ack: bool) {
        if ack {
            self.raw |= 0x02;
        } else {
            self.raw &= !0x02;
        }
    }

    /// Check if confirm error flag is set
    #[inline]
    pub const fn has_error(self) -> bool {
        (self.raw & 0x01) != 0
    }
}

impl Default for ControlField1 {
    /// Standard frame, do not repeat, broadcast, low priority, no ack,
    /// no error: 0b10111100 = 0xBC.
    #[inline]
    fn default() -> Self {
        Self { raw: 0xBC }
    }
}

/// Control Field 2 of `L_Data` frame
///
/// ```text
/// Bit 7: Destination Address Type (0=individual, 1=group)
/// Bit 6-4: Hop Count (0-7)
/// Bit 3-0: Extended Frame Format (0000=standard)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlField2 {
    raw: u8,
}

impl From<u8> for ControlField2 {
    #[inline]
    fn from(raw: u8) -> Self {
        Self { raw }
    }
}

impl From<ControlField2> for u8 {
    #[inline]
    fn from(ctrl: ControlField2) -> u8 {
        ctrl.raw
    }
}

impl ControlField2 {
    /// Create a new Control Field 2
    pub const fn new(is_group: bool, hop_count: u8, extended_format: u8) -> Self {
        let mut raw = 0u8;
        if is_group {
            raw |= 0x80;
        }
        raw |= (hop_count & 0x07) << 4;
        raw |= extended_format & 0x0F;
        Self { raw }
    }

    /// Get raw byte value
    #[inline]
    pub const fn raw(self) -> u8 {
        self.raw
    }

    /// Check if destination is group address (true) or individual (false)
    #[inline]
    pub const fn is_group_address(self) -> bool {
        (self.raw & 0x80) != 0
    }

    /// Set the destination address type bit
    pub fn set_group_address(&mut self, group: bool) {
        if group {
            self.raw |= 0x80;
        } else {
            self.raw &= !0x80;
        }
    }

    /// Get hop count (0-7)
    #[inline]
    pub const fn hop_count(self) -> u8 {
        (self.raw >> 4) & 0x07
    }

    /// Get extended frame format
    #[inline]
    pub const fn extended_format(self) -> u8 {
        self.raw & 0x0F
    }
}

impl Default for ControlField2 {
    /// Group address, hop count 6, standard format: 0b11100000 = 0xE0.
    #[inline]
    fn default() -> Self {
        Self { raw: 0xE0 }
    }
}

/// APCI (Application Layer Protocol Control Information)
///
/// Four bits of the TPCI/APCI word; the code space is fully enumerated so
/// dispatch on it is exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Apci {
    /// `A_GroupValue_Read`
    GroupValueRead = 0,
    /// `A_GroupValue_Response`
    GroupValueResponse = 1,
    /// `A_GroupValue_Write`
    GroupValueWrite = 2,
    /// `A_IndividualAddress_Write`
    IndividualAddrWrite = 3,
    /// `A_IndividualAddress_Read`
    IndividualAddrRead = 4,
    /// `A_IndividualAddress_Response`
    IndividualAddrResponse = 5,
    /// `A_ADC_Read`
    AdcRead = 6,
    /// `A_ADC_Response`
    AdcResponse = 7,
    /// `A_Memory_Read`
    MemoryRead = 8,
    /// `A_Memory_Response`
    MemoryResponse = 9,
    /// `A_Memory_Write`
    MemoryWrite = 10,
    /// `A_UserMemory` services
    UserMessage = 11,
    /// `A_DeviceDescriptor_Read`
    DeviceDescriptorRead = 12,
    /// `A_DeviceDescriptor_Response`
    DeviceDescriptorResponse = 13,
    /// `A_Restart`
    Restart = 14,
    /// Escape to the extended APCI code space
    Escape = 15,
}

impl Apci {
    /// Decode from the four APCI bits of the TPCI/APCI word.
    pub const fn from_code(code: u8) -> Self {
        match code & 0x0F {
            0 => Self::GroupValueRead,
            1 => Self::GroupValueResponse,
            2 => Self::GroupValueWrite,
            3 => Self::IndividualAddrWrite,
            4 => Self::IndividualAddrRead,
            5 => Self::IndividualAddrResponse,
            6 => Self::AdcRead,
            7 => Self::AdcResponse,
            8 => Self::MemoryRead,
            9 => Self::MemoryResponse,
            10 => Self::MemoryWrite,
            11 => Self::UserMessage,
            12 => Self::DeviceDescriptorRead,
            13 => Self::DeviceDescriptorResponse,
            14 => Self::Restart,
            _ => Self::Escape,
        }
    }

    /// The four APCI bits.
    pub const fn to_code(self) -> u8 {
        self as u8
    }
}

impl core::fmt::Display for Apci {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Apci::GroupValueRead => "GroupValue_Read",
            Apci::GroupValueResponse => "GroupValue_Response",
            Apci::GroupValueWrite => "GroupValue_Write",
            Apci::IndividualAddrWrite => "IndividualAddress_Write",
            Apci::IndividualAddrRead => "IndividualAddress_Read",
            Apci::IndividualAddrResponse => "IndividualAddress_Response",
            Apci::AdcRead => "ADC_Read",
            Apci::AdcResponse => "ADC_Response",
            Apci::MemoryRead => "Memory_Read",
            Apci::MemoryResponse => "Memory_Response",
            Apci::MemoryWrite => "Memory_Write",
            Apci::UserMessage => "UserMessage",
            Apci::DeviceDescriptorRead => "DeviceDescriptor_Read",
            Apci::DeviceDescriptorResponse => "DeviceDescriptor_Response",
            Apci::Restart => "Restart",
            Apci::Escape => "Escape",
        };
        f.write_str(name)
    }
}

/// APDU payload with its placement decided by size.
///
/// Values of six bits or less are embedded in the low bits of the TPCI/APCI
/// word (3-byte APDU); anything larger travels as 1..=14 bytes after the
/// word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApduPayload {
    /// 6-bit value embedded in the TPCI/APCI word (0..=63)
    Small(u8),
    /// 1..=14 payload bytes following the word
    Bytes(Vec<u8>),
}

impl ApduPayload {
    /// Payload bytes regardless of placement.
    ///
    /// A `Small` value is viewed as a one-byte buffer, matching what the
    /// short wire form decodes to.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ApduPayload::Small(v) => core::slice::from_ref(v),
            ApduPayload::Bytes(b) => b,
        }
    }

    /// Build a payload from raw bytes and an explicit bit length.
    ///
    /// Bit lengths of six or less select the embedded short form.
    pub fn from_raw(data: &[u8], bit_length: u8) -> Result<Self> {
        if data.is_empty() {
            return Err(KnxError::BadApduLength(0));
        }
        if bit_length <= 6 && data.len() == 1 {
            Ok(ApduPayload::Small(data[0] & 0x3F))
        } else if data.len() <= 14 {
            Ok(ApduPayload::Bytes(data.to_vec()))
        } else {
            Err(KnxError::BadApduLength(data.len()))
        }
    }
}

/// Application Protocol Data Unit
///
/// The TPCI/APCI word plus payload. On the wire: a length byte `L`, then
/// `L+1` further bytes of which the first two are bit-packed as six bits
/// TPCI, four bits APCI and six bits embedded data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Apdu {
    /// Transport control bits (6 bits, 0 for unnumbered data)
    pub tpci: u8,
    /// Application control code
    pub apci: Apci,
    /// Payload, placed per the 6-bit embedding rule
    pub payload: ApduPayload,
}

impl Apdu {
    /// Smallest encodable APDU (length byte + packed word)
    pub const MIN_SIZE: usize = 3;
    /// Largest encodable APDU (14 payload bytes)
    pub const MAX_SIZE: usize = 17;

    /// A GroupValue_Write with an empty 6-bit value, the skeleton default.
    pub fn group_write_default() -> Self {
        Self {
            tpci: 0,
            apci: Apci::GroupValueWrite,
            payload: ApduPayload::Small(0),
        }
    }

    /// Encoded size in bytes including the length byte.
    pub fn length(&self) -> usize {
        match &self.payload {
            ApduPayload::Small(_) => Self::MIN_SIZE,
            ApduPayload::Bytes(b) => Self::MIN_SIZE + b.len(),
        }
    }

    /// Parse an APDU starting at its length byte.
    ///
    /// Returns the value and the number of bytes consumed.
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        if data.is_empty() {
            return Err(KnxError::IncompletePacket);
        }
        let l = data[0] as usize;
        if l == 0 || l > 15 {
            return Err(KnxError::BadApduLength(l));
        }
        let total = l + 2; // length byte + (L+1) further bytes
        if data.len() < total {
            return Err(KnxError::IncompletePacket);
        }

        let word = u16::from_be_bytes([data[1], data[2]]);
        let tpci = (word >> 10) as u8;
        let apci = Apci::from_code(((word >> 6) & 0x0F) as u8);
        let payload = if l == 1 {
            ApduPayload::Small((word & 0x3F) as u8)
        } else {
            ApduPayload::Bytes(data[3..total].to_vec())
        };

        Ok((Self { tpci, apci, payload }, total))
    }

    /// Encode the APDU into a byte buffer.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let total = self.length();
        if buf.len() < total {
            return Err(KnxError::BufferTooSmall);
        }

        let word_base = (u16::from(self.tpci & 0x3F) << 10) | (u16::from(self.apci.to_code()) << 6);
        match &self.payload {
            ApduPayload::Small(v) => {
                if *v > 0x3F {
                    return Err(KnxError::PayloadNotEncodable);
                }
                buf[0] = 1;
                buf[1..3].copy_from_slice(&(word_base | u16::from(*v)).to_be_bytes());
            }
            ApduPayload::Bytes(bytes) => {
                if bytes.is_empty() || bytes.len() > 14 {
                    return Err(KnxError::BadApduLength(bytes.len()));
                }
                buf[0] = (1 + bytes.len()) as u8;
                buf[1..3].copy_from_slice(&word_base.to_be_bytes());
                buf[3..total].copy_from_slice(bytes);
            }
        }
        Ok(total)
    }
}

/// cEMI frame
///
/// Owned representation of the cEMI body carried by tunneling requests and
/// routing indications. The three `L_Data` primitives parse a full service
/// body including the APDU; all other message codes parse the fixed head
/// only and keep `apdu` empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CemiFrame {
    /// Message primitive
    pub msg_code: CemiMessageCode,
    /// Additional information block (usually empty)
    pub additional_info: Vec<u8>,
    /// Control field 1
    pub ctrl1: ControlField1,
    /// Control field 2
    pub ctrl2: ControlField2,
    /// Source address (individual)
    pub source: IndividualAddress,
    /// Destination address; interpretation follows `ctrl2.is_group_address()`
    pub destination: u16,
    /// APDU, present for `L_Data` primitives
    pub apdu: Option<Apdu>,
}

impl CemiFrame {
    /// An `L_Data.req` skeleton with default control fields.
    pub fn ldata_req(source: IndividualAddress) -> Self {
        Self {
            msg_code: CemiMessageCode::LDataReq,
            additional_info: Vec::new(),
            ctrl1: ControlField1::default(),
            ctrl2: ControlField2::default(),
            source,
            destination: 0,
            apdu: Some(Apdu::group_write_default()),
        }
    }

    /// An `L_Data.ind` skeleton with default control fields.
    pub fn ldata_ind(source: IndividualAddress) -> Self {
        Self {
            msg_code: CemiMessageCode::LDataInd,
            ..Self::ldata_req(source)
        }
    }

    /// Parse a cEMI frame, returning the value and the bytes consumed.
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 2 {
            return Err(KnxError::IncompletePacket);
        }
        let msg_code =
            CemiMessageCode::from_u8(data[0]).ok_or(KnxError::UnknownMessageCode(data[0]))?;
        let add_len = data[1] as usize;
        let service_start = 2 + add_len;
        if data.len() < service_start {
            return Err(KnxError::IncompletePacket);
        }
        let additional_info = data[2..service_start].to_vec();

        if !msg_code.is_ldata() {
            // Fixed head only for non-L_Data primitives.
            return Ok((
                Self {
                    msg_code,
                    additional_info,
                    ctrl1: ControlField1::from(0),
                    ctrl2: ControlField2::from(0),
                    source: IndividualAddress::from(0),
                    destination: 0,
                    apdu: None,
                },
                service_start,
            ));
        }

        let svc = &data[service_start..];
        if svc.len() < 6 {
            return Err(KnxError::IncompletePacket);
        }
        let ctrl1 = ControlField1::from(svc[0]);
        let ctrl2 = ControlField2::from(svc[1]);
        let source = IndividualAddress::from(u16::from_be_bytes([svc[2], svc[3]]));
        let destination = u16::from_be_bytes([svc[4], svc[5]]);
        let (apdu, apdu_len) = Apdu::parse(&svc[6..])?;

        Ok((
            Self {
                msg_code,
                additional_info,
                ctrl1,
                ctrl2,
                source,
                destination,
                apdu: Some(apdu),
            },
            service_start + 6 + apdu_len,
        ))
    }

    /// Encoded size in bytes.
    pub fn length(&self) -> usize {
        let head = 2 + self.additional_info.len();
        match &self.apdu {
            Some(apdu) => head + 6 + apdu.length(),
            None => head,
        }
    }

    /// Encode the frame into a byte buffer.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let total = self.length();
        if buf.len() < total {
            return Err(KnxError::BufferTooSmall);
        }

        buf[0] = self.msg_code.to_u8();
        buf[1] = self.additional_info.len() as u8;
        let mut offset = 2;
        buf[offset..offset + self.additional_info.len()].copy_from_slice(&self.additional_info);
        offset += self.additional_info.len();

        if let Some(apdu) = &self.apdu {
            buf[offset] = self.ctrl1.raw();
            buf[offset + 1] = self.ctrl2.raw();
            buf[offset + 2..offset + 4].copy_from_slice(&self.source.raw().to_be_bytes());
            buf[offset + 4..offset + 6].copy_from_slice(&self.destination.to_be_bytes());
            offset += 6;
            offset += apdu.encode(&mut buf[offset..])?;
        }
        Ok(offset)
    }

    /// Destination as group address, when ctrl2 says so.
    pub fn destination_group(&self) -> Option<GroupAddress> {
        self.ctrl2
            .is_group_address()
            .then(|| GroupAddress::from(self.destination))
    }

    /// Destination as individual address, when ctrl2 says so.
    pub fn destination_individual(&self) -> Option<IndividualAddress> {
        (!self.ctrl2.is_group_address()).then(|| IndividualAddress::from(self.destination))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_field1_bits() {
        // 0xBC = standard, do-not-repeat, broadcast, low priority
        let ctrl = ControlField1::from(0xBCu8);
        assert!(ctrl.is_standard_frame());
        assert!(ctrl.do_not_repeat());
        assert!(ctrl.is_broadcast());
        assert_eq!(ctrl.priority(), Priority::Low);
        assert!(!ctrl.ack_requested());
        assert!(!ctrl.has_error());
        assert_eq!(ControlField1::default(), ctrl);
    }

    #[test]
    fn test_control_field1_ack_bit() {
        let mut ctrl = ControlField1::default();
        ctrl.set_ack_requested(true);
        assert_eq!(ctrl.raw(), 0xBE);
        assert!(ctrl.ack_requested());
        ctrl.set_ack_requested(false);
        assert_eq!(ctrl.raw(), 0xBC);
    }

    #[test]
    fn test_control_field1_new_matches_accessors() {
        let ctrl = ControlField1::new(true, false, true, Priority::Normal, true, false);
        assert!(ctrl.is_standard_frame());
        assert!(!ctrl.do_not_repeat());
        assert_eq!(ctrl.priority(), Priority::Normal);
        assert!(ctrl.ack_requested());
    }

    #[test]
    fn test_control_field2_bits() {
        let ctrl = ControlField2::default();
        assert_eq!(ctrl.raw(), 0xE0);
        assert!(ctrl.is_group_address());
        assert_eq!(ctrl.hop_count(), 6);
        assert_eq!(ctrl.extended_format(), 0);

        let ctrl = ControlField2::new(false, 5, 0);
        assert!(!ctrl.is_group_address());
        assert_eq!(ctrl.hop_count(), 5);
    }

    #[test]
    fn test_apci_code_roundtrip() {
        for code in 0u8..16 {
            assert_eq!(Apci::from_code(code).to_code(), code);
        }
        assert_eq!(Apci::from_code(0), Apci::GroupValueRead);
        assert_eq!(Apci::from_code(1), Apci::GroupValueResponse);
        assert_eq!(Apci::from_code(2), Apci::GroupValueWrite);
    }

    #[test]
    fn test_apdu_short_form_roundtrip() {
        // 6-bit payloads encode to exactly 3 bytes
        for value in [0u8, 1, 42, 63] {
            let apdu = Apdu {
                tpci: 0,
                apci: Apci::GroupValueWrite,
                payload: ApduPayload::Small(value),
            };
            let mut buf = [0u8; 17];
            let n = apdu.encode(&mut buf).unwrap();
            assert_eq!(n, 3);
            assert_eq!(buf[0], 1);
            assert_eq!(buf[2] & 0x3F, value);

            let (parsed, consumed) = Apdu::parse(&buf[..n]).unwrap();
            assert_eq!(consumed, 3);
            assert_eq!(parsed, apdu);
        }
    }

    #[test]
    fn test_apdu_long_form_roundtrip() {
        // A 14-byte buffer encodes to the 17-byte maximum
        let payload: Vec<u8> = (0..14).collect();
        let apdu = Apdu {
            tpci: 0,
            apci: Apci::GroupValueResponse,
            payload: ApduPayload::Bytes(payload.clone()),
        };
        let mut buf = [0u8; 17];
        let n = apdu.encode(&mut buf).unwrap();
        assert_eq!(n, 17);
        assert_eq!(buf[0], 15);

        let (parsed, consumed) = Apdu::parse(&buf).unwrap();
        assert_eq!(consumed, 17);
        assert_eq!(parsed.payload.as_bytes(), &payload[..]);
    }

    #[test]
    fn test_apdu_rejects_bad_lengths() {
        // L = 0 on the wire
        assert!(matches!(
            Apdu::parse(&[0x00, 0x00, 0x80]),
            Err(KnxError::BadApduLength(0))
        ));
        // L = 16 on the wire
        assert!(matches!(
            Apdu::parse(&[0x10, 0x00, 0x80]),
            Err(KnxError::BadApduLength(16))
        ));
        // 15-byte payload on encode
        let apdu = Apdu {
            tpci: 0,
            apci: Apci::GroupValueWrite,
            payload: ApduPayload::Bytes(vec![0u8; 15]),
        };
        assert!(matches!(
            apdu.encode(&mut [0u8; 32]),
            Err(KnxError::BadApduLength(15))
        ));
        // Empty payload on encode
        let apdu = Apdu {
            tpci: 0,
            apci: Apci::GroupValueWrite,
            payload: ApduPayload::Bytes(Vec::new()),
        };
        assert!(matches!(
            apdu.encode(&mut [0u8; 32]),
            Err(KnxError::BadApduLength(0))
        ));
    }

    #[test]
    fn test_apdu_word_packing() {
        // word = tpci << 10 | apci << 6 | data
        let apdu = Apdu {
            tpci: 0,
            apci: Apci::GroupValueWrite,
            payload: ApduPayload::Small(1),
        };
        let mut buf = [0u8; 3];
        apdu.encode(&mut buf).unwrap();
        assert_eq!(buf, [0x01, 0x00, 0x81]);
    }

    #[test]
    fn test_payload_from_raw() {
        assert_eq!(
            ApduPayload::from_raw(&[0x01], 1).unwrap(),
            ApduPayload::Small(1)
        );
        assert_eq!(
            ApduPayload::from_raw(&[0x42], 8).unwrap(),
            ApduPayload::Bytes(vec![0x42])
        );
        assert!(ApduPayload::from_raw(&[], 8).is_err());
        assert!(ApduPayload::from_raw(&[0u8; 15], 120).is_err());
    }

    #[test]
    fn test_cemi_group_write_parse() {
        // L_Data.ind, group write to 1/2/3 with embedded value 1
        let data = [
            0x29, // L_Data.ind
            0x00, // no additional info
            0xBC, 0xE0, // control fields
            0x11, 0x01, // source 1.1.1
            0x0A, 0x03, // destination 1/2/3
            0x01, // APDU length
            0x00, 0x81, // word: write, data = 1
        ];

        let (cemi, consumed) = CemiFrame::parse(&data).unwrap();
        assert_eq!(consumed, data.len());
        assert_eq!(cemi.msg_code, CemiMessageCode::LDataInd);
        assert_eq!(cemi.source.to_string(), "1.1.1");
        assert_eq!(
            cemi.destination_group(),
            Some(GroupAddress::new(1, 2, 3).unwrap())
        );
        let apdu = cemi.apdu.unwrap();
        assert_eq!(apdu.apci, Apci::GroupValueWrite);
        assert_eq!(apdu.payload, ApduPayload::Small(1));
    }

    #[test]
    fn test_cemi_roundtrip() {
        let mut cemi = CemiFrame::ldata_req(IndividualAddress::new(15, 15, 15).unwrap());
        cemi.destination = GroupAddress::new(4, 0, 1).unwrap().raw();
        cemi.apdu = Some(Apdu {
            tpci: 0,
            apci: Apci::GroupValueWrite,
            payload: ApduPayload::Bytes(vec![0x12, 0x34]),
        });

        let mut buf = [0u8; 64];
        let n = cemi.encode(&mut buf).unwrap();
        assert_eq!(n, cemi.length());

        let (parsed, consumed) = CemiFrame::parse(&buf[..n]).unwrap();
        assert_eq!(consumed, n);
        assert_eq!(parsed, cemi);
    }

    #[test]
    fn test_cemi_additional_info_preserved() {
        let data = [
            0x29, // L_Data.ind
            0x02, 0xAA, 0xBB, // 2 bytes additional info
            0xBC, 0xE0, 0x11, 0x01, 0x0A, 0x03, 0x01, 0x00, 0x80,
        ];
        let (cemi, _) = CemiFrame::parse(&data).unwrap();
        assert_eq!(cemi.additional_info, vec![0xAA, 0xBB]);

        let mut buf = [0u8; 64];
        let n = cemi.encode(&mut buf).unwrap();
        assert_eq!(&buf[..n], &data[..]);
    }

    #[test]
    fn test_cemi_non_ldata_head_only() {
        // L_Busmon.ind parses the head only, trailing bytes untouched
        let data = [0x2B, 0x00, 0xDE, 0xAD, 0xBE, 0xEF];
        let (cemi, consumed) = CemiFrame::parse(&data).unwrap();
        assert_eq!(consumed, 2);
        assert_eq!(cemi.msg_code, CemiMessageCode::LBusmonInd);
        assert!(cemi.apdu.is_none());
    }

    #[test]
    fn test_cemi_unknown_message_code() {
        assert!(matches!(
            CemiFrame::parse(&[0xFF, 0x00]),
            Err(KnxError::UnknownMessageCode(0xFF))
        ));
    }
}
