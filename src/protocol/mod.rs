//! KNXnet/IP protocol implementation.
//!
//! This module contains the wire codec for the KNXnet/IP frame family
//! (header, HPAI, CRI/CRD, connection structures, DIB, cEMI, APDU), the
//! service-typed frame union and the datagram builder. Everything here is
//! pure over byte slices; sockets and timers live in [`crate::net`] and
//! [`crate::tunnel`].

pub mod builder;
pub mod cemi;
pub mod constants;
pub mod frame;
pub mod services;

pub use builder::{Datagram, DatagramBuilder};
pub use cemi::{Apci, Apdu, ApduPayload, CemiFrame, ControlField1, ControlField2};
pub use constants::{CemiMessageCode, Priority, ServiceType};
pub use frame::{ConnState, ConnectionHeader, Crd, Cri, DeviceInfoDib, Hpai, KnxnetIpHeader};
pub use services::{Body, Frame};
