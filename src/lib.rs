#![doc = include_str!("../README.md")]

//! ## Architecture
//!
//! - [`protocol`]: the pure wire codec. Header, HPAI, CRI/CRD, connection
//!   structures, device DIB, cEMI and APDU, the service-typed [`protocol::Frame`]
//!   union and the [`protocol::DatagramBuilder`].
//! - [`addressing`]: group and individual address types.
//! - [`net`]: the transport abstraction, tokio UDP sockets and the mock
//!   transport for tests.
//! - [`tunnel`]: the connection task. Discovery, connect, heartbeat, paced
//!   tunneling with sequence tracking and acknowledgement correlation.
//! - [`client`]: the [`KnxClient`] request API.
//! - [`discovery`]: one-shot gateway sweep.
//!
//! Datapoint encoding and decoding stays outside this crate: payloads cross
//! the API as raw bytes ([`ApduPayload`]), with the 6-bit embedding rule
//! applied on the wire.

pub mod addressing;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod net;
pub mod protocol;
pub mod tunnel;

#[doc(inline)]
pub use addressing::{GroupAddress, IndividualAddress};
#[doc(inline)]
pub use client::{ClientBuilder, KnxClient};
#[doc(inline)]
pub use config::ClientConfig;
#[doc(inline)]
pub use discovery::{discover_gateways, Gateway};
#[doc(inline)]
pub use error::{KnxError, Result};
#[doc(inline)]
pub use protocol::cemi::{Apci, ApduPayload};
#[doc(inline)]
pub use tunnel::KnxEvent;
