//! Network transports.
//!
//! The connection task never touches sockets directly; it talks to the
//! [`AsyncTransport`](transport::AsyncTransport) abstraction and asks a
//! [`NetProvider`](transport::NetProvider) for fresh sockets when a state
//! transition needs one. Production uses the tokio UDP implementation in
//! [`udp`]; tests drive the task through the channel-backed [`mock`]
//! transport.

pub mod mock;
pub mod transport;
pub mod udp;

pub use mock::{mock_pair, MockHandle, MockProvider, MockTransport};
pub use transport::{AsyncTransport, NetProvider};
pub use udp::{UdpProvider, UdpTransport};
