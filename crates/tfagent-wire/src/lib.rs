//! Broker-to-broker message delivery.
//!
//! Delivers [`Message`](tfagent_types::Message) records between brokers over
//! TCP, one message per stream, framed as length-prefixed JSON.
//!
//! ## Architecture
//!
//! - **PeerTransport**: Capability trait used by the buffered node
//! - **TcpTransport**: Listener plus per-message outbound connections
//! - **PeerAddr**: Transport identity (`<node-id>@<ip:port>`)
//! - **StreamHeader**: First frame of every stream, names the protocol

pub mod message;
pub mod peer;
pub mod transport;

pub use message::{StreamHeader, PROTOCOL_ID};
pub use peer::PeerAddr;
pub use transport::{shutdown_requested, PeerTransport, TcpTransport, TransportError};
