//! Broker configuration model, deserialized from `config.toml`.

use crate::message::TwinId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default port of the client-facing protocol listener.
pub const DEFAULT_CLIENT_PORT: u16 = 8888;

/// Upper bound on a configured message lifetime (about ten years).
const MAX_MESSAGE_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Top-level broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Address of the client protocol listener.
    pub listen_addr: SocketAddr,
    /// File holding the hex-encoded 32-byte identity seed. A fresh key is
    /// generated on every start when unset.
    pub identity_key: Option<PathBuf>,
    pub transport: TransportConfig,
    pub node: NodeConfig,
    /// Static twin directory used by the in-memory identity store.
    pub twins: Vec<TwinConfig>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_CLIENT_PORT)),
            identity_key: None,
            transport: TransportConfig::default(),
            node: NodeConfig::default(),
            twins: Vec::new(),
        }
    }
}

/// Peer transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Address the peer listener binds.
    pub listen_addr: SocketAddr,
    /// Address advertised in the local identity. Defaults to the bound address.
    pub advertise_addr: Option<SocketAddr>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            advertise_addr: None,
        }
    }
}

/// Buffered node settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Deadline for delivering a single message before it is queued.
    pub send_timeout_secs: u64,
    /// Lifetime of messages pushed by clients.
    pub message_ttl_secs: u64,
    /// Interval of the redelivery and expiry sweep.
    pub maintenance_interval_secs: u64,
    /// Capacity of the inbound channel between transport and node.
    pub inbound_buffer: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            send_timeout_secs: 20,
            message_ttl_secs: 3600,
            maintenance_interval_secs: 30,
            inbound_buffer: 256,
        }
    }
}

impl NodeConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    /// Never zero, so pushed messages are always live when created.
    pub fn message_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.message_ttl_secs.clamp(1, MAX_MESSAGE_TTL_SECS) as i64)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }
}

/// A statically configured twin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwinConfig {
    pub id: TwinId,
    /// Hex-encoded Ed25519 public key.
    pub public_key: String,
    /// Transport identity (`<node-id>@<ip:port>`), if known.
    #[serde(default)]
    pub peer: Option<String>,
}
