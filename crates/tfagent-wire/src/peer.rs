//! Transport identities.

use ed25519_dalek::VerifyingKey;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::transport::TransportError;

/// Where a node can be reached: its node ID (hex Ed25519 public key of the
/// transport key) and its socket address.
///
/// String form: `<node_id>@<ip:port>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub node_id: String,
    pub addr: SocketAddr,
}

impl PeerAddr {
    pub fn new(node_id: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            node_id: node_id.into(),
            addr,
        }
    }

    /// Identity of the node owning `key`, reachable at `addr`.
    pub fn from_key(key: &VerifyingKey, addr: SocketAddr) -> Self {
        Self::new(hex::encode(key.to_bytes()), addr)
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node_id, self.addr)
    }
}

impl FromStr for PeerAddr {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| TransportError::InvalidPeerAddr {
            addr: s.to_string(),
            reason: reason.to_string(),
        };
        let (node_id, addr) = s.split_once('@').ok_or_else(|| invalid("missing '@'"))?;
        let key = hex::decode(node_id).map_err(|_| invalid("node id is not hex"))?;
        if key.len() != 32 {
            return Err(invalid("node id must be a 32-byte key"));
        }
        let addr = addr
            .parse::<SocketAddr>()
            .map_err(|_| invalid("invalid socket address"))?;
        Ok(Self::new(node_id.to_ascii_lowercase(), addr))
    }
}
