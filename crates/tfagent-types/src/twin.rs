//! Identity lookup for digital twins.

use crate::message::TwinId;
use thiserror::Error;

/// Size of an Ed25519 public key.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of an Ed25519 signature.
pub const SIGNATURE_SIZE: usize = 64;

/// Raw Ed25519 public key of a twin.
pub type PublicKey = [u8; PUBLIC_KEY_SIZE];

/// Errors returned by a [`TwinStore`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("twin {0} not found")]
    NotFound(TwinId),
    #[error("twin {0} has no known peer")]
    NoPeer(TwinId),
    #[error("invalid public key for twin {twin}: {reason}")]
    InvalidKey { twin: TwinId, reason: String },
    #[error("twin lookup failed: {0}")]
    Backend(String),
}

/// Resolves twin IDs to their transport identity and public key.
///
/// Implementations are read-mostly and shared between every connection, so
/// lookups are synchronous and must not block on I/O for long.
pub trait TwinStore: Send + Sync + 'static {
    /// Transport identity the twin is currently reachable at.
    fn peer_id(&self, twin: TwinId) -> Result<String, LookupError>;

    /// Public key of the twin.
    fn public_key(&self, twin: TwinId) -> Result<PublicKey, LookupError>;

    /// Override the cached transport identity of a twin.
    ///
    /// Transport keys of remote twins are not validated, so anyone able to
    /// call this can redirect a twin's traffic. Development use only.
    fn set_peer_id(&self, twin: TwinId, peer_id: String);
}

/// Decode a hex-encoded public key.
pub fn decode_public_key(twin: TwinId, hex_key: &str) -> Result<PublicKey, LookupError> {
    let bytes = hex::decode(hex_key.trim()).map_err(|e| LookupError::InvalidKey {
        twin,
        reason: e.to_string(),
    })?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| LookupError::InvalidKey {
            twin,
            reason: format!("expected {PUBLIC_KEY_SIZE} bytes, got {}", bytes.len()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_public_key() {
        let key = decode_public_key(
            1,
            "74856cfef93872537edaebd19504e6494beabc33f61abac91da7301f0f37f655",
        )
        .unwrap();
        assert_eq!(key[0], 0x74);
        assert_eq!(key[31], 0x55);
    }

    #[test]
    fn test_decode_public_key_wrong_length() {
        let err = decode_public_key(3, "abcd").unwrap_err();
        assert!(matches!(err, LookupError::InvalidKey { twin: 3, .. }));
        assert!(err.to_string().contains("expected 32 bytes"));
    }

    #[test]
    fn test_decode_public_key_not_hex() {
        assert!(decode_public_key(3, "zz").is_err());
    }
}
