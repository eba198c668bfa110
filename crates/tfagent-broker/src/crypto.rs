//! Ed25519 twin authentication.
//!
//! A twin proves its identity by signing the fixed [`AUTH_CHALLENGE`] with
//! the key registered for it in the twin store. Signatures are accepted raw
//! (64 bytes) or hex encoded (128 characters).

use crate::error::{BrokerError, BrokerResult};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::path::Path;
use tfagent_types::{PublicKey, SIGNATURE_SIZE};
use tracing::info;
use zeroize::Zeroizing;

/// The message every AUTH signature is computed over.
pub const AUTH_CHALLENGE: &[u8] = b"A";

/// Decode a raw or hex-encoded signature.
pub fn decode_signature(raw: &[u8]) -> BrokerResult<[u8; SIGNATURE_SIZE]> {
    let mut sig = [0u8; SIGNATURE_SIZE];
    match raw.len() {
        SIGNATURE_SIZE => sig.copy_from_slice(raw),
        len if len == SIGNATURE_SIZE * 2 => {
            hex::decode_to_slice(raw, &mut sig)
                .map_err(|e| BrokerError::InvalidSignatureEncoding(e.to_string()))?;
        }
        len => return Err(BrokerError::InvalidSignatureLength(len)),
    }
    Ok(sig)
}

/// Check `sig` over [`AUTH_CHALLENGE`] against `public_key`.
pub fn signature_valid(public_key: &PublicKey, sig: &[u8; SIGNATURE_SIZE]) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    verifying_key
        .verify(AUTH_CHALLENGE, &Signature::from_bytes(sig))
        .is_ok()
}

/// Sign [`AUTH_CHALLENGE`] with `key`.
pub fn sign_challenge(key: &SigningKey) -> [u8; SIGNATURE_SIZE] {
    key.sign(AUTH_CHALLENGE).to_bytes()
}

/// Parse a hex-encoded 32-byte Ed25519 seed.
pub fn signing_key_from_hex(seed: &str) -> BrokerResult<SigningKey> {
    let mut bytes = Zeroizing::new([0u8; 32]);
    hex::decode_to_slice(seed.trim(), &mut bytes[..])
        .map_err(|e| BrokerError::IdentityKey(format!("invalid seed: {e}")))?;
    Ok(SigningKey::from_bytes(&bytes))
}

/// Load the broker identity from a seed file, or generate a fresh one.
pub fn load_or_generate_key(path: Option<&Path>) -> BrokerResult<SigningKey> {
    match path {
        Some(path) => {
            let contents = Zeroizing::new(std::fs::read_to_string(path).map_err(|e| {
                BrokerError::IdentityKey(format!("could not read {}: {e}", path.display()))
            })?);
            let key = signing_key_from_hex(&contents)?;
            info!(path = %path.display(), "Loaded identity key");
            Ok(key)
        }
        None => {
            info!("No identity key configured, generating an ephemeral one");
            Ok(SigningKey::generate(&mut OsRng))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let key = SigningKey::generate(&mut OsRng);
        let sig = sign_challenge(&key);
        assert!(signature_valid(&key.verifying_key().to_bytes(), &sig));
    }

    #[test]
    fn test_wrong_key_fails() {
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let sig = sign_challenge(&key);
        assert!(!signature_valid(&other.verifying_key().to_bytes(), &sig));
    }

    #[test]
    fn test_tampered_signature_fails() {
        let key = SigningKey::generate(&mut OsRng);
        let mut sig = sign_challenge(&key);
        sig[10] ^= 0x01;
        assert!(!signature_valid(&key.verifying_key().to_bytes(), &sig));
    }

    #[test]
    fn test_known_vector() {
        // Key and signature produced by the reference signer tool.
        let pk: PublicKey =
            hex::decode("74856cfef93872537edaebd19504e6494beabc33f61abac91da7301f0f37f655")
                .unwrap()
                .try_into()
                .unwrap();
        let sig = decode_signature(
            b"60e2359b98c9f021df38c45c0c498da5faab789c927589a37d195471b14bfb5a\
81d13018d5fbd1f656a0a6957cbd62019f32450c2631e01f81f9d082bfc61606",
        )
        .unwrap();
        assert!(signature_valid(&pk, &sig));
    }

    #[test]
    fn test_decode_raw_and_hex() {
        let key = SigningKey::generate(&mut OsRng);
        let sig = sign_challenge(&key);
        assert_eq!(decode_signature(&sig).unwrap(), sig);
        assert_eq!(decode_signature(hex::encode(sig).as_bytes()).unwrap(), sig);
    }

    #[test]
    fn test_decode_rejects_other_lengths() {
        for len in [0, 63, 65, 127, 129] {
            assert!(matches!(
                decode_signature(&vec![b'a'; len]),
                Err(BrokerError::InvalidSignatureLength(l)) if l == len
            ));
        }
    }

    #[test]
    fn test_decode_rejects_bad_hex() {
        assert!(matches!(
            decode_signature(&[b'z'; 128]),
            Err(BrokerError::InvalidSignatureEncoding(_))
        ));
    }

    #[test]
    fn test_invalid_public_key_is_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let sig = sign_challenge(&key);
        // Arbitrary bytes, not the signing key.
        let mut pk = [0xffu8; 32];
        pk[31] = 0x7f;
        assert!(!signature_valid(&pk, &sig));
    }

    #[test]
    fn test_key_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed.hex");
        let key = SigningKey::generate(&mut OsRng);
        std::fs::write(&path, format!("{}\n", hex::encode(key.to_bytes()))).unwrap();

        let loaded = load_or_generate_key(Some(&path)).unwrap();
        assert_eq!(loaded.verifying_key(), key.verifying_key());
    }

    #[test]
    fn test_key_file_missing() {
        let err = load_or_generate_key(Some(Path::new("/nonexistent/seed.hex"))).unwrap_err();
        assert!(matches!(err, BrokerError::IdentityKey(_)));
    }

    #[test]
    fn test_generated_keys_differ() {
        let a = load_or_generate_key(None).unwrap();
        let b = load_or_generate_key(None).unwrap();
        assert_ne!(a.verifying_key(), b.verifying_key());
    }
}
