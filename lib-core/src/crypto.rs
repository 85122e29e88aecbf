//! Ed25519 signing helpers.
//!
//! Node ids, peer ids and mutable-value ids are all ed25519 verifying keys,
//! so the key wrapper lives next to the id type. Signing keys stay inside
//! this crate's types; raw seeds only appear when loading configuration.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::error::DhtError;
use crate::id::{Id, ID_BYTES};

/// Length of an ed25519 signature in bytes.
pub const SIGNATURE_BYTES: usize = 64;

/// Length of an ed25519 seed in bytes.
pub const SEED_BYTES: usize = 32;

/// An ed25519 keypair owning its signing key.
#[derive(Clone)]
pub struct KeyPair {
    key: SigningKey,
}

impl KeyPair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        KeyPair {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic keypair from a 32-byte seed.
    pub fn from_seed(seed: &[u8; SEED_BYTES]) -> Self {
        KeyPair {
            key: SigningKey::from_bytes(seed),
        }
    }

    /// Keypair from raw private-key bytes (a 32-byte seed).
    pub fn from_private_key(bytes: &[u8]) -> Result<Self, DhtError> {
        let seed: &[u8; SEED_BYTES] = bytes.try_into().map_err(|_| {
            DhtError::Protocol(format!(
                "private key must be {} bytes, got {}",
                SEED_BYTES,
                bytes.len()
            ))
        })?;
        Ok(Self::from_seed(seed))
    }

    /// Keypair from a textual private key, hex or base58.
    pub fn from_encoded_private_key(text: &str) -> Result<Self, DhtError> {
        if let Ok(bytes) = hex::decode(text) {
            if bytes.len() == SEED_BYTES {
                return Self::from_private_key(&bytes);
            }
        }
        let bytes = bs58::decode(text)
            .into_vec()
            .map_err(|e| DhtError::Protocol(format!("invalid private key encoding: {}", e)))?;
        Self::from_private_key(&bytes)
    }

    /// The verifying key as an [`Id`].
    pub fn public_id(&self) -> Id {
        Id::from_bytes(self.key.verifying_key().to_bytes())
    }

    /// Raw seed bytes, for persistence only.
    pub fn to_seed(&self) -> [u8; SEED_BYTES] {
        self.key.to_bytes()
    }

    /// Sign `data`, returning the 64-byte signature.
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.key.sign(data).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never leak the seed into logs.
        write!(f, "KeyPair({})", self.public_id())
    }
}

/// Verify `signature` over `data` against the verifying key `public`.
///
/// Ids that are not valid curve points and malformed signatures verify as
/// false rather than erroring; callers treat both the same way.
pub fn verify_signature(public: &Id, data: &[u8], signature: &[u8]) -> bool {
    let key_bytes: &[u8; ID_BYTES] = public.as_bytes();
    let Ok(key) = VerifyingKey::from_bytes(key_bytes) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(data, &sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_round_trip() {
        let kp = KeyPair::generate();
        let sig = kp.sign(b"hello boson");
        assert_eq!(sig.len(), SIGNATURE_BYTES);
        assert!(verify_signature(&kp.public_id(), b"hello boson", &sig));
        assert!(!verify_signature(&kp.public_id(), b"hello bosom", &sig));
    }

    #[test]
    fn test_wrong_key_fails() {
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        let sig = kp.sign(b"data");
        assert!(!verify_signature(&other.public_id(), b"data", &sig));
    }

    #[test]
    fn test_seed_round_trip() {
        let kp = KeyPair::generate();
        let restored = KeyPair::from_seed(&kp.to_seed());
        assert_eq!(kp.public_id(), restored.public_id());
    }

    #[test]
    fn test_encoded_private_key_hex_and_base58() {
        let kp = KeyPair::generate();
        let seed = kp.to_seed();

        let from_hex = KeyPair::from_encoded_private_key(&hex::encode(seed)).unwrap();
        assert_eq!(from_hex.public_id(), kp.public_id());

        let b58 = bs58::encode(seed).into_string();
        let from_b58 = KeyPair::from_encoded_private_key(&b58).unwrap();
        assert_eq!(from_b58.public_id(), kp.public_id());

        assert!(KeyPair::from_encoded_private_key("!!!not-a-key!!!").is_err());
    }

    #[test]
    fn test_malformed_signature_is_false_not_panic() {
        let kp = KeyPair::generate();
        assert!(!verify_signature(&kp.public_id(), b"data", b"short"));
        assert!(!verify_signature(&Id::MAX, b"data", &[0u8; 64]));
    }
}
