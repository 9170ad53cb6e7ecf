//! # Gateway Key Material
//!
//! A gateway's long-term identity is a pair of keys derived from one seed:
//!
//! ```text
//! Seed (32 bytes, kept in the gateway's secure storage)
//!       │
//!       ├──► HKDF("chainkey-signing-key-v1")    → Ed25519  (authenticate)
//!       │
//!       └──► HKDF("chainkey-encryption-key-v1") → X25519   (receive session key)
//!
//! Public half registered with the server out of band:
//!   hex(ed25519_public) ‖ hex(x25519_public)   = 128 hex characters
//! ```

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::error::{Error, Result};

/// Combined gateway keypair
#[derive(ZeroizeOnDrop)]
pub struct GatewayKeyPair {
    /// Ed25519 keypair for signing
    pub signing: SigningKeyPair,
    /// X25519 keypair for receiving sealed session keys
    pub encryption: EncryptionKeyPair,
}

impl GatewayKeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        Self {
            signing: SigningKeyPair::generate(),
            encryption: EncryptionKeyPair::generate(),
        }
    }

    /// Create a keypair from a 32-byte seed. Deterministic.
    pub fn from_seed(seed: &[u8; 32]) -> Result<Self> {
        use crate::crypto::kdf::derive_keys_from_seed;

        let derived = derive_keys_from_seed(seed)?;

        Ok(Self {
            signing: SigningKeyPair::from_bytes(&derived.signing_key),
            encryption: EncryptionKeyPair::from_bytes(&derived.encryption_key),
        })
    }

    /// Get the public keys for registration with the server
    pub fn public_key(&self) -> GatewayPublicKey {
        GatewayPublicKey {
            signing: self.signing.public_bytes(),
            encryption: self.encryption.public_bytes(),
        }
    }
}

/// Ed25519 signing keypair
#[derive(ZeroizeOnDrop)]
pub struct SigningKeyPair {
    #[zeroize(skip)] // ed25519_dalek::SigningKey handles its own zeroization
    secret: SigningKey,
}

impl SigningKeyPair {
    /// Generate a new random signing keypair
    pub fn generate() -> Self {
        Self {
            secret: SigningKey::generate(&mut OsRng),
        }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            secret: SigningKey::from_bytes(bytes),
        }
    }

    /// Get the public key bytes
    pub fn public_bytes(&self) -> [u8; 32] {
        self.secret.verifying_key().to_bytes()
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.secret
    }
}

/// X25519 encryption keypair
#[derive(ZeroizeOnDrop)]
pub struct EncryptionKeyPair {
    #[zeroize(skip)] // x25519_dalek handles its own zeroization
    secret: StaticSecret,
    #[zeroize(skip)]
    public: X25519PublicKey,
}

impl EncryptionKeyPair {
    /// Generate a new random encryption keypair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        let secret = StaticSecret::from(*bytes);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Get the public key bytes
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Perform Diffie-Hellman key exchange
    pub fn diffie_hellman(&self, their_public: &[u8; 32]) -> [u8; 32] {
        let their_public = X25519PublicKey::from(*their_public);
        self.secret.diffie_hellman(&their_public).to_bytes()
    }
}

/// The public half of a gateway's key, as registered with the server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatewayPublicKey {
    /// Ed25519 public key for signature verification
    #[serde(with = "hex_bytes")]
    pub signing: [u8; 32],

    /// X25519 public key for session-key transport
    #[serde(with = "hex_bytes")]
    pub encryption: [u8; 32],
}

impl GatewayPublicKey {
    /// Get the verifying key for signature verification
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_bytes(&self.signing)
            .map_err(|e| Error::invalid("publicKey", format!("invalid signing key: {}", e)))
    }

    /// Encode as 128 hex characters
    pub fn to_hex(&self) -> String {
        format!("{}{}", hex::encode(self.signing), hex::encode(self.encryption))
    }

    /// Decode from 128 hex characters
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let hex_str = hex_str.trim();
        if hex_str.len() != 128 {
            return Err(Error::invalid(
                "publicKey",
                "must be 128 hex characters (signing ‖ encryption)",
            ));
        }

        let bytes = hex::decode(hex_str)
            .map_err(|e| Error::invalid("publicKey", format!("invalid hex: {}", e)))?;

        let signing: [u8; 32] = bytes[0..32]
            .try_into()
            .map_err(|_| Error::invalid("publicKey", "invalid signing key length"))?;

        let encryption: [u8; 32] = bytes[32..64]
            .try_into()
            .map_err(|_| Error::invalid("publicKey", "invalid encryption key length"))?;

        let key = Self { signing, encryption };
        key.verifying_key()?;
        Ok(key)
    }
}

/// Serde helper for serializing byte arrays as hex
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("Invalid length"))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_from_seed_is_deterministic() {
        let seed = [42u8; 32];
        let a = GatewayKeyPair::from_seed(&seed).unwrap();
        let b = GatewayKeyPair::from_seed(&seed).unwrap();
        assert_eq!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_different_seeds_different_keys() {
        let a = GatewayKeyPair::from_seed(&[1u8; 32]).unwrap();
        let b = GatewayKeyPair::from_seed(&[2u8; 32]).unwrap();
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_diffie_hellman() {
        let alice = EncryptionKeyPair::generate();
        let bob = EncryptionKeyPair::generate();

        assert_eq!(
            alice.diffie_hellman(&bob.public_bytes()),
            bob.diffie_hellman(&alice.public_bytes())
        );
    }

    #[test]
    fn test_public_key_hex() {
        let keypair = GatewayKeyPair::generate();
        let public = keypair.public_key();

        let hex_str = public.to_hex();
        assert_eq!(hex_str.len(), 128);
        assert_eq!(GatewayPublicKey::from_hex(&hex_str).unwrap(), public);
    }

    #[test]
    fn test_public_key_hex_rejects_bad_input() {
        assert!(GatewayPublicKey::from_hex("abc").is_err());
        assert!(GatewayPublicKey::from_hex(&"g".repeat(128)).is_err());
    }
}
