//! # Signing Module
//!
//! Ed25519 signatures used by gateways to prove possession of their
//! registered long-term key.
//!
//! ```text
//! gateway                                   server
//! ───────                                   ──────
//! payload = {"gatewayGuid":..,"timestamp":..}
//! sig = Ed25519(sk, json(payload))  ──────► verify(pk_on_file, json(payload), sig)
//!       hex(sig), 128 chars
//! ```

use ed25519_dalek::{Signature as Ed25519Signature, Signer, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::crypto::SigningKeyPair;
use crate::error::{Error, Result};

/// Size of an Ed25519 signature in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// An Ed25519 digital signature
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "signature_bytes")] pub [u8; SIGNATURE_SIZE]);

impl Signature {
    /// Create from a slice (must be exactly 64 bytes)
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != SIGNATURE_SIZE {
            return Err(Error::invalid(
                "signature",
                format!("must be {} bytes, got {}", SIGNATURE_SIZE, slice.len()),
            ));
        }
        let mut bytes = [0u8; SIGNATURE_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Encode as hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Decode from hex string
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| Error::invalid("signature", format!("invalid hex: {}", e)))?;
        Self::from_slice(&bytes)
    }
}

/// Sign a message using Ed25519
///
/// Ed25519 signatures are deterministic: the same key and message always
/// produce the same signature.
pub fn sign(keypair: &SigningKeyPair, message: &[u8]) -> Signature {
    let sig = keypair.signing_key().sign(message);
    Signature(sig.to_bytes())
}

/// Verify an Ed25519 signature
///
/// Returns `CryptoFailure` if the signature does not match.
pub fn verify(public_key: &[u8; 32], message: &[u8], signature: &Signature) -> Result<()> {
    let verifying_key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| Error::CryptoFailure(format!("Invalid public key: {}", e)))?;

    let sig = Ed25519Signature::from_bytes(&signature.0);

    verifying_key
        .verify(message, &sig)
        .map_err(|_| Error::CryptoFailure("Signature verification failed".into()))
}

/// Serde helper for signature bytes
mod signature_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 64], serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<[u8; 64], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("Invalid signature length"))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let keypair = SigningKeyPair::generate();
        let message = br#"{"gatewayGuid":"gw-1","timestamp":"2025-01-01T00:00:00Z"}"#;

        let signature = sign(&keypair, message);
        assert!(verify(&keypair.public_bytes(), message, &signature).is_ok());
    }

    #[test]
    fn test_verify_wrong_message_fails() {
        let keypair = SigningKeyPair::generate();
        let signature = sign(&keypair, b"original");

        let err = verify(&keypair.public_bytes(), b"tampered", &signature).unwrap_err();
        assert!(matches!(err, Error::CryptoFailure(_)));
    }

    #[test]
    fn test_verify_wrong_key_fails() {
        let signer = SigningKeyPair::generate();
        let other = SigningKeyPair::generate();
        let signature = sign(&signer, b"message");

        assert!(verify(&other.public_bytes(), b"message", &signature).is_err());
    }

    #[test]
    fn test_signature_hex() {
        let keypair = SigningKeyPair::generate();
        let signature = sign(&keypair, b"message");

        let hex_sig = signature.to_hex();
        assert_eq!(hex_sig.len(), SIGNATURE_SIZE * 2);
        assert_eq!(Signature::from_hex(&hex_sig).unwrap(), signature);
    }

    #[test]
    fn test_signature_from_bad_hex() {
        assert!(Signature::from_hex("not-hex").is_err());
        assert!(Signature::from_hex("abcd").is_err());
    }
}
