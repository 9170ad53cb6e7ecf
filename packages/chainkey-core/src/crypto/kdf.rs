//! # Key Derivation
//!
//! HKDF-SHA256 and SHA-256 derivations.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          DERIVATIONS                                    │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Gateway seed ──► HKDF(info=SIGNING_KEY)     ──► Ed25519 secret        │
//! │               └─► HKDF(info=ENCRYPTION_KEY)  ──► X25519 secret         │
//! │                                                                         │
//! │  X25519 DH ──► HKDF(salt=eph_pub‖rcpt_pub, info=SESSION_TRANSPORT)     │
//! │                                          ──► AES key for sealed box    │
//! │                                                                         │
//! │  session key ──► HKDF(info=GATEWAY_TOKEN) ──► hex bearer token         │
//! │                                                                         │
//! │  (guid_lo, guid_hi, secret_lo, secret_hi)                              │
//! │        ──► HKDF(salt=nonce, info=PAIRWISE_KEY) ──► pairwise key (hex)  │
//! │                                                                         │
//! │  SHA-256(old_key_hex ‖ refresh_nonce)     ──► refreshed key (hex)      │
//! │  SHA-256(key_hex)                         ──► keyHash fingerprint      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Pairwise and refresh derivations run on devices. The server only ever
//! stores the fingerprint; they live here so both ends share one definition.

use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::encryption::EncryptionKey;
use crate::error::{Error, Result};

/// Domain separation strings for HKDF
pub mod domain {
    /// Gateway signing key derivation
    pub const SIGNING_KEY: &[u8] = b"chainkey-signing-key-v1";

    /// Gateway encryption key derivation
    pub const ENCRYPTION_KEY: &[u8] = b"chainkey-encryption-key-v1";

    /// Sealed session-key transport
    pub const SESSION_TRANSPORT: &[u8] = b"chainkey-session-transport-v1";

    /// Bearer token presented by an authenticated gateway
    pub const GATEWAY_TOKEN: &[u8] = b"chainkey-gateway-token-v1";

    /// Device pairwise key establishment
    pub const PAIRWISE_KEY: &[u8] = b"chainkey-pairwise-key-v1";
}

/// Keys derived from a gateway seed
#[derive(ZeroizeOnDrop)]
pub struct DerivedKeys {
    pub signing_key: [u8; 32],
    pub encryption_key: [u8; 32],
}

/// Derive signing and encryption keys from a 32-byte seed
pub fn derive_keys_from_seed(seed: &[u8; 32]) -> Result<DerivedKeys> {
    let hkdf = Hkdf::<Sha256>::new(None, seed);

    let mut signing_key = [0u8; 32];
    hkdf.expand(domain::SIGNING_KEY, &mut signing_key)
        .map_err(|_| Error::CryptoFailure("Failed to derive signing key".into()))?;

    let mut encryption_key = [0u8; 32];
    hkdf.expand(domain::ENCRYPTION_KEY, &mut encryption_key)
        .map_err(|_| Error::CryptoFailure("Failed to derive encryption key".into()))?;

    Ok(DerivedKeys {
        signing_key,
        encryption_key,
    })
}

/// Derive the AES key for a sealed session-key box.
///
/// Both public keys go into the salt so a box cannot be re-targeted.
pub fn derive_transport_key(
    dh_output: &[u8; 32],
    ephemeral_public: &[u8; 32],
    recipient_public: &[u8; 32],
) -> Result<EncryptionKey> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral_public);
    salt[32..].copy_from_slice(recipient_public);

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), dh_output);
    let mut key = [0u8; 32];
    hkdf.expand(domain::SESSION_TRANSPORT, &mut key)
        .map_err(|_| Error::CryptoFailure("Failed to derive transport key".into()))?;

    Ok(EncryptionKey::from_bytes(key))
}

/// Derive the hex bearer token a gateway presents with its session.
pub fn derive_session_token(session_key: &[u8; 32]) -> Result<String> {
    let hkdf = Hkdf::<Sha256>::new(None, session_key);
    let mut token = [0u8; 32];
    hkdf.expand(domain::GATEWAY_TOKEN, &mut token)
        .map_err(|_| Error::CryptoFailure("Failed to derive session token".into()))?;

    let encoded = hex::encode(token);
    token.zeroize();
    Ok(encoded)
}

/// Derive the pairwise key two devices share.
///
/// Both GUIDs and both secrets are ordered independently so that either
/// device computes the same key regardless of which side it is.
pub fn derive_pairwise_key(
    (guid_a, secret_a): (&str, &str),
    (guid_b, secret_b): (&str, &str),
    nonce: &str,
) -> Result<String> {
    let (guid_lo, guid_hi) = if guid_a <= guid_b {
        (guid_a, guid_b)
    } else {
        (guid_b, guid_a)
    };
    let (secret_lo, secret_hi) = if secret_a <= secret_b {
        (secret_a, secret_b)
    } else {
        (secret_b, secret_a)
    };

    let mut ikm = Vec::with_capacity(
        guid_lo.len() + guid_hi.len() + secret_lo.len() + secret_hi.len(),
    );
    ikm.extend_from_slice(guid_lo.as_bytes());
    ikm.extend_from_slice(guid_hi.as_bytes());
    ikm.extend_from_slice(secret_lo.as_bytes());
    ikm.extend_from_slice(secret_hi.as_bytes());

    let hkdf = Hkdf::<Sha256>::new(Some(nonce.as_bytes()), &ikm);
    let mut key = [0u8; 32];
    let expanded = hkdf.expand(domain::PAIRWISE_KEY, &mut key);
    ikm.zeroize();
    expanded.map_err(|_| Error::CryptoFailure("Failed to derive pairwise key".into()))?;

    let encoded = hex::encode(key);
    key.zeroize();
    Ok(encoded)
}

/// Apply a refresh nonce to an existing key: `hex(SHA-256(old_key_hex ‖ nonce))`.
pub fn derive_refreshed_key(old_key_hex: &str, refresh_nonce: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(old_key_hex.as_bytes());
    hasher.update(refresh_nonce.as_bytes());
    hex::encode(hasher.finalize())
}

/// One-way fingerprint of a key. This is the `keyHash` the server stores.
pub fn key_fingerprint(key_hex: &str) -> String {
    hex::encode(Sha256::digest(key_hex.as_bytes()))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_keys_deterministic() {
        let seed = [42u8; 32];
        let a = derive_keys_from_seed(&seed).unwrap();
        let b = derive_keys_from_seed(&seed).unwrap();
        assert_eq!(a.signing_key, b.signing_key);
        assert_eq!(a.encryption_key, b.encryption_key);
        assert_ne!(a.signing_key, a.encryption_key);
    }

    #[test]
    fn test_pairwise_key_is_symmetric() {
        let a = ("zone-1.01", "aa11");
        let b = ("zone-1.02", "bb22");
        let ab = derive_pairwise_key(a, b, "nonce-1").unwrap();
        let ba = derive_pairwise_key(b, a, "nonce-1").unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.len(), 64);
    }

    #[test]
    fn test_pairwise_key_depends_on_nonce() {
        let a = ("zone-1.01", "aa11");
        let b = ("zone-1.02", "bb22");
        assert_ne!(
            derive_pairwise_key(a, b, "n1").unwrap(),
            derive_pairwise_key(a, b, "n2").unwrap()
        );
    }

    #[test]
    fn test_refresh_converges_on_both_ends() {
        let shared = derive_pairwise_key(("x.1", "s1"), ("x.2", "s2"), "n").unwrap();
        let on_a = derive_refreshed_key(&shared, "refresh-nonce");
        let on_b = derive_refreshed_key(&shared, "refresh-nonce");
        assert_eq!(on_a, on_b);
        assert_ne!(on_a, shared);
    }

    #[test]
    fn test_refresh_known_vector() {
        // sha256("abc")
        assert_eq!(
            derive_refreshed_key("a", "bc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_fingerprint_hides_key() {
        let key = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";
        let fp = key_fingerprint(key);
        assert_eq!(fp.len(), 64);
        assert_ne!(fp, key);
        assert_eq!(fp, key_fingerprint(key));
    }

    #[test]
    fn test_session_token_deterministic_per_key() {
        let t1 = derive_session_token(&[1u8; 32]).unwrap();
        let t2 = derive_session_token(&[1u8; 32]).unwrap();
        let t3 = derive_session_token(&[2u8; 32]).unwrap();
        assert_eq!(t1, t2);
        assert_ne!(t1, t3);
    }
}
