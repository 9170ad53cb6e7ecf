//! # Encryption Module
//!
//! AES-256-GCM encryption and the hex envelope used for every sealed value
//! the server stores or sends.
//!
//! ## Envelope Format
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SEALED ENVELOPE                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   seal(key, plaintext)                                                 │
//! │                                                                         │
//! │   1. iv   = 12 random bytes (CSPRNG, never reused with a key)          │
//! │   2. ct‖tag = AES-256-GCM(key, iv, plaintext)                          │
//! │   3. split the trailing 16-byte tag from the ciphertext                │
//! │                                                                         │
//! │   Output:   hex(iv) ":" hex(tag) ":" hex(ciphertext)                   │
//! │             └ 24 ch ┘   └ 32 ch ┘   └ 2 × len(plaintext) ┘             │
//! │                                                                         │
//! │   open(key, envelope)                                                  │
//! │                                                                         │
//! │   - exactly three ':'-separated parts, all valid hex                   │
//! │   - iv is 12 bytes, tag is 16 bytes                                    │
//! │   - tag must verify, otherwise CryptoFailure (no partial plaintext)    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The same envelope is used with the server master key (at rest) and with a
//! gateway session key (task payloads in transit).

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce as AesNonce,
};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// Size of the AES-GCM nonce in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Size of the AES-GCM authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Size of the encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// A nonce (number used once) for AES-GCM encryption
///
/// Random 96-bit nonces are safe for up to 2^32 messages per key.
#[derive(Clone, Copy, Debug)]
pub struct Nonce(pub [u8; NONCE_SIZE]);

impl Nonce {
    /// Generate a cryptographically random nonce
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

/// An AES-256-GCM encryption key
///
/// Zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse a key from 64 hex characters.
    ///
    /// This is how the server master key is configured.
    pub fn from_hex(field: &str, hex_str: &str) -> Result<Self> {
        let trimmed = hex_str.trim();
        if trimmed.len() != KEY_SIZE * 2 {
            return Err(Error::invalid(
                field,
                format!("must be {} hex characters, got {}", KEY_SIZE * 2, trimmed.len()),
            ));
        }
        let mut bytes = hex::decode(trimmed)
            .map_err(|e| Error::invalid(field, format!("invalid hex: {}", e)))?;
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(Self(key))
    }

    /// Get the raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Encrypt with AES-256-GCM
///
/// Returns `(nonce, ciphertext_with_tag)`.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8], aad: &[u8]) -> Result<(Nonce, Vec<u8>)> {
    let nonce = Nonce::random();
    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|e| Error::CryptoFailure(format!("Invalid key: {}", e)))?;

    let payload = Payload {
        msg: plaintext,
        aad,
    };

    let ciphertext = cipher
        .encrypt(AesNonce::from_slice(&nonce.0), payload)
        .map_err(|e| Error::CryptoFailure(format!("Encryption failed: {}", e)))?;

    Ok((nonce, ciphertext))
}

/// Decrypt with AES-256-GCM
///
/// ## Errors
///
/// Returns `CryptoFailure` if the ciphertext, AAD, key or nonce do not match.
pub fn decrypt(
    key: &EncryptionKey,
    nonce: &Nonce,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|e| Error::CryptoFailure(format!("Invalid key: {}", e)))?;

    let payload = Payload {
        msg: ciphertext,
        aad,
    };

    cipher
        .decrypt(AesNonce::from_slice(&nonce.0), payload)
        .map_err(|_| Error::CryptoFailure("Decryption failed: authentication tag mismatch".into()))
}

// ============================================================================
// ENVELOPE
// ============================================================================

/// Seal bytes into an `iv:tag:ciphertext` hex envelope.
pub fn seal(key: &EncryptionKey, plaintext: &[u8]) -> Result<String> {
    let (nonce, sealed) = encrypt(key, plaintext, &[])?;
    let split = sealed.len() - TAG_SIZE;
    let (ciphertext, tag) = sealed.split_at(split);

    Ok(format!(
        "{}:{}:{}",
        hex::encode(nonce.0),
        hex::encode(tag),
        hex::encode(ciphertext)
    ))
}

/// Open an `iv:tag:ciphertext` hex envelope.
pub fn open(key: &EncryptionKey, envelope: &str) -> Result<Vec<u8>> {
    let parts: Vec<&str> = envelope.split(':').collect();
    if parts.len() != 3 {
        return Err(Error::CryptoFailure(format!(
            "Envelope must have 3 parts, got {}",
            parts.len()
        )));
    }

    let iv = decode_part("iv", parts[0], Some(NONCE_SIZE))?;
    let tag = decode_part("tag", parts[1], Some(TAG_SIZE))?;
    let mut sealed = decode_part("ciphertext", parts[2], None)?;
    sealed.extend_from_slice(&tag);

    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&iv);

    decrypt(key, &Nonce(nonce), &sealed, &[])
}

/// Seal a UTF-8 string.
pub fn seal_str(key: &EncryptionKey, plaintext: &str) -> Result<String> {
    seal(key, plaintext.as_bytes())
}

/// Open an envelope that is expected to hold UTF-8 text.
pub fn open_str(key: &EncryptionKey, envelope: &str) -> Result<String> {
    let bytes = open(key, envelope)?;
    String::from_utf8(bytes)
        .map_err(|_| Error::CryptoFailure("Envelope plaintext is not valid UTF-8".into()))
}

fn decode_part(name: &str, part: &str, expected_len: Option<usize>) -> Result<Vec<u8>> {
    let bytes = hex::decode(part)
        .map_err(|e| Error::CryptoFailure(format!("Envelope {} is not hex: {}", name, e)))?;
    if let Some(len) = expected_len {
        if bytes.len() != len {
            return Err(Error::CryptoFailure(format!(
                "Envelope {} must be {} bytes, got {}",
                name,
                len,
                bytes.len()
            )));
        }
    }
    Ok(bytes)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> EncryptionKey {
        EncryptionKey::from_bytes([7u8; KEY_SIZE])
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = test_key();
        let envelope = seal_str(&key, "a1b2c3d4e5f60718293a4b5c6d7e8f90").unwrap();
        assert_eq!(
            open_str(&key, &envelope).unwrap(),
            "a1b2c3d4e5f60718293a4b5c6d7e8f90"
        );
    }

    #[test]
    fn test_envelope_shape() {
        let envelope = seal_str(&test_key(), "hello").unwrap();
        let parts: Vec<&str> = envelope.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), NONCE_SIZE * 2);
        assert_eq!(parts[1].len(), TAG_SIZE * 2);
        assert_eq!(parts[2].len(), "hello".len() * 2);
    }

    #[test]
    fn test_seal_is_randomized() {
        let key = test_key();
        let a = seal_str(&key, "same").unwrap();
        let b = seal_str(&key, "same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_corrupted_tag_fails() {
        let key = test_key();
        let envelope = seal_str(&key, "secret material").unwrap();
        let mut parts: Vec<String> = envelope.split(':').map(String::from).collect();
        let flipped = if parts[1].starts_with('0') { "1" } else { "0" };
        parts[1].replace_range(0..1, flipped);
        let tampered = parts.join(":");

        let err = open(&key, &tampered).unwrap_err();
        assert!(matches!(err, Error::CryptoFailure(_)));
    }

    #[test]
    fn test_corrupted_ciphertext_fails() {
        let key = test_key();
        let envelope = seal_str(&key, "secret material").unwrap();
        let mut parts: Vec<String> = envelope.split(':').map(String::from).collect();
        let flipped = if parts[2].starts_with('0') { "1" } else { "0" };
        parts[2].replace_range(0..1, flipped);
        assert!(open(&key, &parts.join(":")).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let envelope = seal_str(&test_key(), "secret").unwrap();
        let other = EncryptionKey::from_bytes([8u8; KEY_SIZE]);
        assert!(open(&other, &envelope).is_err());
    }

    #[test]
    fn test_malformed_envelopes_rejected() {
        let key = test_key();
        assert!(open(&key, "").is_err());
        assert!(open(&key, "abcd:ef").is_err());
        assert!(open(&key, "zz:zz:zz").is_err());
        // IV of the wrong length
        let short_iv = format!("{}:{}:{}", "00".repeat(8), "00".repeat(16), "00");
        assert!(open(&key, &short_iv).is_err());
    }

    #[test]
    fn test_empty_plaintext() {
        let key = test_key();
        let envelope = seal(&key, b"").unwrap();
        assert!(envelope.ends_with(':'));
        assert!(open(&key, &envelope).unwrap().is_empty());
    }

    #[test]
    fn test_key_from_hex() {
        let hex_key = "11".repeat(32);
        let key = EncryptionKey::from_hex("masterKey", &hex_key).unwrap();
        assert_eq!(key.as_bytes(), &[0x11u8; 32]);

        assert!(EncryptionKey::from_hex("masterKey", "abcd").is_err());
        assert!(EncryptionKey::from_hex("masterKey", &"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_key_debug_is_redacted() {
        let rendered = format!("{:?}", test_key());
        assert!(!rendered.contains("07"));
    }
}
