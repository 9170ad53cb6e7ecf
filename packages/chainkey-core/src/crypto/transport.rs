//! # Session-Key Transport
//!
//! Delivers a fresh session key to a gateway so that only the holder of the
//! gateway's registered X25519 key can read it.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  seal_for_gateway(gateway_public, session_key)                         │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  1. eph = fresh X25519 keypair (used once)                             │
//! │  2. dh  = eph.secret × gateway.encryption_public                       │
//! │  3. k   = HKDF(dh, salt = eph.public ‖ gateway.public)                 │
//! │  4. ct  = AES-256-GCM(k, iv, session_key, aad = eph.public)            │
//! │                                                                         │
//! │  Output: base64( eph.public[32] ‖ iv[12] ‖ ct‖tag )                    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use base64::Engine as _;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::encryption::{decrypt, encrypt, EncryptionKey, Nonce, NONCE_SIZE, TAG_SIZE};
use super::kdf::{derive_session_token, derive_transport_key};
use super::keys::{EncryptionKeyPair, GatewayPublicKey};
use super::random::random_bytes;
use crate::error::{Error, Result};

/// Size of a gateway session key in bytes (256 bits)
pub const SESSION_KEY_SIZE: usize = 32;

/// Ephemeral symmetric key shared by the server and one gateway.
///
/// Held only in memory on both sides.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_SIZE]);

impl SessionKey {
    /// Generate a fresh random session key
    pub fn generate() -> Self {
        Self(random_bytes::<SESSION_KEY_SIZE>())
    }

    /// Create from a slice (must be exactly 32 bytes)
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SESSION_KEY_SIZE {
            return Err(Error::CryptoFailure(format!(
                "Session key must be {} bytes, got {}",
                SESSION_KEY_SIZE,
                bytes.len()
            )));
        }
        let mut key = [0u8; SESSION_KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.0
    }

    /// The AES key used to seal task payloads in transit
    pub fn envelope_key(&self) -> EncryptionKey {
        EncryptionKey::from_bytes(self.0)
    }

    /// The bearer token a gateway presents with this session
    pub fn token(&self) -> Result<String> {
        derive_session_token(&self.0)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Seal bytes so only the gateway holding `recipient`'s secret can open them.
pub fn seal_for_gateway(recipient: &GatewayPublicKey, plaintext: &[u8]) -> Result<String> {
    let ephemeral = EncryptionKeyPair::generate();
    let ephemeral_public = ephemeral.public_bytes();
    let mut shared = ephemeral.diffie_hellman(&recipient.encryption);

    let key = derive_transport_key(&shared, &ephemeral_public, &recipient.encryption);
    shared.zeroize();
    let (nonce, ciphertext) = encrypt(&key?, plaintext, &ephemeral_public)?;

    let mut out = Vec::with_capacity(32 + NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&ephemeral_public);
    out.extend_from_slice(nonce.as_bytes());
    out.extend_from_slice(&ciphertext);

    Ok(base64::engine::general_purpose::STANDARD.encode(out))
}

/// Open a box produced by [`seal_for_gateway`] with the gateway's X25519 key.
pub fn open_from_server(recipient: &EncryptionKeyPair, sealed_b64: &str) -> Result<Vec<u8>> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(sealed_b64.trim())
        .map_err(|e| Error::CryptoFailure(format!("Sealed box is not base64: {}", e)))?;

    if bytes.len() < 32 + NONCE_SIZE + TAG_SIZE {
        return Err(Error::CryptoFailure("Sealed box is too short".into()));
    }

    let mut ephemeral_public = [0u8; 32];
    ephemeral_public.copy_from_slice(&bytes[..32]);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&bytes[32..32 + NONCE_SIZE]);
    let ciphertext = &bytes[32 + NONCE_SIZE..];

    let mut shared = recipient.diffie_hellman(&ephemeral_public);
    let key = derive_transport_key(&shared, &ephemeral_public, &recipient.public_bytes());
    shared.zeroize();

    decrypt(&key?, &Nonce(nonce), ciphertext, &ephemeral_public)
}
