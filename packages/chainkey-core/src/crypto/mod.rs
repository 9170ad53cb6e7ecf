//! # Cryptography Module
//!
//! All cryptographic primitives used by chainkey.
//!
//! ## Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    CRYPTOGRAPHIC ARCHITECTURE                           │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  AT REST  (server master key, AES-256-GCM)                      │   │
//! │  │                                                                 │   │
//! │  │  device initial secret ──► seal ──► "iv:tag:ciphertext" (hex)  │   │
//! │  │  task payload JSON     ──► seal ──► "iv:tag:ciphertext" (hex)  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  GATEWAY TRUST                                                  │   │
//! │  │                                                                 │   │
//! │  │  Gateway long-term key = Ed25519 (sign) + X25519 (receive)     │   │
//! │  │                                                                 │   │
//! │  │  gateway ── sign({gatewayGuid,timestamp}) ──► server           │   │
//! │  │  server  ── seal_for_gateway(session key) ──► gateway          │   │
//! │  │            (ephemeral X25519 + HKDF + AES-256-GCM, base64)      │   │
//! │  │                                                                 │   │
//! │  │  session key ──► HKDF ──► bearer token for gateway endpoints   │   │
//! │  │  session key ──► seal ──► task payloads in transit             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  DEVICE KEYS  (computed on devices, never sent)                 │   │
//! │  │                                                                 │   │
//! │  │  pairwise  = HKDF(sorted guids ‖ sorted secrets, salt=nonce)   │   │
//! │  │  refreshed = SHA-256(old_key_hex ‖ refresh_nonce)              │   │
//! │  │  keyHash   = SHA-256(key)   ◄── the only form the server sees  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! | Algorithm | Purpose |
//! |-----------|---------|
//! | AES-256-GCM | Envelope for secrets, payloads, session-key transport |
//! | Ed25519 | Gateway authentication |
//! | X25519 | Session-key transport to gateways |
//! | HKDF-SHA256 | Transport keys, session tokens, pairwise keys |
//! | SHA-256 | Key refresh, key fingerprints |

mod encryption;
mod kdf;
mod keys;
mod random;
mod signing;
mod transport;

pub use encryption::{
    decrypt, encrypt, open, open_str, seal, seal_str, EncryptionKey, Nonce, KEY_SIZE, NONCE_SIZE,
    TAG_SIZE,
};
pub use kdf::{
    derive_keys_from_seed, derive_pairwise_key, derive_refreshed_key, derive_session_token,
    derive_transport_key, key_fingerprint, DerivedKeys,
};
pub use keys::{EncryptionKeyPair, GatewayKeyPair, GatewayPublicKey, SigningKeyPair};
pub use random::{generate_device_secret, generate_refresh_nonce, random_bytes};
pub use signing::{sign, verify, Signature, SIGNATURE_SIZE};
pub use transport::{open_from_server, seal_for_gateway, SessionKey, SESSION_KEY_SIZE};
