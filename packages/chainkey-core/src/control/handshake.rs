//! # Gateway Trust Handshake
//!
//! ```text
//!   Gateway                                        Control plane
//!   ───────                                        ─────────────
//!   payload = {gatewayGuid, timestamp}
//!   sig = Ed25519(payload JSON)
//!        ───────── {gatewayGuid, payload, signature} ─────────►
//!                                                  look up registered key
//!                                                  check guid + clock window
//!                                                  verify signature
//!                                                  K = random 256-bit
//!                                                  registry[guid] = K
//!        ◄──────── sealed_box(gateway X25519 pub, K) ──────────
//!   K = open(sealed)
//!   token = HKDF(K, "chainkey-gateway-token-v1")
//!        ───────── x-gateway-guid / x-gateway-token ──────────►
//! ```
//!
//! Session keys live only in [`SessionRegistry`]; a restart of either side
//! forces a new handshake.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::service::{require_gateway, require_subset, validate_identifier};
use super::KeyService;
use crate::crypto::{seal_for_gateway, verify, GatewayPublicKey, SessionKey, Signature};
use crate::error::{Error, Result};
use crate::storage::GatewayRecord;
use crate::time::{now_timestamp, parse_rfc3339};

// ============================================================================
// SESSION REGISTRY
// ============================================================================

struct Session {
    key: SessionKey,
    established_at: i64,
}

/// In-memory gateway sessions, keyed by gateway GUID.
///
/// Re-authentication replaces the previous session.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, gateway_guid: &str, key: SessionKey) {
        self.sessions.insert(
            gateway_guid.to_string(),
            Session {
                key,
                established_at: now_timestamp(),
            },
        );
    }

    pub fn get(&self, gateway_guid: &str) -> Option<SessionKey> {
        self.sessions.get(gateway_guid).map(|s| s.key.clone())
    }

    pub fn established_at(&self, gateway_guid: &str) -> Option<i64> {
        self.sessions.get(gateway_guid).map(|s| s.established_at)
    }

    pub fn invalidate(&self, gateway_guid: &str) -> bool {
        self.sessions.remove(gateway_guid).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Check a bearer token against the gateway's current session
    pub fn verify_token(&self, gateway_guid: &str, token: &str) -> Result<()> {
        let key = self.get(gateway_guid).ok_or_else(|| {
            Error::Unauthorized(format!("Gateway {} has no session", gateway_guid))
        })?;
        let expected = key.token()?;
        if !constant_time_eq(expected.as_bytes(), token.as_bytes()) {
            return Err(Error::Unauthorized("Invalid gateway token".into()));
        }
        Ok(())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ============================================================================
// HANDSHAKE
// ============================================================================

/// Body of an authentication request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub gateway_guid: String,
    /// Signed object; must carry `gatewayGuid` and an RFC 3339 `timestamp`
    pub payload: serde_json::Value,
    /// Hex Ed25519 signature over the compact JSON of `payload`
    pub signature: String,
}

/// Successful authentication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthGrant {
    pub gateway_guid: String,
    /// Session key sealed to the gateway's encryption key (base64)
    pub encrypted_session_key: String,
}

/// Bytes a gateway signs for a payload object
pub fn signing_bytes(payload: &serde_json::Value) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(payload)?)
}

impl KeyService {
    /// Register a gateway. The public key may be supplied later.
    pub fn register_gateway(
        &self,
        gateway_guid: &str,
        public_key: Option<&str>,
        subset_id: Option<i64>,
        name: Option<&str>,
    ) -> Result<GatewayRecord> {
        validate_identifier("gatewayGuid", gateway_guid)?;
        if let Some(key) = public_key {
            GatewayPublicKey::from_hex(key)?;
        }

        let gateway = self.db().run(|s| {
            if let Some(id) = subset_id {
                require_subset(s, id)?;
            }
            let id = s.insert_gateway(gateway_guid, name, public_key, subset_id)?;
            s.get_gateway(id)?
                .ok_or_else(|| Error::Internal("Gateway vanished after insert".into()))
        })?;

        tracing::info!(gateway = %gateway_guid, subset_id = ?subset_id, "Gateway registered");
        Ok(gateway)
    }

    pub fn list_gateways(&self) -> Result<Vec<GatewayRecord>> {
        self.db().run(|s| s.list_gateways())
    }

    /// Verify a gateway's signed payload and hand it a fresh session key.
    pub fn authenticate(&self, request: &AuthRequest, ip_address: Option<&str>) -> Result<AuthGrant> {
        let guid = request.gateway_guid.as_str();
        let gateway = self.db().run(|s| require_gateway(s, guid))?;

        let public_key = gateway
            .public_key
            .as_deref()
            .ok_or_else(|| Error::Unauthorized(format!("Gateway {} has no public key", guid)))?;
        let public_key = GatewayPublicKey::from_hex(public_key).map_err(|_| {
            tracing::error!(gateway = %guid, "Stored public key is malformed");
            Error::Unauthorized(format!("Gateway {} has an unusable public key", guid))
        })?;

        let signature = Signature::from_hex(&request.signature)?;
        verify(
            &public_key.signing,
            &signing_bytes(&request.payload)?,
            &signature,
        )
        .map_err(|_| {
            tracing::warn!(gateway = %guid, "Gateway signature rejected");
            Error::Unauthorized("Invalid signature".into())
        })?;

        self.check_auth_payload(guid, &request.payload)?;

        let session = SessionKey::generate();
        let sealed = seal_for_gateway(&public_key, session.as_bytes())?;
        self.sessions().insert(guid, session);

        self.db().run(|s| s.mark_gateway_online(gateway.id, ip_address))?;

        tracing::info!(gateway = %guid, ip = ?ip_address, "Gateway authenticated");
        Ok(AuthGrant {
            gateway_guid: guid.to_string(),
            encrypted_session_key: sealed,
        })
    }

    fn check_auth_payload(&self, guid: &str, payload: &serde_json::Value) -> Result<()> {
        let claimed = payload.get("gatewayGuid").and_then(|v| v.as_str());
        if claimed != Some(guid) {
            return Err(Error::Unauthorized(
                "Signed payload names a different gateway".into(),
            ));
        }

        let timestamp = payload
            .get("timestamp")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Unauthorized("Signed payload has no timestamp".into()))?;
        let signed_at = parse_rfc3339("timestamp", timestamp)
            .map_err(|_| Error::Unauthorized("Signed payload timestamp is malformed".into()))?;

        let skew = (now_timestamp() - signed_at.timestamp()).abs();
        if skew > self.config().auth_window_secs {
            tracing::warn!(gateway = %guid, skew, "Authentication payload outside clock window");
            return Err(Error::Unauthorized(
                "Signed payload timestamp outside accepted window".into(),
            ));
        }
        Ok(())
    }

    /// Check gateway credentials for a gateway-facing request.
    ///
    /// `addressed` is the gateway a path names, if any; acting for another
    /// gateway is `Forbidden`. Returns the authenticated GUID.
    pub fn authorize_gateway(
        &self,
        claimed_guid: Option<&str>,
        token: Option<&str>,
        addressed: Option<&str>,
    ) -> Result<String> {
        let (guid, token) = match (claimed_guid, token) {
            (Some(g), Some(t)) if !g.is_empty() && !t.is_empty() => (g, t),
            _ => return Err(Error::Unauthorized("Gateway credentials required".into())),
        };
        self.sessions().verify_token(guid, token)?;

        if let Some(target) = addressed {
            if target != guid {
                return Err(Error::Forbidden(format!(
                    "Gateway {} may not act for {}",
                    guid, target
                )));
            }
        }
        Ok(guid.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================
