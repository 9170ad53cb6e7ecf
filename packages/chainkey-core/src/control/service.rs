//! # Key Service
//!
//! Core service struct shared by every control-plane operation.

use crate::crypto::{open_str, seal_str, EncryptionKey};
use crate::error::{Error, Result};
use crate::model::GatewayStatus;
use crate::storage::{Database, DeviceRecord, GatewayRecord, Store, SubsetRecord};
use crate::wire::TaskPayload;

use super::handshake::SessionRegistry;

/// Tunables for the control plane
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Longest chain walk when checking a new link for cycles
    pub max_chain_hops: usize,
    /// Accepted clock skew for gateway authentication payloads, in seconds
    pub auth_window_secs: i64,
    /// Upper bound on rows returned by task listings
    pub task_list_limit: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_chain_hops: 1024,
            auth_window_secs: 300,
            task_list_limit: 500,
        }
    }
}

/// The key-management service.
///
/// Owns the database handle, the master key that seals secrets and task
/// payloads at rest, and the in-memory gateway session registry.
pub struct KeyService {
    db: Database,
    master_key: EncryptionKey,
    sessions: SessionRegistry,
    config: ServiceConfig,
}

impl KeyService {
    /// Create a new service backed by the given database.
    pub fn new(db: Database, master_key: EncryptionKey, config: ServiceConfig) -> Self {
        Self {
            db,
            master_key,
            sessions: SessionRegistry::new(),
            config,
        }
    }

    pub(crate) fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Live gateway sessions
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    // ── Envelope helpers ──────────────────────────────────────────────────

    pub(crate) fn seal_secret(&self, secret: &str) -> Result<String> {
        seal_str(&self.master_key, secret)
    }

    pub(crate) fn open_secret(&self, device: &DeviceRecord) -> Result<String> {
        open_str(&self.master_key, &device.initial_secret_enc).map_err(|e| {
            tracing::error!(device_guid = %device.device_guid, "Initial secret unreadable");
            e
        })
    }

    pub(crate) fn seal_payload(&self, payload: &TaskPayload) -> Result<String> {
        let json = serde_json::to_string(payload)?;
        seal_str(&self.master_key, &json)
    }

    pub(crate) fn open_payload(&self, sealed: &str) -> Result<TaskPayload> {
        let json = open_str(&self.master_key, sealed)?;
        Ok(serde_json::from_str(&json)?)
    }
}

// ── Lookup helpers shared by the operation modules ────────────────────────────

pub(crate) fn require_subset(store: &Store<'_>, id: i64) -> Result<SubsetRecord> {
    store
        .get_subset(id)?
        .ok_or_else(|| Error::NotFound(format!("Subset {} not found", id)))
}

pub(crate) fn require_device(store: &Store<'_>, guid: &str) -> Result<DeviceRecord> {
    store
        .get_device_by_guid(guid)?
        .ok_or_else(|| Error::NotFound(format!("Device {} not found", guid)))
}

pub(crate) fn require_device_id(store: &Store<'_>, id: i64) -> Result<DeviceRecord> {
    store
        .get_device(id)?
        .ok_or_else(|| Error::NotFound(format!("Device {} not found", id)))
}

pub(crate) fn require_gateway(store: &Store<'_>, guid: &str) -> Result<GatewayRecord> {
    store
        .get_gateway_by_guid(guid)?
        .ok_or_else(|| Error::NotFound(format!("Gateway {} not found", guid)))
}

/// Online gateway that should carry work for a subset.
///
/// `Unreachable` when the subset has no gateway, or none of its gateways
/// is online.
pub(crate) fn serving_gateway(store: &Store<'_>, subset: &SubsetRecord) -> Result<GatewayRecord> {
    store
        .gateways_for_subset(subset.id)?
        .into_iter()
        .find(|g| g.status == GatewayStatus::Online)
        .ok_or_else(|| {
            Error::Unreachable(format!("No online gateway serves subset {}", subset.identifier))
        })
}

/// Identifiers end up in device GUIDs and topic names
pub(crate) fn validate_identifier(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::invalid(field, "must not be empty"));
    }
    if value.len() > 64 {
        return Err(Error::invalid(field, "must be at most 64 characters"));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
    {
        return Err(Error::invalid(
            field,
            "may only contain letters, digits, '-', '_', '.' and '@'",
        ));
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================


#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::RevocationNotice;

    #[test]
    fn test_payload_sealed_at_rest() {
        let svc = test_support::service();
        let payload = TaskPayload::Revocation(RevocationNotice {
            revoked_device_guid: "zone-1.01".into(),
            revoked_subset_identifier: "zone-1".into(),
        });

        let sealed = svc.seal_payload(&payload).unwrap();
        assert!(!sealed.contains("zone-1.01"));
        assert_eq!(sealed.split(':').count(), 3);
        assert_eq!(svc.open_payload(&sealed).unwrap(), payload);
    }

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("identifier", "zone-1").is_ok());
        assert!(validate_identifier("identifier", "device@05").is_ok());
        assert!(validate_identifier("identifier", "").is_err());
        assert!(validate_identifier("identifier", "a/b").is_err());
        assert!(validate_identifier("identifier", "zone+").is_err());
    }
}
