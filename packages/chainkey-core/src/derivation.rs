//! # Key Derivation Engine
//!
//! Pure functions that turn topology into key material. Nothing here touches
//! storage; the control plane feeds it decrypted secrets and seals its output.
//!
//! ## Provisioning vectors
//!
//! ```text
//!   previous subset          subset S                 next subset
//!  ┌───────────────┐   ┌──────────────────────┐   ┌───────────────┐
//!  │ p01  p02  ... │◄──│ c01  c02 (D)  c03 ...│──►│ n01  n02  ... │
//!  └───────┬───────┘   └──────────┬───────────┘   └───────┬───────┘
//!          ▼                      ▼                       ▼
//!          Vp                     Vc                      Vn
//!   secrets ordered by local identifier ascending, empty when unlinked
//! ```
//!
//! D shares overlapping material with every neighbour in S and in the two
//! adjacent subsets, so each pair derives the same key without sending it.
//!
//! ## Rotation fan-out
//!
//! ```text
//!                       refreshNonce r
//!                 ┌──────────┼──────────┐
//!                 ▼          ▼          ▼
//!          A: REFRESH_ALL  B: SPECIFIC  C: SPECIFIC
//!                          (peer = A)   (peer = A)
//!
//!    every party:  K' = SHA-256(K ‖ r)
//! ```

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::crypto::{derive_pairwise_key, derive_refreshed_key, key_fingerprint};
use crate::error::{Error, Result};
use crate::model::RefreshInstruction;
use crate::storage::DeviceRecord;
use crate::wire::{ProvisioningRecord, RefreshOrder};

// ============================================================================
// ORDERING
// ============================================================================

/// Order two local identifiers.
///
/// Numeric identifiers compare as numbers ("2" < "10"); anything else falls
/// back to byte order. Equal numbers with different padding ("01" vs "1")
/// are tie-broken by text so the order stays total.
pub fn compare_local_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

/// Sort devices by local identifier ascending
pub fn sort_by_local_id(devices: &mut [DeviceRecord]) {
    devices.sort_by(|a, b| compare_local_ids(&a.local_identifier, &b.local_identifier));
}

/// Deterministic device GUID for a local identifier within a subset
pub fn device_guid(subset_identifier: &str, local_identifier: &str) -> String {
    format!("{}.{}", subset_identifier, local_identifier)
}

// ============================================================================
// PROVISIONING
// ============================================================================

/// Secrets of one subset, already ordered by local identifier
#[derive(Debug, Clone, Default)]
pub struct SubsetVector {
    pub identifier: String,
    pub secrets: Vec<String>,
}

/// Assemble the provisioning record for one device.
///
/// `vc` must contain the device's own secret; a record whose device is not
/// part of its own vector would leave it unable to derive any key.
pub fn build_provisioning_record(
    device: &DeviceRecord,
    secret: String,
    vc: SubsetVector,
    vp: Option<SubsetVector>,
    vn: Option<SubsetVector>,
) -> Result<ProvisioningRecord> {
    if !vc.secrets.iter().any(|s| *s == secret) {
        return Err(Error::Internal(format!(
            "Device {} is missing from its own subset vector",
            device.device_guid
        )));
    }

    let (previous_subset_identifier, vp) = split_vector(vp);
    let (next_subset_identifier, vn) = split_vector(vn);

    Ok(ProvisioningRecord {
        subset_identifier: vc.identifier,
        device_guid: device.device_guid.clone(),
        secret,
        vc: vc.secrets,
        vp,
        vn,
        alpha: device.security_alpha,
        previous_subset_identifier,
        next_subset_identifier,
    })
}

fn split_vector(vector: Option<SubsetVector>) -> (Option<String>, Vec<String>) {
    match vector {
        Some(v) => (Some(v.identifier), v.secrets),
        None => (None, Vec::new()),
    }
}

// ============================================================================
// ROTATION
// ============================================================================

/// Plan the per-device refresh orders of one rotation around `central`.
///
/// The central device is always first. Every order carries the same nonce.
/// With no peers the plan is a single order for the central device.
pub fn plan_rotation(
    central_guid: &str,
    peer_guids: &[String],
    refresh_nonce: &str,
    parent_task_id: Option<i64>,
) -> Vec<RefreshOrder> {
    let mut orders = Vec::with_capacity(peer_guids.len() + 1);

    orders.push(RefreshOrder {
        instruction: RefreshInstruction::RefreshAllRelated,
        refresh_nonce: refresh_nonce.to_string(),
        device_guid: Some(central_guid.to_string()),
        triggering_device_guid: Some(central_guid.to_string()),
        target_peer_guid: None,
        target_subset_identifier: None,
        parent_task_id,
    });

    for peer in peer_guids {
        orders.push(RefreshOrder {
            instruction: RefreshInstruction::RefreshSpecific,
            refresh_nonce: refresh_nonce.to_string(),
            device_guid: Some(peer.clone()),
            triggering_device_guid: None,
            target_peer_guid: Some(central_guid.to_string()),
            target_subset_identifier: None,
            parent_task_id,
        });
    }

    orders
}

/// Refresh order for a subset-wide scheduled rotation
pub fn scheduled_refresh_order(
    subset_identifier: &str,
    refresh_nonce: &str,
    parent_task_id: i64,
) -> RefreshOrder {
    RefreshOrder {
        instruction: RefreshInstruction::ScheduledRefresh,
        refresh_nonce: refresh_nonce.to_string(),
        device_guid: None,
        triggering_device_guid: None,
        target_peer_guid: None,
        target_subset_identifier: Some(subset_identifier.to_string()),
        parent_task_id: Some(parent_task_id),
    }
}

// ============================================================================
// DEVICE-SIDE KEY STATE
// ============================================================================

/// Which vector a neighbour's secret comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Neighbourhood {
    Previous,
    Current,
    Next,
}

/// Key material as a device holds it after provisioning.
///
/// Transport-free: the gateway never sees this, it models what a device does
/// with the commands the bridge publishes.
#[derive(Debug, Clone)]
pub struct DeviceKeyState {
    device_guid: String,
    secret: String,
    vp: Vec<String>,
    vc: Vec<String>,
    vn: Vec<String>,
    pairwise: HashMap<String, String>,
    revoked_peers: Vec<String>,
}

impl DeviceKeyState {
    /// Load a provisioning record
    pub fn from_record(record: &ProvisioningRecord) -> Self {
        Self {
            device_guid: record.device_guid.clone(),
            secret: record.secret.clone(),
            vp: record.vp.clone(),
            vc: record.vc.clone(),
            vn: record.vn.clone(),
            pairwise: HashMap::new(),
            revoked_peers: Vec::new(),
        }
    }

    pub fn device_guid(&self) -> &str {
        &self.device_guid
    }

    /// Secret of the neighbour at `index` (0-based position by local id)
    pub fn neighbour_secret(&self, neighbourhood: Neighbourhood, index: usize) -> Option<&str> {
        let vector = match neighbourhood {
            Neighbourhood::Previous => &self.vp,
            Neighbourhood::Current => &self.vc,
            Neighbourhood::Next => &self.vn,
        };
        vector.get(index).map(String::as_str)
    }

    /// Derive and store the pairwise key with a neighbour.
    ///
    /// Returns the key fingerprint to report to the control plane.
    pub fn establish(
        &mut self,
        peer_guid: &str,
        neighbourhood: Neighbourhood,
        index: usize,
        nonce: &str,
    ) -> Result<String> {
        if self.is_peer_revoked(peer_guid) {
            return Err(Error::Forbidden(format!("Peer {} is revoked", peer_guid)));
        }
        let peer_secret = self
            .neighbour_secret(neighbourhood, index)
            .ok_or_else(|| Error::NotFound(format!("No neighbour secret at {}", index)))?
            .to_string();

        let key = derive_pairwise_key(
            (&self.device_guid, &self.secret),
            (peer_guid, &peer_secret),
            nonce,
        )?;
        let fingerprint = key_fingerprint(&key);
        self.pairwise.insert(peer_guid.to_string(), key);
        Ok(fingerprint)
    }

    /// Apply a refresh nonce to every held key; returns how many changed
    pub fn refresh_all(&mut self, refresh_nonce: &str) -> usize {
        for key in self.pairwise.values_mut() {
            *key = derive_refreshed_key(key, refresh_nonce);
        }
        self.pairwise.len()
    }

    /// Apply a refresh nonce to the key shared with one peer
    pub fn refresh_peer(&mut self, peer_guid: &str, refresh_nonce: &str) -> usize {
        match self.pairwise.get_mut(peer_guid) {
            Some(key) => {
                *key = derive_refreshed_key(key, refresh_nonce);
                1
            }
            None => 0,
        }
    }

    /// Drop the key with a revoked peer and refuse to re-establish it
    pub fn revoke_peer(&mut self, peer_guid: &str) -> bool {
        if !self.is_peer_revoked(peer_guid) {
            self.revoked_peers.push(peer_guid.to_string());
        }
        self.pairwise.remove(peer_guid).is_some()
    }

    pub fn is_peer_revoked(&self, peer_guid: &str) -> bool {
        self.revoked_peers.iter().any(|g| g == peer_guid)
    }

    /// Fingerprint of the key shared with a peer
    pub fn fingerprint_with(&self, peer_guid: &str) -> Option<String> {
        self.pairwise.get(peer_guid).map(|k| key_fingerprint(k))
    }

    pub fn peer_count(&self) -> usize {
        self.pairwise.len()
    }
}

// ============================================================================
// TESTS
// ============================================================================
