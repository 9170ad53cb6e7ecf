//! # Topology
//!
//! Subsets, devices and their chain.
//!
//! ```text
//!   ┌────────┐ next ┌────────┐ next ┌────────┐
//!   │ zone-1 │─────►│ zone-2 │─────►│ zone-3 │
//!   │        │◄─────│        │◄─────│        │
//!   └────────┘ prev └────────┘ prev └────────┘
//! ```
//!
//! Links are always written in both directions, and a link that would close
//! a loop is refused.

use serde::Serialize;

use super::service::{require_device, require_subset, validate_identifier};
use super::KeyService;
use crate::crypto::generate_device_secret;
use crate::derivation::{device_guid, sort_by_local_id};
use crate::error::{Error, Result};
use crate::model::DeviceStatus;
use crate::storage::{DeviceRecord, GatewayRecord, NewDevice, Store, SubsetRecord};

/// Default security parameter for new devices
pub const DEFAULT_ALPHA: i64 = 5;

/// A device with everything around it
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceView {
    pub device: DeviceRecord,
    pub subset: SubsetRecord,
    pub gateways: Vec<GatewayRecord>,
    pub previous_subset: Option<SubsetRecord>,
    pub next_subset: Option<SubsetRecord>,
}

impl KeyService {
    // ========================================================================
    // SUBSETS
    // ========================================================================

    pub fn register_subset(
        &self,
        identifier: &str,
        name: &str,
        description: Option<&str>,
        user_id: i64,
    ) -> Result<SubsetRecord> {
        validate_identifier("identifier", identifier)?;
        if name.trim().is_empty() {
            return Err(Error::invalid("name", "must not be empty"));
        }

        let subset = self.db().run(|s| {
            let id = s.insert_subset(identifier, name.trim(), description, user_id)?;
            require_subset(s, id)
        })?;

        tracing::info!(subset = %subset.identifier, user_id, "Subset registered");
        Ok(subset)
    }

    pub fn list_subsets(&self) -> Result<Vec<SubsetRecord>> {
        self.db().run(|s| s.list_subsets())
    }

    pub fn get_subset(&self, id: i64) -> Result<SubsetRecord> {
        self.db().run(|s| require_subset(s, id))
    }

    /// Set a subset's previous and next neighbours.
    ///
    /// `None` clears that side. Old neighbours that pointed back at this
    /// subset are detached, and new neighbours are re-pointed at it.
    pub fn link_subsets(
        &self,
        subset_id: i64,
        previous: Option<i64>,
        next: Option<i64>,
    ) -> Result<SubsetRecord> {
        if previous == Some(subset_id) || next == Some(subset_id) {
            return Err(Error::invalid("links", "a subset cannot link to itself"));
        }
        let max_hops = self.config().max_chain_hops;

        let subset = self.db().transaction(|s| {
            let current = require_subset(s, subset_id)?;
            for id in previous.iter().chain(next.iter()) {
                require_subset(s, *id)?;
            }

            // Detach old neighbours that are being replaced
            if let Some(old) = current.next_subset_id.filter(|o| Some(*o) != next) {
                clear_previous_if(s, old, subset_id)?;
            }
            if let Some(old) = current.previous_subset_id.filter(|o| Some(*o) != previous) {
                clear_next_if(s, old, subset_id)?;
            }

            // Steal new neighbours from whatever they pointed at before
            if let Some(n) = next {
                let neighbour = require_subset(s, n)?;
                if let Some(p) = neighbour.previous_subset_id.filter(|p| *p != subset_id) {
                    clear_next_if(s, p, n)?;
                }
                s.set_subset_previous(n, Some(subset_id))?;
            }
            if let Some(p) = previous {
                let neighbour = require_subset(s, p)?;
                if let Some(n) = neighbour.next_subset_id.filter(|n| *n != subset_id) {
                    clear_previous_if(s, n, p)?;
                }
                s.set_subset_next(p, Some(subset_id))?;
            }

            s.set_subset_previous(subset_id, previous)?;
            s.set_subset_next(subset_id, next)?;

            ensure_acyclic(s, subset_id, max_hops)?;
            require_subset(s, subset_id)
        })?;

        tracing::info!(
            subset = %subset.identifier,
            previous = ?subset.previous_subset_id,
            next = ?subset.next_subset_id,
            "Subset links updated"
        );
        Ok(subset)
    }

    /// Delete a subset nothing references any more.
    pub fn delete_subset(&self, subset_id: i64) -> Result<()> {
        self.db().transaction(|s| {
            let subset = require_subset(s, subset_id)?;
            let (devices, gateways, tasks) = s.subset_dependents(subset_id)?;
            if devices > 0 || gateways > 0 || tasks > 0 {
                return Err(Error::Conflict(format!(
                    "Subset {} is referenced by {} device(s), {} gateway(s) and {} task(s)",
                    subset.identifier, devices, gateways, tasks
                )));
            }

            if let Some(p) = subset.previous_subset_id {
                clear_next_if(s, p, subset_id)?;
            }
            if let Some(n) = subset.next_subset_id {
                clear_previous_if(s, n, subset_id)?;
            }
            s.delete_subset(subset_id)?;

            tracing::info!(subset = %subset.identifier, "Subset deleted");
            Ok(())
        })
    }

    // ========================================================================
    // DEVICES
    // ========================================================================

    /// Register a device with a fresh initial secret.
    pub fn register_device(
        &self,
        subset_id: i64,
        local_identifier: &str,
        name: Option<&str>,
        device_type: Option<&str>,
        alpha: Option<i64>,
        user_id: i64,
    ) -> Result<DeviceRecord> {
        validate_identifier("localIdentifierInSubset", local_identifier)?;
        let alpha = alpha.unwrap_or(DEFAULT_ALPHA);
        if alpha < 1 {
            return Err(Error::invalid("securityParameterAlpha", "must be positive"));
        }

        let sealed = self.seal_secret(&generate_device_secret())?;

        let device = self.db().run(|s| {
            let subset = require_subset(s, subset_id)?;
            let guid = device_guid(&subset.identifier, local_identifier);
            let id = s.insert_device(&NewDevice {
                device_guid: &guid,
                subset_id,
                local_identifier,
                name,
                device_type,
                initial_secret_enc: &sealed,
                security_alpha: alpha,
                created_by: user_id,
            })?;
            s.get_device(id)?
                .ok_or_else(|| Error::Internal("Device vanished after insert".into()))
        })?;

        tracing::info!(device_guid = %device.device_guid, user_id, "Device registered");
        Ok(device)
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        self.db().run(|s| s.list_devices())
    }

    pub fn get_device(&self, guid: &str) -> Result<DeviceRecord> {
        self.db().run(|s| require_device(s, guid))
    }

    /// Device with its subset, the subset's gateways and both neighbours
    pub fn get_device_view(&self, guid: &str) -> Result<DeviceView> {
        self.db().run(|s| {
            let device = require_device(s, guid)?;
            let subset = require_subset(s, device.subset_id)?;
            let gateways = s.gateways_for_subset(subset.id)?;
            let previous_subset = match subset.previous_subset_id {
                Some(id) => s.get_subset(id)?,
                None => None,
            };
            let next_subset = match subset.next_subset_id {
                Some(id) => s.get_subset(id)?,
                None => None,
            };
            Ok(DeviceView {
                device,
                subset,
                gateways,
                previous_subset,
                next_subset,
            })
        })
    }

    /// Devices of a subset ordered by local identifier ascending
    pub fn devices_in_subset(&self, subset_id: i64) -> Result<Vec<DeviceRecord>> {
        self.db().run(|s| {
            require_subset(s, subset_id)?;
            ordered_devices(s, subset_id)
        })
    }

    /// Set a device's lifecycle status as reported by its gateway.
    ///
    /// Revoked devices are frozen, and revocation itself goes through
    /// [`KeyService::revoke_device`].
    pub fn update_device_status(&self, guid: &str, status: DeviceStatus) -> Result<DeviceRecord> {
        if status == DeviceStatus::Revoked {
            return Err(Error::invalid("status", "use the revoke operation"));
        }

        let device = self.db().run(|s| {
            let device = require_device(s, guid)?;
            if device.status == DeviceStatus::Revoked {
                return Err(Error::Conflict(format!("Device {} is revoked", guid)));
            }
            if device.status != status {
                s.set_device_status(device.id, status)?;
            }
            require_device(s, guid)
        })?;

        tracing::debug!(device_guid = %guid, status = %status, "Device status updated");
        Ok(device)
    }
}

pub(crate) fn ordered_devices(s: &Store<'_>, subset_id: i64) -> Result<Vec<DeviceRecord>> {
    let mut devices = s.devices_in_subset(subset_id)?;
    sort_by_local_id(&mut devices);
    Ok(devices)
}

fn clear_previous_if(s: &Store<'_>, id: i64, expected: i64) -> Result<()> {
    if let Some(subset) = s.get_subset(id)? {
        if subset.previous_subset_id == Some(expected) {
            s.set_subset_previous(id, None)?;
        }
    }
    Ok(())
}

fn clear_next_if(s: &Store<'_>, id: i64, expected: i64) -> Result<()> {
    if let Some(subset) = s.get_subset(id)? {
        if subset.next_subset_id == Some(expected) {
            s.set_subset_next(id, None)?;
        }
    }
    Ok(())
}

/// Walk forward from `start`; coming back to it means a loop.
fn ensure_acyclic(s: &Store<'_>, start: i64, max_hops: usize) -> Result<()> {
    let mut cursor = require_subset(s, start)?.next_subset_id;
    let mut hops = 0;

    while let Some(id) = cursor {
        if id == start {
            return Err(Error::invalid("links", "link would create a cycle"));
        }
        hops += 1;
        if hops > max_hops {
            return Err(Error::invalid(
                "links",
                format!("chain is longer than {} hops", max_hops),
            ));
        }
        cursor = s.get_subset(id)?.and_then(|n| n.next_subset_id);
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
