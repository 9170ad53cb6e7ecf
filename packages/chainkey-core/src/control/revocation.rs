//! # Revocation
//!
//! Marks a device untrusted everywhere: its status, every key it takes part
//! in, and (through its gateway) every device in its subset.

use serde::Serialize;

use super::service::{require_device, require_subset};
use super::KeyService;
use crate::error::{Error, Result};
use crate::model::{DeviceStatus, Recurrence, TaskStatus, TaskType};
use crate::storage::NewTask;
use crate::wire::{RevocationNotice, TaskPayload};

/// Result of revoking a device
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Revocation {
    pub device_guid: String,
    pub status: DeviceStatus,
    pub task_id: i64,
    /// Gateway the broadcast goes to; `None` when the subset has none yet
    pub gateway_guid: Option<String>,
    pub keys_revoked: usize,
}

impl KeyService {
    /// Revoke a device. A second revocation is a `Conflict`.
    pub fn revoke_device(&self, device_guid: &str, user_id: i64) -> Result<Revocation> {
        let revocation = self.db().transaction(|s| {
            let device = require_device(s, device_guid)?;
            if device.status == DeviceStatus::Revoked {
                return Err(Error::Conflict(format!(
                    "Device {} is already revoked",
                    device_guid
                )));
            }
            let subset = require_subset(s, device.subset_id)?;

            s.set_device_status(device.id, DeviceStatus::Revoked)?;
            let keys_revoked = s.revoke_keys_for_device(device.id)?;

            let gateway = s.gateways_for_subset(subset.id)?.into_iter().next();
            if gateway.is_none() {
                tracing::warn!(
                    device_guid = %device_guid,
                    subset = %subset.identifier,
                    "No gateway serves the subset; revocation broadcast waits for one"
                );
            }

            let payload = self.seal_payload(&TaskPayload::Revocation(RevocationNotice {
                revoked_device_guid: device.device_guid.clone(),
                revoked_subset_identifier: subset.identifier.clone(),
            }))?;

            let task_id = s.insert_task(&NewTask {
                task_type: TaskType::ProcessDeviceRevocation,
                target_device_id: Some(device.id),
                target_subset_id: Some(subset.id),
                target_gateway_id: gateway.as_ref().map(|g| g.id),
                parent_task_id: None,
                initiated_by: user_id,
                status: TaskStatus::Pending,
                scheduled_at: None,
                recurrence: Recurrence::None,
                payload,
            })?;

            Ok(Revocation {
                device_guid: device.device_guid,
                status: DeviceStatus::Revoked,
                task_id,
                gateway_guid: gateway.map(|g| g.gateway_guid),
                keys_revoked,
            })
        })?;

        tracing::info!(
            device_guid = %device_guid,
            task_id = revocation.task_id,
            keys_revoked = revocation.keys_revoked,
            user_id,
            "Device revoked"
        );
        Ok(revocation)
    }
}

// ============================================================================
// TESTS
// ============================================================================
