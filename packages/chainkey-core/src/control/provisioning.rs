//! # Provisioning and Rotation
//!
//! Turns "provision D" and "refresh around D" into sealed, gateway-addressed
//! tasks. Every sequence runs inside one transaction: a failure part-way
//! leaves neither a task nor a changed device status behind.

use super::service::{require_device, require_device_id, require_subset, serving_gateway};
use super::topology::ordered_devices;
use super::KeyService;
use crate::crypto::generate_refresh_nonce;
use crate::derivation::{build_provisioning_record, plan_rotation, SubsetVector};
use crate::error::{Error, Result};
use crate::model::{DeviceStatus, Recurrence, TaskStatus, TaskType};
use crate::storage::{DeviceRecord, NewTask, Store, SubsetRecord};
use crate::wire::TaskPayload;

impl KeyService {
    /// Build a device's provisioning record and queue it for its gateway.
    ///
    /// Accepts devices that were never provisioned, are stuck pending, or
    /// failed a refresh. Returns the new task id.
    pub fn provision(&self, device_guid: &str, user_id: i64) -> Result<i64> {
        let (task_id, gateway_guid) = self.db().transaction(|s| {
            let device = require_device(s, device_guid)?;
            if device.status == DeviceStatus::Revoked {
                return Err(Error::Conflict(format!("Device {} is revoked", device_guid)));
            }
            if !device.status.is_provisionable() {
                return Err(Error::Conflict(format!(
                    "Device {} is already provisioned ({})",
                    device_guid, device.status
                )));
            }

            let subset = require_subset(s, device.subset_id)?;
            let gateway = serving_gateway(s, &subset)?;

            let secret = self.open_secret(&device)?;
            let vc = self.subset_vector(s, &subset)?;
            let vp = match subset.previous_subset_id {
                Some(id) => Some(self.subset_vector(s, &require_subset(s, id)?)?),
                None => None,
            };
            let vn = match subset.next_subset_id {
                Some(id) => Some(self.subset_vector(s, &require_subset(s, id)?)?),
                None => None,
            };

            let record = build_provisioning_record(&device, secret, vc, vp, vn)?;
            let payload = self.seal_payload(&TaskPayload::Provision(record))?;

            let task_id = s.insert_task(&NewTask {
                task_type: TaskType::Provision,
                target_device_id: Some(device.id),
                target_subset_id: Some(subset.id),
                target_gateway_id: Some(gateway.id),
                parent_task_id: None,
                initiated_by: user_id,
                status: TaskStatus::Pending,
                scheduled_at: None,
                recurrence: Recurrence::None,
                payload,
            })?;
            s.set_device_status(device.id, DeviceStatus::ProvisioningPending)?;

            Ok((task_id, gateway.gateway_guid))
        })?;

        tracing::info!(
            device_guid = %device_guid,
            task_id,
            gateway = %gateway_guid,
            user_id,
            "Provisioning queued"
        );
        Ok(task_id)
    }

    /// Rotate every pairwise key of a device with one fresh nonce.
    ///
    /// Returns the ids of the spawned tasks, the central device's first.
    pub fn refresh_pairwise(&self, device_guid: &str, user_id: i64) -> Result<Vec<i64>> {
        let nonce = generate_refresh_nonce();

        let task_ids = self.db().transaction(|s| {
            let device = require_device(s, device_guid)?;
            match device.status {
                DeviceStatus::Revoked => {
                    return Err(Error::Conflict(format!("Device {} is revoked", device_guid)))
                }
                DeviceStatus::Unprovisioned | DeviceStatus::ProvisioningPending => {
                    return Err(Error::Conflict(format!(
                        "Device {} is not provisioned yet",
                        device_guid
                    )))
                }
                _ => {}
            }
            self.spawn_rotation(s, &device, &nonce, None, user_id)
        })?;

        tracing::info!(
            device_guid = %device_guid,
            tasks = task_ids.len(),
            user_id,
            "Pairwise key refresh queued"
        );
        Ok(task_ids)
    }

    /// Queue one refresh task per participant of a rotation around `central`.
    ///
    /// Participants are the central device plus every non-revoked device it
    /// shares an active pairwise key with; each task goes to the gateway of
    /// that participant's own subset.
    pub(crate) fn spawn_rotation(
        &self,
        s: &Store<'_>,
        central: &DeviceRecord,
        refresh_nonce: &str,
        parent_task_id: Option<i64>,
        user_id: i64,
    ) -> Result<Vec<i64>> {
        let mut peer_ids: Vec<i64> = s
            .active_pairwise_for_device(central.id)?
            .iter()
            .filter_map(|k| k.counterpart(central.id))
            .filter(|id| *id != central.id)
            .collect();
        peer_ids.sort_unstable();
        peer_ids.dedup();

        let mut participants = vec![central.clone()];
        for id in peer_ids {
            let peer = require_device_id(s, id)?;
            if peer.status != DeviceStatus::Revoked {
                participants.push(peer);
            }
        }

        let peer_guids: Vec<String> = participants[1..]
            .iter()
            .map(|d| d.device_guid.clone())
            .collect();
        let orders = plan_rotation(&central.device_guid, &peer_guids, refresh_nonce, parent_task_id);

        let mut task_ids = Vec::with_capacity(orders.len());
        for (order, device) in orders.into_iter().zip(participants.iter()) {
            let subset = require_subset(s, device.subset_id)?;
            let gateway = serving_gateway(s, &subset)?;
            let payload = self.seal_payload(&TaskPayload::Refresh(order))?;

            task_ids.push(s.insert_task(&NewTask {
                task_type: TaskType::RefreshPairwiseKeys,
                target_device_id: Some(device.id),
                target_subset_id: Some(subset.id),
                target_gateway_id: Some(gateway.id),
                parent_task_id,
                initiated_by: user_id,
                status: TaskStatus::Pending,
                scheduled_at: None,
                recurrence: Recurrence::None,
                payload,
            })?);
            s.set_device_status(device.id, DeviceStatus::KeyRefreshPending)?;
        }

        Ok(task_ids)
    }

    /// Decrypted secrets of a subset, ordered by local identifier
    fn subset_vector(&self, s: &Store<'_>, subset: &SubsetRecord) -> Result<SubsetVector> {
        let secrets = ordered_devices(s, subset.id)?
            .iter()
            .map(|d| self.open_secret(d))
            .collect::<Result<Vec<_>>>()?;
        Ok(SubsetVector {
            identifier: subset.identifier.clone(),
            secrets,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
