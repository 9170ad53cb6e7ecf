//! # Device-Key Registry
//!
//! Fingerprints of keys devices hold, one row per (owner, peer, type).
//! A key is never deleted; revocation flips its status so the lineage stays
//! auditable.

use super::service::require_device;
use super::KeyService;
use crate::crypto::key_fingerprint;
use crate::error::{Error, Result};
use crate::model::{DeviceStatus, KeyStatus, KeyType, TaskType};
use crate::storage::{DeviceKeyRecord, DeviceRecord, Store};
use crate::wire::TaskPayload;

impl KeyService {
    /// Record a key a device reports.
    ///
    /// Reporting the same (owner, peer, type) again updates the fingerprint
    /// and bumps `keyVersion` on the existing row.
    pub fn create_or_update_key(
        &self,
        owner_guid: &str,
        peer_guid: Option<&str>,
        key_type: KeyType,
        key_hash: &str,
        key_status: Option<KeyStatus>,
    ) -> Result<DeviceKeyRecord> {
        if key_hash.trim().is_empty() {
            return Err(Error::invalid("keyHash", "must not be empty"));
        }
        match (key_type, peer_guid) {
            (KeyType::Pairwise, None) => {
                return Err(Error::invalid("peerDeviceGuid", "required for pairwise keys"));
            }
            (KeyType::Groupwise, Some(_)) => {
                return Err(Error::invalid("peerDeviceGuid", "not allowed for groupwise keys"));
            }
            (_, Some(peer)) if peer == owner_guid => {
                return Err(Error::invalid("peerDeviceGuid", "must differ from the owner"));
            }
            _ => {}
        }

        let record = self.db().transaction(|s| {
            let owner = require_device(s, owner_guid)?;
            ensure_not_revoked(&owner)?;
            let peer = match peer_guid {
                Some(guid) => {
                    let peer = require_device(s, guid)?;
                    ensure_not_revoked(&peer)?;
                    Some(peer.id)
                }
                None => None,
            };

            s.upsert_device_key(
                owner.id,
                peer,
                key_type,
                key_hash,
                key_status.unwrap_or(KeyStatus::Active),
            )
        })?;

        tracing::info!(
            owner = %owner_guid,
            peer = ?peer_guid,
            key_type = %key_type,
            version = record.key_version,
            "Device key recorded"
        );
        Ok(record)
    }

    /// Revoke every key the device owns or is peer of. Returns rows changed.
    pub fn revoke_keys_for_device(&self, device_id: i64) -> Result<usize> {
        self.db().run(|s| s.revoke_keys_for_device(device_id))
    }

    /// Active pairwise keys the device takes part in
    pub fn find_active_pairwise(&self, device_id: i64) -> Result<Vec<DeviceKeyRecord>> {
        self.db().run(|s| s.active_pairwise_for_device(device_id))
    }

    /// Apply a device's refresh acknowledgment to the registry.
    ///
    /// A central refresh bumps every active pairwise row of the device; a
    /// peer refresh bumps only the rows shared with `refreshed_peer_guid`,
    /// in both directions. Returns how many rows changed.
    ///
    /// When the acknowledgment names its refresh task, each row is bumped at
    /// most once per rotation: a redelivered ack, or the other end of the
    /// same rotation acknowledging the shared row, changes nothing.
    pub fn apply_refresh_ack(
        &self,
        device_guid: &str,
        was_central: bool,
        refreshed_peer_guid: Option<&str>,
        new_key_hash: Option<&str>,
        task_id: Option<i64>,
    ) -> Result<usize> {
        if !was_central && refreshed_peer_guid.is_none() {
            return Err(Error::invalid(
                "refreshedPeerGuid",
                "required when the refresh was not central",
            ));
        }

        let bumped = self.db().transaction(|s| {
            let rotation = match task_id {
                Some(id) => Some(self.rotation_marker(s, id)?),
                None => None,
            };
            let device = require_device(s, device_guid)?;
            let rows = if was_central {
                s.active_pairwise_for_device(device.id)?
            } else {
                let peer = require_device(s, refreshed_peer_guid.unwrap_or_default())?;
                s.active_pairwise_between(device.id, peer.id)?
            };

            let mut bumped = 0;
            for row in rows {
                if s.bump_key_version(row.id, new_key_hash, rotation.as_deref())? {
                    bumped += 1;
                }
            }
            Ok(bumped)
        })?;

        tracing::info!(
            device_guid = %device_guid,
            was_central,
            task_id = ?task_id,
            rows = bumped,
            "Key refresh recorded"
        );
        Ok(bumped)
    }

    /// Fingerprint of the nonce a refresh task distributed
    fn rotation_marker(&self, s: &Store<'_>, task_id: i64) -> Result<String> {
        let task = s
            .get_task(task_id)?
            .ok_or_else(|| Error::NotFound(format!("Task {} not found", task_id)))?;
        if task.task_type != TaskType::RefreshPairwiseKeys {
            return Err(Error::invalid(
                "taskId",
                format!("task {} is a {} task", task_id, task.task_type),
            ));
        }
        match self.open_payload(&task.payload)? {
            TaskPayload::Refresh(order) => Ok(key_fingerprint(&order.refresh_nonce)),
            _ => Err(Error::invalid("taskId", format!("task {} carries no refresh order", task_id))),
        }
    }

    /// All key rows, or the rows one device takes part in
    pub fn list_device_keys(&self, device_guid: Option<&str>) -> Result<Vec<DeviceKeyRecord>> {
        self.db().run(|s| match device_guid {
            Some(guid) => {
                let device = require_device(s, guid)?;
                s.list_device_keys(Some(device.id))
            }
            None => s.list_device_keys(None),
        })
    }
}

fn ensure_not_revoked(device: &DeviceRecord) -> Result<()> {
    if device.status == DeviceStatus::Revoked {
        return Err(Error::Conflict(format!(
            "Device {} is revoked",
            device.device_guid
        )));
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::super::service::test_support::{service, zone};
    use super::*;

    #[test]
    fn test_key_versioning() {
        let svc = service();
        zone(&svc, 2);

        let first = svc
            .create_or_update_key("zone-1.01", Some("zone-1.02"), KeyType::Pairwise, "h1", None)
            .unwrap();
        let second = svc
            .create_or_update_key("zone-1.01", Some("zone-1.02"), KeyType::Pairwise, "h2", None)
            .unwrap();

        assert_eq!(first.key_version, 1);
        assert_eq!(second.key_version, 2);
        assert_eq!(svc.list_device_keys(None).unwrap().len(), 1);
    }

    #[test]
    fn test_key_validation() {
        let svc = service();
        zone(&svc, 2);

        assert!(matches!(
            svc.create_or_update_key("zone-1.01", None, KeyType::Pairwise, "h", None),
            Err(Error::InvalidInput { .. })
        ));
        assert!(matches!(
            svc.create_or_update_key("zone-1.01", Some("zone-1.01"), KeyType::Pairwise, "h", None),
            Err(Error::InvalidInput { .. })
        ));
        assert!(matches!(
            svc.create_or_update_key("zone-1.01", Some("zone-1.09"), KeyType::Pairwise, "h", None),
            Err(Error::NotFound(_))
        ));
        svc.create_or_update_key("zone-1.01", None, KeyType::Groupwise, "g", None)
            .unwrap();
    }

    #[test]
    fn test_peer_refresh_bumps_both_directions_only() {
        let svc = service();
        zone(&svc, 3);
        for (owner, peer) in [("01", "02"), ("02", "01"), ("01", "03")] {
            svc.create_or_update_key(
                &format!("zone-1.{}", owner),
                Some(&format!("zone-1.{}", peer)),
                KeyType::Pairwise,
                "h",
                None,
            )
            .unwrap();
        }

        let bumped = svc
            .apply_refresh_ack("zone-1.02", false, Some("zone-1.01"), Some("h2"), None)
            .unwrap();
        assert_eq!(bumped, 2);

        let keys = svc.list_device_keys(Some("zone-1.03")).unwrap();
        assert_eq!(keys[0].key_version, 1);
    }

    #[test]
    fn test_central_refresh_bumps_all_rows() {
        let svc = service();
        zone(&svc, 3);
        for peer in ["02", "03"] {
            svc.create_or_update_key(
                "zone-1.01",
                Some(&format!("zone-1.{}", peer)),
                KeyType::Pairwise,
                "h",
                None,
            )
            .unwrap();
        }

        assert_eq!(svc.apply_refresh_ack("zone-1.01", true, None, None, None).unwrap(), 2);
        assert!(svc
            .list_device_keys(Some("zone-1.01"))
            .unwrap()
            .iter()
            .all(|k| k.key_version == 2 && k.key_hash == "h"));

        assert!(matches!(
            svc.apply_refresh_ack("zone-1.01", false, None, None, None),
            Err(Error::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_redelivered_ack_bumps_once() {
        let svc = service();
        zone(&svc, 2);
        svc.create_or_update_key("zone-1.01", Some("zone-1.02"), KeyType::Pairwise, "h1", None)
            .unwrap();
        svc.update_device_status("zone-1.01", DeviceStatus::Running).unwrap();
        let ids = svc.refresh_pairwise("zone-1.01", 1).unwrap();

        let first = svc
            .apply_refresh_ack("zone-1.01", true, None, Some("h2"), Some(ids[0]))
            .unwrap();
        let again = svc
            .apply_refresh_ack("zone-1.01", true, None, Some("h2"), Some(ids[0]))
            .unwrap();
        assert_eq!((first, again), (1, 0));

        // The peer's ack of the same rotation touches the same row
        let peer = svc
            .apply_refresh_ack("zone-1.02", false, Some("zone-1.01"), Some("h2"), Some(ids[1]))
            .unwrap();
        assert_eq!(peer, 0);

        let keys = svc.list_device_keys(Some("zone-1.01")).unwrap();
        assert_eq!(keys[0].key_version, 2);
        assert_eq!(keys[0].key_hash, "h2");
    }

    #[test]
    fn test_next_rotation_bumps_again() {
        let svc = service();
        zone(&svc, 2);
        svc.create_or_update_key("zone-1.01", Some("zone-1.02"), KeyType::Pairwise, "h1", None)
            .unwrap();
        svc.update_device_status("zone-1.01", DeviceStatus::Running).unwrap();

        let first = svc.refresh_pairwise("zone-1.01", 1).unwrap();
        svc.apply_refresh_ack("zone-1.01", true, None, None, Some(first[0]))
            .unwrap();
        let second = svc.refresh_pairwise("zone-1.01", 1).unwrap();
        svc.apply_refresh_ack("zone-1.01", true, None, None, Some(second[0]))
            .unwrap();

        let keys = svc.list_device_keys(Some("zone-1.01")).unwrap();
        assert_eq!(keys[0].key_version, 3);
    }

    #[test]
    fn test_ack_for_wrong_task_rejected() {
        let svc = service();
        zone(&svc, 1);
        let provision = svc.provision("zone-1.01", 1).unwrap();

        assert!(matches!(
            svc.apply_refresh_ack("zone-1.01", true, None, None, Some(provision)),
            Err(Error::InvalidInput { .. })
        ));
        assert!(matches!(
            svc.apply_refresh_ack("zone-1.01", true, None, None, Some(999)),
            Err(Error::NotFound(_))
        ));
    }
}
