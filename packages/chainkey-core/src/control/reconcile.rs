//! Detection of devices left in `provisioning_pending` with nothing in flight.
//!
//! Detection only: stuck devices are reported and an administrator re-drives
//! them with `provision`.

use super::KeyService;
use crate::error::Result;
use crate::storage::DeviceRecord;
use crate::time::now_timestamp;

impl KeyService {
    /// Devices pending for longer than `timeout_secs` without an open
    /// provision task
    pub fn find_stuck_provisioning(&self, timeout_secs: i64) -> Result<Vec<DeviceRecord>> {
        let older_than = now_timestamp() - timeout_secs;
        let stuck = self.db().run(|s| s.stuck_provisioning(older_than))?;

        for device in &stuck {
            tracing::warn!(
                device_guid = %device.device_guid,
                pending_since = device.updated_at,
                "Device stuck in provisioning"
            );
        }
        Ok(stuck)
    }
}
