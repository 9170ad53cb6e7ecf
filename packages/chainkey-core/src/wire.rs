//! Wire types exchanged between the control plane, gateways and devices.
//!
//! ```text
//! server ──(sealed TaskPayload)──► gateway ──(DeviceCommand)──► device
//! server ◄──(report_* requests)─── gateway ◄──(StatusMessage)── device
//! ```

use serde::{Deserialize, Serialize};

use crate::model::{RefreshInstruction, StatusType};

/// Default topic prefix for the device channel
pub const DEFAULT_TOPIC_PREFIX: &str = "iot_network";

// ── Task payloads ─────────────────────────────────────────────────────────────

/// Provisioning material for one device.
///
/// `Vc`, `Vp` and `Vn` hold the initial secrets of the current, previous and
/// next subset, each ordered by local identifier ascending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningRecord {
    pub subset_identifier: String,
    pub device_guid: String,
    pub secret: String,
    #[serde(rename = "Vc")]
    pub vc: Vec<String>,
    #[serde(rename = "Vp")]
    pub vp: Vec<String>,
    #[serde(rename = "Vn")]
    pub vn: Vec<String>,
    pub alpha: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_subset_identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_subset_identifier: Option<String>,
}

/// Revocation to be broadcast in a subset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevocationNotice {
    pub revoked_device_guid: String,
    pub revoked_subset_identifier: String,
}

/// One device's (or one subset's) share of a key rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshOrder {
    pub instruction: RefreshInstruction,
    pub refresh_nonce: String,
    /// Device the command is addressed to; absent for subset broadcasts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_guid: Option<String>,
    /// Central device, set on `REFRESH_ALL_RELATED_PAIRWISE_KEYS`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggering_device_guid: Option<String>,
    /// Central device as seen by a peer, set on `REFRESH_SPECIFIC_PAIRWISE_KEY`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_peer_guid: Option<String>,
    /// Subset to broadcast to, set on `SCHEDULED_KEY_REFRESH`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_subset_identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<i64>,
}

/// What a scheduled or recurring task does when it comes due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledRefresh {
    pub subset_identifier: String,
    /// Rotate around one device instead of the whole subset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_guid: Option<String>,
}

/// Decrypted content of a task's payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "payloadType", rename_all = "snake_case")]
pub enum TaskPayload {
    Provision(ProvisioningRecord),
    Revocation(RevocationNotice),
    Refresh(RefreshOrder),
    Schedule(ScheduledRefresh),
}

/// A pending task as handed to its gateway.
///
/// `payload` is sealed under the gateway's session key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayTask {
    pub task_id: i64,
    pub task_type: crate::model::TaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subset_identifier: Option<String>,
    pub payload: String,
}

// ── Device channel ────────────────────────────────────────────────────────────

/// Builds topic names for one gateway.
#[derive(Debug, Clone)]
pub struct Topics {
    prefix: String,
    gateway_guid: String,
}

impl Topics {
    pub fn new(prefix: impl Into<String>, gateway_guid: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            gateway_guid: gateway_guid.into(),
        }
    }

    /// Provisioning config for a device (retained)
    pub fn config(&self, device_guid: &str) -> String {
        format!("{}/{}/devices/{}/config", self.prefix, self.gateway_guid, device_guid)
    }

    /// Refresh commands for a device (retained)
    pub fn commands(&self, device_guid: &str) -> String {
        format!("{}/{}/devices/{}/commands", self.prefix, self.gateway_guid, device_guid)
    }

    /// Status acknowledgments from a device
    pub fn status(&self, device_guid: &str) -> String {
        format!("{}/{}/devices/{}/status", self.prefix, self.gateway_guid, device_guid)
    }

    /// Filter matching every device's status topic
    pub fn status_filter(&self) -> String {
        format!("{}/{}/devices/+/status", self.prefix, self.gateway_guid)
    }

    /// Subset-wide scheduled refresh broadcast
    pub fn key_refresh(&self, subset_identifier: &str) -> String {
        format!("{}/subsets/{}/key_refresh", self.prefix, subset_identifier)
    }

    /// Subset-wide revocation alerts
    pub fn broadcast_alerts(&self, subset_identifier: &str) -> String {
        format!("{}/subsets/{}/broadcast_alerts", self.prefix, subset_identifier)
    }

    /// Extract the device GUID from a status topic of this gateway
    pub fn device_from_status(&self, topic: &str) -> Option<String> {
        let rest = topic
            .strip_prefix(&self.prefix)?
            .strip_prefix('/')?
            .strip_prefix(&self.gateway_guid)?
            .strip_prefix("/devices/")?;
        let device = rest.strip_suffix("/status")?;
        if device.is_empty() || device.contains('/') {
            return None;
        }
        Some(device.to_string())
    }
}

/// Command published to a device or a subset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DeviceCommand {
    #[serde(rename = "REFRESH_ALL_RELATED_PAIRWISE_KEYS", rename_all = "camelCase")]
    RefreshAllRelated {
        refresh_nonce: String,
        triggering_device_guid: String,
        issuer: String,
        task_id: i64,
        timestamp: String,
    },
    #[serde(rename = "REFRESH_SPECIFIC_PAIRWISE_KEY", rename_all = "camelCase")]
    RefreshSpecific {
        refresh_nonce: String,
        target_peer_guid: String,
        issuer: String,
        task_id: i64,
        timestamp: String,
    },
    #[serde(rename = "SCHEDULED_KEY_REFRESH", rename_all = "camelCase")]
    ScheduledKeyRefresh {
        refresh_nonce: String,
        issuer: String,
        task_id: i64,
        timestamp: String,
    },
    #[serde(rename = "REVOCATION_ALERT", rename_all = "camelCase")]
    RevocationAlert {
        revoked_guid: String,
        issuer: String,
        timestamp: String,
    },
}

/// Provisioning config as published to the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningConfig {
    pub task_id: i64,
    #[serde(flatten)]
    pub record: ProvisioningRecord,
}

/// Acknowledgment published by a device on its status topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    #[serde(rename = "deviceGuid")]
    pub device_guid: String,
    /// Kept as text so unknown kinds can be logged instead of rejected
    pub status_type: String,
    #[serde(rename = "taskId", default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<i64>,
    #[serde(rename = "peerDeviceGuid", default, skip_serializing_if = "Option::is_none")]
    pub peer_device_guid: Option<String>,
    #[serde(rename = "keyHash", default, skip_serializing_if = "Option::is_none")]
    pub key_hash: Option<String>,
    #[serde(rename = "refreshedPeerGuid", default, skip_serializing_if = "Option::is_none")]
    pub refreshed_peer_guid: Option<String>,
    #[serde(rename = "wasCentralRefresh", default)]
    pub was_central_refresh: bool,
    #[serde(rename = "newKeyHash", default, skip_serializing_if = "Option::is_none")]
    pub new_key_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<serde_json::Value>,
}

impl StatusMessage {
    /// Parsed status kind, `None` for kinds this system does not handle
    pub fn kind(&self) -> Option<StatusType> {
        self.status_type.parse().ok()
    }
}

// ============================================================================
// TESTS
// ============================================================================
