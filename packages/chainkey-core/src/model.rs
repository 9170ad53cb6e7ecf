//! Domain enums shared by storage, the control plane and gateways.
//!
//! Every enum has a fixed wire/text form; parsing an unknown value is an
//! `InvalidInput` error naming the field it came from.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::error::Error;

macro_rules! string_enum {
    (
        $field:literal;
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* #[serde(rename = $text)] $variant ),+
        }

        impl $name {
            /// Every variant, in declaration order
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Text form used on the wire and in the database
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $text ),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $text => Ok($name::$variant), )+
                    other => Err(Error::invalid(
                        $field,
                        format!("unsupported value '{}'", other),
                    )),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: Error| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

string_enum! {
    "status";
    /// Device lifecycle state
    pub enum DeviceStatus {
        Unprovisioned => "unprovisioned",
        ProvisioningPending => "provisioning_pending",
        Active => "active",
        Running => "running",
        KeyRefreshPending => "key_refresh_pending",
        KeyRefreshFailed => "key_refresh_failed",
        Revoked => "revoked",
    }
}

impl DeviceStatus {
    /// Whether the device participates in subset-wide key refreshes
    pub fn is_operational(&self) -> bool {
        matches!(self, DeviceStatus::Active | DeviceStatus::Running)
    }

    /// Whether `provision` may be (re-)driven from this state
    pub fn is_provisionable(&self) -> bool {
        matches!(
            self,
            DeviceStatus::Unprovisioned
                | DeviceStatus::ProvisioningPending
                | DeviceStatus::KeyRefreshFailed
        )
    }
}

string_enum! {
    "status";
    /// Gateway reachability
    pub enum GatewayStatus {
        Offline => "offline",
        Online => "online",
    }
}

string_enum! {
    "keyType";
    /// Kind of device key record
    pub enum KeyType {
        Pairwise => "pairwise",
        Groupwise => "groupwise",
    }
}

string_enum! {
    "keyStatus";
    /// Device key record status
    pub enum KeyStatus {
        Active => "active",
        Revoked => "revoked",
    }
}

string_enum! {
    "taskType";
    /// Kind of work item
    pub enum TaskType {
        Provision => "provision",
        ProcessDeviceRevocation => "process_device_revocation",
        RefreshPairwiseKeys => "refresh_pairwise_keys",
        Scheduled => "scheduled",
        Recurring => "recurring",
    }
}

string_enum! {
    "status";
    /// Task lifecycle state
    ///
    /// ```text
    /// pending ───────► in_progress ──► completed | failed
    ///    └──────────────────────────► completed | failed   (ack before progress report)
    ///
    /// scheduled ─(due)─► in_progress ──► completed | completed_no_devices | failed
    ///     ▲                                  │
    ///     └────────── recurring ─────────────┘
    /// ```
    pub enum TaskStatus {
        Pending => "pending",
        Scheduled => "scheduled",
        InProgress => "in_progress",
        Completed => "completed",
        CompletedNoDevices => "completed_no_devices",
        Failed => "failed",
    }
}

impl TaskStatus {
    /// Terminal states are final
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::CompletedNoDevices | TaskStatus::Failed
        )
    }

    /// Whether a task may move from `self` to `next`.
    ///
    /// A pending task passes through `in_progress` before it ends.
    /// `scheduled → failed` calls a scheduled task off before it runs.
    /// `in_progress → scheduled` is only used when a recurring task is
    /// rescheduled; reporting it from outside is rejected separately.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (*self, next),
            (Pending, InProgress)
                | (Scheduled, InProgress)
                | (Scheduled, Failed)
                | (InProgress, Completed)
                | (InProgress, CompletedNoDevices)
                | (InProgress, Failed)
                | (InProgress, Scheduled)
        )
    }
}

string_enum! {
    "recurrence";
    /// Repeat interval of a recurring task
    pub enum Recurrence {
        None => "none",
        Weekly => "weekly",
        Monthly => "monthly",
    }
}

string_enum! {
    "scheduleType";
    /// How a scheduled refresh is requested
    pub enum ScheduleType {
        OnceAt => "ONCE_AT",
        Recurrence => "RECURRENCE",
    }
}

string_enum! {
    "instruction";
    /// What a device is asked to do with a refresh nonce
    pub enum RefreshInstruction {
        /// Central device: apply the nonce to every pairwise key it holds
        RefreshAllRelated => "REFRESH_ALL_RELATED_PAIRWISE_KEYS",
        /// Peer device: apply the nonce to the key shared with one device
        RefreshSpecific => "REFRESH_SPECIFIC_PAIRWISE_KEY",
        /// Subset broadcast: every device refreshes all its keys
        ScheduledRefresh => "SCHEDULED_KEY_REFRESH",
    }
}

string_enum! {
    "status_type";
    /// Acknowledgment kinds a device publishes on its status topic
    pub enum StatusType {
        Provisioned => "provisioned",
        PairwiseKeyEstablished => "pairwise_key_established",
        PairwiseKeyRefreshProcessed => "pairwise_key_refresh_processed",
        ScheduledKeyRefreshCompleted => "scheduled_key_refresh_completed",
    }
}

// ============================================================================
// TESTS
// ============================================================================
