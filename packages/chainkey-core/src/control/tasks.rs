//! # Task Orchestrator
//!
//! Durable work items and their lifecycle.
//!
//! ```text
//! ┌──────────────┐  provision / refresh / revoke   ┌──────────────┐
//! │ admin action │────────────────────────────────►│   pending    │
//! └──────────────┘                                 └──────┬───────┘
//! ┌──────────────┐  schedule                              │ gateway publishes
//! │ admin action │──────────► scheduled ──(due)──┐        ▼
//! └──────────────┘               ▲               └──► in_progress
//!                                │ recurring              │ device acks
//!                                └────────────────────────┤
//!                                                         ▼
//!                              completed | completed_no_devices | failed
//! ```
//!
//! Payloads are sealed under the master key at rest and re-sealed under the
//! gateway's session key when handed out. Only status, result message and
//! timestamps ever change after creation.

use serde::{Deserialize, Serialize};

use super::service::{require_device, require_gateway, require_subset};
use super::KeyService;
use crate::crypto::seal_str;
use crate::error::{Error, Result};
use crate::model::{Recurrence, ScheduleType, TaskStatus, TaskType};
use crate::storage::{NewTask, TaskRecord};
use crate::time::now_timestamp;
use crate::wire::{GatewayTask, ScheduledRefresh, TaskPayload};

/// Request to rotate a subset (or one device) later
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    pub subset_id: i64,
    pub schedule_type: ScheduleType,
    /// Unix seconds of the (first) run
    pub schedule_value: i64,
    #[serde(default)]
    pub device_guid: Option<String>,
    #[serde(default)]
    pub recurrence: Option<Recurrence>,
}

impl KeyService {
    pub fn get_task(&self, task_id: i64) -> Result<TaskRecord> {
        self.db().run(|s| {
            s.get_task(task_id)?
                .ok_or_else(|| Error::NotFound(format!("Task {} not found", task_id)))
        })
    }

    /// Most recent tasks first
    pub fn list_tasks(&self) -> Result<Vec<TaskRecord>> {
        let limit = self.config().task_list_limit;
        self.db().run(|s| s.list_tasks(limit))
    }

    /// Tasks spawned by a scheduled or recurring parent
    pub fn child_tasks(&self, parent_id: i64) -> Result<Vec<TaskRecord>> {
        self.db().run(|s| s.child_tasks(parent_id))
    }

    /// Create a one-off or recurring refresh.
    ///
    /// Everything is validated now; nothing about the request can fail for
    /// input reasons once it is due.
    pub fn schedule(&self, request: &ScheduleRequest, user_id: i64) -> Result<i64> {
        let now = now_timestamp();
        if request.schedule_value <= now {
            return Err(Error::invalid("scheduleValue", "must be in the future"));
        }

        let (task_type, recurrence) = match (request.schedule_type, request.recurrence) {
            (ScheduleType::OnceAt, None | Some(Recurrence::None)) => {
                (TaskType::Scheduled, Recurrence::None)
            }
            (ScheduleType::OnceAt, Some(_)) => {
                return Err(Error::invalid("recurrence", "not allowed with ONCE_AT"));
            }
            (ScheduleType::Recurrence, Some(r @ (Recurrence::Weekly | Recurrence::Monthly))) => {
                (TaskType::Recurring, r)
            }
            (ScheduleType::Recurrence, _) => {
                return Err(Error::invalid(
                    "recurrence",
                    "weekly or monthly required with RECURRENCE",
                ));
            }
        };

        let task_id = self.db().transaction(|s| {
            let subset = require_subset(s, request.subset_id)?;
            let device = match request.device_guid.as_deref() {
                Some(guid) => {
                    let device = require_device(s, guid)?;
                    if device.subset_id != subset.id {
                        return Err(Error::invalid(
                            "deviceGuid",
                            format!("device is not in subset {}", subset.identifier),
                        ));
                    }
                    Some(device)
                }
                None => None,
            };

            let payload = self.seal_payload(&TaskPayload::Schedule(ScheduledRefresh {
                subset_identifier: subset.identifier.clone(),
                device_guid: device.as_ref().map(|d| d.device_guid.clone()),
            }))?;

            s.insert_task(&NewTask {
                task_type,
                target_device_id: device.map(|d| d.id),
                target_subset_id: Some(subset.id),
                target_gateway_id: None,
                parent_task_id: None,
                initiated_by: user_id,
                status: TaskStatus::Scheduled,
                scheduled_at: Some(request.schedule_value),
                recurrence,
                payload,
            })
        })?;

        tracing::info!(
            task_id,
            subset_id = request.subset_id,
            task_type = %task_type,
            recurrence = %recurrence,
            scheduled_at = request.schedule_value,
            "Key refresh scheduled"
        );
        Ok(task_id)
    }

    /// Apply a status reported by a gateway.
    ///
    /// Re-reporting the current status is a no-op, so duplicate deliveries
    /// are harmless. Leaving a terminal state is a `Conflict`.
    pub fn report_task_status(
        &self,
        task_id: i64,
        status: TaskStatus,
        result_message: Option<&str>,
    ) -> Result<TaskRecord> {
        if !matches!(
            status,
            TaskStatus::InProgress
                | TaskStatus::Completed
                | TaskStatus::CompletedNoDevices
                | TaskStatus::Failed
        ) {
            return Err(Error::invalid(
                "status",
                format!("'{}' cannot be reported", status),
            ));
        }

        let task = self.db().run(|s| {
            let task = s
                .get_task(task_id)?
                .ok_or_else(|| Error::NotFound(format!("Task {} not found", task_id)))?;

            if task.status == status {
                return Ok(task);
            }
            if !task.status.can_transition_to(status) {
                return Err(Error::Conflict(format!(
                    "Task {} cannot move from {} to {}",
                    task_id, task.status, status
                )));
            }

            if !s.transition_task(task_id, task.status, status, result_message)? {
                return Err(Error::Conflict(format!(
                    "Task {} changed concurrently",
                    task_id
                )));
            }
            s.get_task(task_id)?
                .ok_or_else(|| Error::NotFound(format!("Task {} not found", task_id)))
        })?;

        tracing::info!(task_id, status = %task.status, "Task status reported");
        Ok(task)
    }

    /// Pending tasks for a gateway, payloads re-sealed under its session key.
    ///
    /// A task whose payload cannot be opened is marked `failed` with the
    /// reason and left out.
    pub fn gateway_tasks(&self, gateway_guid: &str) -> Result<Vec<GatewayTask>> {
        let session = self.sessions().get(gateway_guid).ok_or_else(|| {
            Error::Unauthorized(format!("Gateway {} has no session", gateway_guid))
        })?;
        let transit_key = session.envelope_key();

        self.db().run(|s| {
            let gateway = require_gateway(s, gateway_guid)?;
            let mut out = Vec::new();

            for task in s.pending_tasks_for_gateway(gateway.id)? {
                let payload = match self.open_payload(&task.payload) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::error!(task_id = task.id, error = %e, "Task payload unreadable");
                        if s.transition_task(task.id, TaskStatus::Pending, TaskStatus::InProgress, None)? {
                            s.transition_task(
                                task.id,
                                TaskStatus::InProgress,
                                TaskStatus::Failed,
                                Some(&format!("Payload unreadable: {}", e)),
                            )?;
                        }
                        continue;
                    }
                };

                let device_guid = match task.target_device_id {
                    Some(id) => s.get_device(id)?.map(|d| d.device_guid),
                    None => None,
                };
                let subset_identifier = match task.target_subset_id {
                    Some(id) => s.get_subset(id)?.map(|sub| sub.identifier),
                    None => None,
                };

                out.push(GatewayTask {
                    task_id: task.id,
                    task_type: task.task_type,
                    device_guid,
                    subset_identifier,
                    payload: seal_str(&transit_key, &serde_json::to_string(&payload)?)?,
                });
            }

            Ok(out)
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::super::service::test_support::{service, zone};
    use super::*;
    use crate::crypto::{open_str, SessionKey};

    fn once_at(subset_id: i64, at: i64) -> ScheduleRequest {
        ScheduleRequest {
            subset_id,
            schedule_type: ScheduleType::OnceAt,
            schedule_value: at,
            device_guid: None,
            recurrence: None,
        }
    }

    #[test]
    fn test_schedule_validation() {
        let svc = service();
        let (subset, _) = zone(&svc, 1);
        let future = now_timestamp() + 3600;

        assert!(matches!(
            svc.schedule(&once_at(subset.id, now_timestamp() - 10), 1),
            Err(Error::InvalidInput { .. })
        ));

        let mut recurring = once_at(subset.id, future);
        recurring.schedule_type = ScheduleType::Recurrence;
        assert!(matches!(svc.schedule(&recurring, 1), Err(Error::InvalidInput { .. })));

        recurring.recurrence = Some(Recurrence::Monthly);
        let id = svc.schedule(&recurring, 1).unwrap();
        let task = svc.get_task(id).unwrap();
        assert_eq!(task.task_type, TaskType::Recurring);
        assert_eq!(task.status, TaskStatus::Scheduled);
        assert_eq!(task.scheduled_at, Some(future));

        assert!(matches!(
            svc.schedule(&once_at(99, future), 1),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_schedule_rejects_device_from_other_subset() {
        let svc = service();
        zone(&svc, 1);
        let other = svc.register_subset("zone-2", "Zone 2", None, 1).unwrap();

        let mut request = once_at(other.id, now_timestamp() + 60);
        request.device_guid = Some("zone-1.01".into());
        assert!(matches!(svc.schedule(&request, 1), Err(Error::InvalidInput { .. })));
    }

    #[test]
    fn test_report_status_state_machine() {
        let svc = service();
        zone(&svc, 1);
        let id = svc.provision("zone-1.01", 1).unwrap();

        // A pending task must be taken before it can end
        assert!(matches!(
            svc.report_task_status(id, TaskStatus::Completed, None),
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            svc.report_task_status(id, TaskStatus::Failed, None),
            Err(Error::Conflict(_))
        ));

        let task = svc.report_task_status(id, TaskStatus::InProgress, None).unwrap();
        assert!(task.started_at.is_some());

        // Duplicate delivery
        svc.report_task_status(id, TaskStatus::InProgress, None).unwrap();

        let task = svc
            .report_task_status(id, TaskStatus::Completed, Some("Device provisioned"))
            .unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());

        assert!(matches!(
            svc.report_task_status(id, TaskStatus::Failed, None),
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            svc.report_task_status(id, TaskStatus::Scheduled, None),
            Err(Error::InvalidInput { .. })
        ));
        assert!(matches!(
            svc.report_task_status(999, TaskStatus::Completed, None),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_gateway_tasks_resealed_for_session() {
        let svc = service();
        zone(&svc, 2);
        let id = svc.provision("zone-1.01", 1).unwrap();

        assert!(matches!(svc.gateway_tasks("gw-1"), Err(Error::Unauthorized(_))));

        let session = SessionKey::generate();
        svc.sessions().insert("gw-1", session.clone());

        let tasks = svc.gateway_tasks("gw-1").unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_id, id);
        assert_eq!(tasks[0].device_guid.as_deref(), Some("zone-1.01"));

        let json = open_str(&session.envelope_key(), &tasks[0].payload).unwrap();
        let payload: TaskPayload = serde_json::from_str(&json).unwrap();
        assert!(matches!(payload, TaskPayload::Provision(_)));

        // The master-key envelope is not what went out
        assert!(svc.open_payload(&tasks[0].payload).is_err());
    }

    #[test]
    fn test_gateway_tasks_only_pending() {
        let svc = service();
        zone(&svc, 1);
        let id = svc.provision("zone-1.01", 1).unwrap();
        svc.sessions().insert("gw-1", SessionKey::generate());

        svc.report_task_status(id, TaskStatus::InProgress, None).unwrap();
        assert!(svc.gateway_tasks("gw-1").unwrap().is_empty());
    }

    #[test]
    fn test_unreadable_task_failed_through_in_progress() {
        let svc = service();
        let (subset, _) = zone(&svc, 1);
        let gateway = svc.list_gateways().unwrap().remove(0);
        let id = svc
            .db()
            .run(|s| {
                s.insert_task(&NewTask {
                    task_type: TaskType::Provision,
                    target_device_id: None,
                    target_subset_id: Some(subset.id),
                    target_gateway_id: Some(gateway.id),
                    parent_task_id: None,
                    initiated_by: 1,
                    status: TaskStatus::Pending,
                    scheduled_at: None,
                    recurrence: Recurrence::None,
                    payload: "not-a-sealed-payload".into(),
                })
            })
            .unwrap();
        svc.sessions().insert("gw-1", SessionKey::generate());

        assert!(svc.gateway_tasks("gw-1").unwrap().is_empty());
        let task = svc.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.started_at.is_some());
        assert!(task.result_message.unwrap().starts_with("Payload unreadable"));
    }
}
