//! # Due-Task Sweep
//!
//! Runs scheduled and recurring tasks whose time has come. One sweep handles
//! its tasks one after another, oldest first. Each task is claimed with a
//! compare-and-set before any work, so two overlapping sweeps never both
//! run it.
//!
//! ```text
//!  due_tasks(now) ──► claim (scheduled→in_progress) ──► lost? skip
//!                              │ won
//!                              ▼
//!                     fresh refresh nonce
//!                              │
//!            ┌─────────────────┴──────────────────┐
//!            ▼ names a device                     ▼ whole subset
//!     rotation fan-out                     one SCHEDULED_KEY_REFRESH
//!     (child per participant)              child for the subset gateway
//!            └─────────────────┬──────────────────┘
//!                              ▼
//!        completed | completed_no_devices | failed
//!                              │ recurring and not failed
//!                              ▼
//!                 scheduled at next occurrence
//! ```

use serde::Serialize;

use super::service::{require_device_id, require_subset, serving_gateway};
use super::topology::ordered_devices;
use super::KeyService;
use crate::crypto::generate_refresh_nonce;
use crate::derivation::scheduled_refresh_order;
use crate::error::{Error, Result};
use crate::model::{DeviceStatus, Recurrence, TaskStatus, TaskType};
use crate::storage::{NewTask, TaskRecord};
use crate::time::{add_days, add_months, now_timestamp};
use crate::wire::TaskPayload;

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub due: usize,
    pub skipped: usize,
    pub completed: usize,
    pub completed_no_devices: usize,
    pub failed: usize,
    pub rescheduled: usize,
}

enum DueOutcome {
    Spawned(usize),
    NoDevices,
}

/// Next run of a recurring task strictly after `now`
pub fn next_occurrence(scheduled_at: i64, recurrence: Recurrence, now: i64) -> Result<Option<i64>> {
    let step = |ts: i64| match recurrence {
        Recurrence::None => Ok(None),
        Recurrence::Weekly => add_days(ts, 7).map(Some),
        Recurrence::Monthly => add_months(ts, 1).map(Some),
    };

    let mut next = match step(scheduled_at)? {
        Some(ts) => ts,
        None => return Ok(None),
    };
    // A long outage should not cause a burst of catch-up runs
    while next <= now {
        next = match step(next)? {
            Some(ts) => ts,
            None => return Ok(None),
        };
    }
    Ok(Some(next))
}

impl KeyService {
    /// Atomically move a scheduled task to `in_progress`.
    ///
    /// Returns whether this caller won the task.
    pub fn claim_due(&self, task_id: i64) -> Result<bool> {
        self.db()
            .run(|s| s.transition_task(task_id, TaskStatus::Scheduled, TaskStatus::InProgress, None))
    }

    pub fn run_due_sweep(&self) -> Result<SweepReport> {
        self.run_due_sweep_at(now_timestamp())
    }

    /// Process every task due at `now`
    pub fn run_due_sweep_at(&self, now: i64) -> Result<SweepReport> {
        let due = self.db().run(|s| s.due_tasks(now))?;
        let mut report = SweepReport {
            due: due.len(),
            ..Default::default()
        };

        for task in due {
            if !self.claim_due(task.id)? {
                tracing::debug!(task_id = task.id, "Due task already claimed");
                report.skipped += 1;
                continue;
            }

            // A claimed task must never be left in_progress
            let status = match self.settle_due(&task, now) {
                Ok((status, rescheduled)) => {
                    if rescheduled {
                        report.rescheduled += 1;
                    }
                    status
                }
                Err(e) => {
                    tracing::error!(task_id = task.id, error = %e, "Failed to settle due task");
                    let message = format!("Failed to settle: {}", e);
                    if let Err(e) = self.db().run(|s| {
                        s.transition_task(task.id, TaskStatus::InProgress, TaskStatus::Failed, Some(&message))
                    }) {
                        tracing::error!(task_id = task.id, error = %e, "Failed to mark due task failed");
                    }
                    TaskStatus::Failed
                }
            };

            match status {
                TaskStatus::Completed => report.completed += 1,
                TaskStatus::CompletedNoDevices => report.completed_no_devices += 1,
                _ => report.failed += 1,
            }
        }

        Ok(report)
    }

    /// Run a claimed task and record its outcome.
    ///
    /// Returns the outcome and whether the task went back to `scheduled`.
    fn settle_due(&self, task: &TaskRecord, now: i64) -> Result<(TaskStatus, bool)> {
        let (status, message) = match self.process_due(task) {
            Ok(DueOutcome::Spawned(n)) => {
                (TaskStatus::Completed, format!("Spawned {} child task(s)", n))
            }
            Ok(DueOutcome::NoDevices) => (
                TaskStatus::CompletedNoDevices,
                "No active devices to refresh".to_string(),
            ),
            Err(e) => {
                tracing::warn!(task_id = task.id, error = %e, "Due task failed");
                (TaskStatus::Failed, e.to_string())
            }
        };

        let next = if status == TaskStatus::Failed || task.task_type != TaskType::Recurring {
            None
        } else {
            let scheduled_at = task.scheduled_at.unwrap_or(now);
            next_occurrence(scheduled_at, task.recurrence, now)?
        };

        match next {
            Some(next_at) => {
                self.db()
                    .run(|s| s.reschedule_task(task.id, next_at, &message))?;
                tracing::info!(task_id = task.id, next_at, "{}; rescheduled", message);
                Ok((status, true))
            }
            None => {
                self.db().run(|s| {
                    s.transition_task(task.id, TaskStatus::InProgress, status, Some(&message))
                })?;
                tracing::info!(task_id = task.id, status = %status, "{}", message);
                Ok((status, false))
            }
        }
    }

    fn process_due(&self, task: &TaskRecord) -> Result<DueOutcome> {
        let nonce = generate_refresh_nonce();

        self.db().transaction(|s| {
            let subset_id = task
                .target_subset_id
                .ok_or_else(|| Error::Internal(format!("Task {} has no subset", task.id)))?;
            let subset = require_subset(s, subset_id)?;

            if let Some(device_id) = task.target_device_id {
                let device = require_device_id(s, device_id)?;
                if !device.status.is_operational() {
                    return Ok(DueOutcome::NoDevices);
                }
                let ids = self.spawn_rotation(s, &device, &nonce, Some(task.id), task.initiated_by)?;
                return Ok(DueOutcome::Spawned(ids.len()));
            }

            let operational: Vec<_> = ordered_devices(s, subset.id)?
                .into_iter()
                .filter(|d| d.status.is_operational())
                .collect();
            if operational.is_empty() {
                return Ok(DueOutcome::NoDevices);
            }

            let gateway = serving_gateway(s, &subset)?;
            let order = scheduled_refresh_order(&subset.identifier, &nonce, task.id);
            s.insert_task(&NewTask {
                task_type: TaskType::RefreshPairwiseKeys,
                target_device_id: None,
                target_subset_id: Some(subset.id),
                target_gateway_id: Some(gateway.id),
                parent_task_id: Some(task.id),
                initiated_by: task.initiated_by,
                status: TaskStatus::Pending,
                scheduled_at: None,
                recurrence: Recurrence::None,
                payload: self.seal_payload(&TaskPayload::Refresh(order))?,
            })?;
            for device in &operational {
                s.set_device_status(device.id, DeviceStatus::KeyRefreshPending)?;
            }

            Ok(DueOutcome::Spawned(1))
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::super::service::test_support::{service, zone};
    use super::super::tasks::ScheduleRequest;
    use super::*;
    use crate::model::{KeyType, RefreshInstruction, ScheduleType};

    fn ts(s: &str) -> i64 {
        chrono::DateTime::parse_from_rfc3339(s).unwrap().timestamp()
    }

    fn schedule(svc: &KeyService, subset_id: i64, recurrence: Option<Recurrence>, at: i64) -> i64 {
        svc.schedule(
            &ScheduleRequest {
                subset_id,
                schedule_type: if recurrence.is_some() {
                    ScheduleType::Recurrence
                } else {
                    ScheduleType::OnceAt
                },
                schedule_value: at,
                device_guid: None,
                recurrence,
            },
            1,
        )
        .unwrap()
    }

    #[test]
    fn test_next_occurrence() {
        let t = ts("2025-01-31T10:00:00Z");
        assert_eq!(
            next_occurrence(t, Recurrence::Weekly, t).unwrap(),
            Some(ts("2025-02-07T10:00:00Z"))
        );
        assert_eq!(
            next_occurrence(t, Recurrence::Monthly, t).unwrap(),
            Some(ts("2025-02-28T10:00:00Z"))
        );
        assert_eq!(next_occurrence(t, Recurrence::None, t).unwrap(), None);
        // Skips past missed runs
        assert_eq!(
            next_occurrence(t, Recurrence::Weekly, ts("2025-02-10T00:00:00Z")).unwrap(),
            Some(ts("2025-02-14T10:00:00Z"))
        );
    }

    #[test]
    fn test_weekly_task_reschedules() {
        let svc = service();
        let (subset, _) = zone(&svc, 2);
        svc.update_device_status("zone-1.01", DeviceStatus::Running).unwrap();

        let t = now_timestamp() + 60;
        let id = schedule(&svc, subset.id, Some(Recurrence::Weekly), t);

        let report = svc.run_due_sweep_at(t).unwrap();
        assert_eq!(report.due, 1);
        assert_eq!(report.rescheduled, 1);

        let task = svc.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Scheduled);
        assert_eq!(task.scheduled_at, Some(add_days(t, 7).unwrap()));
        assert_eq!(task.result_message.as_deref(), Some("Spawned 1 child task(s)"));

        let children = svc.child_tasks(id).unwrap();
        assert_eq!(children.len(), 1);
        match svc.open_payload(&children[0].payload).unwrap() {
            TaskPayload::Refresh(order) => {
                assert_eq!(order.instruction, RefreshInstruction::ScheduledRefresh);
                assert_eq!(order.target_subset_identifier.as_deref(), Some("zone-1"));
                assert_eq!(order.parent_task_id, Some(id));
            }
            other => panic!("unexpected payload {:?}", other),
        }

        // Not due again until next week
        assert_eq!(svc.run_due_sweep_at(t + 1).unwrap().due, 0);
    }

    #[test]
    fn test_once_at_without_devices() {
        let svc = service();
        let (subset, _) = zone(&svc, 1);
        let t = now_timestamp() + 60;
        let id = schedule(&svc, subset.id, None, t);

        let report = svc.run_due_sweep_at(t).unwrap();
        assert_eq!(report.completed_no_devices, 1);

        let task = svc.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::CompletedNoDevices);
        assert!(svc.child_tasks(id).unwrap().is_empty());
    }

    #[test]
    fn test_device_schedule_fans_out_with_one_nonce() {
        let svc = service();
        let (subset, _) = zone(&svc, 3);
        for peer in ["zone-1.02", "zone-1.03"] {
            svc.create_or_update_key("zone-1.01", Some(peer), KeyType::Pairwise, "h", None)
                .unwrap();
        }
        svc.update_device_status("zone-1.01", DeviceStatus::Running).unwrap();

        let t = now_timestamp() + 60;
        let id = svc
            .schedule(
                &ScheduleRequest {
                    subset_id: subset.id,
                    schedule_type: ScheduleType::OnceAt,
                    schedule_value: t,
                    device_guid: Some("zone-1.01".into()),
                    recurrence: None,
                },
                1,
            )
            .unwrap();

        svc.run_due_sweep_at(t).unwrap();
        assert_eq!(svc.get_task(id).unwrap().status, TaskStatus::Completed);

        let children = svc.child_tasks(id).unwrap();
        assert_eq!(children.len(), 3);
        let nonces: Vec<String> = children
            .iter()
            .map(|c| match svc.open_payload(&c.payload).unwrap() {
                TaskPayload::Refresh(order) => order.refresh_nonce,
                other => panic!("unexpected payload {:?}", other),
            })
            .collect();
        assert!(nonces.iter().all(|n| *n == nonces[0]));
    }

    #[test]
    fn test_claim_is_exclusive() {
        let svc = service();
        let (subset, _) = zone(&svc, 1);
        let id = schedule(&svc, subset.id, None, now_timestamp() + 60);

        assert!(svc.claim_due(id).unwrap());
        assert!(!svc.claim_due(id).unwrap());

        // A sweep that sees the task but loses the claim skips it
        let report = svc.run_due_sweep_at(now_timestamp() + 120).unwrap();
        assert_eq!(report.due, 0);
    }

    #[test]
    fn test_missing_gateway_fails_task() {
        let svc = service();
        let subset = svc.register_subset("zone-1", "Zone 1", None, 1).unwrap();
        svc.register_device(subset.id, "01", None, None, None, 1).unwrap();
        svc.update_device_status("zone-1.01", DeviceStatus::Active).unwrap();

        let t = now_timestamp() + 60;
        let id = schedule(&svc, subset.id, Some(Recurrence::Monthly), t);
        let report = svc.run_due_sweep_at(t).unwrap();
        assert_eq!(report.failed, 1);

        let task = svc.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.result_message.unwrap().contains("No online gateway"));
        // Failed recurring tasks are not retried
        assert_eq!(svc.run_due_sweep_at(add_months(t, 2).unwrap()).unwrap().due, 0);
    }

    #[test]
    fn test_offline_gateway_fails_task() {
        let svc = service();
        let subset = svc.register_subset("zone-1", "Zone 1", None, 1).unwrap();
        svc.register_device(subset.id, "01", None, None, None, 1).unwrap();
        svc.update_device_status("zone-1.01", DeviceStatus::Active).unwrap();
        svc.register_gateway("gw-1", None, Some(subset.id), None).unwrap();

        let t = now_timestamp() + 60;
        let id = schedule(&svc, subset.id, None, t);
        assert_eq!(svc.run_due_sweep_at(t).unwrap().failed, 1);
        assert_eq!(svc.get_task(id).unwrap().status, TaskStatus::Failed);
        assert!(svc.child_tasks(id).unwrap().is_empty());
        assert_eq!(svc.get_device("zone-1.01").unwrap().status, DeviceStatus::Active);
    }

    #[test]
    fn test_unsettled_task_fails_and_sweep_continues() {
        let svc = service();
        let (subset, _) = zone(&svc, 1);

        // Next weekly run would fall past the last representable date
        let t = chrono::DateTime::<chrono::Utc>::MAX_UTC.timestamp() - 86_400;
        let stuck = schedule(&svc, subset.id, Some(Recurrence::Weekly), t);
        let later = schedule(&svc, subset.id, None, t + 10);

        let report = svc.run_due_sweep_at(t + 10).unwrap();
        assert_eq!(report.due, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.completed_no_devices, 1);
        assert_eq!(report.rescheduled, 0);

        let task = svc.get_task(stuck).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.result_message.unwrap().contains("Date overflow"));
        assert_eq!(svc.get_task(later).unwrap().status, TaskStatus::CompletedNoDevices);
    }
}
