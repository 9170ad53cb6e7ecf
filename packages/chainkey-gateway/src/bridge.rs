//! # Gateway Bridge
//!
//! Moves work between the control plane and the devices of one gateway.
//!
//! ```text
//!  control plane                     bridge                          devices
//!  ─────────────                     ──────                          ───────
//!  authenticate ◄─── signed {gatewayGuid, timestamp}
//!               ───► sealed session key ──► open, keep in memory
//!
//!  GET tasks    ───► take: PATCH in_progress (not taken: stays pending)
//!                    open payload (session key)
//!                    provision ─────────────────► <gw>/devices/<d>/config   (retained)
//!                    refresh (all / specific) ──► <gw>/devices/<d>/commands (retained)
//!                    refresh (scheduled) ───────► subsets/<s>/key_refresh
//!                    revocation ── deny-list ───► subsets/<s>/broadcast_alerts
//!  PATCH task   ◄─── completed (revocation) | failed
//!
//!  reports      ◄─── dispatch by status_type ◄── <gw>/devices/+/status
//! ```
//!
//! Messages from deny-listed devices are dropped before dispatch.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use chainkey_core::control::{signing_bytes, AuthRequest};
use chainkey_core::crypto::{open_from_server, open_str, sign, SessionKey};
use chainkey_core::model::{
    DeviceStatus, KeyStatus, KeyType, RefreshInstruction, StatusType, TaskStatus, TaskType,
};
use chainkey_core::wire::{
    DeviceCommand, GatewayTask, ProvisioningConfig, RefreshOrder, RevocationNotice,
    StatusMessage, TaskPayload,
};
use chainkey_core::{Error, Result};

use crate::broker::{BrokerMessage, Delivery};
use crate::client::{Credentials, DeviceKeyReport, KeyRefreshReport};
use crate::state::{GatewayState, Session};

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ============================================================================
// AUTHENTICATION
// ============================================================================

/// Run the trust handshake once and install the session.
pub async fn authenticate(state: &GatewayState) -> Result<()> {
    let guid = state.config.gateway_guid.clone();
    let payload = serde_json::json!({
        "gatewayGuid": guid,
        "timestamp": timestamp(),
    });
    let signature = sign(&state.keys.signing, &signing_bytes(&payload)?);

    let grant = state
        .control
        .authenticate(&AuthRequest {
            gateway_guid: guid.clone(),
            payload,
            signature: signature.to_hex(),
        })
        .await?;

    let raw = open_from_server(&state.keys.encryption, &grant.encrypted_session_key)?;
    let key = SessionKey::from_slice(&raw)?;
    state.set_session(key)?;

    tracing::info!(gateway = %guid, "Authenticated with control plane");
    Ok(())
}

/// Retry authentication until it succeeds.
pub async fn run_auth_loop(state: &GatewayState) {
    let retry = Duration::from_secs(state.config.auth_retry_secs);
    loop {
        match authenticate(state).await {
            Ok(()) => return,
            Err(e) => {
                tracing::warn!(error = %e, retry_secs = retry.as_secs(), "Authentication failed");
                tokio::time::sleep(retry).await;
            }
        }
    }
}

// ============================================================================
// TASK POLLING
// ============================================================================

/// What one poll did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollReport {
    /// No session was held, nothing was fetched
    pub skipped: bool,
    pub fetched: usize,
    pub dispatched: usize,
    pub failed: usize,
    /// Could not be taken; still pending for the next poll
    pub deferred: usize,
}

/// What a dispatched task turned into
enum Dispatch {
    /// Published to devices; the task stays in progress
    Published(Delivery),
    /// Handled entirely at the gateway
    Done(String),
}

/// Fetch pending tasks and dispatch each one.
pub async fn poll_once(state: &GatewayState) -> Result<PollReport> {
    let (creds, session) = match (state.credentials(), state.session()) {
        (Some(creds), Some(session)) => (creds, session),
        _ => {
            tracing::debug!("No session; skipping task poll");
            return Ok(PollReport {
                skipped: true,
                ..PollReport::default()
            });
        }
    };

    let tasks = match state.control.fetch_tasks(&creds).await {
        Ok(tasks) => tasks,
        Err(Error::Unauthorized(reason)) => {
            tracing::warn!(%reason, "Session rejected; re-authentication required");
            state.clear_session();
            return Err(Error::Unauthorized(reason));
        }
        Err(e) => return Err(e),
    };

    let mut report = PollReport {
        fetched: tasks.len(),
        ..PollReport::default()
    };
    for task in tasks {
        match dispatch_task(state, &creds, &session, &task).await {
            Ok(true) => report.dispatched += 1,
            Ok(false) => report.failed += 1,
            Err(e) => {
                tracing::warn!(task_id = task.task_id, error = %e, "Could not take task; left pending");
                report.deferred += 1;
            }
        }
    }
    Ok(report)
}

/// Poll on the configured interval, re-authenticating when the session
/// is gone.
pub async fn run_poll_loop(state: &GatewayState) {
    let mut interval = tokio::time::interval(Duration::from_secs(state.config.poll_interval_secs));
    loop {
        interval.tick().await;
        if !state.has_session() {
            if let Err(e) = authenticate(state).await {
                tracing::warn!(error = %e, "Re-authentication failed");
                continue;
            }
        }
        match poll_once(state).await {
            Ok(report) if report.fetched > 0 => {
                tracing::info!(
                    fetched = report.fetched,
                    dispatched = report.dispatched,
                    failed = report.failed,
                    deferred = report.deferred,
                    "Task poll finished"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Task poll failed"),
        }
    }
}

/// Take one task, act on it and report the result.
///
/// The task is reported `in_progress` before anything is published. If that
/// report fails nothing happens and the error is returned, so the task stays
/// pending. Otherwise returns whether dispatch succeeded; tasks handled
/// entirely at the gateway are then reported `completed`, failures `failed`.
pub async fn dispatch_task(
    state: &GatewayState,
    creds: &Credentials,
    session: &Session,
    task: &GatewayTask,
) -> Result<bool> {
    state
        .control
        .report_task_status(creds, task.task_id, TaskStatus::InProgress, None)
        .await?;

    let result = match open_str(&session.key.envelope_key(), &task.payload) {
        Ok(json) => match serde_json::from_str::<TaskPayload>(&json) {
            Ok(payload) => route_task(state, task, payload),
            Err(e) => Err(Error::SerializationError(format!("Task payload malformed: {}", e))),
        },
        Err(e) => Err(Error::CryptoFailure(format!("Task payload undecryptable: {}", e))),
    };

    let outcome = match &result {
        Ok(Dispatch::Published(delivery)) => {
            tracing::info!(
                task_id = task.task_id,
                task_type = %task.task_type,
                topic = %delivery.topic,
                matched = delivery.matched,
                "Task published"
            );
            None
        }
        Ok(Dispatch::Done(message)) => Some((TaskStatus::Completed, message.clone())),
        Err(e) => {
            tracing::error!(task_id = task.task_id, error = %e, "Task dispatch failed");
            Some((TaskStatus::Failed, e.to_string()))
        }
    };

    if let Some((status, message)) = outcome {
        if let Err(e) = state
            .control
            .report_task_status(creds, task.task_id, status, Some(&message))
            .await
        {
            tracing::warn!(task_id = task.task_id, error = %e, "Failed to report task status");
        }
    }
    Ok(result.is_ok())
}

fn route_task(state: &GatewayState, task: &GatewayTask, payload: TaskPayload) -> Result<Dispatch> {
    match (task.task_type, payload) {
        (TaskType::Provision, TaskPayload::Provision(record)) => {
            let topic = state.topics.config(&record.device_guid);
            let config = ProvisioningConfig {
                task_id: task.task_id,
                record,
            };
            let delivery = state
                .broker
                .publish(&topic, serde_json::to_value(&config)?, true)?;
            Ok(Dispatch::Published(delivery))
        }
        (TaskType::RefreshPairwiseKeys, TaskPayload::Refresh(order)) => {
            publish_refresh(state, task, order).map(Dispatch::Published)
        }
        (TaskType::ProcessDeviceRevocation, TaskPayload::Revocation(notice)) => {
            broadcast_revocation(state, &notice).map(Dispatch::Done)
        }
        (task_type, payload) => Err(Error::invalid(
            "payload",
            format!("{} payload does not fit a {} task", payload_kind(&payload), task_type),
        )),
    }
}

fn payload_kind(payload: &TaskPayload) -> &'static str {
    match payload {
        TaskPayload::Provision(_) => "provision",
        TaskPayload::Revocation(_) => "revocation",
        TaskPayload::Refresh(_) => "refresh",
        TaskPayload::Schedule(_) => "schedule",
    }
}

fn publish_refresh(state: &GatewayState, task: &GatewayTask, order: RefreshOrder) -> Result<Delivery> {
    let issuer = state.config.gateway_guid.clone();
    let device = || {
        order
            .device_guid
            .clone()
            .or_else(|| task.device_guid.clone())
            .ok_or_else(|| Error::invalid("deviceGuid", "refresh order names no device"))
    };

    let (topic, command) = match order.instruction {
        RefreshInstruction::RefreshAllRelated => {
            let device = device()?;
            let command = DeviceCommand::RefreshAllRelated {
                refresh_nonce: order.refresh_nonce.clone(),
                triggering_device_guid: order
                    .triggering_device_guid
                    .clone()
                    .unwrap_or_else(|| device.clone()),
                issuer,
                task_id: task.task_id,
                timestamp: timestamp(),
            };
            (state.topics.commands(&device), command)
        }
        RefreshInstruction::RefreshSpecific => {
            let device = device()?;
            let peer = order
                .target_peer_guid
                .clone()
                .ok_or_else(|| Error::invalid("targetPeerGuid", "required for a specific refresh"))?;
            let command = DeviceCommand::RefreshSpecific {
                refresh_nonce: order.refresh_nonce.clone(),
                target_peer_guid: peer,
                issuer,
                task_id: task.task_id,
                timestamp: timestamp(),
            };
            (state.topics.commands(&device), command)
        }
        RefreshInstruction::ScheduledRefresh => {
            let subset = order
                .target_subset_identifier
                .clone()
                .or_else(|| task.subset_identifier.clone())
                .ok_or_else(|| {
                    Error::invalid("targetSubsetIdentifier", "required for a scheduled refresh")
                })?;
            let command = DeviceCommand::ScheduledKeyRefresh {
                refresh_nonce: order.refresh_nonce.clone(),
                issuer,
                task_id: task.task_id,
                timestamp: timestamp(),
            };
            (state.topics.key_refresh(&subset), command)
        }
    };

    state
        .broker
        .publish(&topic, serde_json::to_value(&command)?, true)
}

/// Deny-list the device, drop its retained material and alert the subset.
fn broadcast_revocation(state: &GatewayState, notice: &RevocationNotice) -> Result<String> {
    let guid = &notice.revoked_device_guid;
    state.deny(guid);
    state.broker.clear_retained(&state.topics.config(guid));
    state.broker.clear_retained(&state.topics.commands(guid));

    let alert = DeviceCommand::RevocationAlert {
        revoked_guid: guid.clone(),
        issuer: state.config.gateway_guid.clone(),
        timestamp: timestamp(),
    };
    let topic = state.topics.broadcast_alerts(&notice.revoked_subset_identifier);
    let delivery = state
        .broker
        .publish(&topic, serde_json::to_value(&alert)?, true)?;

    tracing::info!(
        device_guid = %guid,
        subset = %notice.revoked_subset_identifier,
        matched = delivery.matched,
        "Revocation broadcast"
    );
    Ok(format!("Revocation of {} broadcast to subset {}", guid, notice.revoked_subset_identifier))
}

// ============================================================================
// STATUS DISPATCH
// ============================================================================

/// What became of one status message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    Applied,
    /// Sender is deny-listed
    Dropped,
    /// Malformed or of a kind this gateway does not handle
    Ignored,
}

/// Apply one device acknowledgment.
pub async fn handle_status(state: &GatewayState, msg: &BrokerMessage) -> Result<StatusOutcome> {
    let status: StatusMessage = match serde_json::from_value(msg.payload.clone()) {
        Ok(status) => status,
        Err(e) => {
            tracing::warn!(topic = %msg.topic, error = %e, "Malformed status message");
            return Ok(StatusOutcome::Ignored);
        }
    };

    let topic_guid = state.topics.device_from_status(&msg.topic);
    let device = status.device_guid.as_str();
    if state.is_revoked(device) || topic_guid.as_deref().is_some_and(|g| state.is_revoked(g)) {
        tracing::debug!(device_guid = %device, "Dropping message from revoked device");
        return Ok(StatusOutcome::Dropped);
    }
    if let Some(topic_guid) = topic_guid.as_deref().filter(|g| *g != device) {
        tracing::warn!(
            topic_device = %topic_guid,
            payload_device = %device,
            "Status topic and payload name different devices; using payload"
        );
    }

    let Some(kind) = status.kind() else {
        tracing::info!(
            device_guid = %device,
            status_type = %status.status_type,
            "Unrecognized status type"
        );
        return Ok(StatusOutcome::Ignored);
    };

    let creds = state
        .credentials()
        .ok_or_else(|| Error::Unauthorized("No session with the control plane".into()))?;
    let control = &state.control;

    match kind {
        StatusType::Provisioned => {
            if let Some(task_id) = status.task_id {
                control
                    .report_task_status(&creds, task_id, TaskStatus::Completed, Some("Device provisioned"))
                    .await?;
            }
            control
                .report_device_status(&creds, device, DeviceStatus::Active)
                .await?;
        }
        StatusType::PairwiseKeyEstablished => {
            let (Some(peer), Some(key_hash)) = (status.peer_device_guid.as_deref(), status.key_hash.as_deref())
            else {
                tracing::warn!(device_guid = %device, "Key establishment without peer or hash");
                return Ok(StatusOutcome::Ignored);
            };
            control
                .report_device_key(
                    &creds,
                    &DeviceKeyReport {
                        owner_device_guid: device.to_string(),
                        peer_device_guid: Some(peer.to_string()),
                        key_type: KeyType::Pairwise,
                        key_hash: key_hash.to_string(),
                        key_status: KeyStatus::Active,
                    },
                )
                .await?;
            control
                .report_device_status(&creds, device, DeviceStatus::Running)
                .await?;
            control
                .report_device_status(&creds, peer, DeviceStatus::Running)
                .await?;
        }
        StatusType::PairwiseKeyRefreshProcessed => {
            if let Some(task_id) = status.task_id {
                control
                    .report_task_status(
                        &creds,
                        task_id,
                        TaskStatus::Completed,
                        Some("Pairwise key refresh processed"),
                    )
                    .await?;
            }
            control
                .report_key_refresh(
                    &creds,
                    &KeyRefreshReport {
                        device_guid: device.to_string(),
                        was_central_refresh: status.was_central_refresh,
                        refreshed_peer_guid: status.refreshed_peer_guid.clone(),
                        new_key_hash: status.new_key_hash.clone(),
                        task_id: status.task_id,
                    },
                )
                .await?;
            control
                .report_device_status(&creds, device, DeviceStatus::Running)
                .await?;
        }
        StatusType::ScheduledKeyRefreshCompleted => {
            if let Some(task_id) = status.task_id {
                control
                    .report_task_status(
                        &creds,
                        task_id,
                        TaskStatus::Completed,
                        Some("Scheduled key refresh acknowledged"),
                    )
                    .await?;
            }
            control
                .report_device_status(&creds, device, DeviceStatus::Running)
                .await?;
        }
    }

    tracing::debug!(device_guid = %device, status_type = %kind, "Status applied");
    Ok(StatusOutcome::Applied)
}

/// Consume status messages from a local broker subscription.
pub async fn run_status_loop(state: &GatewayState, mut rx: mpsc::UnboundedReceiver<BrokerMessage>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = handle_status(state, &msg).await {
            tracing::warn!(topic = %msg.topic, error = %e, "Status dispatch failed");
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::client::ControlPlane;
    use crate::config::GatewayConfig;
    use chainkey_core::control::AuthGrant;
    use chainkey_core::crypto::{
        seal_for_gateway, seal_str, verify, GatewayKeyPair, GatewayPublicKey, Signature,
    };
    use chainkey_core::wire::ProvisioningRecord;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Call {
        TaskStatus(i64, TaskStatus, Option<String>),
        DeviceStatus(String, DeviceStatus),
        DeviceKey(DeviceKeyReport),
        KeyRefresh(KeyRefreshReport),
    }

    /// Records every report and serves canned tasks
    pub(crate) struct FakeControl {
        public_key: GatewayPublicKey,
        pub session: SessionKey,
        pub tasks: Mutex<Vec<GatewayTask>>,
        pub calls: Mutex<Vec<Call>>,
        pub reject_fetch: AtomicBool,
        pub reject_status: AtomicBool,
    }

    impl FakeControl {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl ControlPlane for FakeControl {
        async fn authenticate(&self, request: &AuthRequest) -> Result<AuthGrant> {
            let signature = Signature::from_hex(&request.signature)?;
            verify(
                &self.public_key.signing,
                &signing_bytes(&request.payload)?,
                &signature,
            )?;
            assert_eq!(request.payload["gatewayGuid"], request.gateway_guid.as_str());
            assert!(request.payload["timestamp"].is_string());
            Ok(AuthGrant {
                gateway_guid: request.gateway_guid.clone(),
                encrypted_session_key: seal_for_gateway(&self.public_key, self.session.as_bytes())?,
            })
        }

        async fn fetch_tasks(&self, _creds: &Credentials) -> Result<Vec<GatewayTask>> {
            if self.reject_fetch.load(Ordering::SeqCst) {
                return Err(Error::Unauthorized("Invalid gateway token".into()));
            }
            Ok(self.tasks.lock().drain(..).collect())
        }

        async fn report_task_status(
            &self,
            _creds: &Credentials,
            task_id: i64,
            status: TaskStatus,
            result_message: Option<&str>,
        ) -> Result<()> {
            if self.reject_status.load(Ordering::SeqCst) {
                return Err(Error::TransportError("Control plane unreachable".into()));
            }
            self.calls.lock().push(Call::TaskStatus(
                task_id,
                status,
                result_message.map(str::to_string),
            ));
            Ok(())
        }

        async fn report_device_status(
            &self,
            _creds: &Credentials,
            device_guid: &str,
            status: DeviceStatus,
        ) -> Result<()> {
            self.calls
                .lock()
                .push(Call::DeviceStatus(device_guid.to_string(), status));
            Ok(())
        }

        async fn report_device_key(&self, _creds: &Credentials, report: &DeviceKeyReport) -> Result<()> {
            self.calls.lock().push(Call::DeviceKey(report.clone()));
            Ok(())
        }

        async fn report_key_refresh(
            &self,
            _creds: &Credentials,
            report: &KeyRefreshReport,
        ) -> Result<()> {
            self.calls.lock().push(Call::KeyRefresh(report.clone()));
            Ok(())
        }
    }

    /// Gateway `gw-1` wired to a fake control plane, no session yet
    pub(crate) fn test_state() -> (GatewayState, Arc<FakeControl>) {
        let keys = GatewayKeyPair::generate();
        let control = Arc::new(FakeControl {
            public_key: keys.public_key(),
            session: SessionKey::generate(),
            tasks: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            reject_fetch: AtomicBool::new(false),
            reject_status: AtomicBool::new(false),
        });
        let config = GatewayConfig {
            gateway_guid: "gw-1".into(),
            ..GatewayConfig::default()
        };
        let state = GatewayState::new(config, keys, control.clone());
        (state, control)
    }

    fn sealed_task(
        control: &FakeControl,
        task_id: i64,
        task_type: TaskType,
        payload: &TaskPayload,
    ) -> GatewayTask {
        GatewayTask {
            task_id,
            task_type,
            device_guid: None,
            subset_identifier: Some("zone-1".into()),
            payload: seal_str(
                &control.session.envelope_key(),
                &serde_json::to_string(payload).unwrap(),
            )
            .unwrap(),
        }
    }

    fn status_msg(state: &GatewayState, topic_device: &str, payload: serde_json::Value) -> BrokerMessage {
        BrokerMessage {
            topic: state.topics.status(topic_device),
            payload,
            retained: false,
        }
    }

    #[tokio::test]
    async fn test_authenticate_installs_session() {
        let (state, control) = test_state();
        assert!(!state.has_session());

        authenticate(&state).await.unwrap();
        let creds = state.credentials().unwrap();
        assert_eq!(creds.gateway_guid, "gw-1");
        assert_eq!(creds.token, control.session.token().unwrap());
    }

    #[tokio::test]
    async fn test_poll_skipped_without_session() {
        let (state, _control) = test_state();
        let report = poll_once(&state).await.unwrap();
        assert!(report.skipped);
        assert_eq!(report.fetched, 0);
    }

    #[tokio::test]
    async fn test_provision_task_published_retained() {
        let (state, control) = test_state();
        state.set_session(control.session.clone()).unwrap();

        let record = ProvisioningRecord {
            subset_identifier: "zone-1".into(),
            device_guid: "zone-1.01".into(),
            secret: "s1".into(),
            vc: vec!["s1".into(), "s2".into()],
            vp: vec![],
            vn: vec![],
            alpha: 5,
            previous_subset_identifier: None,
            next_subset_identifier: None,
        };
        control.tasks.lock().push(sealed_task(
            &control,
            11,
            TaskType::Provision,
            &TaskPayload::Provision(record),
        ));

        let report = poll_once(&state).await.unwrap();
        assert_eq!(report.dispatched, 1);

        let retained = state
            .broker
            .retained(&state.topics.config("zone-1.01"))
            .unwrap();
        assert_eq!(retained["taskId"], 11);
        assert_eq!(retained["Vc"][1], "s2");
        assert_eq!(
            control.calls(),
            vec![Call::TaskStatus(11, TaskStatus::InProgress, None)]
        );
    }

    #[tokio::test]
    async fn test_undecryptable_payload_reports_failed() {
        let (state, control) = test_state();
        state.set_session(control.session.clone()).unwrap();

        let mut task = sealed_task(
            &control,
            12,
            TaskType::Provision,
            &TaskPayload::Revocation(RevocationNotice {
                revoked_device_guid: "zone-1.01".into(),
                revoked_subset_identifier: "zone-1".into(),
            }),
        );
        task.payload = seal_str(&SessionKey::generate().envelope_key(), "{}").unwrap();
        control.tasks.lock().push(task);

        let report = poll_once(&state).await.unwrap();
        assert_eq!(report.failed, 1);
        let calls = control.calls();
        assert_eq!(calls[0], Call::TaskStatus(12, TaskStatus::InProgress, None));
        match &calls[1] {
            Call::TaskStatus(12, TaskStatus::Failed, Some(reason)) => {
                assert!(reason.contains("undecryptable"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mismatched_payload_reports_failed() {
        let (state, control) = test_state();
        state.set_session(control.session.clone()).unwrap();
        control.tasks.lock().push(sealed_task(
            &control,
            13,
            TaskType::Provision,
            &TaskPayload::Revocation(RevocationNotice {
                revoked_device_guid: "zone-1.01".into(),
                revoked_subset_identifier: "zone-1".into(),
            }),
        ));

        assert_eq!(poll_once(&state).await.unwrap().failed, 1);
        assert!(matches!(
            control.calls()[1],
            Call::TaskStatus(13, TaskStatus::Failed, _)
        ));
        assert!(!state.is_revoked("zone-1.01"));
    }

    #[tokio::test]
    async fn test_refresh_commands_routed() {
        let (state, control) = test_state();
        state.set_session(control.session.clone()).unwrap();
        let mut broadcast = state
            .broker
            .subscribe_local(&state.topics.key_refresh("zone-1"))
            .unwrap();

        let specific = RefreshOrder {
            instruction: RefreshInstruction::RefreshSpecific,
            refresh_nonce: "n1".into(),
            device_guid: Some("zone-1.02".into()),
            triggering_device_guid: None,
            target_peer_guid: Some("zone-1.01".into()),
            target_subset_identifier: None,
            parent_task_id: None,
        };
        let scheduled = RefreshOrder {
            instruction: RefreshInstruction::ScheduledRefresh,
            refresh_nonce: "n2".into(),
            device_guid: None,
            triggering_device_guid: None,
            target_peer_guid: None,
            target_subset_identifier: Some("zone-1".into()),
            parent_task_id: Some(3),
        };
        {
            let mut tasks = control.tasks.lock();
            tasks.push(sealed_task(
                &control,
                21,
                TaskType::RefreshPairwiseKeys,
                &TaskPayload::Refresh(specific),
            ));
            tasks.push(sealed_task(
                &control,
                22,
                TaskType::RefreshPairwiseKeys,
                &TaskPayload::Refresh(scheduled),
            ));
        }

        assert_eq!(poll_once(&state).await.unwrap().dispatched, 2);

        let command = state
            .broker
            .retained(&state.topics.commands("zone-1.02"))
            .unwrap();
        assert_eq!(command["type"], "REFRESH_SPECIFIC_PAIRWISE_KEY");
        assert_eq!(command["targetPeerGuid"], "zone-1.01");
        assert_eq!(command["issuer"], "gw-1");

        let msg = broadcast.recv().await.unwrap();
        assert_eq!(msg.payload["type"], "SCHEDULED_KEY_REFRESH");
        assert_eq!(msg.payload["refreshNonce"], "n2");
        assert_eq!(msg.payload["taskId"], 22);
    }

    #[tokio::test]
    async fn test_revocation_denies_and_alerts() {
        let (state, control) = test_state();
        state.set_session(control.session.clone()).unwrap();
        let mut alerts = state
            .broker
            .subscribe_local(&state.topics.broadcast_alerts("zone-1"))
            .unwrap();
        state
            .broker
            .publish(&state.topics.config("zone-1.02"), json!({"old": true}), true)
            .unwrap();

        control.tasks.lock().push(sealed_task(
            &control,
            31,
            TaskType::ProcessDeviceRevocation,
            &TaskPayload::Revocation(RevocationNotice {
                revoked_device_guid: "zone-1.02".into(),
                revoked_subset_identifier: "zone-1".into(),
            }),
        ));
        poll_once(&state).await.unwrap();

        assert!(state.is_revoked("zone-1.02"));
        assert!(state.broker.retained(&state.topics.config("zone-1.02")).is_none());
        let alert = alerts.recv().await.unwrap();
        assert_eq!(alert.payload["type"], "REVOCATION_ALERT");
        assert_eq!(alert.payload["revokedGuid"], "zone-1.02");
        let calls = control.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], Call::TaskStatus(31, TaskStatus::InProgress, None));
        assert!(matches!(
            calls[1],
            Call::TaskStatus(31, TaskStatus::Completed, Some(_))
        ));

        // Deny-listed sender
        let outcome = handle_status(
            &state,
            &status_msg(
                &state,
                "zone-1.02",
                json!({ "deviceGuid": "zone-1.02", "status_type": "provisioned", "taskId": 1 }),
            ),
        )
        .await
        .unwrap();
        assert_eq!(outcome, StatusOutcome::Dropped);
        assert_eq!(control.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_task_left_pending_when_not_taken() {
        let (state, control) = test_state();
        state.set_session(control.session.clone()).unwrap();
        control.reject_status.store(true, Ordering::SeqCst);
        control.tasks.lock().push(sealed_task(
            &control,
            32,
            TaskType::ProcessDeviceRevocation,
            &TaskPayload::Revocation(RevocationNotice {
                revoked_device_guid: "zone-1.02".into(),
                revoked_subset_identifier: "zone-1".into(),
            }),
        ));

        let report = poll_once(&state).await.unwrap();
        assert_eq!(report.fetched, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.dispatched, 0);
        assert!(!state.is_revoked("zone-1.02"));
        assert!(control.calls().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_unauthorized_clears_session() {
        let (state, control) = test_state();
        state.set_session(control.session.clone()).unwrap();
        control.reject_fetch.store(true, Ordering::SeqCst);

        assert!(matches!(poll_once(&state).await, Err(Error::Unauthorized(_))));
        assert!(!state.has_session());
    }

    #[tokio::test]
    async fn test_status_dispatch() {
        let (state, control) = test_state();
        state.set_session(control.session.clone()).unwrap();

        let outcome = handle_status(
            &state,
            &status_msg(
                &state,
                "zone-1.01",
                json!({ "deviceGuid": "zone-1.01", "status_type": "provisioned", "taskId": 5 }),
            ),
        )
        .await
        .unwrap();
        assert_eq!(outcome, StatusOutcome::Applied);

        handle_status(
            &state,
            &status_msg(
                &state,
                "zone-1.01",
                json!({
                    "deviceGuid": "zone-1.01",
                    "status_type": "pairwise_key_established",
                    "peerDeviceGuid": "zone-2.01",
                    "keyHash": "ab",
                }),
            ),
        )
        .await
        .unwrap();

        // Topic names another device; the payload wins
        handle_status(
            &state,
            &status_msg(
                &state,
                "zone-1.09",
                json!({
                    "deviceGuid": "zone-1.01",
                    "status_type": "pairwise_key_refresh_processed",
                    "taskId": 6,
                    "wasCentralRefresh": true,
                    "newKeyHash": "cd",
                }),
            ),
        )
        .await
        .unwrap();

        let calls = control.calls();
        assert_eq!(
            calls,
            vec![
                Call::TaskStatus(5, TaskStatus::Completed, Some("Device provisioned".into())),
                Call::DeviceStatus("zone-1.01".into(), DeviceStatus::Active),
                Call::DeviceKey(DeviceKeyReport {
                    owner_device_guid: "zone-1.01".into(),
                    peer_device_guid: Some("zone-2.01".into()),
                    key_type: KeyType::Pairwise,
                    key_hash: "ab".into(),
                    key_status: KeyStatus::Active,
                }),
                Call::DeviceStatus("zone-1.01".into(), DeviceStatus::Running),
                Call::DeviceStatus("zone-2.01".into(), DeviceStatus::Running),
                Call::TaskStatus(
                    6,
                    TaskStatus::Completed,
                    Some("Pairwise key refresh processed".into())
                ),
                Call::KeyRefresh(KeyRefreshReport {
                    device_guid: "zone-1.01".into(),
                    was_central_refresh: true,
                    refreshed_peer_guid: None,
                    new_key_hash: Some("cd".into()),
                    task_id: Some(6),
                }),
                Call::DeviceStatus("zone-1.01".into(), DeviceStatus::Running),
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_status_ignored() {
        let (state, control) = test_state();
        state.set_session(control.session.clone()).unwrap();

        let unknown = status_msg(
            &state,
            "zone-1.01",
            json!({ "deviceGuid": "zone-1.01", "status_type": "rebooted" }),
        );
        assert_eq!(handle_status(&state, &unknown).await.unwrap(), StatusOutcome::Ignored);

        let malformed = status_msg(&state, "zone-1.01", json!("garbage"));
        assert_eq!(handle_status(&state, &malformed).await.unwrap(), StatusOutcome::Ignored);
        assert!(control.calls().is_empty());
    }
}
