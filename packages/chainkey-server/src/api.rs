//! Control-plane REST API handlers.
//!
//! Two audiences share this router:
//!
//! - administrators (subsets, devices, gateways, provisioning, rotation,
//!   revocation, scheduling), identified by the `x-user-id` header;
//! - gateways (task fetch, status and key reports), which present the
//!   `x-gateway-guid` / `x-gateway-token` pair issued by the handshake.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use chainkey_core::control::{AuthRequest, ScheduleRequest};
use chainkey_core::model::{DeviceStatus, KeyStatus, KeyType, TaskStatus};
use chainkey_core::Error;

use crate::state::ServerState;

pub const USER_HEADER: &str = "x-user-id";
pub const GATEWAY_GUID_HEADER: &str = "x-gateway-guid";
pub const GATEWAY_TOKEN_HEADER: &str = "x-gateway-token";

// ── Request / Response Types ─────────────────────────────────────────────────

/// POST /api/subsets
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterSubsetRequest {
    pub identifier: String,
    pub name: String,
    pub description: Option<String>,
}

/// PUT /api/subsets/:id/links
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkSubsetsRequest {
    pub previous_subset_id: Option<i64>,
    pub next_subset_id: Option<i64>,
}

/// POST /api/devices
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDeviceRequest {
    pub subset_id: i64,
    pub local_identifier_in_subset: String,
    pub name: Option<String>,
    pub device_type: Option<String>,
    pub security_parameter_alpha: Option<i64>,
}

/// PATCH /api/devices/:guid/status
#[derive(Debug, Deserialize)]
pub struct DeviceStatusRequest {
    pub status: DeviceStatus,
}

/// POST /api/gateways
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterGatewayRequest {
    pub gateway_guid: String,
    pub public_key: Option<String>,
    pub subset_id: Option<i64>,
    pub name: Option<String>,
}

/// PATCH /api/tasks/:id
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusRequest {
    pub status: TaskStatus,
    pub result_message: Option<String>,
}

/// POST /api/device-keys
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceKeyRequest {
    pub owner_device_guid: String,
    pub peer_device_guid: Option<String>,
    pub key_type: KeyType,
    pub key_hash: String,
    pub key_status: Option<KeyStatus>,
}

/// PATCH /api/device-keys/refresh
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRefreshRequest {
    pub device_guid: String,
    #[serde(default)]
    pub was_central_refresh: bool,
    pub refreshed_peer_guid: Option<String>,
    pub new_key_hash: Option<String>,
    /// Acknowledged refresh task; a repeated ack for it changes nothing
    pub task_id: Option<i64>,
}

/// GET /api/device-keys
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceKeyQuery {
    pub device_guid: Option<String>,
}

/// Response envelope shared by every endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Json<Self> {
        Json(Self {
            ok: true,
            data: Some(data),
            error: None,
            code: None,
        })
    }
}

fn accepted<T: Serialize>(data: T) -> (StatusCode, Json<ApiResponse<T>>) {
    (StatusCode::ACCEPTED, ApiResponse::success(data))
}

fn created<T: Serialize>(data: T) -> (StatusCode, Json<ApiResponse<T>>) {
    (StatusCode::CREATED, ApiResponse::success(data))
}

/// Core error carried out of a handler.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        } else {
            tracing::debug!(error = %self.0, "Request rejected");
        }
        (
            status,
            Json(ApiResponse::<()> {
                ok: false,
                data: None,
                error: Some(self.0.to_string()),
                code: Some(self.0.code()),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ── Header Helpers ───────────────────────────────────────────────────────────

fn header<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Acting administrator, falling back to the configured system user
fn user_id(state: &ServerState, headers: &HeaderMap) -> ApiResult<i64> {
    match header(headers, USER_HEADER) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::invalid(USER_HEADER, "must be an integer").into()),
        None => Ok(state.config.system_user_id),
    }
}

/// Authenticated gateway GUID for a gateway-facing request
fn gateway(state: &ServerState, headers: &HeaderMap, addressed: Option<&str>) -> ApiResult<String> {
    Ok(state.service.authorize_gateway(
        header(headers, GATEWAY_GUID_HEADER),
        header(headers, GATEWAY_TOKEN_HEADER),
        addressed,
    )?)
}

// ── Subsets ──────────────────────────────────────────────────────────────────

/// POST /api/subsets
pub async fn register_subset(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(req): Json<RegisterSubsetRequest>,
) -> ApiResult<impl IntoResponse> {
    let user = user_id(&state, &headers)?;
    let subset = state.service.register_subset(
        &req.identifier,
        &req.name,
        req.description.as_deref(),
        user,
    )?;
    Ok(created(subset))
}

/// GET /api/subsets
pub async fn list_subsets(State(state): State<ServerState>) -> ApiResult<impl IntoResponse> {
    Ok(ApiResponse::success(state.service.list_subsets()?))
}

/// PUT /api/subsets/:id/links
pub async fn link_subsets(
    State(state): State<ServerState>,
    Path(id): Path<i64>,
    Json(req): Json<LinkSubsetsRequest>,
) -> ApiResult<impl IntoResponse> {
    let subset = state
        .service
        .link_subsets(id, req.previous_subset_id, req.next_subset_id)?;
    Ok(ApiResponse::success(subset))
}

/// DELETE /api/subsets/:id
pub async fn delete_subset(
    State(state): State<ServerState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    state.service.delete_subset(id)?;
    Ok(ApiResponse::success(json!({ "deleted": id })))
}

// ── Devices ──────────────────────────────────────────────────────────────────

/// POST /api/devices
pub async fn register_device(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(req): Json<RegisterDeviceRequest>,
) -> ApiResult<impl IntoResponse> {
    let user = user_id(&state, &headers)?;
    let device = state.service.register_device(
        req.subset_id,
        &req.local_identifier_in_subset,
        req.name.as_deref(),
        req.device_type.as_deref(),
        req.security_parameter_alpha,
        user,
    )?;
    Ok(created(device))
}

/// GET /api/devices
pub async fn list_devices(State(state): State<ServerState>) -> ApiResult<impl IntoResponse> {
    Ok(ApiResponse::success(state.service.list_devices()?))
}

/// GET /api/devices/:guid
pub async fn get_device(
    State(state): State<ServerState>,
    Path(guid): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(ApiResponse::success(state.service.get_device_view(&guid)?))
}

/// POST /api/devices/:guid/provision: 202 with the task id.
pub async fn provision_device(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Path(guid): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let user = user_id(&state, &headers)?;
    let task_id = state.service.provision(&guid, user)?;
    Ok(accepted(json!({ "taskId": task_id })))
}

/// POST /api/devices/:guid/refresh: 202 with one task id per participant.
pub async fn refresh_device(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Path(guid): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let user = user_id(&state, &headers)?;
    let task_ids = state.service.refresh_pairwise(&guid, user)?;
    Ok(accepted(json!({ "taskIds": task_ids })))
}

/// POST /api/devices/:guid/revoke: 202 with the new status.
pub async fn revoke_device(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Path(guid): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let user = user_id(&state, &headers)?;
    Ok(accepted(state.service.revoke_device(&guid, user)?))
}

/// PATCH /api/devices/:guid/status (gateway)
pub async fn report_device_status(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Path(guid): Path<String>,
    Json(req): Json<DeviceStatusRequest>,
) -> ApiResult<impl IntoResponse> {
    gateway(&state, &headers, None)?;
    Ok(ApiResponse::success(
        state.service.update_device_status(&guid, req.status)?,
    ))
}

// ── Gateways ─────────────────────────────────────────────────────────────────

/// POST /api/gateways
pub async fn register_gateway(
    State(state): State<ServerState>,
    Json(req): Json<RegisterGatewayRequest>,
) -> ApiResult<impl IntoResponse> {
    let gateway = state.service.register_gateway(
        &req.gateway_guid,
        req.public_key.as_deref(),
        req.subset_id,
        req.name.as_deref(),
    )?;
    Ok(created(gateway))
}

/// GET /api/gateways
pub async fn list_gateways(State(state): State<ServerState>) -> ApiResult<impl IntoResponse> {
    Ok(ApiResponse::success(state.service.list_gateways()?))
}

/// POST /api/gateways/authenticate
///
/// The caller address is taken from `x-forwarded-for` when a proxy sets it.
pub async fn authenticate_gateway(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(req): Json<AuthRequest>,
) -> ApiResult<impl IntoResponse> {
    let ip = header(&headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim);
    Ok(ApiResponse::success(state.service.authenticate(&req, ip)?))
}

/// GET /api/gateways/:guid/tasks (gateway)
pub async fn gateway_tasks(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Path(guid): Path<String>,
) -> ApiResult<impl IntoResponse> {
    gateway(&state, &headers, Some(&guid))?;
    Ok(ApiResponse::success(state.service.gateway_tasks(&guid)?))
}

// ── Tasks ────────────────────────────────────────────────────────────────────

/// POST /api/tasks/schedule: 202 with the task id.
pub async fn schedule_task(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(req): Json<ScheduleRequest>,
) -> ApiResult<impl IntoResponse> {
    let user = user_id(&state, &headers)?;
    let task_id = state.service.schedule(&req, user)?;
    Ok(accepted(json!({ "taskId": task_id })))
}

/// GET /api/tasks
pub async fn list_tasks(State(state): State<ServerState>) -> ApiResult<impl IntoResponse> {
    Ok(ApiResponse::success(state.service.list_tasks()?))
}

/// PATCH /api/tasks/:id (gateway)
pub async fn report_task_status(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<TaskStatusRequest>,
) -> ApiResult<impl IntoResponse> {
    gateway(&state, &headers, None)?;
    let task = state
        .service
        .report_task_status(id, req.status, req.result_message.as_deref())?;
    Ok(ApiResponse::success(task))
}

// ── Device Keys ──────────────────────────────────────────────────────────────

/// POST /api/device-keys (gateway)
pub async fn report_device_key(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(req): Json<DeviceKeyRequest>,
) -> ApiResult<impl IntoResponse> {
    gateway(&state, &headers, None)?;
    let key = state.service.create_or_update_key(
        &req.owner_device_guid,
        req.peer_device_guid.as_deref(),
        req.key_type,
        &req.key_hash,
        req.key_status,
    )?;
    Ok(ApiResponse::success(key))
}

/// PATCH /api/device-keys/refresh (gateway)
pub async fn report_key_refresh(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(req): Json<KeyRefreshRequest>,
) -> ApiResult<impl IntoResponse> {
    gateway(&state, &headers, None)?;
    let updated = state.service.apply_refresh_ack(
        &req.device_guid,
        req.was_central_refresh,
        req.refreshed_peer_guid.as_deref(),
        req.new_key_hash.as_deref(),
        req.task_id,
    )?;
    Ok(ApiResponse::success(json!({ "updated": updated })))
}

/// GET /api/device-keys
pub async fn list_device_keys(
    State(state): State<ServerState>,
    Query(query): Query<DeviceKeyQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(ApiResponse::success(
        state.service.list_device_keys(query.device_guid.as_deref())?,
    ))
}

// ── Reconciliation ───────────────────────────────────────────────────────────

/// GET /api/reconcile/provisioning
pub async fn stuck_provisioning(State(state): State<ServerState>) -> ApiResult<impl IntoResponse> {
    Ok(ApiResponse::success(state.reconcile_provisioning().await?))
}
