//! Control-plane client.
//!
//! The bridge talks to the server only through [`ControlPlane`], so tests
//! can swap in a recording fake. [`HttpControlPlane`] is the real thing.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use chainkey_core::control::{AuthGrant, AuthRequest};
use chainkey_core::model::{DeviceStatus, KeyStatus, KeyType, TaskStatus};
use chainkey_core::wire::GatewayTask;
use chainkey_core::{Error, Result};

/// Session credentials presented on gateway-facing endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub gateway_guid: String,
    pub token: String,
}

/// A key a device reported establishing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceKeyReport {
    pub owner_device_guid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_device_guid: Option<String>,
    pub key_type: KeyType,
    pub key_hash: String,
    pub key_status: KeyStatus,
}

/// A device's refresh acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRefreshReport {
    pub device_guid: String,
    pub was_central_refresh: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refreshed_peer_guid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_key_hash: Option<String>,
    /// Refresh task the device acknowledged; lets the server drop redeliveries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<i64>,
}

/// Operations a gateway performs against the control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn authenticate(&self, request: &AuthRequest) -> Result<AuthGrant>;

    async fn fetch_tasks(&self, creds: &Credentials) -> Result<Vec<GatewayTask>>;

    async fn report_task_status(
        &self,
        creds: &Credentials,
        task_id: i64,
        status: TaskStatus,
        result_message: Option<&str>,
    ) -> Result<()>;

    async fn report_device_status(
        &self,
        creds: &Credentials,
        device_guid: &str,
        status: DeviceStatus,
    ) -> Result<()>;

    async fn report_device_key(&self, creds: &Credentials, report: &DeviceKeyReport) -> Result<()>;

    async fn report_key_refresh(&self, creds: &Credentials, report: &KeyRefreshReport)
        -> Result<()>;
}

// ============================================================================
// HTTP IMPLEMENTATION
// ============================================================================

/// Response envelope of the control plane.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    data: Option<T>,
    error: Option<String>,
}

/// [`ControlPlane`] over the server's REST API.
#[derive(Clone)]
pub struct HttpControlPlane {
    base_url: String,
    http: reqwest::Client,
}

impl HttpControlPlane {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| Error::TransportError(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn with_creds(builder: reqwest::RequestBuilder, creds: &Credentials) -> reqwest::RequestBuilder {
        builder
            .header("x-gateway-guid", &creds.gateway_guid)
            .header("x-gateway-token", &creds.token)
    }

    async fn send<T: DeserializeOwned>(builder: reqwest::RequestBuilder) -> Result<Option<T>> {
        let response = builder
            .send()
            .await
            .map_err(|e| Error::TransportError(e.to_string()))?;
        let status = response.status().as_u16();
        let body: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| Error::TransportError(format!("Unreadable response ({}): {}", status, e)))?;

        if body.ok {
            return Ok(body.data);
        }
        let message = body.error.unwrap_or_else(|| format!("HTTP {}", status));
        Err(error_for_status(status, message))
    }
}

/// Rebuild a core error from the server's status code
fn error_for_status(status: u16, message: String) -> Error {
    match status {
        400 => Error::invalid("request", message),
        401 => Error::Unauthorized(message),
        403 => Error::Forbidden(message),
        404 => Error::NotFound(message),
        409 => Error::Conflict(message),
        _ => Error::TransportError(message),
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn authenticate(&self, request: &AuthRequest) -> Result<AuthGrant> {
        let builder = self.http.post(self.url("/gateways/authenticate")).json(request);
        Self::send(builder)
            .await?
            .ok_or_else(|| Error::TransportError("Empty authentication response".into()))
    }

    async fn fetch_tasks(&self, creds: &Credentials) -> Result<Vec<GatewayTask>> {
        let path = format!("/gateways/{}/tasks", creds.gateway_guid);
        let builder = Self::with_creds(self.http.get(self.url(&path)), creds);
        Ok(Self::send(builder).await?.unwrap_or_default())
    }

    async fn report_task_status(
        &self,
        creds: &Credentials,
        task_id: i64,
        status: TaskStatus,
        result_message: Option<&str>,
    ) -> Result<()> {
        let body = serde_json::json!({
            "status": status,
            "resultMessage": result_message,
        });
        let path = format!("/tasks/{}", task_id);
        let builder = Self::with_creds(self.http.patch(self.url(&path)), creds).json(&body);
        Self::send::<serde_json::Value>(builder).await.map(|_| ())
    }

    async fn report_device_status(
        &self,
        creds: &Credentials,
        device_guid: &str,
        status: DeviceStatus,
    ) -> Result<()> {
        let body = serde_json::json!({ "status": status });
        let path = format!("/devices/{}/status", device_guid);
        let builder = Self::with_creds(self.http.patch(self.url(&path)), creds).json(&body);
        Self::send::<serde_json::Value>(builder).await.map(|_| ())
    }

    async fn report_device_key(&self, creds: &Credentials, report: &DeviceKeyReport) -> Result<()> {
        let builder = Self::with_creds(self.http.post(self.url("/device-keys")), creds).json(report);
        Self::send::<serde_json::Value>(builder).await.map(|_| ())
    }

    async fn report_key_refresh(
        &self,
        creds: &Credentials,
        report: &KeyRefreshReport,
    ) -> Result<()> {
        let builder =
            Self::with_creds(self.http.patch(self.url("/device-keys/refresh")), creds).json(report);
        Self::send::<serde_json::Value>(builder).await.map(|_| ())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
