//! Chainkey control-plane server.
//!
//! HTTP front for [`chainkey_core::KeyService`]: administrators register the
//! topology and trigger provisioning, rotation, revocation and schedules;
//! gateways authenticate, fetch their tasks and report what devices
//! acknowledged. A periodic sweep turns due schedules into refresh tasks.

pub mod api;
pub mod state;

use axum::{
    http::Method,
    response::IntoResponse,
    routing::{delete, get, patch, post, put},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use state::{ServerConfig, ServerState};

/// Build the full router with state attached.
pub fn router(state: ServerState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers(Any);

    let api = Router::new()
        .route("/subsets", post(api::register_subset).get(api::list_subsets))
        .route("/subsets/:id", delete(api::delete_subset))
        .route("/subsets/:id/links", put(api::link_subsets))
        .route("/devices", post(api::register_device).get(api::list_devices))
        .route("/devices/:guid", get(api::get_device))
        .route("/devices/:guid/provision", post(api::provision_device))
        .route("/devices/:guid/refresh", post(api::refresh_device))
        .route("/devices/:guid/revoke", post(api::revoke_device))
        .route("/devices/:guid/status", patch(api::report_device_status))
        .route("/gateways", post(api::register_gateway).get(api::list_gateways))
        .route("/gateways/authenticate", post(api::authenticate_gateway))
        .route("/gateways/:guid/tasks", get(api::gateway_tasks))
        .route("/tasks", get(api::list_tasks))
        .route("/tasks/schedule", post(api::schedule_task))
        .route("/tasks/:id", patch(api::report_task_status))
        .route(
            "/device-keys",
            post(api::report_device_key).get(api::list_device_keys),
        )
        .route("/device-keys/refresh", patch(api::report_key_refresh))
        .route("/reconcile/provisioning", get(api::stuck_provisioning));

    Router::new()
        .nest("/api", api)
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
async fn health_handler(
    axum::extract::State(state): axum::extract::State<ServerState>,
) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "chainkey-server",
        "version": env!("CARGO_PKG_VERSION"),
        "gatewaySessions": state.service.sessions().len(),
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use chainkey_core::crypto::{open_from_server, sign, EncryptionKey, GatewayKeyPair, SessionKey};
    use chainkey_core::storage::Database;
    use chainkey_core::{KeyService, ServiceConfig};
    use serde_json::Value;
    use tower::ServiceExt;

    fn app() -> Router {
        let service = KeyService::new(
            Database::open(None).unwrap(),
            EncryptionKey::from_bytes([9u8; 32]),
            ServiceConfig::default(),
        );
        router(ServerState::new(service, ServerConfig::default()))
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    /// Subset `zone-1` with devices 01 and 02 and gateway `gw-1`
    async fn seed(app: &Router, keys: &GatewayKeyPair) {
        let (status, _) = call(
            app,
            "POST",
            "/api/subsets",
            Some(json!({ "identifier": "zone-1", "name": "Zone 1" })),
            &[("x-user-id", "7")],
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        for local in ["01", "02"] {
            let (status, body) = call(
                app,
                "POST",
                "/api/devices",
                Some(json!({ "subsetId": 1, "localIdentifierInSubset": local })),
                &[],
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
            assert_eq!(body["data"]["deviceGuid"], format!("zone-1.{}", local));
        }

        let (status, _) = call(
            app,
            "POST",
            "/api/gateways",
            Some(json!({
                "gatewayGuid": "gw-1",
                "publicKey": keys.public_key().to_hex(),
                "subsetId": 1,
            })),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    async fn authenticate(app: &Router, keys: &GatewayKeyPair) -> String {
        let payload = json!({
            "gatewayGuid": "gw-1",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        let signature = sign(&keys.signing, &serde_json::to_vec(&payload).unwrap());
        let (status, body) = call(
            app,
            "POST",
            "/api/gateways/authenticate",
            Some(json!({
                "gatewayGuid": "gw-1",
                "payload": payload,
                "signature": signature.to_hex(),
            })),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let sealed = body["data"]["encryptedSessionKey"].as_str().unwrap();
        let raw = open_from_server(&keys.encryption, sealed).unwrap();
        SessionKey::from_slice(&raw).unwrap().token().unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(&app(), "GET", "/health", None, &[]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "chainkey-server");
    }

    #[tokio::test]
    async fn test_provision_flow_over_http() {
        let app = app();
        let keys = GatewayKeyPair::generate();
        seed(&app, &keys).await;

        // gw-1 is offline until it authenticates
        let (status, body) =
            call(&app, "POST", "/api/devices/zone-1.01/provision", None, &[]).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], 400);

        let (status, body) = call(&app, "GET", "/api/gateways/gw-1/tasks", None, &[]).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["ok"], false);
        assert_eq!(body["code"], 200);

        let token = authenticate(&app, &keys).await;
        let creds = [("x-gateway-guid", "gw-1"), ("x-gateway-token", token.as_str())];

        let (status, body) =
            call(&app, "POST", "/api/devices/zone-1.01/provision", None, &[]).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let task_id = body["data"]["taskId"].as_i64().unwrap();

        let (status, body) = call(&app, "GET", "/api/gateways/gw-1/tasks", None, &creds).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["taskId"], task_id);

        let uri = format!("/api/tasks/{}", task_id);
        let (status, _) = call(
            &app,
            "PATCH",
            &uri,
            Some(json!({ "status": "completed" })),
            &creds,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = call(
            &app,
            "PATCH",
            &uri,
            Some(json!({ "status": "in_progress" })),
            &creds,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "in_progress");

        let (status, body) = call(
            &app,
            "PATCH",
            &uri,
            Some(json!({ "status": "completed", "resultMessage": "Device provisioned" })),
            &creds,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "completed");

        let (status, body) = call(
            &app,
            "PATCH",
            "/api/devices/zone-1.01/status",
            Some(json!({ "status": "active" })),
            &creds,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "active");
    }

    #[tokio::test]
    async fn test_gateway_cannot_read_other_gateway_tasks() {
        let app = app();
        let keys = GatewayKeyPair::generate();
        seed(&app, &keys).await;
        let token = authenticate(&app, &keys).await;

        let (status, _) = call(
            &app,
            "GET",
            "/api/gateways/gw-2/tasks",
            None,
            &[("x-gateway-guid", "gw-1"), ("x-gateway-token", token.as_str())],
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(
            &app,
            "GET",
            "/api/gateways/gw-1/tasks",
            None,
            &[("x-gateway-guid", "gw-1"), ("x-gateway-token", "nope")],
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_revoke_twice_conflicts() {
        let app = app();
        seed(&app, &GatewayKeyPair::generate()).await;

        let (status, body) = call(&app, "POST", "/api/devices/zone-1.02/revoke", None, &[]).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["data"]["status"], "revoked");

        let (status, body) = call(&app, "POST", "/api/devices/zone-1.02/revoke", None, &[]).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], 102);

        let (status, _) = call(&app, "POST", "/api/devices/zone-9.01/revoke", None, &[]).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_refresh_ack_bumps_versions() {
        let app = app();
        let keys = GatewayKeyPair::generate();
        seed(&app, &keys).await;
        let token = authenticate(&app, &keys).await;
        let creds = [("x-gateway-guid", "gw-1"), ("x-gateway-token", token.as_str())];

        let (status, _) = call(
            &app,
            "POST",
            "/api/device-keys",
            Some(json!({
                "ownerDeviceGuid": "zone-1.01",
                "peerDeviceGuid": "zone-1.02",
                "keyType": "pairwise",
                "keyHash": "aa",
            })),
            &creds,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            &app,
            "PATCH",
            "/api/device-keys/refresh",
            Some(json!({
                "deviceGuid": "zone-1.01",
                "wasCentralRefresh": true,
                "newKeyHash": "bb",
            })),
            &creds,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["updated"], 1);

        let (_, body) = call(
            &app,
            "GET",
            "/api/device-keys?deviceGuid=zone-1.02",
            None,
            &[],
        )
        .await;
        assert_eq!(body["data"][0]["keyVersion"], 2);
        assert_eq!(body["data"][0]["keyHash"], "bb");
    }

    #[tokio::test]
    async fn test_schedule_in_past_rejected() {
        let app = app();
        seed(&app, &GatewayKeyPair::generate()).await;

        let (status, body) = call(
            &app,
            "POST",
            "/api/tasks/schedule",
            Some(json!({
                "subsetId": 1,
                "scheduleType": "ONCE_AT",
                "scheduleValue": 1_000,
            })),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 100);

        let at = chrono::Utc::now().timestamp() + 3600;
        let (status, body) = call(
            &app,
            "POST",
            "/api/tasks/schedule",
            Some(json!({
                "subsetId": 1,
                "scheduleType": "RECURRENCE",
                "scheduleValue": at,
                "recurrence": "weekly",
            })),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body["data"]["taskId"].is_i64());
    }

    #[tokio::test]
    async fn test_subset_delete_refused_while_referenced() {
        let app = app();
        seed(&app, &GatewayKeyPair::generate()).await;

        let (status, _) = call(&app, "DELETE", "/api/subsets/1", None, &[]).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(
            &app,
            "PUT",
            "/api/subsets/1/links",
            Some(json!({ "nextSubsetId": 1 })),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_bad_user_header() {
        let (status, _) = call(
            &app(),
            "POST",
            "/api/subsets",
            Some(json!({ "identifier": "zone-1", "name": "Zone 1" })),
            &[("x-user-id", "admin")],
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
