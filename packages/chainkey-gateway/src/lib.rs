//! Chainkey subset gateway.
//!
//! Sits between the control plane and the devices of its subsets:
//!
//! - authenticates to the server with its long-term key and keeps the
//!   session key it is granted in memory only
//! - polls for key tasks, opens them and publishes commands to devices on
//!   an in-process topic broker
//! - turns device acknowledgments into control-plane reports
//!
//! Devices reach the broker over `/ws`.

pub mod bridge;
pub mod broker;
pub mod client;
pub mod config;
pub mod handler;
pub mod keys;
pub mod protocol;
pub mod state;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::Method,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::GatewayConfig;
pub use state::GatewayState;

/// Build the device-facing router with state attached.
pub fn router(state: GatewayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// WebSocket upgrade handler for device connections.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handler::handle_websocket(socket, state))
}

/// Health check endpoint.
async fn health_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "chainkey-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "gatewayGuid": state.config.gateway_guid,
        "session": state.has_session(),
        "revokedDevices": state.revoked_count(),
        "connectedDevices": state.broker.remote_clients(),
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
