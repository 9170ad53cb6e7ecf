//! Chainkey Subset Gateway
//!
//! Runs three loops next to the device broker:
//!
//! 1. **Authentication**: proves the gateway's identity to the control
//!    plane and installs the granted session key, retrying until it works.
//!
//! 2. **Task polling**: fetches pending key tasks and publishes them to
//!    devices, re-authenticating whenever the session is rejected.
//!
//! 3. **Status relay**: forwards device acknowledgments to the control
//!    plane, dropping anything from revoked devices.
//!
//! The long-term key lives in `<key-dir>/gateway.key`; the session key is
//! never written to disk.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use chainkey_gateway::client::HttpControlPlane;
use chainkey_gateway::{bridge, keys, router, GatewayConfig, GatewayState};

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "chainkey-gateway", version, about = "Chainkey subset gateway")]
struct Args {
    /// Identifier this gateway is registered under
    #[arg(long, default_value = "gateway-1", env = "GATEWAY_GUID")]
    gateway_guid: String,

    /// Control-plane API base URL
    #[arg(long, default_value = "http://127.0.0.1:5000/api", env = "SERVER_BASE_URL")]
    server_url: String,

    /// Directory holding the gateway key
    #[arg(long, default_value = "./secure_storage", env = "GATEWAY_KEY_DIR")]
    key_dir: PathBuf,

    /// Port for device connections
    #[arg(short = 'p', long, default_value_t = 1884, env = "BROKER_PORT")]
    broker_port: u16,

    /// Root of every topic name
    #[arg(long, default_value = chainkey_core::wire::DEFAULT_TOPIC_PREFIX, env = "TOPIC_PREFIX")]
    topic_prefix: String,

    /// Seconds between task polls
    #[arg(long, default_value_t = 15, env = "TASK_POLL_INTERVAL_SECS")]
    poll_interval_secs: u64,

    /// Seconds between failed authentication attempts
    #[arg(long, default_value_t = 5, env = "AUTH_RETRY_SECS")]
    auth_retry_secs: u64,
}

impl From<Args> for GatewayConfig {
    fn from(args: Args) -> Self {
        Self {
            gateway_guid: args.gateway_guid,
            server_url: args.server_url,
            key_dir: args.key_dir,
            broker_port: args.broker_port,
            topic_prefix: args.topic_prefix,
            poll_interval_secs: args.poll_interval_secs.max(1),
            auth_retry_secs: args.auth_retry_secs.max(1),
        }
    }
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "chainkey_gateway=info,chainkey_core=info,tower_http=info".into()
            }),
        )
        .init();

    let config: GatewayConfig = Args::parse().into();

    let gateway_keys = match keys::load_or_create(&config.key_dir) {
        Ok(keys) => keys,
        Err(e) => {
            tracing::error!(error = %e, "Gateway key unavailable");
            std::process::exit(1);
        }
    };
    tracing::info!(
        gateway = %config.gateway_guid,
        public_key = %gateway_keys.public_key().to_hex(),
        "Gateway identity loaded; register this public key with the control plane"
    );

    let control = match HttpControlPlane::new(config.server_url.clone()) {
        Ok(control) => control,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build control-plane client");
            std::process::exit(1);
        }
    };

    let state = GatewayState::new(config.clone(), gateway_keys, Arc::new(control));

    let status_rx = match state.broker.subscribe_local(&state.topics.status_filter()) {
        Ok(rx) => rx,
        Err(e) => {
            tracing::error!(error = %e, "Failed to subscribe to device status");
            std::process::exit(1);
        }
    };

    // Authenticate, then poll for tasks
    let task_state = state.clone();
    tokio::spawn(async move {
        bridge::run_auth_loop(&task_state).await;
        bridge::run_poll_loop(&task_state).await;
    });

    // Relay device acknowledgments
    let status_state = state.clone();
    tokio::spawn(async move {
        bridge::run_status_loop(&status_state, status_rx).await;
    });

    let app = router(state);
    let addr = format!("0.0.0.0:{}", config.broker_port);
    tracing::info!(
        gateway = %config.gateway_guid,
        server = %config.server_url,
        "Chainkey gateway listening on {}",
        addr
    );

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app).await.expect("Server error");
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["chainkey-gateway"]);
        let config = GatewayConfig::from(args);
        assert_eq!(config.broker_port, 1884);
        assert_eq!(config.topic_prefix, "iot_network");
        assert_eq!(config.poll_interval_secs, 15);
    }

    #[test]
    fn test_args_override() {
        let args = Args::parse_from([
            "chainkey-gateway",
            "--gateway-guid",
            "gw-7",
            "--broker-port",
            "9000",
            "--poll-interval-secs",
            "0",
        ]);
        let config = GatewayConfig::from(args);
        assert_eq!(config.gateway_guid, "gw-7");
        assert_eq!(config.broker_port, 9000);
        assert_eq!(config.poll_interval_secs, 1);
    }
}
