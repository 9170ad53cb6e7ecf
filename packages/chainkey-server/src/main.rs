//! Chainkey Control Plane
//!
//! Serves the administrative and gateway-facing HTTP API and runs two
//! periodic jobs:
//!
//! 1. **Due-task sweep**: claims scheduled and recurring refreshes whose
//!    time has come and spawns their refresh tasks.
//!
//! 2. **Provisioning reconciliation**: reports devices left in
//!    `provisioning_pending` with no provision task in flight.
//!
//! The master key never leaves this process; secrets and task payloads are
//! sealed under it at rest.

use std::time::Duration;

use clap::Parser;

use chainkey_core::crypto::EncryptionKey;
use chainkey_core::storage::Database;
use chainkey_core::{KeyService, ServiceConfig};
use chainkey_server::{router, ServerConfig, ServerState};

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "chainkey-server", version, about = "Chainkey key-management control plane")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 5000, env = "CHAINKEY_PORT")]
    port: u16,

    /// SQLite database file (in-memory when omitted)
    #[arg(long, env = "CHAINKEY_DATABASE")]
    database: Option<String>,

    /// Master encryption key, 64 hex characters
    #[arg(long, env = "MASTER_ENCRYPTION_KEY", hide_env_values = true)]
    master_key: String,

    /// Seconds between due-task sweeps
    #[arg(long, default_value_t = 60, env = "SWEEP_INTERVAL_SECS")]
    sweep_interval_secs: u64,

    /// Seconds between provisioning reconciliation passes
    #[arg(long, default_value_t = 300, env = "RECONCILE_INTERVAL_SECS")]
    reconcile_interval_secs: u64,

    /// Age in seconds after which a pending provisioning counts as stuck
    #[arg(long, default_value_t = 900, env = "PROVISIONING_TIMEOUT_SECS")]
    provisioning_timeout_secs: i64,

    /// Longest chain walk when checking subset links for cycles
    #[arg(long, default_value_t = 1024, env = "MAX_CHAIN_HOPS")]
    max_chain_hops: usize,

    /// User id recorded for requests without an x-user-id header
    #[arg(long, default_value_t = 0, env = "SYSTEM_USER_ID")]
    system_user_id: i64,
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "chainkey_server=info,chainkey_core=info,tower_http=info".into()
            }),
        )
        .init();

    let args = Args::parse();

    let config = ServerConfig {
        port: args.port,
        database: args.database,
        sweep_interval_secs: args.sweep_interval_secs,
        reconcile_interval_secs: args.reconcile_interval_secs,
        provisioning_timeout_secs: args.provisioning_timeout_secs,
        max_chain_hops: args.max_chain_hops,
        system_user_id: args.system_user_id,
    };

    let master_key = match EncryptionKey::from_hex("MASTER_ENCRYPTION_KEY", args.master_key.trim()) {
        Ok(key) => key,
        Err(e) => {
            tracing::error!(error = %e, "Master key rejected");
            std::process::exit(1);
        }
    };

    let db = match Database::open(config.database.as_deref()) {
        Ok(db) => db,
        Err(e) => {
            tracing::error!(error = %e, "Failed to open database");
            std::process::exit(1);
        }
    };
    if config.database.is_none() {
        tracing::warn!("No database path configured; state is in-memory only");
    }

    let service = KeyService::new(
        db,
        master_key,
        ServiceConfig {
            max_chain_hops: config.max_chain_hops,
            ..ServiceConfig::default()
        },
    );
    let state = ServerState::new(service, config.clone());

    // Spawn periodic due-task sweep
    let sweep_state = state.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(sweep_state.config.sweep_interval_secs));
        loop {
            interval.tick().await;
            match sweep_state.sweep_due_tasks().await {
                Ok(report) if report.due > 0 => {
                    tracing::info!(
                        due = report.due,
                        completed = report.completed,
                        completed_no_devices = report.completed_no_devices,
                        failed = report.failed,
                        rescheduled = report.rescheduled,
                        "Due-task sweep finished"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Due-task sweep failed"),
            }
        }
    });

    // Spawn periodic provisioning reconciliation
    let reconcile_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(
            reconcile_state.config.reconcile_interval_secs,
        ));
        loop {
            interval.tick().await;
            match reconcile_state.reconcile_provisioning().await {
                Ok(stuck) if !stuck.is_empty() => {
                    tracing::warn!(count = stuck.len(), "Devices stuck in provisioning");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Provisioning reconciliation failed"),
            }
        }
    });

    let app = router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Chainkey control plane starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app)
        .await
        .expect("Server error");
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from([
            "chainkey-server",
            "--master-key",
            "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff",
        ])
        .unwrap();
        assert_eq!(args.port, 5000);
        assert_eq!(args.sweep_interval_secs, 60);
        assert_eq!(args.provisioning_timeout_secs, 900);
        assert!(args.database.is_none());
        assert!(EncryptionKey::from_hex("MASTER_ENCRYPTION_KEY", &args.master_key).is_ok());
    }

    #[test]
    fn test_master_key_required() {
        // Only meaningful when the variable is not set in the test environment
        if std::env::var("MASTER_ENCRYPTION_KEY").is_err() {
            assert!(Args::try_parse_from(["chainkey-server"]).is_err());
        }
    }
}
