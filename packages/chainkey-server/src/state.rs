//! Server state and configuration.
//!
//! The state is cheap to clone: the key service sits behind an `Arc` and
//! every handler gets its own handle.

use std::sync::Arc;

use chainkey_core::control::SweepReport;
use chainkey_core::storage::DeviceRecord;
use chainkey_core::{KeyService, Result};

/// Default port for the control plane.
const DEFAULT_PORT: u16 = 5000;

/// Default interval between due-task sweeps (1 minute).
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Default interval between provisioning reconciliation passes (5 minutes).
const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 300;

/// Default age after which a pending provisioning is reported (15 minutes).
const DEFAULT_PROVISIONING_TIMEOUT_SECS: i64 = 900;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// SQLite file; in-memory when `None`
    pub database: Option<String>,
    pub sweep_interval_secs: u64,
    pub reconcile_interval_secs: u64,
    pub provisioning_timeout_secs: i64,
    pub max_chain_hops: usize,
    /// User recorded on administrative actions without an `x-user-id` header
    pub system_user_id: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database: None,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            reconcile_interval_secs: DEFAULT_RECONCILE_INTERVAL_SECS,
            provisioning_timeout_secs: DEFAULT_PROVISIONING_TIMEOUT_SECS,
            max_chain_hops: 1024,
            system_user_id: 0,
        }
    }
}

/// Shared server state.
#[derive(Clone)]
pub struct ServerState {
    pub service: Arc<KeyService>,
    pub config: ServerConfig,
}

impl ServerState {
    pub fn new(service: KeyService, config: ServerConfig) -> Self {
        Self {
            service: Arc::new(service),
            config,
        }
    }

    // ── Background Jobs ───────────────────────────────────────────────────

    /// One pass of the scheduled-task sweep.
    ///
    /// Runs on the blocking pool; SQLite calls must not stall the runtime.
    pub async fn sweep_due_tasks(&self) -> Result<SweepReport> {
        let service = self.service.clone();
        tokio::task::spawn_blocking(move || service.run_due_sweep())
            .await
            .map_err(|e| chainkey_core::Error::Internal(format!("Sweep task panicked: {}", e)))?
    }

    /// One reconciliation pass over pending provisionings.
    pub async fn reconcile_provisioning(&self) -> Result<Vec<DeviceRecord>> {
        let service = self.service.clone();
        let timeout = self.config.provisioning_timeout_secs;
        tokio::task::spawn_blocking(move || service.find_stuck_provisioning(timeout))
            .await
            .map_err(|e| {
                chainkey_core::Error::Internal(format!("Reconcile task panicked: {}", e))
            })?
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chainkey_core::crypto::EncryptionKey;
    use chainkey_core::storage::Database;
    use chainkey_core::ServiceConfig;

    fn state() -> ServerState {
        let service = KeyService::new(
            Database::open(None).unwrap(),
            EncryptionKey::from_bytes([3u8; 32]),
            ServiceConfig::default(),
        );
        ServerState::new(service, ServerConfig::default())
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 5000);
        assert_eq!(config.sweep_interval_secs, 60);
        assert_eq!(config.reconcile_interval_secs, 300);
        assert_eq!(config.provisioning_timeout_secs, 900);
        assert!(config.database.is_none());
    }

    #[tokio::test]
    async fn test_background_jobs_on_empty_store() {
        let state = state();
        let report = state.sweep_due_tasks().await.unwrap();
        assert_eq!(report.due, 0);
        assert!(state.reconcile_provisioning().await.unwrap().is_empty());
    }
}
