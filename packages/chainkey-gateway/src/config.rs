//! Gateway configuration.

use std::path::PathBuf;

use chainkey_core::wire::DEFAULT_TOPIC_PREFIX;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub gateway_guid: String,
    /// Control-plane API base, e.g. `http://127.0.0.1:5000/api`
    pub server_url: String,
    /// Directory holding `gateway.key`
    pub key_dir: PathBuf,
    /// Port for the device WebSocket and health endpoint
    pub broker_port: u16,
    pub topic_prefix: String,
    pub poll_interval_secs: u64,
    pub auth_retry_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            gateway_guid: "gateway-1".to_string(),
            server_url: "http://127.0.0.1:5000/api".to_string(),
            key_dir: PathBuf::from("./secure_storage"),
            broker_port: 1884,
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            poll_interval_secs: 15,
            auth_retry_secs: 5,
        }
    }
}
