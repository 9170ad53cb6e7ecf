//! Gateway state.
//!
//! Holds the broker, the key material, the current control-plane session
//! and the local deny-list of revoked devices. All of it is shared between
//! the device sockets and the bridge loops.

use std::sync::Arc;

use dashmap::DashSet;
use parking_lot::RwLock;

use chainkey_core::crypto::{GatewayKeyPair, SessionKey};
use chainkey_core::wire::Topics;
use chainkey_core::Result;

use crate::broker::Broker;
use crate::client::{ControlPlane, Credentials};
use crate::config::GatewayConfig;

/// Session established by the trust handshake.
#[derive(Clone)]
pub struct Session {
    pub key: SessionKey,
    pub token: String,
}

/// Shared gateway state.
#[derive(Clone)]
pub struct GatewayState {
    pub config: GatewayConfig,
    pub broker: Broker,
    pub topics: Topics,
    pub keys: Arc<GatewayKeyPair>,
    pub control: Arc<dyn ControlPlane>,
    session: Arc<RwLock<Option<Session>>>,
    /// Revoked device GUIDs; their messages are dropped without a server call
    revoked: Arc<DashSet<String>>,
}

impl GatewayState {
    pub fn new(config: GatewayConfig, keys: GatewayKeyPair, control: Arc<dyn ControlPlane>) -> Self {
        let topics = Topics::new(config.topic_prefix.clone(), config.gateway_guid.clone());
        Self {
            config,
            broker: Broker::new(),
            topics,
            keys: Arc::new(keys),
            control,
            session: Arc::new(RwLock::new(None)),
            revoked: Arc::new(DashSet::new()),
        }
    }

    // ── Session ───────────────────────────────────────────────────────────

    /// Install a fresh session key, replacing any previous one.
    pub fn set_session(&self, key: SessionKey) -> Result<()> {
        let token = key.token()?;
        *self.session.write() = Some(Session { key, token });
        Ok(())
    }

    pub fn clear_session(&self) {
        *self.session.write() = None;
    }

    pub fn session(&self) -> Option<Session> {
        self.session.read().clone()
    }

    pub fn has_session(&self) -> bool {
        self.session.read().is_some()
    }

    /// Credentials for gateway-facing requests, if a session is held
    pub fn credentials(&self) -> Option<Credentials> {
        self.session.read().as_ref().map(|s| Credentials {
            gateway_guid: self.config.gateway_guid.clone(),
            token: s.token.clone(),
        })
    }

    // ── Deny-list ─────────────────────────────────────────────────────────

    /// Add a device to the deny-list. Returns false if it was already there.
    pub fn deny(&self, device_guid: &str) -> bool {
        self.revoked.insert(device_guid.to_string())
    }

    pub fn is_revoked(&self, device_guid: &str) -> bool {
        self.revoked.contains(device_guid)
    }

    pub fn revoked_count(&self) -> usize {
        self.revoked.len()
    }
}
