//! Device channel protocol.
//!
//! Devices speak JSON over WebSocket to the gateway's broker. Topics follow
//! MQTT conventions: `/`-separated levels, `+` matches one level and `#`
//! matches the remainder.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Device → Gateway ──────────────────────────────────────────────────────────

/// Messages sent from a device to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving messages on topics matching `topic`.
    /// Retained messages on matching topics are delivered immediately.
    Subscribe { topic: String },

    /// Stop receiving messages for a filter previously subscribed.
    Unsubscribe { topic: String },

    /// Publish to a concrete topic (no wildcards).
    Publish {
        topic: String,
        payload: Value,
        #[serde(default)]
        retain: bool,
    },

    /// Ping to keep connection alive.
    Ping,
}

// ── Gateway → Device ──────────────────────────────────────────────────────────

/// Messages sent from the broker to a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Subscription accepted.
    Subscribed { topic: String },

    /// Subscription removed.
    Unsubscribed { topic: String },

    /// A message on a subscribed topic.
    Message {
        topic: String,
        payload: Value,
        retained: bool,
    },

    /// Publish accepted; `matched` subscribers received it.
    Published { topic: String, matched: usize },

    /// Pong response to keep connection alive.
    Pong,

    /// Error response.
    Error { message: String },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
