//! In-process topic broker.
//!
//! ```text
//!   device socket ──subscribe(filter)──┐
//!   bridge (local) ──subscribe(filter)─┤      ┌───────────────┐
//!                                      ├────► │ subscriptions │
//!   publish(topic, payload, retain) ───┘      │ retained      │
//!                                             └──────┬────────┘
//!                       Delivery{matched, retained}  │ BrokerMessage
//!                       ◄────────────────────────────┴──────────► subscribers
//! ```
//!
//! Retained messages keep the last payload per topic and are replayed to
//! every new matching subscription, so a device that was offline when its
//! command was published still gets it when it reconnects.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use chainkey_core::{Error, Result};

/// A message handed to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Value,
    /// Replayed from the retained store rather than freshly published
    pub retained: bool,
}

/// Outcome of a publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub topic: String,
    /// Subscribers the message was handed to
    pub matched: usize,
    pub retained: bool,
}

/// A subscriber's sender channel.
pub type SubscriberSender = mpsc::UnboundedSender<BrokerMessage>;

struct Subscriber {
    sender: SubscriberSender,
    filters: HashSet<String>,
    /// Device socket, as opposed to a local subscription of the gateway itself
    remote: bool,
}

/// Shared broker handle.
#[derive(Clone, Default)]
pub struct Broker {
    subscribers: Arc<DashMap<String, Subscriber>>,
    retained: Arc<DashMap<String, Value>>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Subscriptions ─────────────────────────────────────────────────────

    /// Add `filter` to a client's subscriptions.
    ///
    /// The first call for a client registers its sender. Returns how many
    /// retained messages were replayed.
    pub fn subscribe(
        &self,
        client_id: &str,
        filter: &str,
        sender: &SubscriberSender,
        remote: bool,
    ) -> Result<usize> {
        validate_filter(filter)?;

        let mut entry = self
            .subscribers
            .entry(client_id.to_string())
            .or_insert_with(|| Subscriber {
                sender: sender.clone(),
                filters: HashSet::new(),
                remote,
            });
        entry.filters.insert(filter.to_string());

        let mut replayed = 0;
        for retained in self.retained.iter() {
            if topic_matches(filter, retained.key()) {
                let msg = BrokerMessage {
                    topic: retained.key().clone(),
                    payload: retained.value().clone(),
                    retained: true,
                };
                if entry.sender.send(msg).is_ok() {
                    replayed += 1;
                }
            }
        }

        tracing::debug!(client = client_id, filter, replayed, "Subscribed");
        Ok(replayed)
    }

    /// Subscription for the gateway itself
    pub fn subscribe_local(&self, filter: &str) -> Result<mpsc::UnboundedReceiver<BrokerMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client_id = format!("local-{}", Uuid::new_v4());
        self.subscribe(&client_id, filter, &tx, false)?;
        Ok(rx)
    }

    pub fn unsubscribe(&self, client_id: &str, filter: &str) -> bool {
        self.subscribers
            .get_mut(client_id)
            .map(|mut s| s.filters.remove(filter))
            .unwrap_or(false)
    }

    /// Drop every subscription of a client
    pub fn disconnect(&self, client_id: &str) {
        if self.subscribers.remove(client_id).is_some() {
            tracing::debug!(client = client_id, "Subscriber removed");
        }
    }

    /// Connected device sockets
    pub fn remote_clients(&self) -> usize {
        self.subscribers.iter().filter(|s| s.remote).count()
    }

    // ── Publishing ────────────────────────────────────────────────────────

    /// Deliver to every matching subscriber, once per subscriber.
    ///
    /// With `retain`, the payload also replaces the topic's retained
    /// message.
    pub fn publish(&self, topic: &str, payload: Value, retain: bool) -> Result<Delivery> {
        validate_topic(topic)?;

        if retain {
            self.retained.insert(topic.to_string(), payload.clone());
        }

        let mut matched = 0;
        let mut closed = Vec::new();
        for sub in self.subscribers.iter() {
            if !sub.filters.iter().any(|f| topic_matches(f, topic)) {
                continue;
            }
            let msg = BrokerMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
                retained: false,
            };
            if sub.sender.send(msg).is_ok() {
                matched += 1;
            } else {
                closed.push(sub.key().clone());
            }
        }
        for client in closed {
            self.disconnect(&client);
        }

        tracing::debug!(topic, matched, retain, "Published");
        Ok(Delivery {
            topic: topic.to_string(),
            matched,
            retained: retain,
        })
    }

    /// Current retained payload of a topic
    pub fn retained(&self, topic: &str) -> Option<Value> {
        self.retained.get(topic).map(|v| v.clone())
    }

    pub fn clear_retained(&self, topic: &str) -> bool {
        self.retained.remove(topic).is_some()
    }
}

// ── Topic Matching ────────────────────────────────────────────────────────────

/// MQTT-style filter match: `+` is one level, a trailing `#` the remainder
/// (including nothing).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn validate_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(Error::invalid("topic", "must not be empty"));
    }
    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
            return Err(Error::invalid("topic", "'#' must be the whole last level"));
        }
        if level.contains('+') && *level != "+" {
            return Err(Error::invalid("topic", "'+' must be a whole level"));
        }
    }
    Ok(())
}

fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::invalid("topic", "must not be empty"));
    }
    if topic.contains(['+', '#']) {
        return Err(Error::invalid("topic", "wildcards are not allowed when publishing"));
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("a/b/c", "a/b/c"));
        assert!(topic_matches("a/+/c", "a/x/c"));
        assert!(topic_matches("a/#", "a/b/c"));
        assert!(topic_matches("a/#", "a"));
        assert!(topic_matches(
            "iot_network/gw-1/devices/+/status",
            "iot_network/gw-1/devices/zone-1.01/status"
        ));
        assert!(!topic_matches("a/+/c", "a/x/y/c"));
        assert!(!topic_matches("a/b", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b"));
    }

    #[test]
    fn test_filter_validation() {
        assert!(validate_filter("a/#").is_ok());
        assert!(validate_filter("+/b").is_ok());
        assert!(validate_filter("a/#/c").is_err());
        assert!(validate_filter("a/b+").is_err());
        assert!(validate_topic("a/+").is_err());
        assert!(validate_topic("").is_err());
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers_once() {
        let broker = Broker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.subscribe("dev", "a/+", &tx, true).unwrap();
        broker.subscribe("dev", "a/#", &tx, true).unwrap();
        let mut other = broker.subscribe_local("b/#").unwrap();

        let delivery = broker.publish("a/x", json!({"n": 1}), false).unwrap();
        assert_eq!(delivery.matched, 1);
        assert!(!delivery.retained);

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "a/x");
        assert_eq!(msg.payload["n"], 1);
        assert!(rx.try_recv().is_err());
        assert!(other.try_recv().is_err());
        assert_eq!(broker.remote_clients(), 1);
    }

    #[tokio::test]
    async fn test_retained_replayed_on_subscribe() {
        let broker = Broker::new();
        broker.publish("a/config", json!("v1"), true).unwrap();
        broker.publish("a/config", json!("v2"), true).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert_eq!(broker.subscribe("dev", "a/+", &tx, true).unwrap(), 1);
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.payload, json!("v2"));
        assert!(msg.retained);

        assert!(broker.clear_retained("a/config"));
        assert!(broker.retained("a/config").is_none());
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_dropped() {
        let broker = Broker::new();
        let (tx, rx) = mpsc::unbounded_channel();
        broker.subscribe("dev", "a/#", &tx, true).unwrap();
        drop(rx);

        assert_eq!(broker.publish("a/b", json!(1), false).unwrap().matched, 0);
        assert_eq!(broker.remote_clients(), 0);
    }

    #[test]
    fn test_unsubscribe() {
        let broker = Broker::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        broker.subscribe("dev", "a/#", &tx, true).unwrap();
        assert!(broker.unsubscribe("dev", "a/#"));
        assert!(!broker.unsubscribe("dev", "a/#"));
        assert_eq!(broker.publish("a/b", json!(1), false).unwrap().matched, 0);
    }
}
