//! Device WebSocket connection handler.
//!
//! Each socket is one broker client. Replies and broker deliveries are
//! funnelled through a single sender task so writes never interleave.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::broker::BrokerMessage;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::GatewayState;

/// Handle a single device connection for its whole lifetime.
pub async fn handle_websocket(socket: WebSocket, state: GatewayState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let client_id = Uuid::new_v4().to_string();

    // Direct replies, and broker deliveries for this client
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let (bus_tx, mut bus_rx) = mpsc::unbounded_channel::<BrokerMessage>();

    tracing::info!(client = client_id.as_str(), "Device socket connected");

    // ── Sender Task ───────────────────────────────────────────────────────

    let sender_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                Some(reply) = reply_rx.recv() => reply,
                Some(delivery) = bus_rx.recv() => ServerMessage::Message {
                    topic: delivery.topic,
                    payload: delivery.payload,
                    retained: delivery.retained,
                },
                else => break,
            };
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break; // Connection closed
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize server message: {}", e);
                }
            }
        }
    });

    // ── Process Messages ──────────────────────────────────────────────────

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                let reply = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => handle_client_message(&state, &client_id, &bus_tx, client_msg),
                    Err(e) => {
                        tracing::warn!(
                            client = client_id.as_str(),
                            error = %e,
                            "Failed to parse device message"
                        );
                        ServerMessage::Error {
                            message: format!("Invalid message format: {}", e),
                        }
                    }
                };
                if reply_tx.send(reply).is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::debug!(client = client_id.as_str(), error = %e, "Socket error");
                break;
            }
            _ => {}
        }
    }

    // ── Cleanup ───────────────────────────────────────────────────────────

    state.broker.disconnect(&client_id);
    drop(reply_tx);
    drop(bus_tx);
    sender_task.abort();
    tracing::info!(client = client_id.as_str(), "Device socket disconnected");
}

/// Apply one device message to the broker and build the reply.
fn handle_client_message(
    state: &GatewayState,
    client_id: &str,
    bus_tx: &mpsc::UnboundedSender<BrokerMessage>,
    msg: ClientMessage,
) -> ServerMessage {
    match msg {
        ClientMessage::Subscribe { topic } => {
            match state.broker.subscribe(client_id, &topic, bus_tx, true) {
                Ok(_) => ServerMessage::Subscribed { topic },
                Err(e) => ServerMessage::Error {
                    message: e.to_string(),
                },
            }
        }
        ClientMessage::Unsubscribe { topic } => {
            state.broker.unsubscribe(client_id, &topic);
            ServerMessage::Unsubscribed { topic }
        }
        ClientMessage::Publish {
            topic,
            payload,
            retain,
        } => match state.broker.publish(&topic, payload, retain) {
            Ok(delivery) => ServerMessage::Published {
                topic,
                matched: delivery.matched,
            },
            Err(e) => ServerMessage::Error {
                message: e.to_string(),
            },
        },
        ClientMessage::Ping => ServerMessage::Pong,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::tests::test_state;
    use serde_json::json;

    #[tokio::test]
    async fn test_subscribe_then_receive_publish() {
        let (state, _control) = test_state();
        let (bus_tx, mut bus_rx) = mpsc::unbounded_channel();

        let reply = handle_client_message(
            &state,
            "dev-1",
            &bus_tx,
            ClientMessage::Subscribe {
                topic: "iot_network/gw-1/devices/zone-1.01/#".into(),
            },
        );
        assert!(matches!(reply, ServerMessage::Subscribed { .. }));

        let reply = handle_client_message(
            &state,
            "dev-2",
            &bus_tx,
            ClientMessage::Publish {
                topic: "iot_network/gw-1/devices/zone-1.01/commands".into(),
                payload: json!({"type": "PING"}),
                retain: false,
            },
        );
        match reply {
            ServerMessage::Published { matched, .. } => assert_eq!(matched, 1),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(bus_rx.recv().await.unwrap().payload["type"], "PING");
    }

    #[test]
    fn test_invalid_filter_is_error_reply() {
        let (state, _control) = test_state();
        let (bus_tx, _bus_rx) = mpsc::unbounded_channel();
        let reply = handle_client_message(
            &state,
            "dev-1",
            &bus_tx,
            ClientMessage::Subscribe {
                topic: "a/#/b".into(),
            },
        );
        assert!(matches!(reply, ServerMessage::Error { .. }));
        assert!(matches!(
            handle_client_message(&state, "dev-1", &bus_tx, ClientMessage::Ping),
            ServerMessage::Pong
        ));
    }
}
