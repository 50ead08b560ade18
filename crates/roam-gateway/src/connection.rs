use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use roam_types::events::{GatewayCommand, GatewayEvent};
use roam_types::models::UserId;

use crate::dispatcher::Dispatcher;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How much of a rejected frame is echoed into the log.
const LOG_PREVIEW_CHARS: usize = 200;

/// Drive one authenticated WebSocket connection. The identity token was
/// verified at the HTTP upgrade, so this goes straight to Ready.
pub async fn handle_connection(socket: WebSocket, dispatcher: Dispatcher, user_id: UserId) {
    let (mut sender, mut receiver) = socket.split();

    info!("{} connected to gateway", user_id);

    let ready = GatewayEvent::Ready {
        user_id: user_id.clone(),
    };
    match encode(&ready) {
        Some(text) => {
            if sender.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
        None => return,
    }

    let (conn_id, mut outbound) = dispatcher.register_connection(user_id.clone()).await;

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward pushes -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = outbound.recv() => {
                    let Some(event) = event else { break };
                    let Some(text) = encode(&event) else { continue };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let dispatcher_recv = dispatcher.clone();
    let user_recv = user_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => handle_command(&dispatcher_recv, conn_id, &user_recv, cmd).await,
                    Err(e) => {
                        warn!(
                            "{} bad command: {} -- raw: {}",
                            user_recv,
                            e,
                            preview(&text, LOG_PREVIEW_CHARS)
                        );
                        dispatcher_recv
                            .send_to_connection(
                                conn_id,
                                GatewayEvent::Error {
                                    message: format!("bad command: {}", e),
                                },
                            )
                            .await;
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    dispatcher.unregister_connection(conn_id).await;
    info!("{} disconnected from gateway", user_id);
}

async fn handle_command(dispatcher: &Dispatcher, conn_id: Uuid, user_id: &str, cmd: GatewayCommand) {
    match cmd {
        GatewayCommand::Subscribe { id, shape } => {
            info!("{} subscribing {} to {:?}", user_id, id, shape);
            dispatcher.subscribe(conn_id, id, shape).await;
        }

        GatewayCommand::Unsubscribe { id } => {
            if !dispatcher.unsubscribe(conn_id, &id).await {
                dispatcher
                    .send_to_connection(
                        conn_id,
                        GatewayEvent::Error {
                            message: format!("no subscription '{}'", id),
                        },
                    )
                    .await;
            }
        }
    }
}

/// The first `max_chars` characters of `text`, cut on a char boundary.
fn preview(text: &str, max_chars: usize) -> &str {
    text.char_indices()
        .nth(max_chars)
        .map_or(text, |(i, _)| &text[..i])
}

fn encode(event: &GatewayEvent) -> Option<String> {
    serde_json::to_string(event)
        .map_err(|e| warn!("Failed to encode gateway event: {}", e))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use roam_db::Database;
    use roam_types::events::QueryShape;

    #[tokio::test]
    async fn subscribe_command_pushes_snapshot() {
        let dispatcher = Dispatcher::new(Arc::new(Database::open_in_memory().unwrap()));
        let (conn_id, mut rx) = dispatcher.register_connection("alice").await;

        let cmd: GatewayCommand =
            serde_json::from_str(r#"{"type":"Subscribe","data":{"id":"s1","shape":{"kind":"all_trips"}}}"#)
                .unwrap();
        handle_command(&dispatcher, conn_id, "alice", cmd).await;

        match rx.try_recv().unwrap() {
            GatewayEvent::Snapshot { subscription_id, shape, .. } => {
                assert_eq!(subscription_id, "s1");
                assert_eq!(shape, QueryShape::AllTrips);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_unsubscribe_reports_error() {
        let dispatcher = Dispatcher::new(Arc::new(Database::open_in_memory().unwrap()));
        let (conn_id, mut rx) = dispatcher.register_connection("alice").await;

        handle_command(
            &dispatcher,
            conn_id,
            "alice",
            GatewayCommand::Unsubscribe { id: "nope".into() },
        )
        .await;

        assert!(matches!(rx.try_recv().unwrap(), GatewayEvent::Error { .. }));
    }

    #[test]
    fn preview_cuts_on_char_boundaries() {
        let text = format!("{}é{}", "a".repeat(199), "b".repeat(50));
        let cut = preview(&text, LOG_PREVIEW_CHARS);
        assert_eq!(cut.chars().count(), LOG_PREVIEW_CHARS);
        assert!(cut.ends_with('é'));
        assert_eq!(preview("short", LOG_PREVIEW_CHARS), "short");
    }

    #[test]
    fn events_encode_with_type_tag() {
        let text = encode(&GatewayEvent::Ready {
            user_id: "alice".into(),
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "Ready");
        assert_eq!(value["data"]["user_id"], "alice");
    }
}
