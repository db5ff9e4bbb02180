//! Client fan-out: pushes state changes to connected clients.
//!
//! Per connection: a snapshot frame on connect, then change frames
//! coalesced per `(device, topic-group)` within a 100 ms window, delivered
//! through a bounded per-client queue. A client that cannot keep up is
//! closed with a `slow-consumer` reason and is expected to reconnect and
//! resynchronize from the snapshot.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket, close_code},
    },
    response::IntoResponse,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::collections::HashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use hh_common::events::{ChangeKind, StateChange};

use crate::state::ApiState;

const CLIENT_QUEUE_CAP: usize = 64;
const COALESCE_WINDOW: Duration = Duration::from_millis(100);
const PING_INTERVAL: Duration = Duration::from_secs(30);
const MAX_MISSED_PONGS: u32 = 2;

pub fn router() -> Router<ApiState> {
    Router::new().route("/ws", get(ws_handler))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ApiState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

enum Control {
    Pong(Vec<u8>),
    PongJson,
}

async fn handle_socket(socket: WebSocket, state: ApiState) {
    let client_id = uuid::Uuid::new_v4();
    debug!("WebSocket client {client_id} connected");

    let (mut sender, mut receiver) = socket.split();

    // Snapshot first: clients rebuild their world from this on every
    // (re)connect; nothing is replayed.
    let devices = state.state.snapshot_all().await;
    let alerts = state.alerts.current().await;
    let snapshot = json!({ "type": "snapshot", "devices": devices, "alerts": alerts });
    if sender
        .send(Message::Text(snapshot.to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    let (frame_tx, mut frame_rx) = mpsc::channel::<String>(CLIENT_QUEUE_CAP);
    let (control_tx, mut control_rx) = mpsc::channel::<Control>(8);
    let slow = Arc::new(AtomicBool::new(false));
    let outstanding_pings = Arc::new(AtomicU32::new(0));
    let mut shutdown = state.shutdown.clone();
    state.active_clients.fetch_add(1, Ordering::Relaxed);

    // Coalescing forwarder: state changes → per-client queue.
    let forwarder = {
        let changes = state.state.subscribe();
        let slow = slow.clone();
        tokio::spawn(run_forwarder(changes, frame_tx, slow))
    };

    // Reader: pongs reset the liveness counter; app-level pings are
    // answered; unknown message types are ignored.
    let reader = {
        let outstanding = outstanding_pings.clone();
        tokio::spawn(async move {
            while let Some(Ok(message)) = receiver.next().await {
                match message {
                    Message::Close(_) => break,
                    Message::Pong(_) => outstanding.store(0, Ordering::Relaxed),
                    Message::Ping(data) => {
                        let _ = control_tx.send(Control::Pong(data.to_vec())).await;
                    }
                    Message::Text(text) => {
                        if let Ok(value) = serde_json::from_str::<Value>(&text) {
                            if value.get("type").and_then(|t| t.as_str()) == Some("ping") {
                                let _ = control_tx.send(Control::PongJson).await;
                            }
                        }
                    }
                    _ => {}
                }
            }
        })
    };

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            frame = frame_rx.recv() => match frame {
                Some(text) => {
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => {
                    if slow.load(Ordering::Relaxed) {
                        info!("WebSocket client {client_id} is a slow consumer, closing");
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code: close_code::POLICY,
                                reason: "slow-consumer".into(),
                            })))
                            .await;
                    }
                    break;
                }
            },
            control = control_rx.recv() => match control {
                Some(Control::Pong(data)) => {
                    if sender.send(Message::Pong(data.into())).await.is_err() {
                        break;
                    }
                }
                Some(Control::PongJson) => {
                    let pong = json!({ "type": "pong" }).to_string();
                    if sender.send(Message::Text(pong.into())).await.is_err() {
                        break;
                    }
                }
                // Reader finished: the client went away.
                None => break,
            },
            _ = ping.tick() => {
                if outstanding_pings.load(Ordering::Relaxed) >= MAX_MISSED_PONGS {
                    info!("WebSocket client {client_id} missed {MAX_MISSED_PONGS} pings, closing");
                    break;
                }
                outstanding_pings.fetch_add(1, Ordering::Relaxed);
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            },
            // Server shutdown: close the socket cleanly so the client
            // knows to reconnect later, and count ourselves out of the
            // drain.
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                debug!("Closing WebSocket client {client_id} for shutdown");
                let _ = sender
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::AWAY,
                        reason: "server-shutdown".into(),
                    })))
                    .await;
                break;
            }
        }
    }

    forwarder.abort();
    reader.abort();
    state.active_clients.fetch_sub(1, Ordering::Relaxed);
    debug!("WebSocket client {client_id} disconnected");
}

/// Forward change records into the client queue, coalescing bursts: when
/// several changes hit the same `(device, topic-group)` inside the window,
/// only the last one is sent.
async fn run_forwarder(
    mut changes: broadcast::Receiver<StateChange>,
    frame_tx: mpsc::Sender<String>,
    slow: Arc<AtomicBool>,
) {
    let mut pending: HashMap<String, Value> = HashMap::new();
    let mut flush_at = tokio::time::Instant::now();

    loop {
        tokio::select! {
            result = changes.recv() => match result {
                Ok(change) => {
                    if let Some((key, frame)) = frame_for(&change) {
                        if pending.is_empty() {
                            flush_at = tokio::time::Instant::now() + COALESCE_WINDOW;
                        }
                        pending.insert(key, frame);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Fan-out forwarder lagged {} change records", n);
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            _ = tokio::time::sleep_until(flush_at), if !pending.is_empty() => {
                for (_, frame) in pending.drain() {
                    match frame_tx.try_send(frame.to_string()) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            // One overflow disconnects the client; dropping
                            // the channel wakes the writer.
                            slow.store(true, Ordering::Relaxed);
                            return;
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => return,
                    }
                }
            }
        }
    }
}

/// Map a change record to its client frame and coalescing key. Readings
/// and internal bookkeeping records are not client-visible.
fn frame_for(change: &StateChange) -> Option<(String, Value)> {
    match change.kind {
        ChangeKind::Reading | ChangeKind::IncidentsCleared => None,
        ChangeKind::Alerts => Some((
            "alerts".to_string(),
            json!({ "type": "alerts", "alerts": change.after }),
        )),
        _ => {
            let group = change.topic_group().to_string();
            let mut frame = serde_json::Map::new();
            frame.insert("type".to_string(), json!(group));
            frame.insert("device_id".to_string(), json!(change.device_id));
            if let Value::Object(after) = &change.after {
                for (field, value) in after {
                    frame.insert(field.clone(), value.clone());
                }
            }
            Some((
                format!("{}|{}", change.device_id, group),
                Value::Object(frame),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn door_changes_become_door_frames_with_state() {
        let change = StateChange::new(
            "garage-controller",
            ChangeKind::Door,
            Value::Null,
            json!({ "state": "opening", "ts": 1 }),
        );
        let (key, frame) = frame_for(&change).unwrap();
        assert_eq!(key, "garage-controller|door");
        assert_eq!(frame["type"], "door");
        assert_eq!(frame["state"], "opening");
    }

    #[test]
    fn status_changes_group_by_device() {
        let change = StateChange::new(
            "house-monitor",
            ChangeKind::Status,
            json!({ "status": "online" }),
            json!({ "status": "offline" }),
        );
        let (key, frame) = frame_for(&change).unwrap();
        assert_eq!(key, "house-monitor|house-monitor");
        assert_eq!(frame["type"], "house-monitor");
        assert_eq!(frame["status"], "offline");
    }

    #[test]
    fn readings_are_not_client_frames() {
        let change = StateChange::new(
            "garage-controller",
            ChangeKind::Reading,
            Value::Null,
            json!({ "metric": "weather_temperature_f", "value": 70.0, "ts": 1 }),
        );
        assert!(frame_for(&change).is_none());
    }

    #[test]
    fn alert_set_changes_use_the_alerts_group() {
        let change = StateChange::new("", ChangeKind::Alerts, json!([]), json!([{ "code": "x" }]));
        let (key, frame) = frame_for(&change).unwrap();
        assert_eq!(key, "alerts");
        assert_eq!(frame["type"], "alerts");
        assert!(frame["alerts"].is_array());
    }
}
