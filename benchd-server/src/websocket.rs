//! WebSocket transport: snapshot-then-patches state dissemination, event
//! stream, heartbeat, and inbound command dispatch.
//!
//! Each client gets the current fabric snapshot on attach followed by
//! ordered patches. If the per-client delta stream lags behind the
//! broadcast, the client is resynced with a fresh snapshot instead of a
//! gapped patch sequence.

use axum::extract::ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use benchd_core::BenchEvent;
use benchd_core::keyboard::{KeyAction, KeyEventRequest};
use benchd_core::state::PatchOp;

use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
enum Outbound {
    #[serde(rename = "status")]
    Status { state: String },
    #[serde(rename = "state:snapshot")]
    Snapshot { version: u64, data: Value },
    #[serde(rename = "state:patch")]
    Patch {
        from: u64,
        to: u64,
        patch: Vec<PatchOp>,
    },
    #[serde(rename = "ping")]
    Ping { ts: i64 },
    #[serde(rename = "event")]
    Event { event: BenchEvent },
    #[serde(rename = "error")]
    Error { message: String },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Inbound {
    Pong {
        #[serde(default)]
        ts: Option<i64>,
    },
    Key {
        action: KeyAction,
        #[serde(flatten)]
        request: KeyEventRequest,
    },
    PowerOn,
    PowerOff,
    #[serde(rename = "imager:list")]
    ImagerList { path: String },
    #[serde(rename = "imager:mkdir")]
    ImagerMkdir { name: String },
    #[serde(rename = "imager:rename")]
    ImagerRename { from: String, to: String },
    #[serde(rename = "imager:move")]
    ImagerMove { from: String, dest_dir: String },
    #[serde(rename = "imager:delete")]
    ImagerDelete { path: String },
    #[serde(rename = "imager:read")]
    ImagerRead { dest_dir: String, name: String },
    #[serde(rename = "imager:write")]
    ImagerWrite { name: String },
    Cancel {
        #[serde(default)]
        reason: Option<String>,
    },
}

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(256);
    let closed = CancellationToken::new();

    // Outgoing pump: everything funnels through one writer.
    let sender_closed = closed.clone();
    let sender_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&msg) else {
                continue;
            };
            if ws_sender.send(Message::Text(Utf8Bytes::from(text))).await.is_err() {
                break;
            }
        }
        sender_closed.cancel();
    });

    let snapshot = state.bench.fabric().snapshot();
    let _ = tx
        .send(Outbound::Status {
            state: "connected".into(),
        })
        .await;
    let _ = tx
        .send(Outbound::Snapshot {
            version: snapshot.version,
            data: snapshot.data,
        })
        .await;

    // State deltas, with snapshot resync on lag.
    let delta_tx = tx.clone();
    let delta_state = state.clone();
    let delta_closed = closed.clone();
    let delta_task = tokio::spawn(async move {
        let mut deltas = delta_state.bench.fabric().subscribe_deltas();
        loop {
            tokio::select! {
                _ = delta_closed.cancelled() => break,
                delta = deltas.recv() => match delta {
                    Ok(delta) => {
                        let msg = Outbound::Patch {
                            from: delta.from,
                            to: delta.to,
                            patch: delta.patch,
                        };
                        if delta_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        let snapshot = delta_state.bench.fabric().snapshot();
                        let msg = Outbound::Snapshot {
                            version: snapshot.version,
                            data: snapshot.data,
                        };
                        if delta_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    });

    // Device/op events.
    let event_tx = tx.clone();
    let event_state = state.clone();
    let event_closed = closed.clone();
    let event_task = tokio::spawn(async move {
        let mut events = event_state.bench.broadcast().subscribe();
        loop {
            tokio::select! {
                _ = event_closed.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        if event_tx.send(Outbound::Event { event }).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(target: "ws", skipped, "event stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    });

    // Heartbeat: ping on an interval, close when pongs stop coming back.
    let last_pong = Arc::new(AtomicI64::new(Utc::now().timestamp_millis()));
    let ping_tx = tx.clone();
    let ping_pong = Arc::clone(&last_pong);
    let ping_closed = closed.clone();
    let interval = Duration::from_millis(state.config.heartbeat_interval_ms);
    let timeout_ms = state.config.heartbeat_timeout_ms as i64;
    let heartbeat_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = ping_closed.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            let age = Utc::now().timestamp_millis() - ping_pong.load(Ordering::SeqCst);
            if age > timeout_ms {
                tracing::info!(target: "ws", age_ms = age, "heartbeat timed out, closing");
                ping_closed.cancel();
                break;
            }
            let msg = Outbound::Ping {
                ts: Utc::now().timestamp_millis(),
            };
            if ping_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    handle_text(text.as_str(), &state, &tx, &last_pong).await;
                }
                Some(Ok(Message::Binary(bin))) => {
                    if let Ok(text) = std::str::from_utf8(bin.as_ref()) {
                        handle_text(text, &state, &tx, &last_pong).await;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(target: "ws", error = %err, "socket error");
                    break;
                }
            }
        }
    }

    closed.cancel();
    drop(tx);
    for task in [sender_task, delta_task, event_task, heartbeat_task] {
        task.abort();
    }
}

async fn handle_text(
    text: &str,
    state: &AppState,
    tx: &mpsc::Sender<Outbound>,
    last_pong: &AtomicI64,
) {
    let inbound = match serde_json::from_str::<Inbound>(text) {
        Ok(inbound) => inbound,
        Err(err) => {
            let _ = tx
                .send(Outbound::Error {
                    message: format!("unrecognized command: {err}"),
                })
                .await;
            return;
        }
    };

    if let Err(err) = dispatch(inbound, state, last_pong) {
        let _ = tx.send(Outbound::Error { message: err }).await;
    }
}

/// Route a command to its service. Handles are dropped: per-op lifecycle
/// arrives through the event stream, not a request/response pair.
fn dispatch(inbound: Inbound, state: &AppState, last_pong: &AtomicI64) -> Result<(), String> {
    let stringify = |err: benchd_core::BenchError| err.to_string();
    match inbound {
        Inbound::Pong { .. } => {
            last_pong.store(Utc::now().timestamp_millis(), Ordering::SeqCst);
            Ok(())
        }
        Inbound::Key { action, request } => state
            .bench
            .keyboard()
            .enqueue_key_event(action, request)
            .map(drop)
            .map_err(stringify),
        Inbound::PowerOn => state
            .bench
            .keyboard()
            .power_on(None)
            .map(drop)
            .map_err(stringify),
        Inbound::PowerOff => state
            .bench
            .keyboard()
            .power_off(None)
            .map(drop)
            .map_err(stringify),
        Inbound::ImagerList { path } => {
            state.bench.imager().list(&path).map(drop).map_err(stringify)
        }
        Inbound::ImagerMkdir { name } => state
            .bench
            .imager()
            .make_directory(&name)
            .map(drop)
            .map_err(stringify),
        Inbound::ImagerRename { from, to } => state
            .bench
            .imager()
            .rename(&from, &to)
            .map(drop)
            .map_err(stringify),
        Inbound::ImagerMove { from, dest_dir } => state
            .bench
            .imager()
            .move_to(&from, &dest_dir)
            .map(drop)
            .map_err(stringify),
        Inbound::ImagerDelete { path } => state
            .bench
            .imager()
            .delete(&path)
            .map(drop)
            .map_err(stringify),
        Inbound::ImagerRead { dest_dir, name } => state
            .bench
            .imager()
            .read_image(&dest_dir, &name, None)
            .map(drop)
            .map_err(stringify),
        Inbound::ImagerWrite { name } => state
            .bench
            .imager()
            .write_image(&name, None)
            .map(drop)
            .map_err(stringify),
        Inbound::Cancel { reason } => {
            let reason = reason.unwrap_or_else(|| "client-cancel".to_string());
            state.bench.keyboard().cancel_all(&reason);
            state.bench.imager().queue().cancel_all(&reason);
            Ok(())
        }
    }
}
