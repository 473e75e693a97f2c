//! WebSocket handler: room joins, terminal I/O, mode toggles.
//!
//! Authentication happens at the handshake (bearer header or `token` query
//! parameter). Each joined session room gets its own bus subscription whose
//! events are forwarded to this connection; writer errors are delivered as
//! `system.error` events to the offending connection only.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::api::{ApiError, AppState};
use crate::auth::CurrentUser;
use crate::events::{Event, EventKind, Room};

use super::types::ClientFrame;
use super::TokenBucket;

/// WS heartbeat interval.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Per-connection outbound buffer.
const OUT_BUFFER: usize = 256;

/// GET /api/v1/ws
pub async fn ws_handler(
    State(state): State<AppState>,
    user: CurrentUser,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    info!("websocket upgrade for {}", user.username);
    Ok(ws.on_upgrade(move |socket| handle_connection(socket, state, user)))
}

async fn handle_connection(socket: WebSocket, state: AppState, user: CurrentUser) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUT_BUFFER);

    // Outbound pump: serialized events plus protocol pings.
    let send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await;
        loop {
            tokio::select! {
                frame = out_rx.recv() => match frame {
                    Some(json) => {
                        if sink.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut joined: HashMap<String, JoinHandle<()>> = HashMap::new();
    let mut bucket = TokenBucket::new(state.limits.terminal_rate, state.limits.terminal_burst);

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                warn!("websocket error for {}: {err}", user.username);
                break;
            }
        };

        match message {
            Message::Text(text) => {
                let frame = match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => frame,
                    Err(err) => {
                        debug!("unparseable frame from {}: {err}", user.username);
                        send_error(&out_tx, None, format!("unparseable frame: {err}")).await;
                        continue;
                    }
                };
                handle_frame(&state, &user, &out_tx, &mut joined, &mut bucket, frame).await;
            }
            Message::Close(_) => {
                info!("{} closed websocket", user.username);
                break;
            }
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }

    for (_, task) in joined {
        task.abort();
    }
    send_task.abort();
    info!("websocket connection closed for {}", user.username);
}

async fn handle_frame(
    state: &AppState,
    user: &CurrentUser,
    out_tx: &mpsc::Sender<String>,
    joined: &mut HashMap<String, JoinHandle<()>>,
    bucket: &mut TokenBucket,
    frame: ClientFrame,
) {
    match frame {
        ClientFrame::JoinSession { session_id } => {
            let Some(handle) = state.manager.get(&session_id) else {
                send_error(
                    out_tx,
                    Some(&session_id),
                    format!("session {session_id} not found"),
                )
                .await;
                return;
            };

            // Only the owning analyst or an admin may observe a session.
            let meta = handle.meta();
            if meta.analyst_id != user.username && !user.is_admin() {
                send_error(out_tx, Some(&session_id), "not authorized to join").await;
                return;
            }

            if joined.contains_key(&session_id) {
                return;
            }

            let subscription = state.bus.subscribe_default(
                Room::Session(session_id.clone()),
                &format!("ws:{}:{session_id}", user.username),
            );
            let forward_tx = out_tx.clone();
            let task = tokio::spawn(async move {
                loop {
                    let event = subscription.recv().await;
                    let Ok(json) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if forward_tx.send(json).await.is_err() {
                        break;
                    }
                }
            });
            joined.insert(session_id.clone(), task);
            info!("{} joined room session:{session_id}", user.username);
        }

        ClientFrame::LeaveSession { session_id } => {
            if let Some(task) = joined.remove(&session_id) {
                task.abort();
                info!("{} left room session:{session_id}", user.username);
            }
        }

        ClientFrame::TerminalInput { session_id, data } => {
            let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(&data) else {
                send_error(out_tx, Some(&session_id), "invalid base64 input").await;
                return;
            };

            if !bucket.allow(bytes.len()) {
                send_error(out_tx, Some(&session_id), "terminal input rate limit exceeded")
                    .await;
                return;
            }

            let Some(handle) = state.manager.get(&session_id) else {
                return;
            };
            if let Err(err) = handle.terminal_input(&user.username, bytes).await {
                send_error(out_tx, Some(&session_id), err.to_string()).await;
            }
        }

        ClientFrame::TerminalResize {
            session_id,
            cols,
            rows,
        } => {
            if let Some(handle) = state.manager.get(&session_id) {
                let _ = handle.terminal_resize(cols, rows).await;
            }
        }

        ClientFrame::ToggleMode { session_id, mode } => {
            let Some(handle) = state.manager.get(&session_id) else {
                send_error(
                    out_tx,
                    Some(&session_id),
                    format!("session {session_id} not found"),
                )
                .await;
                return;
            };
            if let Err(err) = handle.enter_mode(mode, &user.username).await {
                send_error(out_tx, Some(&session_id), err.to_string()).await;
            }
        }
    }
}

/// Deliver a `system.error` to this connection only.
async fn send_error(
    out_tx: &mpsc::Sender<String>,
    session_id: Option<&str>,
    error: impl Into<String>,
) {
    let event = Event::new(EventKind::SystemError {
        session_id: session_id.map(str::to_string),
        component: "gateway".to_string(),
        error: error.into(),
        severity: "low".to_string(),
    });
    if let Ok(json) = serde_json::to_string(&event) {
        let _ = out_tx.send(json).await;
    }
}
