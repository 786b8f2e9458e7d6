//! Per-session duplex transport over WebSocket.
//!
//! Text frames carry JSON control messages; binary frames carry raw PCM.
//! Outbound audio is one binary message: a JSON header line terminated by
//! `\n`, immediately followed by the raw bytes. A dedicated writer task
//! decouples socket sends from the engine. A disconnect only schedules
//! deletion; a reconnect inside the grace window re-attaches to the same
//! session.

use std::borrow::Cow;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use sauti_core::{now_unix_millis, AudioFrame, EngineEvent, SessionEvent};

use crate::api::request_context::RequestContext;
use crate::registry::ManagedSession;
use crate::state::AppState;

/// Largest accepted inbound audio frame.
const MAX_FRAME_BYTES: usize = 1024 * 1024;
/// How long a disconnected session waits for a reconnect before deletion.
const RECONNECT_GRACE: Duration = Duration::from_secs(5);

pub fn router() -> Router<AppState> {
    Router::new().route("/ws/:session_id", get(ws_upgrade))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Extension(ctx): Extension<RequestContext>,
) -> Response {
    let managed = state.manager.get(&session_id).await;
    let correlation_id = ctx.correlation_id;
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id, correlation_id, managed))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    session_id: String,
    correlation_id: String,
    managed: Option<ManagedSession>,
) {
    let Some(managed) = managed else {
        reject_unknown_session(socket, &session_id).await;
        return;
    };

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    managed.attach_epoch.fetch_add(1, Ordering::SeqCst);
    managed.connected.store(true, Ordering::SeqCst);
    info!(session = %session_id, correlation = %correlation_id, "transport attached");

    send_json(
        &out_tx,
        json!({
            "type": "ready",
            "session_id": session_id,
        }),
    );

    let forwarder = tokio::spawn(forward_engine_events(
        managed.handle.subscribe(),
        out_tx.clone(),
    ));

    while let Some(result) = ws_rx.next().await {
        let message = match result {
            Ok(message) => message,
            Err(err) => {
                warn!(session = %session_id, "websocket receive error: {err}");
                break;
            }
        };

        match message {
            Message::Text(text) => {
                handle_control_frame(&session_id, &managed, &out_tx, &text);
            }
            Message::Binary(data) => {
                if data.len() > MAX_FRAME_BYTES {
                    debug!(
                        session = %session_id,
                        "dropping oversized audio frame ({} bytes)",
                        data.len()
                    );
                    continue;
                }
                let frame = AudioFrame::new(data, now_unix_millis());
                if !managed.handle.send(SessionEvent::Frame(frame)) {
                    break;
                }
            }
            Message::Close(_) => {
                debug!(session = %session_id, "client closed transport");
                break;
            }
            Message::Ping(payload) => {
                let _ = out_tx.send(Message::Pong(payload));
            }
            Message::Pong(_) => {}
        }
    }

    managed.connected.store(false, Ordering::SeqCst);
    forwarder.abort();
    drop(out_tx);
    let _ = writer.await;
    info!(session = %session_id, correlation = %correlation_id, "transport detached");

    schedule_grace_deletion(state, session_id, managed);
}

async fn reject_unknown_session(mut socket: WebSocket, session_id: &str) {
    warn!(session = %session_id, "rejecting transport for unknown session");
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: Cow::from("unknown session"),
        })))
        .await;
}

/// After a disconnect, delete the session unless a transport re-attached
/// within the grace window.
fn schedule_grace_deletion(state: AppState, session_id: String, managed: ManagedSession) {
    let epoch_at_disconnect = managed.attach_epoch.load(Ordering::SeqCst);
    tokio::spawn(async move {
        tokio::time::sleep(RECONNECT_GRACE).await;
        if managed.connected.load(Ordering::SeqCst) {
            return;
        }
        // A newer transport attached meanwhile; its own disconnect owns
        // the grace window now.
        if managed.attach_epoch.load(Ordering::SeqCst) != epoch_at_disconnect {
            return;
        }
        if state.manager.delete(&session_id).await {
            info!(session = %session_id, "session deleted after reconnect grace");
        }
    });
}

/// Inbound control frames recognized on the transport.
#[derive(Debug, PartialEq, Eq)]
enum ClientControl {
    Interrupt,
    Offer,
    IceCandidate,
    StartRecording,
    StopRecording,
    Unknown(String),
    Invalid,
}

fn parse_control(text: &str) -> ClientControl {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return ClientControl::Invalid;
    };
    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return ClientControl::Invalid;
    };
    match kind {
        "interrupt" => ClientControl::Interrupt,
        "offer" => ClientControl::Offer,
        "ice-candidate" => ClientControl::IceCandidate,
        "start-recording" => ClientControl::StartRecording,
        "stop-recording" => ClientControl::StopRecording,
        other => ClientControl::Unknown(other.to_string()),
    }
}

fn handle_control_frame(
    session_id: &str,
    managed: &ManagedSession,
    out_tx: &mpsc::UnboundedSender<Message>,
    text: &str,
) {
    match parse_control(text) {
        ClientControl::Interrupt => {
            managed.handle.send(SessionEvent::Interrupt);
        }
        ClientControl::Offer => {
            // No media negotiation stack behind this endpoint; a canned
            // answer keeps client state flow moving.
            send_json(
                out_tx,
                json!({
                    "type": "answer",
                    "sdp": "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=sauti\r\nt=0 0\r\n",
                    "timestamp": now_unix_millis(),
                }),
            );
        }
        ClientControl::IceCandidate => {
            debug!(session = %session_id, "ice candidate acknowledged");
        }
        ClientControl::StartRecording | ClientControl::StopRecording => {
            debug!(session = %session_id, "advisory recording control received");
        }
        ClientControl::Unknown(kind) => {
            warn!(session = %session_id, "ignoring unknown control frame type '{kind}'");
        }
        ClientControl::Invalid => {
            warn!(session = %session_id, "dropping malformed control frame");
        }
    }
}

async fn forward_engine_events(
    mut events: tokio::sync::broadcast::Receiver<EngineEvent>,
    out_tx: mpsc::UnboundedSender<Message>,
) {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        match events.recv().await {
            Ok(EngineEvent::StateChanged {
                transition, state, ..
            }) => {
                send_json(
                    &out_tx,
                    json!({
                        "type": "state_change",
                        "state": state,
                        "transition": {
                            "from": transition.from,
                            "to": transition.to,
                            "event": transition.event,
                        },
                        "timestamp": transition.at_ms,
                    }),
                );
            }
            Ok(EngineEvent::Thinking { at_ms }) => {
                send_json(&out_tx, json!({ "type": "llm_thinking", "timestamp": at_ms }));
            }
            Ok(EngineEvent::StopPlayback { at_ms }) => {
                send_json(&out_tx, json!({ "type": "stop-tts", "timestamp": at_ms }));
            }
            Ok(EngineEvent::Audio {
                pcm,
                is_final,
                at_ms,
            }) => {
                let _ = out_tx.send(Message::Binary(encode_audio_message(
                    &pcm, is_final, at_ms,
                )));
            }
            Ok(EngineEvent::TurnCompleted(_)) => {}
            Ok(EngineEvent::Ended { .. }) => {
                let _ = out_tx.send(Message::Close(None));
                break;
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("transport forwarder lagged, skipped {skipped} events");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// One outbound audio delivery: JSON header line + `\n` + raw PCM.
fn encode_audio_message(pcm: &Bytes, is_final: bool, timestamp: u64) -> Vec<u8> {
    let header = json!({
        "type": "audio",
        "is_final": is_final,
        "timestamp": timestamp,
    })
    .to_string();

    let mut message = Vec::with_capacity(header.len() + 1 + pcm.len());
    message.extend_from_slice(header.as_bytes());
    message.push(b'\n');
    message.extend_from_slice(pcm);
    message
}

fn send_json(out_tx: &mpsc::UnboundedSender<Message>, value: Value) -> bool {
    match serde_json::to_string(&value) {
        Ok(text) => out_tx.send(Message::Text(text)).is_ok(),
        Err(err) => {
            warn!("failed to serialize transport frame: {err}");
            false
        }
    }
}
