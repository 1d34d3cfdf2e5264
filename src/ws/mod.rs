//! WebSocket hub.
//!
//! `GET /ws` upgrades (admission already ran in middleware) and enters a
//! per-connection loop: text frames are `{id, method, params}` requests
//! dispatched to the IPC multiplexer, replies come back as
//! `{id, success, result | error}`, and server pushes use
//! `{event, data}`. Video subscriptions feed binary JPEG frames through
//! a bounded per-connection queue. Liveness is a ping every
//! `ping_interval`; a pong missing past `pong_timeout` marks the
//! connection degraded, and three consecutive misses close it with 1001.

use crate::error::{ApiError, IpcError};
use crate::AppContext;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Per-connection outbound FIFO depth.
const SEND_QUEUE_DEPTH: usize = 64;
/// Consecutive missed pongs before the hub gives up on a connection.
const MAX_FAILED_PINGS: u32 = 3;

/// Going away (RFC 6455 §7.4.1) — used for liveness-failure closes.
const CLOSE_GOING_AWAY: u16 = 1001;
/// Message too big.
const CLOSE_MESSAGE_TOO_BIG: u16 = 1009;

/// Shared hub state: the connection gauge that enforces the cap.
#[derive(Debug, Default)]
pub struct WsHub {
    active: AtomicUsize,
    next_conn_id: AtomicU64,
}

impl WsHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

#[derive(Deserialize)]
struct WsRequest {
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

pub async fn ws_handler(
    State(ctx): State<Arc<AppContext>>,
    ws: WebSocketUpgrade,
) -> Response {
    if !ctx.config.websocket.enabled {
        return ApiError::NotFound.into_response();
    }
    // Cap check at handshake: connections past the limit get a plain 503
    // before the upgrade, which clients see as a failed handshake.
    let cap = ctx.config.websocket.max_connections;
    if ctx.ws_hub.active_count() >= cap {
        warn!(cap, "websocket connection cap reached — rejecting handshake");
        return (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(serde_json::json!({
                "success": false,
                "status": 503,
                "error": "websocket connection limit reached",
            })),
        )
            .into_response();
    }
    let max_message = ctx.config.websocket.max_message;
    ws.max_message_size(max_message)
        .on_upgrade(move |socket| handle_socket(socket, ctx))
}

fn reply_ok(id: &Value, result: Value) -> String {
    json!({"id": id, "success": true, "result": result}).to_string()
}

fn reply_err(id: &Value, error: &str) -> String {
    json!({"id": id, "success": false, "error": error}).to_string()
}

fn event(name: &str, data: Value) -> String {
    json!({"event": name, "data": data}).to_string()
}

async fn handle_socket(socket: WebSocket, ctx: Arc<AppContext>) {
    let conn_id = ctx.ws_hub.next_conn_id.fetch_add(1, Ordering::Relaxed);
    ctx.ws_hub.active.fetch_add(1, Ordering::AcqRel);
    ctx.stats.ws_connections.fetch_add(1, Ordering::Relaxed);
    debug!(conn_id, "websocket connection open");

    let (mut sink, mut stream) = socket.split();

    // Outbound send queue: strict FIFO per connection, drained by one
    // writer task. Everything outbound goes through here.
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(SEND_QUEUE_DEPTH);
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // One bounded frame channel serves every video subscription this
    // connection makes; the publisher's try_send backpressure applies
    // upstream of it.
    let (video_tx, mut video_rx) =
        mpsc::channel::<Bytes>(crate::video::VideoStreams::subscriber_queue_depth());

    let ping_interval = Duration::from_secs(ctx.config.websocket.ping_interval_sec);
    let pong_timeout = Duration::from_secs(ctx.config.websocket.pong_timeout_sec);
    let max_message = ctx.config.websocket.max_message;

    let mut ping_timer = tokio::time::interval(ping_interval);
    // The first tick fires immediately; skip it so the first ping waits a
    // full interval.
    ping_timer.tick().await;

    let mut pong_outstanding = false;
    let mut pong_armed = false;
    let mut failed_pings: u32 = 0;
    let mut close_frame: Option<CloseFrame> = None;

    let pong_sleep = tokio::time::sleep(pong_timeout);
    tokio::pin!(pong_sleep);

    loop {
        tokio::select! {
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        ctx.stats.ws_messages_in.fetch_add(1, Ordering::Relaxed);
                        handle_text(&ctx, conn_id, text.as_str(), &out_tx, &video_tx).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        pong_outstanding = false;
                        pong_armed = false;
                        failed_pings = 0;
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // The library answers pings; nothing to do.
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let _ = out_tx
                            .send(Message::Text(
                                reply_err(&Value::Null, "binary requests are not supported").into(),
                            ))
                            .await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(conn_id, err = %e, "websocket read error");
                        break;
                    }
                }
            }

            frame = video_rx.recv() => {
                let Some(frame) = frame else { break };
                if frame.len() > max_message {
                    close_frame = Some(CloseFrame {
                        code: CLOSE_MESSAGE_TOO_BIG,
                        reason: "frame exceeds message limit".into(),
                    });
                    break;
                }
                ctx.stats.ws_messages_out.fetch_add(1, Ordering::Relaxed);
                // Frames already passed the fanout's backpressure; a full
                // send queue here drops the frame rather than stalling
                // control traffic.
                if out_tx.try_send(Message::Binary(frame)).is_err() {
                    ctx.stats.video_frames_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }

            _ = ping_timer.tick() => {
                if !pong_outstanding {
                    pong_outstanding = true;
                    pong_armed = true;
                    pong_sleep
                        .as_mut()
                        .reset(tokio::time::Instant::now() + pong_timeout);
                    if out_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }

            () = &mut pong_sleep, if pong_armed => {
                failed_pings += 1;
                pong_armed = false;
                pong_outstanding = false;
                warn!(conn_id, failed_pings, "pong missing — connection degraded");
                if failed_pings >= MAX_FAILED_PINGS {
                    close_frame = Some(CloseFrame {
                        code: CLOSE_GOING_AWAY,
                        reason: "liveness check failed".into(),
                    });
                    break;
                }
                let _ = out_tx
                    .send(Message::Text(
                        event("connectionDegraded", json!({"failed_pings": failed_pings})).into(),
                    ))
                    .await;
            }
        }
    }

    // Graceful close: queue the close frame (if we initiated) and let the
    // writer drain before tearing down.
    if let Some(frame) = close_frame {
        let _ = out_tx.send(Message::Close(Some(frame))).await;
    }
    drop(out_tx);
    let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;

    ctx.video.unsubscribe(conn_id);
    ctx.ws_hub.active.fetch_sub(1, Ordering::AcqRel);
    debug!(conn_id, "websocket connection closed");
}

/// Parse and dispatch one text request.
async fn handle_text(
    ctx: &Arc<AppContext>,
    conn_id: u64,
    text: &str,
    out_tx: &mpsc::Sender<Message>,
    video_tx: &mpsc::Sender<Bytes>,
) {
    let req: WsRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(_) => {
            let _ = out_tx
                .send(Message::Text(
                    reply_err(&Value::Null, "invalid request frame").into(),
                ))
                .await;
            return;
        }
    };
    let id = req.id.unwrap_or(Value::Null);

    match req.method.as_str() {
        // Hub-local liveness probe; no browser round trip.
        "ping" => {
            let _ = out_tx
                .send(Message::Text(reply_ok(&id, json!({"pong": true})).into()))
                .await;
        }
        "subscribeVideo" => {
            let Some(context_id) = req.params.get("context_id").and_then(Value::as_str) else {
                let _ = out_tx
                    .send(Message::Text(
                        reply_err(&id, "subscribeVideo requires context_id").into(),
                    ))
                    .await;
                return;
            };
            ctx.video.subscribe(context_id, conn_id, video_tx.clone());
            let _ = out_tx
                .send(Message::Text(
                    reply_ok(&id, json!({"subscribed": context_id})).into(),
                ))
                .await;
        }
        "unsubscribeVideo" => {
            ctx.video.unsubscribe(conn_id);
            let _ = out_tx
                .send(Message::Text(reply_ok(&id, json!({"subscribed": false})).into()))
                .await;
        }
        // Everything else goes to the browser. Dispatch on its own task so
        // a slow command never blocks this connection's read loop.
        _ => {
            let ctx = ctx.clone();
            let out_tx = out_tx.clone();
            let method = req.method.clone();
            let params = req.params;
            tokio::spawn(async move {
                let outcome = ctx.ipc.call(&method, params, None).await;
                ctx.stats.ws_messages_out.fetch_add(1, Ordering::Relaxed);
                let text = match outcome {
                    Ok(result) => reply_ok(&id, result),
                    Err(e) => reply_err(&id, &ipc_error_text(&e)),
                };
                let _ = out_tx.send(Message::Text(text.into())).await;
            });
        }
    }
}

fn ipc_error_text(e: &IpcError) -> String {
    match e {
        IpcError::Timeout => "timeout".to_string(),
        IpcError::Browser { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_shapes_match_the_wire_contract() {
        let ok: Value = serde_json::from_str(&reply_ok(&json!(1), json!({"x": 1}))).unwrap();
        assert_eq!(ok["id"], 1);
        assert_eq!(ok["success"], true);
        assert_eq!(ok["result"]["x"], 1);

        let err: Value = serde_json::from_str(&reply_err(&json!(2), "boom")).unwrap();
        assert_eq!(err["id"], 2);
        assert_eq!(err["success"], false);
        assert_eq!(err["error"], "boom");

        let ev: Value =
            serde_json::from_str(&event("connectionDegraded", json!({"failed_pings": 1}))).unwrap();
        assert_eq!(ev["event"], "connectionDegraded");
        assert_eq!(ev["data"]["failed_pings"], 1);
    }

    #[test]
    fn request_parse_accepts_missing_params() {
        let req: WsRequest = serde_json::from_str(r#"{"id":1,"method":"ping"}"#).unwrap();
        assert_eq!(req.method, "ping");
        assert!(req.params.is_null());
    }

    #[test]
    fn handshake_accept_key_matches_rfc6455_vector() {
        // The upgrade path delegates key derivation to tungstenite; pin the
        // RFC 6455 §1.3 sample so a library regression cannot slip through.
        let accept = tokio_tungstenite::tungstenite::handshake::derive_accept_key(
            b"dGhlIHNhbXBsZSBub25jZQ==",
        );
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }
}
