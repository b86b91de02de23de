//! WebSocket transport for terminal sessions.

use std::time::Instant;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use super::WS_WRITE_TIMEOUT;
use super::coalesce::PollBackoff;
use crate::api::AppState;
use crate::engine::ReadOptions;

/// Read at most this much per poll so one message stays manageable.
const READ_CHUNK_BYTES: u64 = 64 * 1024;

/// Close code sent on hub shutdown ("going away").
const CLOSE_GOING_AWAY: u16 = 1001;

/// Server → client messages.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ServerMessage {
    /// Sent once after upgrade with the starting offset.
    Ready {
        #[serde(rename = "offsetBytes")]
        offset_bytes: u64,
    },
    /// New output; `offset_bytes` is the cumulative count after `text`.
    Output {
        #[serde(rename = "offsetBytes")]
        offset_bytes: u64,
        text: String,
    },
    /// Non-fatal error.
    Error { error: String },
    /// Reply to a client ping.
    Pong,
}

/// Client → server messages.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientMessage {
    /// UTF-8 input for the pty.
    Input { data: String },
    /// Requested terminal size.
    Resize { cols: u16, rows: u16 },
    /// Keepalive.
    Ping,
}

/// Query parameters of the stream endpoint.
#[derive(Debug, Deserialize)]
pub struct StreamParams {
    /// Replay from this cumulative offset; live tail when absent.
    since: Option<u64>,
}

/// `GET /api/drones/{id}/terminal/{session}/stream`
pub async fn terminal_stream_handler(
    ws: WebSocketUpgrade,
    Path((drone_id, session)): Path<(String, String)>,
    Query(params): Query<StreamParams>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| stream_session(socket, state, drone_id, session, params.since))
}

async fn stream_session(
    socket: WebSocket,
    state: AppState,
    drone_id: String,
    session: String,
    since: Option<u64>,
) {
    let hub = state.hub.terminal();
    tracing::info!(drone = %drone_id, session = %session, "terminal stream connected");

    let (mut sender, mut receiver) = socket.split();

    // Establish the starting cursor: the requested replay offset, or the
    // live tail.
    let cursor = match since {
        Some(n) => n,
        None => match hub.read(&drone_id, &session, ReadOptions::default()).await {
            Ok(chunk) => chunk.offset_bytes,
            Err(e) => {
                tracing::warn!(error = %e, "terminal stream failed to resolve tail");
                let _ = send_json(
                    &mut sender,
                    &ServerMessage::Error {
                        error: e.to_string(),
                    },
                )
                .await;
                return;
            }
        },
    };
    let mut cursor = cursor;

    if send_json(&mut sender, &ServerMessage::Ready { offset_bytes: cursor })
        .await
        .is_err()
    {
        return;
    }

    let shutdown = state.hub.shutdown_token();
    let mut backoff = PollBackoff::new(Instant::now());

    loop {
        let interval = backoff.next_interval(Instant::now());
        tokio::select! {
            () = tokio::time::sleep(interval) => {
                let read = hub
                    .read(
                        &drone_id,
                        &session,
                        ReadOptions {
                            since: Some(cursor),
                            max_bytes: Some(READ_CHUNK_BYTES),
                            tail_lines: None,
                        },
                    )
                    .await;
                match read {
                    Ok(chunk) if chunk.text.is_empty() => backoff.on_empty(),
                    Ok(chunk) => {
                        cursor = chunk.offset_bytes;
                        backoff.on_output(Instant::now());
                        let message = ServerMessage::Output {
                            offset_bytes: chunk.offset_bytes,
                            text: chunk.text,
                        };
                        if send_json(&mut sender, &message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        backoff.on_error();
                        let message = ServerMessage::Error {
                            error: e.to_string(),
                        };
                        if send_json(&mut sender, &message).await.is_err() {
                            break;
                        }
                    }
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let parsed: ClientMessage = match serde_json::from_str(&text) {
                            Ok(m) => m,
                            Err(e) => {
                                tracing::debug!(error = %e, "ignoring malformed client message");
                                continue;
                            }
                        };
                        match parsed {
                            ClientMessage::Input { data } => {
                                if let Err(e) = hub
                                    .send_input(&drone_id, &session, data.into_bytes())
                                    .await
                                {
                                    let message = ServerMessage::Error {
                                        error: e.to_string(),
                                    };
                                    if send_json(&mut sender, &message).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            ClientMessage::Resize { cols, rows } => {
                                hub.record_resize(&drone_id, &session, cols, rows);
                            }
                            ClientMessage::Ping => {
                                if send_json(&mut sender, &ServerMessage::Pong).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "terminal stream socket error");
                        break;
                    }
                }
            }
            () = shutdown.cancelled() => {
                let _ = sender
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_GOING_AWAY,
                        reason: "hub shutting down".into(),
                    })))
                    .await;
                break;
            }
        }
    }

    tracing::info!(drone = %drone_id, session = %session, "terminal stream disconnected");
}

/// Serialise and send one message, bounded by the write deadline.
async fn send_json(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), ()> {
    let payload = match serde_json::to_string(message) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialise terminal message");
            return Err(());
        }
    };
    match tokio::time::timeout(WS_WRITE_TIMEOUT, sender.send(Message::Text(payload.into()))).await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "terminal stream send failed");
            Err(())
        }
        Err(_) => {
            tracing::warn!("terminal stream send exceeded write deadline");
            Err(())
        }
    }
}
