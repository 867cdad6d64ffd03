//! WebSocket broker: authenticates clients against the shared token, routes
//! typed envelopes into the supervisor, and broadcasts every supervisor
//! event to every connected client.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::{
    observer::ObserverHub, rpc::RequestId, session::SessionEvent, state::AppState,
    supervisor::SupervisorEvent,
};

/// How long one client may stall a socket send before it is dropped.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);
/// WebSocket close code for policy violations (bad token).
const POLICY_VIOLATION: u16 = 1008;

/// Envelopes clients send to the broker.
///
/// `requestId` correlates client traffic with the broker; the numeric `id`
/// in `rpc.response` correlates broker traffic with a child. The two are
/// separate spaces.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "profile.start", rename_all = "camelCase")]
    ProfileStart { profile_id: String },
    #[serde(rename = "profile.stop", rename_all = "camelCase")]
    ProfileStop { profile_id: String },
    #[serde(rename = "rpc.request", rename_all = "camelCase")]
    RpcRequest {
        request_id: String,
        profile_id: String,
        method: String,
        #[serde(default)]
        params: Value,
    },
    #[serde(rename = "rpc.response", rename_all = "camelCase")]
    RpcResponse {
        profile_id: String,
        id: RequestId,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<Value>,
    },
}

/// Envelopes the broker sends to clients.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "profile.started", rename_all = "camelCase")]
    ProfileStarted { profile_id: String },
    #[serde(rename = "profile.stopped", rename_all = "camelCase")]
    ProfileStopped { profile_id: String },
    #[serde(rename = "rpc.response", rename_all = "camelCase")]
    RpcResponse {
        request_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "rpc.event", rename_all = "camelCase")]
    RpcEvent {
        profile_id: String,
        method: String,
        params: Value,
    },
    #[serde(rename = "rpc.serverRequest", rename_all = "camelCase")]
    RpcServerRequest {
        profile_id: String,
        id: RequestId,
        method: String,
        params: Value,
    },
    #[serde(rename = "profile.diagnostic", rename_all = "camelCase")]
    ProfileDiagnostic { profile_id: String, message: String },
    #[serde(rename = "profile.exit", rename_all = "camelCase")]
    ProfileExit {
        profile_id: String,
        code: Option<i32>,
    },
    #[serde(rename = "profile.error", rename_all = "camelCase")]
    ProfileError { profile_id: String, message: String },
    #[serde(rename = "error")]
    Error { message: String },
}

/// Process-wide set of authenticated clients.
///
/// Each client is its own writer task fed by an unbounded channel, so one
/// slow socket never blocks a broadcast; a client whose channel is gone is
/// dropped during the next broadcast sweep.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    clients: Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<Message>>>>,
    next_id: Arc<AtomicU64>,
}

impl ClientRegistry {
    async fn register(&self, tx: mpsc::UnboundedSender<Message>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.clients.lock().await.insert(id, tx);
        id
    }

    async fn remove(&self, id: u64) {
        self.clients.lock().await.remove(&id);
    }

    /// Serializes once and fans the payload out to every client.
    pub async fn broadcast(&self, message: &ServerMessage) {
        let Ok(serialized) = serde_json::to_string(message) else {
            return;
        };
        let mut guard = self.clients.lock().await;
        guard.retain(|_, tx| tx.send(Message::Text(serialized.clone())).is_ok());
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.token))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, token: Option<String>) {
    if token.as_deref() != Some(state.config.token.as_str()) {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: POLICY_VIOLATION,
                reason: "unauthorized".into(),
            })))
            .await;
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let client_id = state.clients.register(tx.clone()).await;
    info!(client_id, "websocket client connected");

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match tokio::time::timeout(SEND_TIMEOUT, sink.send(message)).await {
                Ok(Ok(())) => {}
                _ => break,
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Binary(bytes) => String::from_utf8_lossy(&bytes).to_string(),
            Message::Close(_) => break,
            _ => continue,
        };
        dispatch(&state, &tx, &text).await;
    }

    state.clients.remove(client_id).await;
    writer.abort();
    debug!(client_id, "websocket client disconnected");
}

async fn dispatch(state: &AppState, reply: &mpsc::UnboundedSender<Message>, text: &str) {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        send_to(
            reply,
            &ServerMessage::Error {
                message: "Invalid JSON".to_string(),
            },
        );
        return;
    };

    let message: ClientMessage = match serde_json::from_value(value) {
        Ok(message) => message,
        Err(err) => {
            debug!("unsupported client message: {err}");
            send_to(
                reply,
                &ServerMessage::Error {
                    message: "unsupported message type".to_string(),
                },
            );
            return;
        }
    };

    match message {
        ClientMessage::ProfileStart { profile_id } => {
            let Some(profile) = state.profiles.get(&profile_id) else {
                send_to(
                    reply,
                    &ServerMessage::Error {
                        message: format!("unknown profile `{profile_id}`"),
                    },
                );
                return;
            };
            match state.supervisor.start(&profile).await {
                Ok(_) => send_to(reply, &ServerMessage::ProfileStarted { profile_id }),
                Err(err) => send_to(
                    reply,
                    &ServerMessage::Error {
                        message: err.to_string(),
                    },
                ),
            }
        }
        ClientMessage::ProfileStop { profile_id } => {
            state.supervisor.stop(&profile_id).await;
            state.observer.profile_stopped(&profile_id);
            send_to(reply, &ServerMessage::ProfileStopped { profile_id });
        }
        ClientMessage::RpcRequest {
            request_id,
            profile_id,
            method,
            params,
        } => {
            // Routed on its own task so a slow child never blocks this
            // client's read loop.
            let state = state.clone();
            let reply = reply.clone();
            tokio::spawn(async move {
                state.observer.client_request(&profile_id, &method, &params);
                match state.supervisor.request(&profile_id, &method, params).await {
                    Ok(result) => {
                        state.observer.client_response(&profile_id, &method, &result);
                        send_to(
                            &reply,
                            &ServerMessage::RpcResponse {
                                request_id,
                                result: Some(result),
                                error: None,
                            },
                        );
                    }
                    Err(err) => send_to(
                        &reply,
                        &ServerMessage::RpcResponse {
                            request_id,
                            result: None,
                            error: Some(err.to_string()),
                        },
                    ),
                }
            });
        }
        ClientMessage::RpcResponse {
            profile_id,
            id,
            result,
            error,
        } => {
            state
                .observer
                .server_response(&profile_id, id, result.as_ref().unwrap_or(&Value::Null));
            state.supervisor.respond(&profile_id, id, result, error).await;
        }
    }
}

fn send_to(tx: &mpsc::UnboundedSender<Message>, message: &ServerMessage) {
    if let Ok(serialized) = serde_json::to_string(message) {
        let _ = tx.send(Message::Text(serialized));
    }
}

/// Bridges supervisor events into the observer and the broadcast fan-out.
pub fn spawn_event_pump(
    mut events: mpsc::UnboundedReceiver<SupervisorEvent>,
    clients: ClientRegistry,
    observer: ObserverHub,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(SupervisorEvent { profile_id, event }) = events.recv().await {
            let outbound = match event {
                SessionEvent::Notification { method, params } => {
                    observer.event(&profile_id, &method, &params);
                    ServerMessage::RpcEvent {
                        profile_id,
                        method,
                        params,
                    }
                }
                SessionEvent::PeerRequest { id, method, params } => {
                    observer.server_request(&profile_id, id, &method, &params);
                    ServerMessage::RpcServerRequest {
                        profile_id,
                        id,
                        method,
                        params,
                    }
                }
                SessionEvent::Stderr(line) => ServerMessage::ProfileDiagnostic {
                    profile_id,
                    message: line,
                },
                SessionEvent::ProtocolError(message) => ServerMessage::ProfileError {
                    profile_id,
                    message,
                },
                SessionEvent::Exit(code) => {
                    observer.profile_stopped(&profile_id);
                    ServerMessage::ProfileExit { profile_id, code }
                }
            };
            clients.broadcast(&outbound).await;
        }
    })
}
