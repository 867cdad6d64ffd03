use std::{path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use serde_json::Value;
use tokio::{
    process::Command,
    sync::{mpsc, oneshot},
};

use crate::{
    error::HubError,
    rpc::{
        connection::{await_response, await_response_timeout, ConnectionEvent, JsonRpcConnection},
        ClientInfo, RequestId, METHOD_INITIALIZE, METHOD_INITIALIZED,
    },
};

/// Launch configuration for one app-server child.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub binary: PathBuf,
    pub base_args: Vec<String>,
    pub app_server_args: Vec<String>,
    pub codex_home: PathBuf,
    pub cwd: Option<PathBuf>,
    pub client_info: ClientInfo,
    pub handshake_timeout: Duration,
}

/// Lifecycle and traffic events from one running child.
#[derive(Debug)]
pub enum SessionEvent {
    Notification {
        method: String,
        params: Value,
    },
    PeerRequest {
        id: RequestId,
        method: String,
        params: Value,
    },
    Stderr(String),
    ProtocolError(String),
    /// Terminal. Pending requests are failed before this is emitted.
    Exit(Option<i32>),
}

/// One running `app-server` child wired to a JSON-RPC connection.
///
/// `start` performs the `initialize`/`initialized` handshake before
/// returning, so every request issued through the session runs against a
/// ready child. A monitor task owns the process handle: it reaps the child
/// on its own exit or on `stop`, drains the pending table, and emits
/// [`SessionEvent::Exit`] last.
#[derive(Debug)]
pub struct AppServerSession {
    connection: Arc<JsonRpcConnection>,
    stop: mpsc::Sender<()>,
    pid: Option<u32>,
}

impl AppServerSession {
    /// Spawns the child, completes the handshake, and wires event pumping.
    ///
    /// On handshake failure (error or timeout) the child is killed and the
    /// session is never surfaced.
    pub async fn start(
        config: SessionConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), HubError> {
        let mut command = Command::new(&config.binary);
        command
            .args(&config.base_args)
            .arg("app-server")
            .args(&config.app_server_args)
            .env("CODEX_HOME", &config.codex_home)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }

        let command_debug = format!("{command:?}");
        let mut child = command.spawn().map_err(|source| HubError::Spawn {
            command: command_debug,
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HubError::Handshake("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HubError::Handshake("child stdout unavailable".to_string()))?;
        let stderr = child.stderr.take();
        let pid = child.id();

        let (connection, mut connection_events) = JsonRpcConnection::new(stdin, stdout, stderr);

        let handshake = async {
            let client_info = serde_json::to_value(&config.client_info)?;
            let rx = connection
                .request(
                    METHOD_INITIALIZE,
                    serde_json::json!({ "clientInfo": client_info }),
                )
                .await?;
            await_response_timeout(rx, config.handshake_timeout).await?;
            connection.notify(METHOD_INITIALIZED, serde_json::json!({}))?;
            Ok::<(), HubError>(())
        };
        if let Err(err) = handshake.await {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(HubError::Handshake(err.to_string()));
        }

        let connection = Arc::new(connection);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let pump_tx = events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = connection_events.recv().await {
                let forwarded = match event {
                    ConnectionEvent::Notification { method, params } => {
                        SessionEvent::Notification { method, params }
                    }
                    ConnectionEvent::PeerRequest { id, method, params } => {
                        SessionEvent::PeerRequest { id, method, params }
                    }
                    ConnectionEvent::Stderr(line) => SessionEvent::Stderr(line),
                    ConnectionEvent::ProtocolError(message) => {
                        SessionEvent::ProtocolError(message)
                    }
                    // Exit is the terminal signal for session consumers.
                    ConnectionEvent::Closed => continue,
                };
                if pump_tx.send(forwarded).is_err() {
                    break;
                }
            }
        });

        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let monitor_connection = connection.clone();
        tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = stop_rx.recv() => None,
            };
            let code = match exited {
                Some(status) => status.ok().and_then(|status| status.code()),
                None => {
                    let _ = child.start_kill();
                    child.wait().await.ok().and_then(|status| status.code())
                }
            };
            // Pending requests must fail before anyone observes the exit.
            monitor_connection.shutdown("app-server exited").await;
            let _ = events_tx.send(SessionEvent::Exit(code));
        });

        Ok((
            Self {
                connection,
                stop: stop_tx,
                pid,
            },
            events_rx,
        ))
    }

    /// Sends a request to the child and awaits the correlated response.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, HubError> {
        let rx = self.connection.request(method, params).await?;
        await_response(rx).await
    }

    /// Sends a request and returns a receiver for its eventual outcome.
    pub async fn request_deferred(
        &self,
        method: &str,
        params: Value,
    ) -> Result<oneshot::Receiver<Result<Value, HubError>>, HubError> {
        self.connection.request(method, params).await
    }

    /// Relays a response for a child-initiated request.
    pub fn respond(
        &self,
        id: RequestId,
        result: Option<Value>,
        error: Option<Value>,
    ) -> Result<(), HubError> {
        self.connection.respond(id, result, error)
    }

    /// Sends a notification to the child.
    pub fn notify(&self, method: &str, params: Value) -> Result<(), HubError> {
        self.connection.notify(method, params)
    }

    /// Signals the monitor to kill the child. No-op once exited.
    pub fn stop(&self) {
        let _ = self.stop.try_send(());
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}
