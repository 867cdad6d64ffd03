use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
    time,
};
use tracing::debug;

use crate::error::HubError;

use super::{classify, codec::FrameCodec, InboundFrame, RequestId};

/// Events surfaced by a [`JsonRpcConnection`].
///
/// Responses to our own requests never show up here; they resolve the
/// matching pending request instead.
#[derive(Debug)]
pub enum ConnectionEvent {
    Notification {
        method: String,
        params: Value,
    },
    PeerRequest {
        id: RequestId,
        method: String,
        params: Value,
    },
    /// One trimmed, non-empty stderr line. Never parsed as JSON.
    Stderr(String),
    /// Non-fatal wire trouble: unparseable or unclassifiable frames.
    ProtocolError(String),
    /// Terminal: the stream closed and every pending request was failed.
    Closed,
}

/// `None` once the connection has closed; no request may register after that.
type Pending = Arc<Mutex<Option<HashMap<RequestId, oneshot::Sender<Result<Value, HubError>>>>>>;

/// Receiver for the eventual outcome of one outbound request.
pub type ResponseReceiver = oneshot::Receiver<Result<Value, HubError>>;

/// JSON-RPC endpoint over a duplex byte stream pair (plus optional stderr).
///
/// One writer task serializes whole-line stdin writes; one reader task
/// drains stdout through the frame codec and correlates responses with the
/// pending table. Request ids are allocated from a per-connection monotone
/// counter starting at 1.
#[derive(Debug)]
pub struct JsonRpcConnection {
    writer: mpsc::UnboundedSender<String>,
    pending: Pending,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    next_id: AtomicI64,
    tasks: Vec<JoinHandle<()>>,
}

impl JsonRpcConnection {
    /// Wires a connection over the given streams and returns it together
    /// with its event receiver.
    pub fn new<W, R, E>(
        stdin: W,
        stdout: R,
        stderr: Option<E>,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pending: Pending = Arc::new(Mutex::new(Some(HashMap::new())));
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        let mut tasks = vec![
            tokio::spawn(writer_task(
                stdin,
                writer_rx,
                pending.clone(),
                events_tx.clone(),
            )),
            tokio::spawn(reader_task(stdout, pending.clone(), events_tx.clone())),
        ];
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(stderr_task(stderr, events_tx.clone())));
        }

        (
            Self {
                writer: writer_tx,
                pending,
                events: events_tx,
                next_id: AtomicI64::new(1),
                tasks,
            },
            events_rx,
        )
    }

    /// Registers a pending entry and queues the request frame.
    ///
    /// The returned receiver resolves with the matching response, or fails
    /// with the close reason if the stream goes away first.
    pub async fn request(&self, method: &str, params: Value) -> Result<ResponseReceiver, HubError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let serialized = serde_json::to_string(&frame)?;
        let (tx, rx) = oneshot::channel();

        {
            let mut guard = self.pending.lock().await;
            match guard.as_mut() {
                Some(map) => {
                    map.insert(id, tx);
                }
                None => return Err(HubError::connection_closed()),
            }
        }

        if self.writer.send(serialized).is_err() {
            let mut guard = self.pending.lock().await;
            if let Some(map) = guard.as_mut() {
                map.remove(&id);
            }
            return Err(HubError::connection_closed());
        }

        Ok(rx)
    }

    /// Queues a notification frame (no id, no reply expected).
    pub fn notify(&self, method: &str, params: Value) -> Result<(), HubError> {
        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        let serialized = serde_json::to_string(&frame)?;
        self.writer
            .send(serialized)
            .map_err(|_| HubError::connection_closed())
    }

    /// Queues a response frame for a peer-initiated request.
    pub fn respond(
        &self,
        id: RequestId,
        result: Option<Value>,
        error: Option<Value>,
    ) -> Result<(), HubError> {
        let mut frame = serde_json::Map::new();
        frame.insert("jsonrpc".to_string(), Value::from("2.0"));
        frame.insert("id".to_string(), Value::from(id));
        match error {
            Some(error) => {
                frame.insert("error".to_string(), error);
            }
            None => {
                frame.insert("result".to_string(), result.unwrap_or(Value::Null));
            }
        }
        let serialized = serde_json::to_string(&Value::Object(frame))?;
        self.writer
            .send(serialized)
            .map_err(|_| HubError::connection_closed())
    }

    /// Fails every pending request with `reason` and refuses new ones.
    pub async fn shutdown(&self, reason: &str) {
        if drain_pending(&self.pending, reason).await {
            let _ = self.events.send(ConnectionEvent::Closed);
        }
    }
}

impl Drop for JsonRpcConnection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Awaits the outcome of a request.
pub async fn await_response(rx: ResponseReceiver) -> Result<Value, HubError> {
    match rx.await {
        Ok(outcome) => outcome,
        Err(_) => Err(HubError::connection_closed()),
    }
}

/// Awaits the outcome of a request, bounded by `timeout`.
pub async fn await_response_timeout(
    rx: ResponseReceiver,
    timeout: Duration,
) -> Result<Value, HubError> {
    match time::timeout(timeout, rx).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => Err(HubError::connection_closed()),
        Err(_) => Err(HubError::Timeout(timeout)),
    }
}

/// Takes the pending table; the winner fails every entry with `reason`.
async fn drain_pending(pending: &Pending, reason: &str) -> bool {
    let drained = { pending.lock().await.take() };
    match drained {
        Some(map) => {
            for (_, tx) in map {
                let _ = tx.send(Err(HubError::Closed(reason.to_string())));
            }
            true
        }
        None => false,
    }
}

async fn writer_task<W>(
    mut stdin: W,
    mut rx: mpsc::UnboundedReceiver<String>,
    pending: Pending,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        if stdin.write_all(message.as_bytes()).await.is_err() {
            break;
        }
        if stdin.write_all(b"\n").await.is_err() {
            break;
        }
        let _ = stdin.flush().await;
    }

    let _ = stdin.shutdown().await;
    if drain_pending(&pending, "connection closed").await {
        let _ = events.send(ConnectionEvent::Closed);
    }
}

async fn reader_task<R>(
    mut stdout: R,
    pending: Pending,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut codec = FrameCodec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(read) => {
                let frames = match codec.push(&chunk[..read]) {
                    Ok(frames) => frames,
                    Err(err) => {
                        let _ = events.send(ConnectionEvent::ProtocolError(err.to_string()));
                        break;
                    }
                };
                for frame in frames {
                    handle_frame(&frame, &pending, &events).await;
                }
            }
            Err(err) => {
                debug!("app-server stdout read failed: {err}");
                break;
            }
        }
    }

    if drain_pending(&pending, "connection closed").await {
        let _ = events.send(ConnectionEvent::Closed);
    }
}

async fn handle_frame(
    frame: &str,
    pending: &Pending,
    events: &mpsc::UnboundedSender<ConnectionEvent>,
) {
    let value: Value = match serde_json::from_str(frame) {
        Ok(value) => value,
        Err(err) => {
            let _ = events.send(ConnectionEvent::ProtocolError(format!(
                "failed to parse frame as JSON: {err}"
            )));
            return;
        }
    };

    if !value.is_object() {
        let _ = events.send(ConnectionEvent::ProtocolError(
            "frame is not a JSON object".to_string(),
        ));
        return;
    }

    match classify(&value) {
        Some(InboundFrame::PeerResponse { id, result, error }) => {
            let sender = { pending.lock().await.as_mut().and_then(|map| map.remove(&id)) };
            let Some(tx) = sender else {
                debug!(id, "dropping response with no pending request");
                return;
            };
            let outcome = match error {
                Some(error) => Err(HubError::Rpc {
                    code: error.code,
                    message: error.message,
                    data: error.data,
                }),
                None => Ok(result.unwrap_or(Value::Null)),
            };
            let _ = tx.send(outcome);
        }
        Some(InboundFrame::Notification { method, params }) => {
            let _ = events.send(ConnectionEvent::Notification { method, params });
        }
        Some(InboundFrame::PeerRequest { id, method, params }) => {
            let _ = events.send(ConnectionEvent::PeerRequest { id, method, params });
        }
        None => {
            let _ = events.send(ConnectionEvent::ProtocolError(
                "frame carries neither id nor method".to_string(),
            ));
        }
    }
}

async fn stderr_task<E>(stderr: E, events: mpsc::UnboundedSender<ConnectionEvent>)
where
    E: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        debug!("app-server stderr: {trimmed}");
        let _ = events.send(ConnectionEvent::Stderr(trimmed.to_string()));
    }
}
