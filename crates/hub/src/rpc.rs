//! Wire-level pieces of the app-server protocol: the newline-delimited frame
//! codec and the JSON-RPC connection that multiplexes requests, responses,
//! and notifications over a child's stdio.
//!
//! The protocol has three asymmetrical directions on one pipe pair:
//! requests we send (correlated by a locally allocated numeric id),
//! requests the child sends to us (approval flows), and notifications in
//! either direction. Frames are classified purely by the presence of `id`
//! and `method`.

pub mod codec;
pub mod connection;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Upper bound for a single wire frame.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Handshake request sent right after spawn.
pub const METHOD_INITIALIZE: &str = "initialize";
/// Handshake notification acknowledging a successful initialize.
pub const METHOD_INITIALIZED: &str = "initialized";

/// Identifier for JSON-RPC calls on a single connection.
pub type RequestId = i64;

/// Client metadata attached to the `initialize` request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// Error object carried in a response frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Inbound frame classified by inspecting `(id?, method?)`.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundFrame {
    /// No id, has method: a notification from the child.
    Notification { method: String, params: Value },
    /// Id and method: the child is asking us something (approval flows).
    PeerRequest {
        id: RequestId,
        method: String,
        params: Value,
    },
    /// Id without method: a reply to one of our requests.
    PeerResponse {
        id: RequestId,
        result: Option<Value>,
        error: Option<WireError>,
    },
}

/// Classifies a parsed frame. Returns `None` for objects that fit no
/// direction (no id and no method).
pub fn classify(value: &Value) -> Option<InboundFrame> {
    let object = value.as_object()?;
    let id = object.get("id").and_then(Value::as_i64);
    let method = object
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_string);

    match (id, method) {
        (Some(id), Some(method)) => Some(InboundFrame::PeerRequest {
            id,
            method,
            params: object.get("params").cloned().unwrap_or(Value::Null),
        }),
        (Some(id), None) => {
            let error = object
                .get("error")
                .cloned()
                .and_then(|raw| serde_json::from_value::<WireError>(raw).ok());
            Some(InboundFrame::PeerResponse {
                id,
                result: object.get("result").cloned(),
                error,
            })
        }
        (None, Some(method)) => Some(InboundFrame::Notification {
            method,
            params: object.get("params").cloned().unwrap_or(Value::Null),
        }),
        (None, None) => None,
    }
}
