use std::{io, time::Duration};

use serde_json::Value;
use thiserror::Error;

/// Errors surfaced while supervising app-server processes and serving the hub.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("app-server did not complete initialize: {0}")]
    Handshake(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("app-server returned an error: {message}")]
    Rpc {
        code: Option<i64>,
        message: String,
        data: Option<Value>,
    },
    #[error("{0}")]
    Closed(String),
    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },
    #[error("profile app-server not running")]
    ProfileNotRunning,
    #[error("unknown profile `{0}`")]
    UnknownProfile(String),
    #[error("the default profile cannot be removed")]
    DefaultProfileProtected,
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl HubError {
    /// The close reason used when a connection goes away without a cause.
    pub fn connection_closed() -> Self {
        HubError::Closed("connection closed".to_string())
    }

    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        HubError::Io {
            context: context.into(),
            source,
        }
    }
}
