use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::{
    error::HubError,
    profiles::Profile,
    rpc::{ClientInfo, RequestId},
    session::{AppServerSession, SessionConfig, SessionEvent},
};

/// Shared launch defaults applied to every profile's child.
#[derive(Clone, Debug)]
pub struct SessionLauncher {
    pub binary: PathBuf,
    pub base_args: Vec<String>,
    pub app_server_args: Vec<String>,
    pub default_cwd: Option<PathBuf>,
    pub client_info: ClientInfo,
    pub handshake_timeout: Duration,
}

impl SessionLauncher {
    fn session_config(&self, profile: &Profile) -> SessionConfig {
        SessionConfig {
            binary: self.binary.clone(),
            base_args: self.base_args.clone(),
            app_server_args: self.app_server_args.clone(),
            codex_home: profile.codex_home.clone(),
            cwd: self.default_cwd.clone(),
            client_info: self.client_info.clone(),
            handshake_timeout: self.handshake_timeout,
        }
    }
}

/// A session event tagged with the profile that produced it.
#[derive(Debug)]
pub struct SupervisorEvent {
    pub profile_id: String,
    pub event: SessionEvent,
}

type SessionMap = Arc<Mutex<HashMap<String, Arc<AppServerSession>>>>;

/// Keyed registry of app-server sessions, one per profile.
///
/// All session events are re-emitted on a single fan-in channel with the
/// profile id prepended. When a child exits, its registry entry is removed
/// before the exit event is re-emitted, so observers that re-enter the
/// supervisor see a clean slate.
#[derive(Clone)]
pub struct Supervisor {
    sessions: SessionMap,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    launcher: Arc<SessionLauncher>,
}

impl Supervisor {
    pub fn new(launcher: SessionLauncher) -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                sessions: Arc::new(Mutex::new(HashMap::new())),
                events: events_tx,
                launcher: Arc::new(launcher),
            },
            events_rx,
        )
    }

    /// Starts (or reuses) the child for `profile`. Subsequent calls while a
    /// session is alive return the existing one; a racing start loses and
    /// its freshly spawned child is stopped.
    pub async fn start(&self, profile: &Profile) -> Result<Arc<AppServerSession>, HubError> {
        {
            let guard = self.sessions.lock().await;
            if let Some(existing) = guard.get(&profile.id) {
                return Ok(existing.clone());
            }
        }

        let (session, session_events) = AppServerSession::start(
            self.launcher.session_config(profile),
        )
        .await?;
        let session = Arc::new(session);

        {
            let mut guard = self.sessions.lock().await;
            if let Some(existing) = guard.get(&profile.id) {
                session.stop();
                return Ok(existing.clone());
            }
            guard.insert(profile.id.clone(), session.clone());
        }
        debug!(profile_id = %profile.id, pid = ?session.pid(), "app-server started");

        self.spawn_pump(profile.id.clone(), session.clone(), session_events);
        Ok(session)
    }

    /// Stops and removes the session for `profile_id`. Safe on absent keys.
    pub async fn stop(&self, profile_id: &str) {
        let session = { self.sessions.lock().await.remove(profile_id) };
        if let Some(session) = session {
            session.stop();
        }
    }

    /// Routes a request to the profile's child.
    pub async fn request(
        &self,
        profile_id: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, HubError> {
        let session = {
            self.sessions
                .lock()
                .await
                .get(profile_id)
                .cloned()
                .ok_or(HubError::ProfileNotRunning)?
        };
        session.request(method, params).await
    }

    /// Relays a client's response to a child-initiated request. No-op when
    /// the profile has no running session.
    pub async fn respond(
        &self,
        profile_id: &str,
        id: RequestId,
        result: Option<Value>,
        error: Option<Value>,
    ) {
        let session = { self.sessions.lock().await.get(profile_id).cloned() };
        if let Some(session) = session {
            if let Err(err) = session.respond(id, result, error) {
                warn!(profile_id, id, "failed to relay response: {err}");
            }
        }
    }

    pub async fn is_running(&self, profile_id: &str) -> bool {
        self.sessions.lock().await.contains_key(profile_id)
    }

    pub async fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn spawn_pump(
        &self,
        profile_id: String,
        session: Arc<AppServerSession>,
        mut session_events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let sessions = self.sessions.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(event) = session_events.recv().await {
                let is_exit = matches!(event, SessionEvent::Exit(_));
                if is_exit {
                    // Remove before re-emitting, unless a restart already
                    // replaced this entry with a newer session.
                    let mut guard = sessions.lock().await;
                    if guard
                        .get(&profile_id)
                        .is_some_and(|current| Arc::ptr_eq(current, &session))
                    {
                        guard.remove(&profile_id);
                    }
                }
                let _ = events.send(SupervisorEvent {
                    profile_id: profile_id.clone(),
                    event,
                });
                if is_exit {
                    break;
                }
            }
        });
    }
}
