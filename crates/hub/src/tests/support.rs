use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::{
    activity::ActivityMap,
    observer::{spawn_observer, ObserverHub, Observers},
    profiles::Profile,
    rpc::ClientInfo,
    session::SessionConfig,
    stores::{analytics::AnalyticsStore, reviews::ReviewSessionStore, threads::ThreadIndexStore},
    supervisor::SessionLauncher,
};

/// A scripted stand-in for `codex app-server`: echoes `ping`, answers
/// `slow` after a delay, forwards `emit` as a notification, raises an
/// approval request on `ask` (echoing the decision back as a
/// notification), serves a canned `thread/list`, and dies on `crash`.
pub(super) fn write_fake_app_server() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let script_path = dir.path().join("fake-codex");
    let script = r#"#!/usr/bin/env python3
import json
import sys
import threading
import time

print("fake app-server booted", file=sys.stderr, flush=True)

def send(payload):
    sys.stdout.write(json.dumps(payload) + "\n")
    sys.stdout.flush()

def handle_slow(req_id, params):
    def worker():
        time.sleep(0.3)
        send({"jsonrpc": "2.0", "id": req_id, "result": {"slow": True, "params": params}})
    threading.Thread(target=worker, daemon=True).start()

for line in sys.stdin:
    if not line.strip():
        continue
    msg = json.loads(line)
    method = msg.get("method")
    if method is None:
        if msg.get("id") == 9001:
            send({"jsonrpc": "2.0", "method": "approval/echo", "params": msg.get("result") or {"error": msg.get("error")}})
        continue
    if method == "initialize":
        send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {"ready": True}})
    elif method == "initialized":
        continue
    elif method == "ping":
        send({"jsonrpc": "2.0", "id": msg.get("id"), "result": msg.get("params") or {}})
    elif method == "slow":
        handle_slow(msg.get("id"), msg.get("params") or {})
    elif method == "emit":
        params = msg.get("params") or {}
        send({"jsonrpc": "2.0", "method": params.get("method", "turn/started"), "params": params.get("params", {})})
        send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {"ok": True}})
    elif method == "ask":
        params = msg.get("params") or {}
        send({"jsonrpc": "2.0", "id": 9001, "method": params.get("method", "item/commandExecution/requestApproval"), "params": params.get("params", {})})
        send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {"asked": True}})
    elif method == "thread/list":
        send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {"threads": [
            {"id": "t-parser", "preview": "fix parser bug"},
            {"id": "t-schema", "preview": "refactor schema"},
        ]}})
    elif method == "crash":
        sys.exit(3)
    elif msg.get("id") is not None:
        send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {}})
"#;

    fs::write(&script_path, script).expect("write script");
    let mut perms = fs::metadata(&script_path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script_path, perms).expect("chmod");
    (dir, script_path)
}

/// An app-server that reads frames and never answers anything.
pub(super) fn write_unresponsive_app_server() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let script_path = dir.path().join("mute-codex");
    let script = r#"#!/usr/bin/env python3
import sys
for line in sys.stdin:
    pass
"#;

    fs::write(&script_path, script).expect("write script");
    let mut perms = fs::metadata(&script_path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script_path, perms).expect("chmod");
    (dir, script_path)
}

pub(super) fn test_client() -> ClientInfo {
    ClientInfo {
        name: "tests".to_string(),
        version: "0.0.0".to_string(),
    }
}

pub(super) fn session_config(binary: PathBuf, codex_home: &Path) -> SessionConfig {
    SessionConfig {
        binary,
        base_args: Vec::new(),
        app_server_args: Vec::new(),
        codex_home: codex_home.to_path_buf(),
        cwd: None,
        client_info: test_client(),
        handshake_timeout: Duration::from_secs(5),
    }
}

pub(super) fn test_launcher(binary: PathBuf) -> SessionLauncher {
    SessionLauncher {
        binary,
        base_args: Vec::new(),
        app_server_args: Vec::new(),
        default_cwd: None,
        client_info: test_client(),
        handshake_timeout: Duration::from_secs(5),
    }
}

pub(super) fn test_profile(id: &str, codex_home: &Path) -> Profile {
    Profile {
        id: id.to_string(),
        name: id.to_string(),
        codex_home: codex_home.to_path_buf(),
        created_at: crate::stores::now_ms(),
    }
}

/// Store bundle plus the observer task feeding it.
pub(super) struct ObserverFixture {
    pub _dir: TempDir,
    pub activity: Arc<ActivityMap>,
    pub threads: ThreadIndexStore,
    pub analytics: AnalyticsStore,
    pub reviews: ReviewSessionStore,
    pub hub: ObserverHub,
}

pub(super) fn observer_fixture() -> ObserverFixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let threads =
        ThreadIndexStore::open(&dir.path().join("threads.sqlite")).expect("thread store");
    let analytics =
        AnalyticsStore::open(&dir.path().join("analytics.sqlite")).expect("analytics store");
    let reviews =
        ReviewSessionStore::open(&dir.path().join("reviews.sqlite")).expect("review store");
    let activity = Arc::new(ActivityMap::default());
    let hub = spawn_observer(Observers {
        activity: activity.clone(),
        threads: threads.clone(),
        analytics: analytics.clone(),
        reviews: reviews.clone(),
    });
    ObserverFixture {
        _dir: dir,
        activity,
        threads,
        analytics,
        reviews,
        hub,
    }
}

/// Polls `check` until it passes or the timeout elapses.
pub(super) async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Receives events until one matches the predicate, or gives up.
pub(super) async fn next_matching<T, F>(
    rx: &mut mpsc::UnboundedReceiver<T>,
    timeout: Duration,
    mut predicate: F,
) -> Option<T>
where
    F: FnMut(&T) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return None;
        }
        match tokio::time::timeout(deadline - now, rx.recv()).await {
            Ok(Some(event)) if predicate(&event) => return Some(event),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}
