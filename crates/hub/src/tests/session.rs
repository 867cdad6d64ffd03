use std::time::Duration;

use serde_json::json;

use crate::{
    error::HubError,
    rpc::connection::await_response,
    session::{AppServerSession, SessionEvent},
};

use super::support::{
    next_matching, session_config, write_fake_app_server, write_unresponsive_app_server,
};

#[tokio::test]
async fn handshake_then_request_roundtrip() {
    let (dir, script) = write_fake_app_server();
    let (session, _events) = AppServerSession::start(session_config(script, dir.path()))
        .await
        .expect("start session");
    assert!(session.pid().is_some());

    let result = session
        .request("ping", json!({ "value": 42 }))
        .await
        .expect("ping");
    assert_eq!(result, json!({ "value": 42 }));
}

#[tokio::test]
async fn out_of_order_responses_resolve_by_id() {
    let (dir, script) = write_fake_app_server();
    let (session, _events) = AppServerSession::start(session_config(script, dir.path()))
        .await
        .expect("start session");

    let slow_rx = session
        .request_deferred("slow", json!({ "tag": "a" }))
        .await
        .expect("slow request");
    let fast = session
        .request("ping", json!({ "tag": "b" }))
        .await
        .expect("fast request");
    assert_eq!(fast, json!({ "tag": "b" }));

    let slow = await_response(slow_rx).await.expect("slow response");
    assert_eq!(slow["slow"], json!(true));
    assert_eq!(slow["params"], json!({ "tag": "a" }));
}

#[tokio::test]
async fn forwards_notifications_and_stderr() {
    let (dir, script) = write_fake_app_server();
    let (session, mut events) = AppServerSession::start(session_config(script, dir.path()))
        .await
        .expect("start session");

    let stderr = next_matching(&mut events, Duration::from_secs(2), |event| {
        matches!(event, SessionEvent::Stderr(line) if line.contains("booted"))
    })
    .await;
    assert!(stderr.is_some());

    session
        .request(
            "emit",
            json!({ "method": "turn/started", "params": { "threadId": "t1" } }),
        )
        .await
        .expect("emit");
    let notification = next_matching(&mut events, Duration::from_secs(2), |event| {
        matches!(event, SessionEvent::Notification { method, .. } if method == "turn/started")
    })
    .await;
    assert!(notification.is_some());
}

#[tokio::test]
async fn crash_fails_pending_and_emits_exit() {
    let (dir, script) = write_fake_app_server();
    let (session, mut events) = AppServerSession::start(session_config(script, dir.path()))
        .await
        .expect("start session");

    let err = session
        .request("crash", json!({}))
        .await
        .expect_err("crash must fail the request");
    assert!(matches!(err, HubError::Closed(_)));

    let exit = next_matching(&mut events, Duration::from_secs(5), |event| {
        matches!(event, SessionEvent::Exit(_))
    })
    .await;
    match exit {
        Some(SessionEvent::Exit(code)) => assert_eq!(code, Some(3)),
        other => panic!("expected exit event, got {other:?}"),
    }
}

#[tokio::test]
async fn stop_kills_the_child() {
    let (dir, script) = write_fake_app_server();
    let (session, mut events) = AppServerSession::start(session_config(script, dir.path()))
        .await
        .expect("start session");

    session.stop();
    let exit = next_matching(&mut events, Duration::from_secs(5), |event| {
        matches!(event, SessionEvent::Exit(_))
    })
    .await;
    assert!(exit.is_some());

    // Stopping again after exit is a no-op.
    session.stop();
}

#[tokio::test]
async fn handshake_timeout_kills_the_child() {
    let (dir, script) = write_unresponsive_app_server();
    let mut config = session_config(script, dir.path());
    config.handshake_timeout = Duration::from_millis(300);

    let err = AppServerSession::start(config)
        .await
        .expect_err("handshake must time out");
    assert!(matches!(err, HubError::Handshake(_)));
}

#[tokio::test]
async fn spawn_failure_surfaces_as_error() {
    let (dir, _script) = write_fake_app_server();
    let config = session_config(dir.path().join("does-not-exist"), dir.path());
    let err = AppServerSession::start(config)
        .await
        .expect_err("spawn must fail");
    assert!(matches!(err, HubError::Spawn { .. }));
}
