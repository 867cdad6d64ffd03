use std::time::Duration;

use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream},
    sync::mpsc,
};

use crate::{
    error::HubError,
    rpc::connection::{await_response, ConnectionEvent, JsonRpcConnection},
};

use super::support::next_matching;

type Peer = (BufReader<DuplexStream>, DuplexStream);

fn wired() -> (
    JsonRpcConnection,
    mpsc::UnboundedReceiver<ConnectionEvent>,
    Peer,
) {
    let (peer_writer, conn_stdout) = tokio::io::duplex(64 * 1024);
    let (conn_stdin, peer_reader) = tokio::io::duplex(64 * 1024);
    let (connection, events) =
        JsonRpcConnection::new(conn_stdin, conn_stdout, None::<tokio::io::Empty>);
    (connection, events, (BufReader::new(peer_reader), peer_writer))
}

async fn read_frame(reader: &mut BufReader<DuplexStream>) -> Value {
    let mut line = String::new();
    reader.read_line(&mut line).await.expect("read frame");
    serde_json::from_str(&line).expect("frame is JSON")
}

#[tokio::test]
async fn request_resolves_with_matching_response() {
    let (connection, _events, (mut reader, mut writer)) = wired();

    let rx = connection.request("ping", json!({})).await.expect("request");
    let frame = read_frame(&mut reader).await;
    assert_eq!(frame["method"], "ping");
    assert_eq!(frame["id"], 1);

    writer
        .write_all(b"{\"id\":1,\"result\":{\"ok\":true}}\n")
        .await
        .expect("write response");
    let result = await_response(rx).await.expect("response");
    assert_eq!(result, json!({ "ok": true }));
}

#[tokio::test]
async fn interleaved_responses_resolve_by_id() {
    let (connection, _events, (mut reader, mut writer)) = wired();

    let first = connection
        .request("ping", json!({ "n": 1 }))
        .await
        .expect("first request");
    let second = connection
        .request("pong", json!({ "n": 2 }))
        .await
        .expect("second request");
    let frame_one = read_frame(&mut reader).await;
    let frame_two = read_frame(&mut reader).await;
    assert_eq!(frame_one["id"], 1);
    assert_eq!(frame_two["id"], 2);

    // Replies arrive in reverse order; correlation is strictly by id.
    writer
        .write_all(b"{\"id\":2,\"result\":{\"from\":\"pong\"}}\n{\"id\":1,\"result\":{\"from\":\"ping\"}}\n")
        .await
        .expect("write responses");

    assert_eq!(
        await_response(second).await.expect("second response"),
        json!({ "from": "pong" })
    );
    assert_eq!(
        await_response(first).await.expect("first response"),
        json!({ "from": "ping" })
    );
}

#[tokio::test]
async fn close_fails_every_pending_request() {
    let (connection, mut events, (mut reader, writer)) = wired();

    let rx = connection.request("ping", json!({})).await.expect("request");
    let _ = read_frame(&mut reader).await;

    drop(writer);

    let err = await_response(rx).await.expect_err("pending must fail");
    assert!(matches!(&err, HubError::Closed(reason) if reason == "connection closed"));

    let closed = next_matching(&mut events, Duration::from_secs(2), |event| {
        matches!(event, ConnectionEvent::Closed)
    })
    .await;
    assert!(closed.is_some());

    // No new requests after close.
    assert!(connection.request("ping", json!({})).await.is_err());
}

#[tokio::test]
async fn unknown_response_ids_are_dropped_silently() {
    let (connection, _events, (mut reader, mut writer)) = wired();

    writer
        .write_all(b"{\"id\":77,\"result\":{}}\n")
        .await
        .expect("write stray response");

    let rx = connection.request("ping", json!({})).await.expect("request");
    let _ = read_frame(&mut reader).await;
    writer
        .write_all(b"{\"id\":1,\"result\":{\"alive\":true}}\n")
        .await
        .expect("write response");
    assert_eq!(
        await_response(rx).await.expect("response"),
        json!({ "alive": true })
    );
}

#[tokio::test]
async fn peer_error_fails_the_pending_request() {
    let (connection, _events, (mut reader, mut writer)) = wired();

    let rx = connection.request("ping", json!({})).await.expect("request");
    let _ = read_frame(&mut reader).await;
    writer
        .write_all(b"{\"id\":1,\"error\":{\"code\":-32000,\"message\":\"nope\"}}\n")
        .await
        .expect("write error");

    let err = await_response(rx).await.expect_err("must fail");
    match err {
        HubError::Rpc { code, message, .. } => {
            assert_eq!(code, Some(-32000));
            assert_eq!(message, "nope");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn malformed_frames_are_nonfatal() {
    let (connection, mut events, (mut reader, mut writer)) = wired();

    writer
        .write_all(b"this is not json\n42\n")
        .await
        .expect("write garbage");

    let error = next_matching(&mut events, Duration::from_secs(2), |event| {
        matches!(event, ConnectionEvent::ProtocolError(_))
    })
    .await;
    assert!(error.is_some());

    let rx = connection.request("ping", json!({})).await.expect("request");
    let _ = read_frame(&mut reader).await;
    writer
        .write_all(b"{\"id\":1,\"result\":{}}\n")
        .await
        .expect("write response");
    assert!(await_response(rx).await.is_ok());
}

#[tokio::test]
async fn classifies_notifications_and_peer_requests() {
    let (connection, mut events, (mut reader, mut writer)) = wired();

    writer
        .write_all(
            b"{\"method\":\"turn/started\",\"params\":{\"threadId\":\"t1\"}}\n\
              {\"id\":5,\"method\":\"item/commandExecution/requestApproval\",\"params\":{}}\n",
        )
        .await
        .expect("write frames");

    let notification = next_matching(&mut events, Duration::from_secs(2), |event| {
        matches!(event, ConnectionEvent::Notification { method, .. } if method == "turn/started")
    })
    .await;
    assert!(notification.is_some());

    let peer_request = next_matching(&mut events, Duration::from_secs(2), |event| {
        matches!(event, ConnectionEvent::PeerRequest { id: 5, .. })
    })
    .await;
    assert!(peer_request.is_some());

    connection
        .respond(5, Some(json!({ "decision": "approved" })), None)
        .expect("respond");
    let frame = read_frame(&mut reader).await;
    assert_eq!(frame["id"], 5);
    assert_eq!(frame["result"], json!({ "decision": "approved" }));
    assert!(frame.get("error").is_none());
}
