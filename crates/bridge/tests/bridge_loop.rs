//! Integration test: an in-process WebSocket server plays the bridge side
//! of the protocol and a real [`BridgeClient`] talks to it.
//!
//! Covers request/response correlation, error-kind mapping, request
//! timeouts, notification forwarding, and recovery after the bridge drops
//! the socket.

use std::net::SocketAddr;
use std::time::Duration;

use ct_bridge::{BridgeClient, BridgeError, BridgeMessage, BridgeOp, ErrorKind};
use ct_domain::config::BridgeConfig;
use ct_domain::source::{SourceClient, SourceConnectionState, SourceNotification};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

// ── Mini bridge: in-process WS server ───────────────────────────────────

enum ServerCmd {
    Push(BridgeMessage),
    Hangup,
}

/// Boots a scripted bridge on an ephemeral port. Every accepted
/// connection announces `ready`, answers requests by op, and obeys
/// commands from the returned channel.
async fn start_mini_bridge() -> (SocketAddr, mpsc::Sender<ServerCmd>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<ServerCmd>(16);

    tokio::spawn(async move {
        while let Ok((stream, _peer)) = listener.accept().await {
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut sink, mut stream) = ws.split();
            send(&mut sink, &BridgeMessage::Ready).await;

            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(ServerCmd::Push(msg)) => send(&mut sink, &msg).await,
                        Some(ServerCmd::Hangup) | None => break,
                    },
                    frame = stream.next() => {
                        let Some(Ok(Message::Text(text))) = frame else { break };
                        match serde_json::from_str::<BridgeMessage>(&text) {
                            Ok(BridgeMessage::Request { request_id, op }) => {
                                if let Some(reply) = answer(request_id, op) {
                                    send(&mut sink, &reply).await;
                                }
                            }
                            Ok(BridgeMessage::Ping { timestamp }) => {
                                send(&mut sink, &BridgeMessage::Pong { timestamp }).await;
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
    });

    (addr, cmd_tx)
}

async fn send<S>(sink: &mut S, msg: &BridgeMessage)
where
    S: SinkExt<Message> + Unpin,
{
    let json = serde_json::to_string(msg).unwrap();
    let _ = sink.send(Message::Text(json)).await;
}

fn answer(request_id: String, op: BridgeOp) -> Option<BridgeMessage> {
    let ok = |result: serde_json::Value| BridgeMessage::Response {
        request_id: request_id.clone(),
        ok: true,
        result,
        error: None,
    };
    Some(match op {
        BridgeOp::ListChannels => ok(json!([
            {"id": "c1", "name": "general", "last_activity_ms": 10},
            {"id": "c2", "last_activity_ms": 5}
        ])),
        BridgeOp::FetchRecentEvents { channel_id, limit } => ok(json!((0..limit.min(3))
            .map(|i| json!({
                "id": format!("{channel_id}-{i}"),
                "channel_id": channel_id,
                "sender_id": "u1",
                "timestamp_ms": 100 + i as i64
            }))
            .collect::<Vec<_>>())),
        BridgeOp::ConnectionState => ok(json!("awaiting_authentication")),
        BridgeOp::ResolveIdentity { identity } => match identity.as_str() {
            "slow" => return None,
            "expired" => BridgeMessage::Response {
                request_id: request_id.clone(),
                ok: false,
                result: serde_json::Value::Null,
                error: Some(BridgeError {
                    kind: ErrorKind::AuthExpired,
                    message: "session logged out".into(),
                }),
            },
            _ => ok(json!({"id": identity, "display_name": format!("Name of {identity}")})),
        },
        BridgeOp::Reinitialize | BridgeOp::PurgeCredentials | BridgeOp::Destroy => {
            ok(serde_json::Value::Null)
        }
    })
}

fn config(addr: SocketAddr) -> BridgeConfig {
    BridgeConfig {
        url: format!("ws://{addr}/v1/source"),
        token_env: "CT_BRIDGE_TEST_TOKEN_UNSET".into(),
        request_timeout_ms: 5_000,
        reconnect_delay_ms: 50,
        ping_interval_ms: 60_000,
    }
}

async fn next_notification(rx: &mut mpsc::Receiver<SourceNotification>) -> SourceNotification {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timeout waiting for notification")
        .expect("notification stream closed")
}

// ── Tests ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn requests_and_notifications_roundtrip() {
    let (addr, server) = start_mini_bridge().await;
    let (client, mut notifications) = BridgeClient::connect(&config(addr));

    assert_eq!(next_notification(&mut notifications).await, SourceNotification::Ready);
    assert!(client.is_connected());

    let channels = client.list_channels().await.unwrap();
    assert_eq!(channels.len(), 2);
    assert_eq!(channels[0].name.as_deref(), Some("general"));

    let events = client.fetch_recent_events("c1", 20).await.unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(events[2].id, "c1-2");

    assert_eq!(
        client.connection_state().await.unwrap(),
        SourceConnectionState::AwaitingAuthentication
    );
    let profile = client.resolve_identity("u9").await.unwrap();
    assert_eq!(profile.display_name, "Name of u9");

    let err = client.resolve_identity("expired").await.unwrap_err();
    assert!(err.is_auth_expired(), "got {err}");

    server
        .send(ServerCmd::Push(BridgeMessage::SessionStateChanged {
            session_id: "call-1".into(),
            status: ct_domain::source::SessionStatus::Missed,
            at_ms: 7,
        }))
        .await
        .unwrap();
    match next_notification(&mut notifications).await {
        SourceNotification::SessionStateChanged { session_id, .. } => {
            assert_eq!(session_id, "call-1")
        }
        other => panic!("unexpected notification: {other:?}"),
    }

    client.destroy().await.unwrap();
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let (addr, _server) = start_mini_bridge().await;
    let mut cfg = config(addr);
    cfg.request_timeout_ms = 200;
    let (client, mut notifications) = BridgeClient::connect(&cfg);
    next_notification(&mut notifications).await;

    let err = client.resolve_identity("slow").await.unwrap_err();
    assert!(err.is_transient());
    assert!(err.to_string().contains("timed out"), "got {err}");

    // The link is still usable afterwards.
    assert_eq!(client.list_channels().await.unwrap().len(), 2);
    client.close();
}

#[tokio::test]
async fn dropped_socket_fails_pending_and_reconnects() {
    let (addr, server) = start_mini_bridge().await;
    let (client, mut notifications) = BridgeClient::connect(&config(addr));
    next_notification(&mut notifications).await;

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.resolve_identity("slow").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.send(ServerCmd::Hangup).await.unwrap();

    let err = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("pending request not failed on drop")
        .unwrap()
        .unwrap_err();
    assert!(err.is_transient());

    match next_notification(&mut notifications).await {
        SourceNotification::Disconnected { reason } => assert!(!reason.is_empty()),
        other => panic!("expected disconnected, got {other:?}"),
    }

    // The socket task re-opens the link and the bridge announces ready again.
    assert_eq!(next_notification(&mut notifications).await, SourceNotification::Ready);
    assert_eq!(client.list_channels().await.unwrap().len(), 2);
    client.close();
}
