//! WebSocket client for the source bridge. One background task owns the
//! socket and keeps re-opening it; requests are correlated by id and
//! resolved through one-shot channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ct_domain::config::BridgeConfig;
use ct_domain::error::{Error, Result};
use ct_domain::source::{
    ChannelSummary, IdentityProfile, SourceClient, SourceConnectionState, SourceEvent,
    SourceNotification,
};
use ct_domain::trace::TraceEvent;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::protocol::{BridgeMessage, BridgeOp};

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Result<serde_json::Value>>>>>;

const NOTIFY_BUFFER: usize = 256;
const OUTBOUND_BUFFER: usize = 64;

pub struct BridgeClient {
    outbound: mpsc::Sender<BridgeMessage>,
    pending: Pending,
    connected: Arc<AtomicBool>,
    request_timeout: Duration,
    cancel: CancellationToken,
}

impl BridgeClient {
    /// Spawn the socket task and return the client plus the notification
    /// stream the orchestrator consumes.
    pub fn connect(cfg: &BridgeConfig) -> (Arc<Self>, mpsc::Receiver<SourceNotification>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_BUFFER);
        let client = Arc::new(Self {
            outbound: outbound_tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
            connected: Arc::new(AtomicBool::new(false)),
            request_timeout: Duration::from_millis(cfg.request_timeout_ms),
            cancel: CancellationToken::new(),
        });

        let socket = SocketTask {
            url: build_url(&cfg.url, cfg.token().as_deref()),
            reconnect_delay: Duration::from_millis(cfg.reconnect_delay_ms),
            ping_interval: Duration::from_millis(cfg.ping_interval_ms.max(1)),
            pending: client.pending.clone(),
            connected: client.connected.clone(),
            notify: notify_tx,
            cancel: client.cancel.clone(),
        };
        tokio::spawn(socket.run(outbound_rx));

        (client, notify_rx)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Stop the socket task. Pending requests fail.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    async fn call(&self, op: BridgeOp) -> Result<serde_json::Value> {
        if !self.is_connected() {
            return Err(Error::TransientSource(format!(
                "{}: bridge not connected",
                op.name()
            )));
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        let name = op.name();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);

        let request = BridgeMessage::Request {
            request_id: request_id.clone(),
            op,
        };
        if self.outbound.send(request).await.is_err() {
            self.pending.lock().remove(&request_id);
            return Err(Error::TransientSource(format!("{name}: bridge task stopped")));
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::TransientSource(format!(
                "{name}: request dropped"
            ))),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                tracing::warn!(
                    request_id = %request_id,
                    op = name,
                    timeout_ms = self.request_timeout.as_millis() as u64,
                    "bridge request timed out"
                );
                Err(Error::TransientSource(format!("{name}: request timed out")))
            }
        }
    }

    async fn call_as<T: DeserializeOwned>(&self, op: BridgeOp) -> Result<T> {
        let value = self.call(op).await?;
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl SourceClient for BridgeClient {
    async fn fetch_recent_events(&self, channel_id: &str, limit: usize) -> Result<Vec<SourceEvent>> {
        self.call_as(BridgeOp::FetchRecentEvents {
            channel_id: channel_id.to_owned(),
            limit,
        })
        .await
    }

    async fn resolve_identity(&self, identity: &str) -> Result<IdentityProfile> {
        self.call_as(BridgeOp::ResolveIdentity {
            identity: identity.to_owned(),
        })
        .await
    }

    async fn list_channels(&self) -> Result<Vec<ChannelSummary>> {
        self.call_as(BridgeOp::ListChannels).await
    }

    async fn connection_state(&self) -> Result<SourceConnectionState> {
        self.call_as(BridgeOp::ConnectionState).await
    }

    async fn reinitialize(&self) -> Result<()> {
        self.call(BridgeOp::Reinitialize).await.map(drop)
    }

    async fn purge_credentials(&self) -> Result<()> {
        self.call(BridgeOp::PurgeCredentials).await.map(drop)
    }

    async fn destroy(&self) -> Result<()> {
        let result = if self.is_connected() {
            self.call(BridgeOp::Destroy).await.map(drop)
        } else {
            Ok(())
        };
        self.close();
        result
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Socket task
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct SocketTask {
    url: String,
    reconnect_delay: Duration,
    ping_interval: Duration,
    pending: Pending,
    connected: Arc<AtomicBool>,
    notify: mpsc::Sender<SourceNotification>,
    cancel: CancellationToken,
}

impl SocketTask {
    async fn run(self, mut outbound: mpsc::Receiver<BridgeMessage>) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let reason = match self.connect_and_run(&mut outbound).await {
                Ok(reason) => reason,
                Err(e) => e.to_string(),
            };

            let was_connected = self.connected.swap(false, Ordering::SeqCst);
            self.fail_pending(&reason);
            if was_connected {
                tracing::warn!(reason = %reason, "bridge connection lost");
                TraceEvent::BridgeLink {
                    connected: false,
                    detail: Some(reason.clone()),
                }
                .emit();
                let _ = self
                    .notify
                    .send(SourceNotification::Disconnected { reason })
                    .await;
            } else {
                tracing::debug!(reason = %reason, "bridge connect attempt failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = self.cancel.cancelled() => break,
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        self.fail_pending("bridge client closed");
        tracing::info!("bridge socket task stopped");
    }

    /// One socket lifetime. Returns the reason it ended.
    async fn connect_and_run(
        &self,
        outbound: &mut mpsc::Receiver<BridgeMessage>,
    ) -> anyhow::Result<String> {
        let (ws, _response) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        let (mut sink, mut stream) = ws.split();

        // Frames queued while the socket was down belong to requests that
        // have already been failed.
        while outbound.try_recv().is_ok() {}

        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(url = %redact(&self.url), "bridge connected");
        TraceEvent::BridgeLink {
            connected: true,
            detail: None,
        }
        .emit();

        let mut ping = tokio::time::interval(self.ping_interval);
        ping.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok("bridge client closed".into());
                }
                _ = ping.tick() => {
                    let msg = BridgeMessage::Ping { timestamp: Utc::now().timestamp_millis() };
                    sink.send(Message::Text(serde_json::to_string(&msg)?)).await?;
                }
                msg = outbound.recv() => {
                    let Some(msg) = msg else {
                        return Ok("bridge client dropped".into());
                    };
                    sink.send(Message::Text(serde_json::to_string(&msg)?)).await?;
                }
                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(reply) = self.dispatch(&text).await {
                                sink.send(Message::Text(serde_json::to_string(&reply)?)).await?;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Ok("bridge closed the connection".into());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
            }
        }
    }

    /// Route one inbound frame. Returns a frame to send back, if any.
    async fn dispatch(&self, text: &str) -> Option<BridgeMessage> {
        let msg = match serde_json::from_str::<BridgeMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(error = %e, "unparseable bridge frame");
                return None;
            }
        };

        match msg {
            BridgeMessage::Response {
                request_id,
                ok,
                result,
                error,
            } => {
                let Some(tx) = self.pending.lock().remove(&request_id) else {
                    tracing::debug!(request_id = %request_id, "response for unknown request");
                    return None;
                };
                let outcome = if ok {
                    Ok(result)
                } else {
                    Err(error.map(Error::from).unwrap_or_else(|| {
                        Error::TransientSource("bridge reported failure".into())
                    }))
                };
                let _ = tx.send(outcome);
                None
            }
            BridgeMessage::Ping { timestamp } => Some(BridgeMessage::Pong { timestamp }),
            BridgeMessage::Pong { .. } => {
                tracing::trace!("received pong");
                None
            }
            BridgeMessage::Request { request_id, .. } => {
                tracing::debug!(request_id = %request_id, "ignoring request from bridge");
                None
            }
            other => {
                if let Some(notification) = other.into_notification() {
                    if self.notify.send(notification).await.is_err() {
                        tracing::debug!("notification receiver dropped");
                    }
                }
                None
            }
        }
    }

    fn fail_pending(&self, reason: &str) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(Error::TransientSource(reason.to_owned())));
        }
    }
}

/// Append the bearer token as a query parameter.
fn build_url(base: &str, token: Option<&str>) -> String {
    match token {
        Some(token) => {
            let sep = if base.contains('?') { "&" } else { "?" };
            format!("{base}{sep}token={token}")
        }
        None => base.to_owned(),
    }
}

fn redact(url: &str) -> &str {
    url.split_once("token=").map_or(url, |(head, _)| head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_url_with_token() {
        assert_eq!(
            build_url("ws://localhost:3399/v1/source", Some("secret")),
            "ws://localhost:3399/v1/source?token=secret"
        );
    }

    #[test]
    fn build_url_without_token() {
        assert_eq!(
            build_url("ws://localhost:3399/v1/source", None),
            "ws://localhost:3399/v1/source"
        );
    }

    #[test]
    fn build_url_with_existing_query_params() {
        let url = build_url("ws://localhost:3399/v1/source?foo=bar", Some("secret"));
        assert_eq!(url, "ws://localhost:3399/v1/source?foo=bar&token=secret");
    }

    #[test]
    fn token_is_redacted_in_logs() {
        assert_eq!(redact("ws://h/v1/source?token=secret"), "ws://h/v1/source?");
        assert_eq!(redact("ws://h/v1/source"), "ws://h/v1/source");
    }

    #[tokio::test]
    async fn calls_fail_fast_while_disconnected() {
        let cfg = BridgeConfig {
            url: "ws://127.0.0.1:9/unreachable".into(),
            reconnect_delay_ms: 60_000,
            ..BridgeConfig::default()
        };
        let (client, _rx) = BridgeClient::connect(&cfg);
        let err = client.list_channels().await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("not connected"));
        client.close();
    }
}
