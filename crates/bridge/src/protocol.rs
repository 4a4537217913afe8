//! Bridge wire protocol: JSON text frames tagged by `type`.
//!
//! The daemon sends `request` frames and receives `response` frames
//! correlated by `request_id`. Everything else flowing from the bridge is a
//! notification about the source session.

use ct_domain::error::Error;
use ct_domain::source::{SessionStart, SessionStatus, SourceEvent, SourceNotification};
use serde::{Deserialize, Serialize};

/// WebSocket message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeMessage {
    /// Daemon → bridge: perform an operation against the source.
    Request { request_id: String, op: BridgeOp },

    /// Bridge → daemon: outcome of a request.
    Response {
        request_id: String,
        ok: bool,
        #[serde(default)]
        result: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<BridgeError>,
    },

    AuthChallenge {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Authenticated,
    Ready,
    Disconnected {
        #[serde(default)]
        reason: String,
    },
    Event { event: SourceEvent },
    SessionStarted { session: SessionStart },
    SessionStateChanged {
        session_id: String,
        status: SessionStatus,
        at_ms: i64,
    },

    /// Bidirectional: heartbeat.
    Ping { timestamp: i64 },
    /// Bidirectional: heartbeat response.
    Pong { timestamp: i64 },
}

/// Operations the bridge performs on the daemon's behalf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum BridgeOp {
    FetchRecentEvents { channel_id: String, limit: usize },
    ResolveIdentity { identity: String },
    ListChannels,
    ConnectionState,
    Reinitialize,
    PurgeCredentials,
    Destroy,
}

impl BridgeOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FetchRecentEvents { .. } => "fetch_recent_events",
            Self::ResolveIdentity { .. } => "resolve_identity",
            Self::ListChannels => "list_channels",
            Self::ConnectionState => "connection_state",
            Self::Reinitialize => "reinitialize",
            Self::PurgeCredentials => "purge_credentials",
            Self::Destroy => "destroy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The source session is no longer authorized.
    AuthExpired,
    Unavailable,
    NotFound,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeError {
    pub kind: ErrorKind,
    #[serde(default)]
    pub message: String,
}

impl From<BridgeError> for Error {
    fn from(err: BridgeError) -> Self {
        match err.kind {
            ErrorKind::AuthExpired => Error::AuthExpired(err.message),
            _ => Error::TransientSource(err.message),
        }
    }
}

impl BridgeMessage {
    /// Notification frames mapped onto the source vocabulary. Requests,
    /// responses and heartbeats yield `None`.
    pub fn into_notification(self) -> Option<SourceNotification> {
        Some(match self {
            Self::AuthChallenge { detail } => SourceNotification::AuthChallenge { detail },
            Self::Authenticated => SourceNotification::Authenticated,
            Self::Ready => SourceNotification::Ready,
            Self::Disconnected { reason } => SourceNotification::Disconnected { reason },
            Self::Event { event } => SourceNotification::Event(event),
            Self::SessionStarted { session } => SourceNotification::SessionStarted(session),
            Self::SessionStateChanged {
                session_id,
                status,
                at_ms,
            } => SourceNotification::SessionStateChanged {
                session_id,
                status,
                at_ms,
            },
            Self::Request { .. } | Self::Response { .. } | Self::Ping { .. } | Self::Pong { .. } => {
                return None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_shape() {
        let msg = BridgeMessage::Request {
            request_id: "r1".into(),
            op: BridgeOp::FetchRecentEvents {
                channel_id: "c1".into(),
                limit: 20,
            },
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "request",
                "request_id": "r1",
                "op": {"name": "fetch_recent_events", "channel_id": "c1", "limit": 20}
            })
        );
    }

    #[test]
    fn unit_ops_carry_only_their_name() {
        let value = serde_json::to_value(BridgeOp::ListChannels).unwrap();
        assert_eq!(value, json!({"name": "list_channels"}));
        assert_eq!(BridgeOp::PurgeCredentials.name(), "purge_credentials");
    }

    #[test]
    fn response_without_result_parses() {
        let msg: BridgeMessage =
            serde_json::from_str(r#"{"type":"response","request_id":"r9","ok":true}"#).unwrap();
        match msg {
            BridgeMessage::Response { result, error, .. } => {
                assert!(result.is_null());
                assert!(error.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_error_kind_is_tolerated() {
        let err: BridgeError =
            serde_json::from_str(r#"{"kind":"rate_limited","message":"slow down"}"#).unwrap();
        assert_eq!(err.kind, ErrorKind::Unknown);
        assert!(Error::from(err).is_transient());
    }

    #[test]
    fn auth_expired_kind_maps_to_escalation() {
        let err = BridgeError {
            kind: ErrorKind::AuthExpired,
            message: "logged out elsewhere".into(),
        };
        assert!(Error::from(err).is_auth_expired());
    }

    #[test]
    fn notifications_map_onto_source_vocabulary() {
        let msg: BridgeMessage = serde_json::from_value(json!({
            "type": "session_state_changed",
            "session_id": "call-1",
            "status": "in_progress",
            "at_ms": 5
        }))
        .unwrap();
        assert_eq!(
            msg.into_notification(),
            Some(SourceNotification::SessionStateChanged {
                session_id: "call-1".into(),
                status: SessionStatus::InProgress,
                at_ms: 5,
            })
        );

        let ready: BridgeMessage = serde_json::from_str(r#"{"type":"ready"}"#).unwrap();
        assert_eq!(ready.into_notification(), Some(SourceNotification::Ready));
        assert_eq!(BridgeMessage::Ping { timestamp: 1 }.into_notification(), None);
    }

    #[test]
    fn disconnected_reason_defaults_to_empty() {
        let msg: BridgeMessage = serde_json::from_str(r#"{"type":"disconnected"}"#).unwrap();
        assert_eq!(
            msg,
            BridgeMessage::Disconnected {
                reason: String::new()
            }
        );
    }
}
