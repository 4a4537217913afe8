//! The messaging-source collaborator: what it tells us and what we can ask it.
//!
//! Inbound notifications arrive on an `mpsc` channel owned by whoever
//! constructs the client; outbound calls go through [`SourceClient`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Events and lookups
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single event observed on the source, live or fetched from history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEvent {
    /// Globally unique; the dedupe key for persistence.
    pub id: String,
    pub channel_id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Epoch milliseconds as reported by the source.
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Epoch milliseconds of the latest activity the source knows about.
    #[serde(default)]
    pub last_activity_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityProfile {
    pub id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub attributes: serde_json::Value,
}

/// Liveness as reported by the source's own state query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceConnectionState {
    Connected,
    Connecting,
    AwaitingAuthentication,
    Disconnected,
    Unknown,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sessions (calls and other multi-event interactions)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Connecting,
    InProgress,
    Ended,
    Rejected,
    Missed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Rejected | Self::Missed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Connecting => "connecting",
            Self::InProgress => "in_progress",
            Self::Ended => "ended",
            Self::Rejected => "rejected",
            Self::Missed => "missed",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFlags {
    #[serde(default)]
    pub audio: bool,
    #[serde(default)]
    pub video: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStart {
    pub session_id: String,
    pub channel_id: String,
    pub initiator_id: String,
    #[serde(default)]
    pub counterpart_id: Option<String>,
    #[serde(default)]
    pub media: MediaFlags,
    pub started_at_ms: i64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound notifications
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq)]
pub enum SourceNotification {
    /// The source needs an interactive login (QR code, device code, ...).
    AuthChallenge { detail: Option<String> },
    Authenticated,
    /// The source session is up and delivering events.
    Ready,
    Disconnected { reason: String },
    Event(SourceEvent),
    SessionStarted(SessionStart),
    SessionStateChanged {
        session_id: String,
        status: SessionStatus,
        at_ms: i64,
    },
}

impl SourceNotification {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthChallenge { .. } => "auth_challenge",
            Self::Authenticated => "authenticated",
            Self::Ready => "ready",
            Self::Disconnected { .. } => "disconnected",
            Self::Event(_) => "event",
            Self::SessionStarted(_) => "session_started",
            Self::SessionStateChanged { .. } => "session_state_changed",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outbound calls
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Client for the single long-lived source connection.
///
/// Implementations are not assumed to tolerate concurrent calls; callers
/// serialize access.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Most recent `limit` events for a channel, newest first or any order.
    async fn fetch_recent_events(&self, channel_id: &str, limit: usize)
        -> Result<Vec<SourceEvent>>;

    async fn resolve_identity(&self, identity: &str) -> Result<IdentityProfile>;

    async fn list_channels(&self) -> Result<Vec<ChannelSummary>>;

    async fn connection_state(&self) -> Result<SourceConnectionState>;

    /// Tear down and re-open the source session.
    async fn reinitialize(&self) -> Result<()>;

    /// Delete locally stored credentials so the next start issues a fresh
    /// authentication challenge.
    async fn purge_credentials(&self) -> Result<()>;

    async fn destroy(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(SessionStatus::Ended.is_terminal());
        assert!(SessionStatus::Rejected.is_terminal());
        assert!(SessionStatus::Missed.is_terminal());
        assert!(!SessionStatus::Pending.is_terminal());
        assert!(!SessionStatus::InProgress.is_terminal());
    }

    #[test]
    fn event_parses_without_optional_fields() {
        let json = r#"{"id":"e1","channel_id":"c1","sender_id":"u1","timestamp_ms":42}"#;
        let ev: SourceEvent = serde_json::from_str(json).unwrap();
        assert_eq!(ev.id, "e1");
        assert!(ev.channel_name.is_none());
        assert!(ev.payload.is_null());
    }

    #[test]
    fn session_status_wire_names() {
        let s: SessionStatus = serde_json::from_str("\"in_progress\"").unwrap();
        assert_eq!(s, SessionStatus::InProgress);
        assert_eq!(SessionStatus::Missed.to_string(), "missed");
    }
}
