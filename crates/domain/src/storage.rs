//! The storage collaborator and the records that flow into it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::source::{MediaFlags, SessionStatus, SourceEvent};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Raw log envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawKind {
    Event,
    Session,
}

/// One line of the append-only raw log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEnvelope {
    pub kind: RawKind,
    pub id: String,
    pub received_at_ms: i64,
    pub body: serde_json::Value,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dimension records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub last_event_ms: Option<i64>,
}

impl ChannelRecord {
    /// Apply the fields of `update` that are present and differ.
    /// `last_event_ms` only moves forward. Returns whether anything changed.
    pub fn merge_from(&mut self, update: &ChannelRecord) -> bool {
        let mut changed = false;
        if update.name.is_some() && update.name != self.name {
            self.name.clone_from(&update.name);
            changed = true;
        }
        if let Some(ts) = update.last_event_ms {
            if self.last_event_ms.map_or(true, |cur| ts > cur) {
                self.last_event_ms = Some(ts);
                changed = true;
            }
        }
        changed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub attributes: Option<serde_json::Value>,
}

impl IdentityRecord {
    /// Apply the fields of `update` that are present and differ.
    pub fn merge_from(&mut self, update: &IdentityRecord) -> bool {
        let mut changed = false;
        if update.display_name.is_some() && update.display_name != self.display_name {
            self.display_name.clone_from(&update.display_name);
            changed = true;
        }
        if update.attributes.is_some() && update.attributes != self.attributes {
            self.attributes.clone_from(&update.attributes);
            changed = true;
        }
        changed
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fact records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A persisted event. `id` is a hard dedupe key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRecord {
    pub id: String,
    pub channel_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp_ms: i64,
}

impl From<&SourceEvent> for IngestRecord {
    fn from(ev: &SourceEvent) -> Self {
        Self {
            id: ev.id.clone(),
            channel_id: ev.channel_id.clone(),
            sender_id: ev.sender_id.clone(),
            payload: ev.payload.clone(),
            timestamp_ms: ev.timestamp_ms,
        }
    }
}

/// The durable record of a finished session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub channel_id: String,
    pub initiator_id: String,
    #[serde(default)]
    pub counterpart_id: Option<String>,
    #[serde(default)]
    pub media: MediaFlags,
    pub status: SessionStatus,
    pub started_at_ms: i64,
    #[serde(default)]
    pub ended_at_ms: Option<i64>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertOutcome {
    Inserted,
    /// A record with the same id already exists; nothing was written.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelActivity {
    pub channel_id: String,
    pub event_count: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Storage trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait Storage: Send + Sync {
    /// Append to the raw log. Must be durable before returning `Ok`.
    async fn append_raw(&self, envelope: &RawEnvelope) -> Result<()>;

    /// Create or merge a channel. Returns whether anything was written.
    async fn upsert_channel(&self, channel: &ChannelRecord) -> Result<bool>;

    /// Create or merge an identity. Returns whether anything was written.
    async fn upsert_identity(&self, identity: &IdentityRecord) -> Result<bool>;

    /// Insert keyed by `record.id`; an existing id is a silent no-op.
    async fn insert_event(&self, record: &IngestRecord) -> Result<InsertOutcome>;

    /// Insert keyed by `record.session_id`; an existing id is a no-op.
    async fn insert_session_record(&self, record: &SessionRecord) -> Result<InsertOutcome>;

    async fn event_count(&self, channel_id: &str) -> Result<u64>;

    /// Channels ranked by event count among events with
    /// `timestamp_ms >= since_ms`, highest first.
    async fn active_channels(&self, since_ms: i64, limit: usize) -> Result<Vec<ChannelActivity>>;

    async fn watermark(&self) -> Result<Option<i64>>;

    async fn set_watermark(&self, value: i64) -> Result<()>;
}
