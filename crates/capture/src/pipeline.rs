//! Ingestion pipeline: raw append, then structured upsert.
//!
//! Stage 1 appends the event to the raw log before anything else; if that
//! fails the event is dropped. Stage 2 upserts the channel and sender
//! dimensions and inserts the event keyed by id. Stage 2 failures are
//! logged with ids and the failing operation and never propagate: the raw
//! log already holds the event.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use ct_domain::error::{Error, Result};
use ct_domain::source::SourceEvent;
use ct_domain::storage::{
    ChannelRecord, IdentityRecord, IngestRecord, InsertOutcome, RawEnvelope, RawKind,
    SessionRecord, Storage,
};
use ct_domain::trace::TraceEvent;

use crate::clock::Clock;
use crate::watermark::Watermark;

/// Which path handed the event to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOrigin {
    Live,
    Prefill,
    Backfill,
    Refresh,
}

impl IngestOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Prefill => "prefill",
            Self::Backfill => "backfill",
            Self::Refresh => "refresh",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Inserted,
    /// Already stored; a no-op.
    Duplicate,
    /// In the raw log, but the structured write failed.
    StructuredFailed,
    /// Raw append failed; nothing was written.
    Dropped,
}

impl IngestOutcome {
    /// The event is present in structured storage.
    pub fn is_persisted(self) -> bool {
        matches!(self, Self::Inserted | Self::Duplicate)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub events_inserted: u64,
    pub events_duplicate: u64,
    pub sessions_written: u64,
    pub raw_failures: u64,
    pub storage_failures: u64,
    /// Wall-clock time the last live event arrived.
    pub last_event_ms: Option<i64>,
    /// Wall-clock time of the last successful structured write.
    pub last_write_ms: Option<i64>,
}

pub struct IngestionPipeline {
    storage: Arc<dyn Storage>,
    watermark: Arc<Watermark>,
    clock: Arc<dyn Clock>,
    events_inserted: AtomicU64,
    events_duplicate: AtomicU64,
    sessions_written: AtomicU64,
    raw_failures: AtomicU64,
    storage_failures: AtomicU64,
    last_event_ms: AtomicI64,
    last_write_ms: AtomicI64,
}

const NEVER: i64 = i64::MIN;

fn optional(v: i64) -> Option<i64> {
    (v != NEVER).then_some(v)
}

impl IngestionPipeline {
    pub fn new(storage: Arc<dyn Storage>, watermark: Arc<Watermark>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            watermark,
            clock,
            events_inserted: AtomicU64::new(0),
            events_duplicate: AtomicU64::new(0),
            sessions_written: AtomicU64::new(0),
            raw_failures: AtomicU64::new(0),
            storage_failures: AtomicU64::new(0),
            last_event_ms: AtomicI64::new(NEVER),
            last_write_ms: AtomicI64::new(NEVER),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn watermark(&self) -> &Arc<Watermark> {
        &self.watermark
    }

    pub async fn ingest(&self, event: &SourceEvent, origin: IngestOrigin) -> IngestOutcome {
        let now = self.clock.now_ms();
        if origin == IngestOrigin::Live {
            self.last_event_ms.store(now, Ordering::Relaxed);
        }

        let body = match serde_json::to_value(event) {
            Ok(v) => v,
            Err(e) => {
                self.raw_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(event_id = %event.id, error = %e, "event not serializable; dropped");
                return IngestOutcome::Dropped;
            }
        };
        let envelope = RawEnvelope {
            kind: RawKind::Event,
            id: event.id.clone(),
            received_at_ms: now,
            body,
        };
        if let Err(e) = self.storage.append_raw(&envelope).await {
            self.raw_failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                event_id = %event.id,
                channel_id = %event.channel_id,
                origin = origin.as_str(),
                error = %e,
                "raw append failed; event dropped"
            );
            TraceEvent::IngestFailed {
                event_id: event.id.clone(),
                channel_id: event.channel_id.clone(),
                op: "append_raw".into(),
                error: e.to_string(),
            }
            .emit();
            return IngestOutcome::Dropped;
        }

        let outcome = match self.write_structured(event).await {
            Ok(outcome) => outcome,
            Err((op, e)) => {
                self.storage_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    event_id = %event.id,
                    channel_id = %event.channel_id,
                    sender_id = %event.sender_id,
                    op,
                    origin = origin.as_str(),
                    error = %e,
                    "structured write failed; event kept in raw log"
                );
                TraceEvent::IngestFailed {
                    event_id: event.id.clone(),
                    channel_id: event.channel_id.clone(),
                    op: op.into(),
                    error: e.to_string(),
                }
                .emit();
                return IngestOutcome::StructuredFailed;
            }
        };

        match outcome {
            InsertOutcome::Inserted => {
                self.events_inserted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(event_id = %event.id, origin = origin.as_str(), "event stored");
            }
            InsertOutcome::Duplicate => {
                self.events_duplicate.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.last_write_ms.store(self.clock.now_ms(), Ordering::Relaxed);
        self.watermark.advance(event.timestamp_ms).await;

        match outcome {
            InsertOutcome::Inserted => IngestOutcome::Inserted,
            InsertOutcome::Duplicate => IngestOutcome::Duplicate,
        }
    }

    async fn write_structured(
        &self,
        event: &SourceEvent,
    ) -> std::result::Result<InsertOutcome, (&'static str, Error)> {
        let channel = ChannelRecord {
            id: event.channel_id.clone(),
            name: event.channel_name.clone(),
            last_event_ms: Some(event.timestamp_ms),
        };
        self.storage
            .upsert_channel(&channel)
            .await
            .map_err(|e| ("upsert_channel", e))?;

        let sender = IdentityRecord {
            id: event.sender_id.clone(),
            display_name: event.sender_name.clone(),
            attributes: None,
        };
        self.storage
            .upsert_identity(&sender)
            .await
            .map_err(|e| ("upsert_identity", e))?;

        self.storage
            .insert_event(&IngestRecord::from(event))
            .await
            .map_err(|e| ("insert_event", e))
    }

    /// Persist a finished session: raw append, then the session record.
    pub async fn ingest_session(&self, record: &SessionRecord) -> IngestOutcome {
        let now = self.clock.now_ms();
        let envelope = match serde_json::to_value(record) {
            Ok(body) => RawEnvelope {
                kind: RawKind::Session,
                id: record.session_id.clone(),
                received_at_ms: now,
                body,
            },
            Err(e) => {
                self.raw_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(session_id = %record.session_id, error = %e, "session not serializable; dropped");
                return IngestOutcome::Dropped;
            }
        };
        if let Err(e) = self.storage.append_raw(&envelope).await {
            self.raw_failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(session_id = %record.session_id, error = %e, "raw append failed; session dropped");
            return IngestOutcome::Dropped;
        }

        match self.write_session(record).await {
            Ok(outcome) => {
                self.sessions_written.fetch_add(1, Ordering::Relaxed);
                self.last_write_ms.store(self.clock.now_ms(), Ordering::Relaxed);
                match outcome {
                    InsertOutcome::Inserted => IngestOutcome::Inserted,
                    InsertOutcome::Duplicate => IngestOutcome::Duplicate,
                }
            }
            Err(e) => {
                self.storage_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    session_id = %record.session_id,
                    channel_id = %record.channel_id,
                    op = "insert_session_record",
                    error = %e,
                    "session write failed; record kept in raw log"
                );
                IngestOutcome::StructuredFailed
            }
        }
    }

    async fn write_session(&self, record: &SessionRecord) -> Result<InsertOutcome> {
        self.storage
            .upsert_channel(&ChannelRecord {
                id: record.channel_id.clone(),
                name: None,
                last_event_ms: None,
            })
            .await?;
        self.storage.insert_session_record(record).await
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            events_inserted: self.events_inserted.load(Ordering::Relaxed),
            events_duplicate: self.events_duplicate.load(Ordering::Relaxed),
            sessions_written: self.sessions_written.load(Ordering::Relaxed),
            raw_failures: self.raw_failures.load(Ordering::Relaxed),
            storage_failures: self.storage_failures.load(Ordering::Relaxed),
            last_event_ms: optional(self.last_event_ms.load(Ordering::Relaxed)),
            last_write_ms: optional(self.last_write_ms.load(Ordering::Relaxed)),
        }
    }
}
