//! In-memory collaborators with failure injection, for tests of the capture
//! core and of anything built on it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use ct_domain::error::{Error, Result};
use ct_domain::source::{
    ChannelSummary, IdentityProfile, SourceClient, SourceConnectionState, SourceEvent,
};
use ct_domain::storage::{
    ChannelActivity, ChannelRecord, IdentityRecord, IngestRecord, InsertOutcome, RawEnvelope,
    SessionRecord, Storage,
};

use crate::clock::Clock;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Clock
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Wall clock that follows tokio's clock, so `start_paused` tests see
/// timestamps move with the timers they auto-advance.
pub struct TokioClock {
    origin: tokio::time::Instant,
    base_ms: i64,
}

impl TokioClock {
    pub fn new(base_ms: i64) -> Self {
        Self {
            origin: tokio::time::Instant::now(),
            base_ms,
        }
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> i64 {
        self.base_ms + self.origin.elapsed().as_millis() as i64
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Storage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct MemoryStorage {
    pub raw: Mutex<Vec<RawEnvelope>>,
    pub events: Mutex<HashMap<String, IngestRecord>>,
    pub channels: Mutex<HashMap<String, ChannelRecord>>,
    pub identities: Mutex<HashMap<String, IdentityRecord>>,
    pub sessions: Mutex<Vec<SessionRecord>>,
    pub watermark: Mutex<Option<i64>>,
    pub fail_raw: AtomicBool,
    pub fail_structured: AtomicBool,
    pub fail_watermark: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.events.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn structured_guard(&self, op: &str, id: &str) -> Result<()> {
        if self.fail_structured.load(Ordering::SeqCst) {
            return Err(Error::storage_write(op, id, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn append_raw(&self, envelope: &RawEnvelope) -> Result<()> {
        if self.fail_raw.load(Ordering::SeqCst) {
            return Err(Error::storage_write("append_raw", &envelope.id, "injected failure"));
        }
        self.raw.lock().push(envelope.clone());
        Ok(())
    }

    async fn upsert_channel(&self, channel: &ChannelRecord) -> Result<bool> {
        self.structured_guard("upsert_channel", &channel.id)?;
        let mut channels = self.channels.lock();
        Ok(match channels.get_mut(&channel.id) {
            Some(existing) => existing.merge_from(channel),
            None => {
                channels.insert(channel.id.clone(), channel.clone());
                true
            }
        })
    }

    async fn upsert_identity(&self, identity: &IdentityRecord) -> Result<bool> {
        self.structured_guard("upsert_identity", &identity.id)?;
        let mut identities = self.identities.lock();
        Ok(match identities.get_mut(&identity.id) {
            Some(existing) => existing.merge_from(identity),
            None => {
                identities.insert(identity.id.clone(), identity.clone());
                true
            }
        })
    }

    async fn insert_event(&self, record: &IngestRecord) -> Result<InsertOutcome> {
        self.structured_guard("insert_event", &record.id)?;
        let mut events = self.events.lock();
        if events.contains_key(&record.id) {
            return Ok(InsertOutcome::Duplicate);
        }
        events.insert(record.id.clone(), record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn insert_session_record(&self, record: &SessionRecord) -> Result<InsertOutcome> {
        self.structured_guard("insert_session_record", &record.session_id)?;
        let mut sessions = self.sessions.lock();
        if sessions.iter().any(|s| s.session_id == record.session_id) {
            return Ok(InsertOutcome::Duplicate);
        }
        sessions.push(record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn event_count(&self, channel_id: &str) -> Result<u64> {
        Ok(self
            .events
            .lock()
            .values()
            .filter(|e| e.channel_id == channel_id)
            .count() as u64)
    }

    async fn active_channels(&self, since_ms: i64, limit: usize) -> Result<Vec<ChannelActivity>> {
        let mut counts: HashMap<String, u64> = HashMap::new();
        for e in self.events.lock().values() {
            if e.timestamp_ms >= since_ms {
                *counts.entry(e.channel_id.clone()).or_default() += 1;
            }
        }
        let mut ranked: Vec<_> = counts
            .into_iter()
            .map(|(channel_id, event_count)| ChannelActivity {
                channel_id,
                event_count,
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.event_count
                .cmp(&a.event_count)
                .then_with(|| a.channel_id.cmp(&b.channel_id))
        });
        ranked.truncate(limit);
        Ok(ranked)
    }

    async fn watermark(&self) -> Result<Option<i64>> {
        Ok(*self.watermark.lock())
    }

    async fn set_watermark(&self, value: i64) -> Result<()> {
        if self.fail_watermark.load(Ordering::SeqCst) {
            return Err(Error::storage_write("set_watermark", &value.to_string(), "injected failure"));
        }
        *self.watermark.lock() = Some(value);
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Source
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A source whose answers are set up front and whose calls are counted.
pub struct FakeSource {
    pub channels: Mutex<Vec<ChannelSummary>>,
    /// channel id → history, newest first.
    pub history: Mutex<HashMap<String, Vec<SourceEvent>>>,
    pub display_names: Mutex<HashMap<String, String>>,
    pub state: Mutex<SourceConnectionState>,
    /// Outcomes for upcoming `reinitialize()` calls; empty means `Ok`.
    pub reinit_script: Mutex<VecDeque<Result<()>>>,
    /// Number of upcoming `list_channels`/`fetch_recent_events` calls to fail.
    pub fail_fetches: AtomicU32,
    pub fail_resolve: AtomicBool,
    /// Simulated latency of every `fetch_recent_events` call.
    pub fetch_delay: Mutex<Option<Duration>>,
    pub fetch_calls: Mutex<Vec<(String, usize)>>,
    pub list_calls: AtomicU32,
    pub resolve_calls: AtomicU32,
    pub reinit_calls: AtomicU32,
    pub purge_calls: AtomicU32,
    pub destroy_calls: AtomicU32,
}

impl Default for FakeSource {
    fn default() -> Self {
        Self {
            channels: Mutex::new(Vec::new()),
            history: Mutex::new(HashMap::new()),
            display_names: Mutex::new(HashMap::new()),
            state: Mutex::new(SourceConnectionState::Connected),
            reinit_script: Mutex::new(VecDeque::new()),
            fail_fetches: AtomicU32::new(0),
            fail_resolve: AtomicBool::new(false),
            fetch_delay: Mutex::new(None),
            fetch_calls: Mutex::new(Vec::new()),
            list_calls: AtomicU32::new(0),
            resolve_calls: AtomicU32::new(0),
            reinit_calls: AtomicU32::new(0),
            purge_calls: AtomicU32::new(0),
            destroy_calls: AtomicU32::new(0),
        }
    }
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a channel with `count` historical events timestamped
    /// `base_ts + i` (newest first).
    pub fn with_channel(self, id: &str, last_activity_ms: i64, count: usize, base_ts: i64) -> Self {
        self.channels.lock().push(ChannelSummary {
            id: id.into(),
            name: Some(format!("#{id}")),
            last_activity_ms,
        });
        let events = (0..count)
            .rev()
            .map(|i| event(&format!("{id}-{i}"), id, "u1", base_ts + i as i64))
            .collect();
        self.history.lock().insert(id.into(), events);
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_calls.lock().len()
    }

    fn maybe_fail_fetch(&self) -> Result<()> {
        let remaining = self.fail_fetches.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_fetches.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::TransientSource("injected fetch failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SourceClient for FakeSource {
    async fn fetch_recent_events(&self, channel_id: &str, limit: usize) -> Result<Vec<SourceEvent>> {
        self.fetch_calls.lock().push((channel_id.to_owned(), limit));
        let delay = *self.fetch_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.maybe_fail_fetch()?;
        Ok(self
            .history
            .lock()
            .get(channel_id)
            .map(|h| h.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn resolve_identity(&self, identity: &str) -> Result<IdentityProfile> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_resolve.load(Ordering::SeqCst) {
            return Err(Error::TransientSource("injected resolve failure".into()));
        }
        let display_name = self
            .display_names
            .lock()
            .get(identity)
            .cloned()
            .unwrap_or_else(|| format!("name-of-{identity}"));
        Ok(IdentityProfile {
            id: identity.to_owned(),
            display_name,
            attributes: serde_json::Value::Null,
        })
    }

    async fn list_channels(&self) -> Result<Vec<ChannelSummary>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_fail_fetch()?;
        Ok(self.channels.lock().clone())
    }

    async fn connection_state(&self) -> Result<SourceConnectionState> {
        Ok(*self.state.lock())
    }

    async fn reinitialize(&self) -> Result<()> {
        self.reinit_calls.fetch_add(1, Ordering::SeqCst);
        self.reinit_script.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn purge_credentials(&self) -> Result<()> {
        self.purge_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn event(id: &str, channel_id: &str, sender_id: &str, timestamp_ms: i64) -> SourceEvent {
    SourceEvent {
        id: id.into(),
        channel_id: channel_id.into(),
        sender_id: sender_id.into(),
        channel_name: None,
        sender_name: None,
        payload: serde_json::json!({ "text": format!("message {id}") }),
        timestamp_ms,
    }
}
