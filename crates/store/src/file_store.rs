//! File-backed [`Storage`] implementation.
//!
//! Events and session records are append-only JSONL files with an
//! in-memory id index rebuilt on open, so dedupe survives restarts.
//! Dimension records (channels, identities) live in memory and are written
//! to `dimensions.json` by [`FileStore::flush_if_dirty`]; the watermark is
//! written atomically on every update.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use ct_domain::error::{Error, Result};
use ct_domain::storage::{
    ChannelActivity, ChannelRecord, IdentityRecord, IngestRecord, InsertOutcome, RawEnvelope,
    SessionRecord, Storage,
};

use crate::fsutil;
use crate::raw_log::RawLog;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Dimensions {
    #[serde(default)]
    channels: HashMap<String, ChannelRecord>,
    #[serde(default)]
    identities: HashMap<String, IdentityRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WatermarkFile {
    watermark_ms: i64,
}

#[derive(Default)]
struct Index {
    event_ids: HashSet<String>,
    /// channel id → event timestamps, for counts and activity ranking.
    channel_events: HashMap<String, Vec<i64>>,
    session_ids: HashSet<String>,
    watermark: Option<i64>,
}

pub struct FileStore {
    root: PathBuf,
    raw: RawLog,
    dims: RwLock<Dimensions>,
    dims_dirty: AtomicBool,
    index: RwLock<Index>,
    /// Held across check-and-append so two inserts of one id cannot both land.
    events_lock: tokio::sync::Mutex<()>,
    sessions_lock: tokio::sync::Mutex<()>,
    watermark_lock: tokio::sync::Mutex<()>,
}

impl FileStore {
    /// Load or create the store rooted at `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let raw = RawLog::open(&data_dir.join("raw"))?;

        let mut index = Index::default();
        for record in fsutil::read_jsonl::<IngestRecord>(&data_dir.join("events.jsonl"))? {
            if index.event_ids.insert(record.id) {
                index
                    .channel_events
                    .entry(record.channel_id)
                    .or_default()
                    .push(record.timestamp_ms);
            }
        }
        for record in fsutil::read_jsonl::<SessionRecord>(&data_dir.join("sessions.jsonl"))? {
            index.session_ids.insert(record.session_id);
        }

        let wm_path = data_dir.join("watermark.json");
        if wm_path.exists() {
            let raw = std::fs::read_to_string(&wm_path)?;
            match serde_json::from_str::<WatermarkFile>(&raw) {
                Ok(wm) => index.watermark = Some(wm.watermark_ms),
                Err(e) => {
                    tracing::warn!(
                        path = %wm_path.display(),
                        error = %e,
                        "unreadable watermark file, starting from none"
                    );
                }
            }
        }

        let dims_path = data_dir.join("dimensions.json");
        let dims: Dimensions = if dims_path.exists() {
            let raw = std::fs::read_to_string(&dims_path)?;
            match serde_json::from_str(&raw) {
                Ok(dims) => dims,
                Err(e) => {
                    // Keep the unreadable copy; the next flush rewrites the original path.
                    let aside = data_dir.join("dimensions.json.corrupt");
                    std::fs::rename(&dims_path, &aside)?;
                    tracing::warn!(
                        path = %dims_path.display(),
                        moved_to = %aside.display(),
                        error = %e,
                        "unreadable dimensions file set aside, starting empty"
                    );
                    Dimensions::default()
                }
            }
        } else {
            Dimensions::default()
        };

        tracing::info!(
            events = index.event_ids.len(),
            sessions = index.session_ids.len(),
            channels = dims.channels.len(),
            identities = dims.identities.len(),
            watermark = ?index.watermark,
            path = %data_dir.display(),
            "file store loaded"
        );

        Ok(Self {
            root: data_dir.to_path_buf(),
            raw,
            dims: RwLock::new(dims),
            dims_dirty: AtomicBool::new(false),
            index: RwLock::new(index),
            events_lock: tokio::sync::Mutex::new(()),
            sessions_lock: tokio::sync::Mutex::new(()),
            watermark_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn raw_log(&self) -> &RawLog {
        &self.raw
    }

    /// Write `dimensions.json` if any channel or identity changed since the
    /// last flush.
    pub async fn flush_if_dirty(&self) -> Result<()> {
        if !self.dims_dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let bytes = {
            let dims = self.dims.read();
            serde_json::to_vec_pretty(&*dims)?
        };
        if let Err(e) = fsutil::write_atomic(self.root.join("dimensions.json"), bytes).await {
            self.dims_dirty.store(true, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    pub fn channel(&self, id: &str) -> Option<ChannelRecord> {
        self.dims.read().channels.get(id).cloned()
    }

    pub fn identity(&self, id: &str) -> Option<IdentityRecord> {
        self.dims.read().identities.get(id).cloned()
    }

    pub fn total_events(&self) -> usize {
        self.index.read().event_ids.len()
    }
}

#[async_trait]
impl Storage for FileStore {
    async fn append_raw(&self, envelope: &RawEnvelope) -> Result<()> {
        self.raw
            .append(envelope)
            .await
            .map_err(|e| Error::storage_write("append_raw", &envelope.id, e))
    }

    async fn upsert_channel(&self, channel: &ChannelRecord) -> Result<bool> {
        let changed = {
            let mut dims = self.dims.write();
            match dims.channels.get_mut(&channel.id) {
                Some(existing) => existing.merge_from(channel),
                None => {
                    dims.channels.insert(channel.id.clone(), channel.clone());
                    true
                }
            }
        };
        if changed {
            self.dims_dirty.store(true, Ordering::SeqCst);
        }
        Ok(changed)
    }

    async fn upsert_identity(&self, identity: &IdentityRecord) -> Result<bool> {
        let changed = {
            let mut dims = self.dims.write();
            match dims.identities.get_mut(&identity.id) {
                Some(existing) => existing.merge_from(identity),
                None => {
                    dims.identities.insert(identity.id.clone(), identity.clone());
                    true
                }
            }
        };
        if changed {
            self.dims_dirty.store(true, Ordering::SeqCst);
        }
        Ok(changed)
    }

    async fn insert_event(&self, record: &IngestRecord) -> Result<InsertOutcome> {
        let _guard = self.events_lock.lock().await;
        if self.index.read().event_ids.contains(&record.id) {
            return Ok(InsertOutcome::Duplicate);
        }

        let buf = fsutil::to_jsonl(std::slice::from_ref(record))?;
        fsutil::append(self.root.join("events.jsonl"), buf)
            .await
            .map_err(|e| Error::storage_write("insert_event", &record.id, e))?;

        let mut index = self.index.write();
        index.event_ids.insert(record.id.clone());
        index
            .channel_events
            .entry(record.channel_id.clone())
            .or_default()
            .push(record.timestamp_ms);
        Ok(InsertOutcome::Inserted)
    }

    async fn insert_session_record(&self, record: &SessionRecord) -> Result<InsertOutcome> {
        let _guard = self.sessions_lock.lock().await;
        if self.index.read().session_ids.contains(&record.session_id) {
            return Ok(InsertOutcome::Duplicate);
        }

        let buf = fsutil::to_jsonl(std::slice::from_ref(record))?;
        fsutil::append(self.root.join("sessions.jsonl"), buf)
            .await
            .map_err(|e| Error::storage_write("insert_session_record", &record.session_id, e))?;

        self.index.write().session_ids.insert(record.session_id.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn event_count(&self, channel_id: &str) -> Result<u64> {
        let index = self.index.read();
        Ok(index
            .channel_events
            .get(channel_id)
            .map_or(0, |ts| ts.len() as u64))
    }

    async fn active_channels(&self, since_ms: i64, limit: usize) -> Result<Vec<ChannelActivity>> {
        let mut ranked: Vec<ChannelActivity> = {
            let index = self.index.read();
            index
                .channel_events
                .iter()
                .map(|(channel_id, stamps)| ChannelActivity {
                    channel_id: channel_id.clone(),
                    event_count: stamps.iter().filter(|&&ts| ts >= since_ms).count() as u64,
                })
                .filter(|a| a.event_count > 0)
                .collect()
        };
        ranked.sort_by(|a, b| {
            b.event_count
                .cmp(&a.event_count)
                .then_with(|| a.channel_id.cmp(&b.channel_id))
        });
        ranked.truncate(limit);
        Ok(ranked)
    }

    async fn watermark(&self) -> Result<Option<i64>> {
        Ok(self.index.read().watermark)
    }

    async fn set_watermark(&self, value: i64) -> Result<()> {
        let _guard = self.watermark_lock.lock().await;
        let bytes = serde_json::to_vec(&WatermarkFile { watermark_ms: value })?;
        fsutil::write_atomic(self.root.join("watermark.json"), bytes)
            .await
            .map_err(|e| Error::storage_write("set_watermark", &value.to_string(), e))?;
        self.index.write().watermark = Some(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, channel: &str, ts: i64) -> IngestRecord {
        IngestRecord {
            id: id.into(),
            channel_id: channel.into(),
            sender_id: "u1".into(),
            payload: serde_json::json!({ "text": id }),
            timestamp_ms: ts,
        }
    }

    #[tokio::test]
    async fn duplicate_event_is_a_silent_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        assert_eq!(
            store.insert_event(&event("e1", "c1", 10)).await.unwrap(),
            InsertOutcome::Inserted
        );
        for _ in 0..3 {
            assert_eq!(
                store.insert_event(&event("e1", "c1", 10)).await.unwrap(),
                InsertOutcome::Duplicate
            );
        }
        assert_eq!(store.event_count("c1").await.unwrap(), 1);
        assert_eq!(store.total_events(), 1);
    }

    #[tokio::test]
    async fn dedupe_index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.insert_event(&event("e1", "c1", 10)).await.unwrap();
            store.set_watermark(10).await.unwrap();
        }

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(
            store.insert_event(&event("e1", "c1", 10)).await.unwrap(),
            InsertOutcome::Duplicate
        );
        assert_eq!(store.watermark().await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn concurrent_inserts_of_one_id_store_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(FileStore::open(dir.path()).unwrap());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.insert_event(&event("same", "c1", 5)).await.unwrap()
            }));
        }
        let mut inserted = 0;
        for h in handles {
            if h.await.unwrap() == InsertOutcome::Inserted {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        assert_eq!(store.event_count("c1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn active_channels_ranked_by_recent_volume() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        store.insert_event(&event("a1", "a", 100)).await.unwrap();
        store.insert_event(&event("b1", "b", 100)).await.unwrap();
        store.insert_event(&event("b2", "b", 200)).await.unwrap();
        store.insert_event(&event("c1", "c", 1)).await.unwrap();

        let active = store.active_channels(50, 10).await.unwrap();
        let ids: Vec<_> = active.iter().map(|a| a.channel_id.as_str()).collect();
        assert_eq!(ids, ["b", "a"]);
        assert_eq!(active[0].event_count, 2);

        let top1 = store.active_channels(0, 1).await.unwrap();
        assert_eq!(top1.len(), 1);
        assert_eq!(top1[0].channel_id, "b");
    }

    #[tokio::test]
    async fn channel_upsert_merges_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let first = ChannelRecord {
            id: "c1".into(),
            name: Some("general".into()),
            last_event_ms: Some(10),
        };
        assert!(store.upsert_channel(&first).await.unwrap());
        assert!(!store.upsert_channel(&first).await.unwrap());

        let partial = ChannelRecord {
            id: "c1".into(),
            name: None,
            last_event_ms: Some(20),
        };
        assert!(store.upsert_channel(&partial).await.unwrap());
        let stored = store.channel("c1").unwrap();
        assert_eq!(stored.name.as_deref(), Some("general"));
        assert_eq!(stored.last_event_ms, Some(20));

        store.flush_if_dirty().await.unwrap();
        drop(store);

        let reopened = FileStore::open(dir.path()).unwrap();
        assert_eq!(reopened.channel("c1").unwrap().last_event_ms, Some(20));
    }

    #[tokio::test]
    async fn corrupt_dimensions_are_set_aside_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let ada = IdentityRecord {
            id: "u1".into(),
            display_name: Some("Ada".into()),
            attributes: None,
        };
        store.upsert_identity(&ada).await.unwrap();
        store.flush_if_dirty().await.unwrap();
        drop(store);

        let dims_path = dir.path().join("dimensions.json");
        let mut bytes = std::fs::read(&dims_path).unwrap();
        bytes.push(b'}');
        std::fs::write(&dims_path, &bytes).unwrap();

        let reopened = FileStore::open(dir.path()).unwrap();
        assert!(reopened.identity("u1").is_none());
        let aside = dir.path().join("dimensions.json.corrupt");
        assert_eq!(std::fs::read(&aside).unwrap(), bytes);

        let channel = ChannelRecord {
            id: "c1".into(),
            name: None,
            last_event_ms: Some(5),
        };
        reopened.upsert_channel(&channel).await.unwrap();
        reopened.flush_if_dirty().await.unwrap();

        // The damaged copy still holds the identity after the rewrite.
        assert_eq!(std::fs::read(&aside).unwrap(), bytes);
        drop(reopened);
        assert!(FileStore::open(dir.path()).unwrap().channel("c1").is_some());
    }

    #[tokio::test]
    async fn session_records_are_idempotent() {
        use ct_domain::source::{MediaFlags, SessionStatus};

        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let record = SessionRecord {
            session_id: "s1".into(),
            channel_id: "c1".into(),
            initiator_id: "u1".into(),
            counterpart_id: None,
            media: MediaFlags::default(),
            status: SessionStatus::Ended,
            started_at_ms: 0,
            ended_at_ms: Some(5_000),
            duration_ms: Some(5_000),
        };
        assert_eq!(
            store.insert_session_record(&record).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert_session_record(&record).await.unwrap(),
            InsertOutcome::Duplicate
        );
    }
}
