//! Append-only raw event log.
//!
//! Every event is written here before any other processing. Nothing reads
//! it on the hot path; it exists so a degraded structured store never
//! loses data.

use std::path::{Path, PathBuf};

use ct_domain::error::Result;
use ct_domain::storage::RawEnvelope;

use crate::fsutil;

pub struct RawLog {
    path: PathBuf,
    /// Appends are serialized so concurrent lines never interleave.
    write_lock: tokio::sync::Mutex<()>,
}

impl RawLog {
    /// Open (creating the directory if needed) the log at `dir/events.jsonl`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join("events.jsonl"),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub async fn append(&self, envelope: &RawEnvelope) -> Result<()> {
        let buf = fsutil::to_jsonl(std::slice::from_ref(envelope))?;
        let _guard = self.write_lock.lock().await;
        fsutil::append(self.path.clone(), buf).await
    }

    /// Read the whole log back. Intended for audits and tests.
    pub async fn read_all(&self) -> Result<Vec<RawEnvelope>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || fsutil::read_jsonl(&path))
            .await
            .map_err(|e| ct_domain::error::Error::Other(format!("spawn_blocking join: {e}")))?
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
