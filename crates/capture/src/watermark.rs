//! Continuity watermark: the latest durably-processed event timestamp.
//!
//! In-memory progress is authoritative for this process; the persisted copy
//! is a best-effort resumption hint and a failed flush never blocks
//! ingestion.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use ct_domain::error::Result;
use ct_domain::storage::Storage;

pub struct Watermark {
    value: AtomicI64,
    persisted: AtomicI64,
    flush_failures: AtomicU64,
    /// Serializes flushes so a slower, older write cannot land last.
    flush_lock: tokio::sync::Mutex<()>,
    storage: Arc<dyn Storage>,
}

impl Watermark {
    /// Load the persisted value, defaulting to 0.
    pub async fn load(storage: Arc<dyn Storage>) -> Result<Self> {
        let initial = storage.watermark().await?.unwrap_or(0);
        tracing::info!(watermark_ms = initial, "watermark loaded");
        Ok(Self {
            value: AtomicI64::new(initial),
            persisted: AtomicI64::new(initial),
            flush_failures: AtomicU64::new(0),
            flush_lock: tokio::sync::Mutex::new(()),
            storage,
        })
    }

    pub fn value(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    pub fn flush_failures(&self) -> u64 {
        self.flush_failures.load(Ordering::Relaxed)
    }

    /// Raise the watermark to `max(current, ts)` and flush it.
    /// Returns whether the in-memory value moved.
    pub async fn advance(&self, ts: i64) -> bool {
        let prev = self.value.fetch_max(ts, Ordering::SeqCst);
        if ts <= prev {
            return false;
        }
        self.flush().await;
        true
    }

    async fn flush(&self) {
        let _guard = self.flush_lock.lock().await;
        let current = self.value();
        if current <= self.persisted.load(Ordering::SeqCst) {
            return;
        }
        match self.storage.set_watermark(current).await {
            Ok(()) => self.persisted.store(current, Ordering::SeqCst),
            Err(e) => {
                self.flush_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    watermark_ms = current,
                    error = %e,
                    "watermark flush failed; continuing with in-memory value"
                );
            }
        }
    }

    /// Gap between `now_ms` and the watermark when it exceeds `threshold_ms`.
    pub fn stall_gap(&self, now_ms: i64, threshold_ms: i64) -> Option<i64> {
        let gap = now_ms.saturating_sub(self.value());
        (gap > threshold_ms).then_some(gap)
    }
}
