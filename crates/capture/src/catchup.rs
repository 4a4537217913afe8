//! Catch-up scheduler: prefill, backfill and periodic refresh.
//!
//! Prefill grabs the newest event of the most recently active channels and
//! retries with exponential backoff until it succeeds, then hands over to
//! backfill exactly once. Backfill fetches a deeper window for the same
//! channels and retries the whole phase after a fixed delay. The refresh
//! loop runs on its own period with jitter and tops up channels whose
//! stored history looks thin.
//!
//! Each phase has its own single-flight guard. Cancellation only interrupts
//! the waits between attempts; an attempt in flight runs to completion.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use ct_domain::config::CatchupConfig;
use ct_domain::error::Result;
use ct_domain::source::SourceClient;
use ct_domain::trace::TraceEvent;

use crate::backoff::RetryPolicy;
use crate::clock::Clock;
use crate::identity::IdentityCache;
use crate::pipeline::{IngestOrigin, IngestionPipeline};
use crate::single_flight::SingleFlight;

const DELAY_HISTORY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Prefill,
    Backfill,
    Refresh,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prefill => "prefill",
            Self::Backfill => "backfill",
            Self::Refresh => "refresh",
        }
    }

    fn origin(self) -> IngestOrigin {
        match self {
            Self::Prefill => IngestOrigin::Prefill,
            Self::Backfill => IngestOrigin::Backfill,
            Self::Refresh => IngestOrigin::Refresh,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PhaseStatus {
    /// At least one run of the phase has succeeded.
    pub completed: bool,
    pub running: bool,
    /// Consecutive failed attempts of the current run.
    pub attempts: u32,
    pub successful_runs: u64,
    pub failed_attempts: u64,
    pub last_delay_ms: Option<u64>,
    pub last_success_ms: Option<i64>,
    pub last_error: Option<String>,
    pub events_fetched: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CatchupStatus {
    pub prefill: PhaseStatus,
    pub backfill: PhaseStatus,
    pub refresh: PhaseStatus,
    /// Channels chosen by the last successful prefill listing.
    pub channels: Vec<String>,
}

impl CatchupStatus {
    fn phase_mut(&mut self, phase: Phase) -> &mut PhaseStatus {
        match phase {
            Phase::Prefill => &mut self.prefill,
            Phase::Backfill => &mut self.backfill,
            Phase::Refresh => &mut self.refresh,
        }
    }
}

/// Deterministic fraction in [0, 1) spread by a Knuth multiplicative hash.
fn jitter_fraction(seed: u64) -> f64 {
    let hash = (seed as u32).wrapping_mul(2_654_435_761);
    f64::from(hash) / (f64::from(u32::MAX) + 1.0)
}

/// Refresh delay: `period` shifted by up to `±jitter`.
pub fn refresh_delay(period_ms: u64, jitter_ms: u64, seed: u64) -> Duration {
    let offset = (jitter_fraction(seed) * 2.0 - 1.0) * jitter_ms as f64;
    let ms = (period_ms as f64 + offset).max(1.0);
    Duration::from_millis(ms as u64)
}

/// Sleep for `delay` unless cancelled first. Returns `false` on cancel.
pub(crate) async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

pub struct CatchupScheduler {
    cfg: CatchupConfig,
    source: Arc<dyn SourceClient>,
    pipeline: Arc<IngestionPipeline>,
    identities: Arc<IdentityCache>,
    clock: Arc<dyn Clock>,
    prefill_guard: Arc<SingleFlight>,
    backfill_guard: Arc<SingleFlight>,
    refresh_guard: Arc<SingleFlight>,
    prefill_policy: Mutex<RetryPolicy>,
    prefill_delays: Mutex<Vec<Duration>>,
    backfill_starts: AtomicU64,
    status: Mutex<CatchupStatus>,
}

impl CatchupScheduler {
    pub fn new(
        cfg: CatchupConfig,
        source: Arc<dyn SourceClient>,
        pipeline: Arc<IngestionPipeline>,
        identities: Arc<IdentityCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let policy = RetryPolicy::new(cfg.prefill_base_delay_ms, cfg.prefill_max_delay_ms)
            .with_reset_after(cfg.prefill_attempt_reset);
        Self {
            cfg,
            source,
            pipeline,
            identities,
            clock,
            prefill_guard: SingleFlight::new(),
            backfill_guard: SingleFlight::new(),
            refresh_guard: SingleFlight::new(),
            prefill_policy: Mutex::new(policy),
            prefill_delays: Mutex::new(Vec::new()),
            backfill_starts: AtomicU64::new(0),
            status: Mutex::new(CatchupStatus::default()),
        }
    }

    pub fn status(&self) -> CatchupStatus {
        self.status.lock().clone()
    }

    /// Backoff delays scheduled by prefill, oldest first (bounded history).
    pub fn prefill_delays(&self) -> Vec<Duration> {
        self.prefill_delays.lock().clone()
    }

    /// How many times backfill was handed over to by a successful prefill.
    pub fn backfill_starts(&self) -> u64 {
        self.backfill_starts.load(Ordering::SeqCst)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Prefill
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Run prefill until it succeeds (or is cancelled), then backfill.
    /// Returns immediately if a prefill run is already in flight.
    pub async fn run_prefill(&self, cancel: &CancellationToken) {
        let Some(permit) = self.prefill_guard.try_acquire() else {
            tracing::debug!("prefill already in flight; skipping");
            return;
        };
        self.set_running(Phase::Prefill, true);
        let succeeded = self.prefill_until_success(cancel).await;
        self.set_running(Phase::Prefill, false);
        drop(permit);

        if succeeded {
            self.backfill_starts.fetch_add(1, Ordering::SeqCst);
            self.run_backfill(cancel).await;
        }
    }

    async fn prefill_until_success(&self, cancel: &CancellationToken) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            match self.prefill_once().await {
                Ok(events) => {
                    self.prefill_policy.lock().reset();
                    self.record_success(Phase::Prefill, events);
                    return true;
                }
                Err(e) => {
                    let (delay, attempt) = {
                        let mut policy = self.prefill_policy.lock();
                        (policy.record_failure(), policy.attempt())
                    };
                    {
                        let mut delays = self.prefill_delays.lock();
                        if delays.len() == DELAY_HISTORY {
                            delays.remove(0);
                        }
                        delays.push(delay);
                    }
                    self.record_failure(Phase::Prefill, attempt, delay, &e.to_string());
                    if !pause(cancel, delay).await {
                        return false;
                    }
                }
            }
        }
    }

    /// One prefill attempt: newest event of the top-N recently active
    /// channels. Any source failure fails the attempt.
    pub async fn prefill_once(&self) -> Result<usize> {
        let mut channels = self.source.list_channels().await?;
        channels.sort_by(|a, b| b.last_activity_ms.cmp(&a.last_activity_ms));
        channels.truncate(self.cfg.prefill_channels);
        let ids: Vec<String> = channels.into_iter().map(|c| c.id).collect();
        self.status.lock().channels = ids.clone();

        self.fetch_into_pipeline(Phase::Prefill, &ids, 1).await
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Backfill
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Run backfill until it succeeds, retrying the whole phase after the
    /// fixed retry delay.
    pub async fn run_backfill(&self, cancel: &CancellationToken) {
        let Some(_permit) = self.backfill_guard.try_acquire() else {
            tracing::debug!("backfill already in flight; skipping");
            return;
        };
        self.set_running(Phase::Backfill, true);
        let delay = Duration::from_millis(self.cfg.backfill_retry_ms);
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.backfill_once().await {
                Ok(events) => {
                    self.record_success(Phase::Backfill, events);
                    break;
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    self.record_failure(Phase::Backfill, attempt, delay, &e.to_string());
                    if !pause(cancel, delay).await {
                        break;
                    }
                }
            }
        }
        self.set_running(Phase::Backfill, false);
    }

    pub async fn backfill_once(&self) -> Result<usize> {
        let ids = self.status.lock().channels.clone();
        self.fetch_into_pipeline(Phase::Backfill, &ids, self.cfg.backfill_depth)
            .await
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Periodic refresh
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Loop until cancelled: wait one jittered period, then refresh.
    pub async fn run_refresh_loop(&self, cancel: &CancellationToken) {
        let mut round: u64 = 0;
        loop {
            round += 1;
            let seed = round ^ self.clock.now_ms() as u64;
            let delay = refresh_delay(self.cfg.refresh_period_ms, self.cfg.refresh_jitter_ms, seed);
            tracing::debug!(delay_ms = delay.as_millis() as u64, "next active-channel refresh scheduled");
            if !pause(cancel, delay).await {
                return;
            }
            self.refresh_now().await;
        }
    }

    /// A single guarded refresh run. Failures wait for the next period.
    pub async fn refresh_now(&self) {
        let Some(_permit) = self.refresh_guard.try_acquire() else {
            tracing::debug!("refresh already in flight; skipping");
            return;
        };
        self.set_running(Phase::Refresh, true);
        match self.refresh_once().await {
            Ok(events) => self.record_success(Phase::Refresh, events),
            Err(e) => {
                let next = Duration::from_millis(self.cfg.refresh_period_ms);
                self.record_failure(Phase::Refresh, 1, next, &e.to_string());
            }
        }
        self.set_running(Phase::Refresh, false);
    }

    /// Rank the top-K channels by stored volume over the trailing window
    /// and top up those below the event-count threshold.
    pub async fn refresh_once(&self) -> Result<usize> {
        let window = i64::try_from(self.cfg.refresh_window_ms).unwrap_or(i64::MAX);
        let since = self.clock.now_ms().saturating_sub(window);
        let storage = self.pipeline.storage();
        let ranked = storage.active_channels(since, self.cfg.refresh_top_k).await?;

        let mut thin = Vec::new();
        for activity in ranked {
            let stored = storage.event_count(&activity.channel_id).await?;
            if stored < self.cfg.refresh_min_events {
                tracing::debug!(
                    channel_id = %activity.channel_id,
                    stored,
                    threshold = self.cfg.refresh_min_events,
                    "channel below continuity threshold"
                );
                thin.push(activity.channel_id);
            }
        }

        self.fetch_into_pipeline(Phase::Refresh, &thin, self.cfg.refresh_fetch_limit)
            .await
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Shared
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn fetch_into_pipeline(&self, phase: Phase, channels: &[String], limit: usize) -> Result<usize> {
        let mut fetched = 0;
        for channel_id in channels {
            let events = self.source.fetch_recent_events(channel_id, limit).await?;
            for mut event in events {
                self.identities.fill_sender(self.source.as_ref(), &mut event).await;
                self.pipeline.ingest(&event, phase.origin()).await;
                fetched += 1;
            }
        }
        Ok(fetched)
    }

    fn set_running(&self, phase: Phase, running: bool) {
        self.status.lock().phase_mut(phase).running = running;
    }

    fn record_success(&self, phase: Phase, events: usize) {
        let now = self.clock.now_ms();
        let attempt = {
            let mut status = self.status.lock();
            let s = status.phase_mut(phase);
            let attempt = s.attempts + 1;
            s.completed = true;
            s.attempts = 0;
            s.successful_runs += 1;
            s.last_success_ms = Some(now);
            s.last_error = None;
            s.events_fetched += events as u64;
            attempt
        };
        tracing::info!(phase = phase.as_str(), events, attempt, "catch-up phase complete");
        TraceEvent::CatchupPhase {
            phase: phase.as_str().into(),
            outcome: "ok".into(),
            attempt,
            events,
            delay_ms: None,
        }
        .emit();
    }

    fn record_failure(&self, phase: Phase, attempt: u32, delay: Duration, error: &str) {
        let delay_ms = delay.as_millis() as u64;
        {
            let mut status = self.status.lock();
            let s = status.phase_mut(phase);
            s.attempts = attempt;
            s.failed_attempts += 1;
            s.last_delay_ms = Some(delay_ms);
            s.last_error = Some(error.to_owned());
        }
        tracing::warn!(phase = phase.as_str(), attempt, delay_ms, error, "catch-up phase failed; rescheduling");
        TraceEvent::CatchupPhase {
            phase: phase.as_str().into(),
            outcome: "retry".into(),
            attempt,
            events: 0,
            delay_ms: Some(delay_ms),
        }
        .emit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::testkit::{event, FakeSource, MemoryStorage};
    use crate::watermark::Watermark;
    use ct_domain::storage::Storage;

    const DAY: i64 = 24 * 60 * 60 * 1000;

    async fn scheduler(
        source: FakeSource,
    ) -> (Arc<FakeSource>, Arc<MemoryStorage>, Arc<ManualClock>, CatchupScheduler) {
        let source = Arc::new(source);
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::new(30 * DAY));
        let wm = Arc::new(Watermark::load(storage.clone()).await.unwrap());
        let pipeline = Arc::new(IngestionPipeline::new(storage.clone(), wm, clock.clone()));
        let identities = Arc::new(IdentityCache::new(DAY, 0, clock.clone()));
        let cfg = CatchupConfig {
            prefill_channels: 2,
            backfill_depth: 5,
            refresh_min_events: 4,
            refresh_fetch_limit: 10,
            ..CatchupConfig::default()
        };
        let sched = CatchupScheduler::new(cfg, source.clone(), pipeline, identities, clock.clone());
        (source, storage, clock, sched)
    }

    #[test]
    fn refresh_delay_stays_within_jitter() {
        for seed in 0..500 {
            let d = refresh_delay(86_400_000, 3_600_000, seed).as_millis() as u64;
            assert!((82_800_000..=90_000_000).contains(&d), "seed {seed}: {d}");
        }
    }

    #[test]
    fn refresh_delay_never_zero() {
        assert!(refresh_delay(0, 0, 7) >= Duration::from_millis(1));
    }

    #[tokio::test]
    async fn prefill_takes_newest_event_of_most_active_channels() {
        let source = FakeSource::new()
            .with_channel("quiet", 100, 5, 1_000)
            .with_channel("busy", 900, 5, 2_000)
            .with_channel("mid", 500, 5, 3_000);
        let (source, storage, _clock, sched) = scheduler(source).await;

        assert_eq!(sched.prefill_once().await.unwrap(), 2);
        assert_eq!(storage.event_ids(), ["busy-4", "mid-4"]);
        assert_eq!(sched.status().channels, ["busy", "mid"]);
        assert!(source.fetch_calls.lock().iter().all(|(_, limit)| *limit == 1));
    }

    #[tokio::test]
    async fn backfill_overlaps_prefill_without_duplicates() {
        let source = FakeSource::new().with_channel("c1", 10, 8, 0);
        let (_source, storage, _clock, sched) = scheduler(source).await;

        sched.prefill_once().await.unwrap();
        assert_eq!(sched.backfill_once().await.unwrap(), 5);
        assert_eq!(storage.events.lock().len(), 5);
    }

    #[tokio::test]
    async fn catchup_events_carry_resolved_sender_names() {
        let source = FakeSource::new().with_channel("c1", 10, 1, 0);
        source.display_names.lock().insert("u1".into(), "Ada".into());
        let (_source, storage, _clock, sched) = scheduler(source).await;

        sched.prefill_once().await.unwrap();
        assert_eq!(
            storage.identities.lock()["u1"].display_name.as_deref(),
            Some("Ada")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn backfill_retries_after_fixed_delay() {
        let source = FakeSource::new().with_channel("c1", 10, 3, 0);
        let (source, _storage, _clock, sched) = scheduler(source).await;
        sched.prefill_once().await.unwrap();

        source.fail_fetches.store(3, Ordering::SeqCst);
        sched.run_backfill(&CancellationToken::new()).await;

        let status = sched.status();
        assert!(status.backfill.completed);
        assert_eq!(status.backfill.failed_attempts, 3);
        assert_eq!(status.backfill.last_delay_ms, Some(30_000));
    }

    #[tokio::test]
    async fn refresh_tops_up_thin_channels_only() {
        let source = FakeSource::new()
            .with_channel("thin", 0, 20, 30 * DAY - 1_000)
            .with_channel("thick", 0, 20, 30 * DAY - 1_000);
        let (source, storage, _clock, sched) = scheduler(source).await;

        for i in 0..2 {
            let ev = event(&format!("t{i}"), "thin", "u1", 30 * DAY - 10);
            sched.pipeline.ingest(&ev, IngestOrigin::Live).await;
        }
        for i in 0..6 {
            let ev = event(&format!("k{i}"), "thick", "u1", 30 * DAY - 10);
            sched.pipeline.ingest(&ev, IngestOrigin::Live).await;
        }

        assert_eq!(sched.refresh_once().await.unwrap(), 10);
        assert_eq!(source.fetch_calls.lock().as_slice(), [("thin".to_owned(), 10)]);
        assert_eq!(storage.event_count("thin").await.unwrap(), 12);
    }

    #[tokio::test]
    async fn refresh_ignores_channels_outside_window() {
        let source = FakeSource::new().with_channel("old", 0, 5, 0);
        let (source, _storage, _clock, sched) = scheduler(source).await;
        sched
            .pipeline
            .ingest(&event("o1", "old", "u1", DAY), IngestOrigin::Live)
            .await;

        assert_eq!(sched.refresh_once().await.unwrap(), 0);
        assert_eq!(source.fetch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_prefill_retries() {
        let source = FakeSource::new().with_channel("c1", 10, 1, 0);
        source.fail_fetches.store(u32::MAX, Ordering::SeqCst);
        let (_source, _storage, _clock, sched) = scheduler(source).await;
        let sched = Arc::new(sched);
        let cancel = CancellationToken::new();

        let task = {
            let sched = sched.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { sched.run_prefill(&cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(100)).await;
        cancel.cancel();
        task.await.unwrap();

        assert!(!sched.status().prefill.completed);
        assert_eq!(sched.backfill_starts(), 0);
        assert!(!sched.prefill_guard.in_flight());
    }
}
