//! Capture orchestrator.
//!
//! Built once per process. Owns the lifecycle machine and every piece of
//! mutable capture state, and runs the background tasks: notification
//! pump, heartbeat, stall check, refresh loop, reconnect driver and the
//! catch-up phases triggered by each (re)connection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use ct_domain::config::Config;
use ct_domain::error::{Error, Result};
use ct_domain::source::{SourceClient, SourceConnectionState, SourceEvent, SourceNotification};
use ct_domain::storage::{IdentityRecord, Storage};
use ct_domain::trace::TraceEvent;

use crate::backoff::RetryPolicy;
use crate::catchup::{pause, CatchupScheduler};
use crate::clock::Clock;
use crate::correlator::SessionCorrelator;
use crate::heartbeat::{HeartbeatPolicy, ProbeResult, ProbeVerdict};
use crate::identity::IdentityCache;
use crate::lifecycle::{ConnectionContext, ConnectionState, LifecycleMachine, Transition, Trigger};
use crate::pipeline::{IngestOrigin, IngestionPipeline};
use crate::single_flight::SingleFlight;
use crate::source_gate::SerializedSource;
use crate::status::{is_healthy, StatusSnapshot, TransitionRecord};
use crate::watermark::Watermark;

pub struct CaptureOrchestrator {
    clock: Arc<dyn Clock>,
    source: Arc<SerializedSource>,
    lifecycle: Mutex<LifecycleMachine>,
    state_tx: watch::Sender<ConnectionState>,
    history: Mutex<VecDeque<TransitionRecord>>,
    heartbeat: HeartbeatPolicy,
    stall_check_interval: Duration,
    stall_threshold_ms: i64,
    max_event_age_ms: i64,
    pipeline: Arc<IngestionPipeline>,
    identities: Arc<IdentityCache>,
    sessions: SessionCorrelator,
    catchup: Arc<CatchupScheduler>,
    reconnect_guard: Arc<SingleFlight>,
    purge_pending: AtomicBool,
    stall_warnings: AtomicU64,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

const TRANSITION_HISTORY: usize = 32;

fn millis(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

/// Trigger for a failed (re)initialization attempt from `state`.
fn failure_trigger(state: ConnectionState, reason: String) -> Trigger {
    match state {
        ConnectionState::Starting => Trigger::InitFailed { reason },
        _ => Trigger::ReconnectFailed { reason },
    }
}

impl CaptureOrchestrator {
    /// Load the watermark and assemble the components. Fails only when the
    /// persisted watermark cannot be read.
    pub async fn new(
        config: &Config,
        source: Arc<dyn SourceClient>,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        let watermark = Arc::new(Watermark::load(storage.clone()).await?);
        let pipeline = Arc::new(IngestionPipeline::new(storage, watermark, clock.clone()));
        let source = Arc::new(SerializedSource::new(source));
        let identities = Arc::new(IdentityCache::from_config(&config.identity, clock.clone()));
        let catchup = Arc::new(CatchupScheduler::new(
            config.catchup.clone(),
            source.clone(),
            pipeline.clone(),
            identities.clone(),
            clock.clone(),
        ));

        let policy = RetryPolicy::new(config.connection.base_delay_ms, config.connection.max_delay_ms);
        let machine = LifecycleMachine::new(policy, config.connection.auth_reset_threshold, clock.now_ms());
        let (state_tx, _) = watch::channel(machine.state());

        Ok(Arc::new(Self {
            clock,
            source,
            lifecycle: Mutex::new(machine),
            state_tx,
            history: Mutex::new(VecDeque::with_capacity(TRANSITION_HISTORY)),
            heartbeat: HeartbeatPolicy::from_config(&config.heartbeat),
            stall_check_interval: Duration::from_millis(config.watermark.stall_check_interval_ms.max(1)),
            stall_threshold_ms: millis(config.watermark.stall_threshold_ms),
            max_event_age_ms: millis(config.health.max_event_age_ms),
            sessions: SessionCorrelator::new(pipeline.clone()),
            pipeline,
            identities,
            catchup,
            reconnect_guard: SingleFlight::new(),
            purge_pending: AtomicBool::new(false),
            stall_warnings: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }))
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Accessors
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.lock().state()
    }

    pub fn context(&self) -> ConnectionContext {
        self.lifecycle.lock().context().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn pipeline(&self) -> &Arc<IngestionPipeline> {
        &self.pipeline
    }

    pub fn catchup(&self) -> &Arc<CatchupScheduler> {
        &self.catchup
    }

    pub fn sessions(&self) -> &SessionCorrelator {
        &self.sessions
    }

    pub fn recent_transitions(&self) -> Vec<TransitionRecord> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn is_healthy(&self) -> bool {
        let ctx = self.context();
        is_healthy(
            ctx.state,
            self.pipeline.stats().last_event_ms,
            ctx.last_ready_ms,
            self.clock.now_ms(),
            self.max_event_age_ms,
        )
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let ctx = self.context();
        let ingest = self.pipeline.stats();
        let now = self.clock.now_ms();
        let watermark = self.pipeline.watermark();
        StatusSnapshot {
            healthy: is_healthy(ctx.state, ingest.last_event_ms, ctx.last_ready_ms, now, self.max_event_age_ms),
            state: ctx.state,
            state_since_ms: ctx.state_since_ms,
            retry_count: ctx.retry_count,
            restart_count: ctx.restart_count,
            ever_connected: ctx.ever_connected,
            ever_authenticated: ctx.ever_authenticated,
            last_authenticated_ms: ctx.last_authenticated_ms,
            last_ready_ms: ctx.last_ready_ms,
            last_event_ms: ingest.last_event_ms,
            last_write_ms: ingest.last_write_ms,
            watermark_ms: watermark.value(),
            watermark_flush_failures: watermark.flush_failures(),
            stall_warnings: self.stall_warnings.load(Ordering::Relaxed),
            active_sessions: self.sessions.active(),
            catchup: self.catchup.status(),
            recent_transitions: self.recent_transitions(),
            ingest,
            identity_cache: self.identities.stats(),
            detail: ctx.last_error,
            generated_at_ms: now,
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Startup / shutdown
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Spawn the background tasks, then make the first connection attempt.
    /// Returns once the first attempt has settled; failures hand over to
    /// the reconnect path rather than erroring.
    pub async fn start(self: &Arc<Self>, notifications: mpsc::Receiver<SourceNotification>) {
        let this = Arc::clone(self);
        self.tracker.spawn(async move { this.pump_notifications(notifications).await });

        let this = Arc::clone(self);
        let expiry = self.source.watch_auth_expiry();
        self.tracker.spawn(async move { this.escalate_on_expiry(expiry).await });

        let this = Arc::clone(self);
        self.tracker.spawn(async move { this.heartbeat_loop().await });

        let this = Arc::clone(self);
        self.tracker.spawn(async move { this.stall_loop().await });

        let this = Arc::clone(self);
        self.tracker.spawn(async move { this.catchup.run_refresh_loop(&this.cancel).await });

        self.connect_initial().await;
    }

    /// Stop scheduling new work, wait for in-flight work to finish, then
    /// tear down the source client.
    pub async fn shutdown(self: &Arc<Self>) {
        self.apply(Trigger::Shutdown);
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        if let Err(e) = self.source.destroy().await {
            tracing::warn!(error = %e, "source destroy failed");
        }
        tracing::info!(
            watermark_ms = self.pipeline.watermark().value(),
            active_sessions = self.sessions.active(),
            "capture stopped"
        );
    }

    async fn connect_initial(self: &Arc<Self>) {
        let mut result = self.reinitialize().await;
        if let Err(e) = &result {
            if !e.is_auth_expired() {
                tracing::warn!(error = %e, "initial connect failed; retrying once immediately");
                result = self.reinitialize().await;
            }
        }
        match result {
            Ok(()) => self.settle(ConnectionState::Starting).await,
            Err(e) => self.route_failure(ConnectionState::Starting, e),
        }
    }

    async fn reinitialize(&self) -> Result<()> {
        self.lifecycle.lock().record_restart();
        self.source.reinitialize().await
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Transitions
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Apply `trigger` to the lifecycle and run the side effects of the
    /// resulting transition. Triggers invalid in the current state are
    /// ignored.
    pub fn apply(self: &Arc<Self>, trigger: Trigger) -> Option<Transition> {
        let now = self.clock.now_ms();
        let (transition, state) = {
            let mut machine = self.lifecycle.lock();
            let t = machine.apply(&trigger, now);
            (t, machine.state())
        };

        let Some(t) = transition else {
            tracing::debug!(state = %state, trigger = trigger.name(), "trigger ignored in current state");
            return None;
        };

        {
            let mut history = self.history.lock();
            if history.len() == TRANSITION_HISTORY {
                history.pop_front();
            }
            history.push_back(TransitionRecord {
                from: t.from,
                to: t.to,
                trigger: t.trigger,
                retry_count: t.retry_count,
                at_ms: now,
            });
        }
        self.state_tx.send_replace(t.to);
        tracing::info!(
            from = %t.from,
            to = %t.to,
            trigger = t.trigger,
            retry_count = t.retry_count,
            escalated = t.escalated,
            "lifecycle transition"
        );
        TraceEvent::LifecycleTransition {
            from: t.from.as_str().into(),
            to: t.to.as_str().into(),
            trigger: t.trigger.into(),
            retry_count: t.retry_count,
        }
        .emit();

        if t.escalated {
            self.purge_pending.store(true, Ordering::SeqCst);
        }

        if t.to == ConnectionState::Connected && t.from != ConnectionState::Connected {
            let this = Arc::clone(self);
            self.tracker.spawn(async move { this.catchup.run_prefill(&this.cancel).await });
        }

        if t.to.wants_reinitialize() && (t.from != t.to || t.escalated) {
            let this = Arc::clone(self);
            self.tracker.spawn(async move { this.drive_reconnect().await });
        }

        Some(t)
    }

    fn route_failure(self: &Arc<Self>, state: ConnectionState, error: Error) {
        tracing::warn!(state = %state, error = %error, "connection attempt failed");
        if error.is_auth_expired() {
            // A no-op when the expiry watcher already escalated.
            self.apply(Trigger::AuthExpired {
                reason: error.to_string(),
            });
            return;
        }
        self.apply(failure_trigger(state, error.to_string()));
    }

    /// After a successful `reinitialize()`, decide what the source is doing.
    async fn settle(self: &Arc<Self>, before: ConnectionState) {
        let probe = self.source.probe(self.heartbeat.probe_timeout).await;
        let trigger = match probe {
            ProbeResult::State(SourceConnectionState::Connected) => {
                if before == ConnectionState::Starting {
                    Trigger::Ready
                } else {
                    Trigger::ReconnectSucceeded
                }
            }
            ProbeResult::State(SourceConnectionState::AwaitingAuthentication) => Trigger::AuthChallenge,
            other => {
                // Give notifications a chance to move the state first.
                if self.wait_for_change(before, self.heartbeat.probe_timeout).await {
                    return;
                }
                failure_trigger(before, format!("source not ready after reinitialize: {other:?}"))
            }
        };

        if self.apply(trigger).is_none() && self.state() == before {
            self.apply(failure_trigger(
                before,
                "reinitialized source did not reach a usable state".into(),
            ));
        }
    }

    async fn wait_for_change(&self, from: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.state_tx.subscribe();
        let changed = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| *s != from)).await,
            Ok(Ok(_))
        );
        changed
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Reconnect driver
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn drive_reconnect(self: Arc<Self>) {
        loop {
            let Some(permit) = self.reconnect_guard.try_acquire() else {
                return;
            };
            self.reconnect_rounds().await;
            drop(permit);
            // A transition may have asked for a driver while this one was
            // on its way out.
            if self.cancel.is_cancelled() || !self.state().wants_reinitialize() {
                return;
            }
        }
    }

    async fn reconnect_rounds(self: &Arc<Self>) {
        loop {
            let (state, retry_count, delay) = {
                let machine = self.lifecycle.lock();
                (machine.state(), machine.context().retry_count, machine.reconnect_delay())
            };
            if self.cancel.is_cancelled() || !state.wants_reinitialize() {
                return;
            }

            let delay_ms = delay.as_millis() as u64;
            tracing::info!(state = %state, attempt = retry_count, delay_ms, "reconnect scheduled");
            TraceEvent::ReconnectScheduled {
                attempt: retry_count,
                delay_ms,
            }
            .emit();
            if !pause(&self.cancel, delay).await {
                return;
            }

            if self.purge_pending.swap(false, Ordering::SeqCst) {
                self.purge_credentials().await;
            }

            let before = self.state();
            if !before.wants_reinitialize() {
                return;
            }
            match self.reinitialize().await {
                Ok(()) => self.settle(before).await,
                Err(e) => self.route_failure(before, e),
            }
        }
    }

    async fn purge_credentials(&self) {
        let ctx = self.context();
        let reason = ctx.last_error.clone().unwrap_or_else(|| "escalation".into());
        match self.source.purge_credentials().await {
            Ok(()) => {
                tracing::warn!(reason = %reason, "local credentials purged; fresh authentication required");
                TraceEvent::CredentialsPurged {
                    retry_count: ctx.retry_count,
                    reason,
                }
                .emit();
            }
            Err(e) => {
                self.lifecycle.lock().record_error(format!("credential purge failed: {e}"));
                tracing::error!(error = %e, "credential purge failed");
            }
        }
    }

    async fn escalate_on_expiry(self: Arc<Self>, mut expiry: mpsc::UnboundedReceiver<String>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                reason = expiry.recv() => match reason {
                    Some(reason) => {
                        self.apply(Trigger::AuthExpired { reason });
                    }
                    None => return,
                },
            }
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Periodic checks
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.heartbeat.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if self.state() != ConnectionState::Connected {
                continue;
            }
            let probe = self.source.probe(self.heartbeat.probe_timeout).await;
            let ctx = self.context();
            let verdict = self.heartbeat.evaluate(ctx.state, ctx.last_authenticated_ms, self.clock.now_ms(), &probe);
            match verdict {
                ProbeVerdict::Healthy => {}
                ProbeVerdict::Skipped => {
                    if probe == ProbeResult::Busy {
                        tracing::debug!("probe skipped: source busy with another call");
                    }
                }
                ProbeVerdict::Suppressed => {
                    tracing::debug!(probe = ?probe, "probe reading ignored inside post-auth grace window");
                }
                ProbeVerdict::Lost { reason } => {
                    tracing::warn!(reason = %reason, "heartbeat lost the connection");
                    self.apply(Trigger::ProbeFailed { reason });
                }
            }
        }
    }

    async fn stall_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.stall_check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            self.check_stall();
        }
    }

    /// Warn when connected but the watermark has not moved for longer
    /// than the threshold. Skipped until the connection itself is older
    /// than the threshold.
    pub fn check_stall(&self) -> Option<i64> {
        let ctx = self.context();
        let now = self.clock.now_ms();
        if ctx.state != ConnectionState::Connected
            || now.saturating_sub(ctx.state_since_ms) <= self.stall_threshold_ms
        {
            return None;
        }
        let watermark = self.pipeline.watermark();
        let gap = watermark.stall_gap(now, self.stall_threshold_ms)?;
        self.stall_warnings.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            watermark_ms = watermark.value(),
            gap_ms = gap,
            "connected but no events persisted within the stall threshold"
        );
        TraceEvent::WatermarkStall {
            watermark_ms: watermark.value(),
            gap_ms: gap,
        }
        .emit();
        Some(gap)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Notifications
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn pump_notifications(self: Arc<Self>, mut rx: mpsc::Receiver<SourceNotification>) {
        loop {
            let notification = tokio::select! {
                _ = self.cancel.cancelled() => return,
                n = rx.recv() => n,
            };
            match notification {
                Some(n) => self.handle_notification(n).await,
                None => {
                    tracing::warn!("source notification stream closed");
                    return;
                }
            }
        }
    }

    pub async fn handle_notification(self: &Arc<Self>, notification: SourceNotification) {
        tracing::trace!(kind = notification.kind(), "source notification");
        match notification {
            SourceNotification::AuthChallenge { detail } => {
                if let Some(detail) = &detail {
                    tracing::info!(detail = %detail, "authentication challenge issued");
                }
                self.apply(Trigger::AuthChallenge);
            }
            SourceNotification::Authenticated => {
                self.apply(Trigger::Authenticated);
            }
            SourceNotification::Ready => {
                self.apply(Trigger::Ready);
            }
            SourceNotification::Disconnected { reason } => {
                self.apply(Trigger::Disconnected { reason });
            }
            SourceNotification::Event(event) => self.ingest_live(event).await,
            SourceNotification::SessionStarted(start) => {
                self.sessions.start(&start);
            }
            SourceNotification::SessionStateChanged {
                session_id,
                status,
                at_ms,
            } => {
                self.sessions.update(&session_id, status, at_ms).await;
            }
        }
    }

    /// Live events go straight to the pipeline. The sender name comes from
    /// the cache when fresh; otherwise it is resolved in the background so
    /// the live path never queues behind catch-up traffic at the source.
    async fn ingest_live(self: &Arc<Self>, mut event: SourceEvent) {
        let mut resolve_later = false;
        if event.sender_name.is_none() {
            match self.identities.peek(&event.sender_id) {
                Some(profile) => event.sender_name = Some(profile.display_name),
                None => resolve_later = true,
            }
        }

        let outcome = self.pipeline.ingest(&event, IngestOrigin::Live).await;
        if resolve_later && outcome.is_persisted() {
            let this = Arc::clone(self);
            let sender_id = event.sender_id;
            self.tracker.spawn(async move { this.backfill_identity(sender_id).await });
        }
    }

    async fn backfill_identity(&self, sender_id: String) {
        let Some(profile) = self.identities.resolve(self.source.as_ref(), &sender_id).await else {
            return;
        };
        let record = IdentityRecord {
            id: sender_id,
            display_name: Some(profile.display_name),
            attributes: (!profile.attributes.is_null()).then_some(profile.attributes),
        };
        if let Err(e) = self.pipeline.storage().upsert_identity(&record).await {
            tracing::warn!(identity = %record.id, op = "upsert_identity", error = %e, "identity upsert failed");
        }
    }
}
