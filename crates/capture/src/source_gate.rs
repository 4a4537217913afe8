//! Serialized access to the source client.
//!
//! The source client is not assumed safe for concurrent invocation, so
//! every outbound call from the orchestrator, the catch-up phases, the
//! heartbeat and the identity cache goes through one async mutex.
//! Any call failing with expired credentials is reported on the expiry
//! channel so the lifecycle can escalate no matter who made the call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use ct_domain::error::{Error, Result};
use ct_domain::source::{
    ChannelSummary, IdentityProfile, SourceClient, SourceConnectionState, SourceEvent,
};

use crate::heartbeat::ProbeResult;

pub struct SerializedSource {
    inner: Arc<dyn SourceClient>,
    gate: Mutex<()>,
    calls: AtomicU64,
    expiry: parking_lot::Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl SerializedSource {
    pub fn new(inner: Arc<dyn SourceClient>) -> Self {
        Self {
            inner,
            gate: Mutex::new(()),
            calls: AtomicU64::new(0),
            expiry: parking_lot::Mutex::new(None),
        }
    }

    /// Receive the reason of every auth-expired failure from now on.
    /// Replaces any previous subscriber.
    pub fn watch_auth_expiry(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.expiry.lock() = Some(tx);
        rx
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(Error::AuthExpired(reason)) = &result {
            if let Some(tx) = self.expiry.lock().as_ref() {
                let _ = tx.send(reason.clone());
            }
        }
        result
    }

    /// Total outbound calls issued.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Liveness probe. Only the source's answer is bounded by `timeout`;
    /// a gate still held by another call after `timeout` yields
    /// [`ProbeResult::Busy`], since that call is bounded by its own
    /// request timeout.
    pub async fn probe(&self, timeout: Duration) -> ProbeResult {
        let Ok(_turn) = tokio::time::timeout(timeout, self.gate.lock()).await else {
            return ProbeResult::Busy;
        };
        self.calls.fetch_add(1, Ordering::Relaxed);
        match tokio::time::timeout(timeout, self.inner.connection_state()).await {
            Ok(result) => match self.observe(result) {
                Ok(state) => ProbeResult::State(state),
                Err(e) => ProbeResult::Failed(e.to_string()),
            },
            Err(_) => ProbeResult::TimedOut,
        }
    }
}

macro_rules! serialized {
    ($self:ident, $call:expr) => {{
        let _turn = $self.gate.lock().await;
        $self.calls.fetch_add(1, Ordering::Relaxed);
        let result = $call.await;
        $self.observe(result)
    }};
}

#[async_trait]
impl SourceClient for SerializedSource {
    async fn fetch_recent_events(&self, channel_id: &str, limit: usize) -> Result<Vec<SourceEvent>> {
        serialized!(self, self.inner.fetch_recent_events(channel_id, limit))
    }

    async fn resolve_identity(&self, identity: &str) -> Result<IdentityProfile> {
        serialized!(self, self.inner.resolve_identity(identity))
    }

    async fn list_channels(&self) -> Result<Vec<ChannelSummary>> {
        serialized!(self, self.inner.list_channels())
    }

    async fn connection_state(&self) -> Result<SourceConnectionState> {
        serialized!(self, self.inner.connection_state())
    }

    async fn reinitialize(&self) -> Result<()> {
        serialized!(self, self.inner.reinitialize())
    }

    async fn purge_credentials(&self) -> Result<()> {
        serialized!(self, self.inner.purge_credentials())
    }

    async fn destroy(&self) -> Result<()> {
        serialized!(self, self.inner.destroy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::FakeSource;
    use std::sync::atomic::AtomicBool;

    /// Records whether two calls ever overlapped.
    struct OverlapDetector {
        active: AtomicBool,
        overlapped: AtomicBool,
    }

    #[async_trait]
    impl SourceClient for OverlapDetector {
        async fn fetch_recent_events(&self, _: &str, _: usize) -> Result<Vec<SourceEvent>> {
            if self.active.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.active.store(false, Ordering::SeqCst);
            Ok(Vec::new())
        }
        async fn resolve_identity(&self, id: &str) -> Result<IdentityProfile> {
            Ok(IdentityProfile {
                id: id.into(),
                display_name: id.into(),
                attributes: serde_json::Value::Null,
            })
        }
        async fn list_channels(&self) -> Result<Vec<ChannelSummary>> {
            Ok(Vec::new())
        }
        async fn connection_state(&self) -> Result<SourceConnectionState> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(SourceConnectionState::Connected)
        }
        async fn reinitialize(&self) -> Result<()> {
            Ok(())
        }
        async fn purge_credentials(&self) -> Result<()> {
            Ok(())
        }
        async fn destroy(&self) -> Result<()> {
            Ok(())
        }
    }

    fn detector() -> Arc<OverlapDetector> {
        Arc::new(OverlapDetector {
            active: AtomicBool::new(false),
            overlapped: AtomicBool::new(false),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_never_overlap() {
        let inner = detector();
        let source = Arc::new(SerializedSource::new(inner.clone()));
        let mut handles = Vec::new();
        for i in 0..8 {
            let s = Arc::clone(&source);
            handles.push(tokio::spawn(async move {
                s.fetch_recent_events(&format!("c{i}"), 1).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(!inner.overlapped.load(Ordering::SeqCst));
        assert_eq!(source.calls(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probe_times_out() {
        let source = SerializedSource::new(detector());
        let result = source.probe(Duration::from_secs(10)).await;
        assert_eq!(result, ProbeResult::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_behind_long_fetch_reports_busy() {
        let fake = Arc::new(FakeSource::new().with_channel("c1", 1, 1, 100));
        *fake.fetch_delay.lock() = Some(Duration::from_secs(25));
        let source = Arc::new(SerializedSource::new(fake));

        let fetch = {
            let s = Arc::clone(&source);
            tokio::spawn(async move { s.fetch_recent_events("c1", 1).await })
        };
        tokio::task::yield_now().await;

        assert_eq!(source.probe(Duration::from_secs(10)).await, ProbeResult::Busy);
        assert_eq!(fetch.await.unwrap().unwrap().len(), 1);
        assert_eq!(
            source.probe(Duration::from_secs(10)).await,
            ProbeResult::State(SourceConnectionState::Connected)
        );
    }

    #[tokio::test]
    async fn auth_expiry_is_reported() {
        let fake = Arc::new(FakeSource::new());
        fake.reinit_script
            .lock()
            .push_back(Err(Error::AuthExpired("token revoked".into())));
        let source = SerializedSource::new(fake);
        let mut expired = source.watch_auth_expiry();

        assert!(source.reinitialize().await.unwrap_err().is_auth_expired());
        assert_eq!(expired.try_recv().unwrap(), "token revoked");
        source.reinitialize().await.unwrap();
        assert!(expired.try_recv().is_err());
    }

    #[tokio::test]
    async fn probe_reports_state() {
        let fake = Arc::new(FakeSource::new());
        *fake.state.lock() = SourceConnectionState::AwaitingAuthentication;
        let source = SerializedSource::new(fake);
        assert_eq!(
            source.probe(Duration::from_secs(1)).await,
            ProbeResult::State(SourceConnectionState::AwaitingAuthentication)
        );
    }
}
