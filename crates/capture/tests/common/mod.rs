//! Shared harness: an orchestrator over a scripted source and in-memory
//! storage, with a notification channel the test drives.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ct_capture::testkit::{FakeSource, MemoryStorage, TokioClock};
use ct_capture::{CaptureOrchestrator, ConnectionState};
use ct_domain::config::Config;
use ct_domain::source::SourceNotification;
use tokio::sync::mpsc;

pub const START_MS: i64 = 1_700_000_000_000;

pub struct Harness {
    pub source: Arc<FakeSource>,
    pub storage: Arc<MemoryStorage>,
    pub orchestrator: Arc<CaptureOrchestrator>,
    pub notify: mpsc::Sender<SourceNotification>,
    notifications: Option<mpsc::Receiver<SourceNotification>>,
}

impl Harness {
    pub async fn new(config: Config, source: FakeSource) -> Self {
        let source = Arc::new(source);
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(TokioClock::new(START_MS));
        let orchestrator = CaptureOrchestrator::new(&config, source.clone(), storage.clone(), clock)
            .await
            .unwrap();
        let (notify, notifications) = mpsc::channel(64);
        Self {
            source,
            storage,
            orchestrator,
            notify,
            notifications: Some(notifications),
        }
    }

    pub async fn start(&mut self) {
        let rx = self.notifications.take().expect("started twice");
        self.orchestrator.start(rx).await;
    }

    pub async fn send(&self, notification: SourceNotification) {
        self.notify.send(notification).await.unwrap();
    }

    /// Wait (in virtual time) until the lifecycle reaches `state`.
    pub async fn reach(&self, state: ConnectionState) {
        let mut rx = self.orchestrator.subscribe_state();
        tokio::time::timeout(Duration::from_secs(3_600), rx.wait_for(|s| *s == state))
            .await
            .unwrap_or_else(|_| panic!("never reached {state}; stuck in {}", self.orchestrator.state()))
            .unwrap();
    }

    /// Let spawned tasks run without moving virtual time far.
    pub async fn settle(&self) {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }
}

pub fn config() -> Config {
    let mut config = Config::default();
    config.connection.base_delay_ms = 5_000;
    config.connection.max_delay_ms = 60_000;
    config
}
