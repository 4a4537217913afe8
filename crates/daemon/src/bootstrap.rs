//! Process wiring: store, bridge, orchestrator, and the background store
//! flusher.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ct_bridge::BridgeClient;
use ct_capture::{CaptureOrchestrator, SystemClock};
use ct_domain::config::Config;
use ct_domain::source::SourceNotification;
use ct_store::FileStore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub struct Services {
    pub orchestrator: Arc<CaptureOrchestrator>,
    pub store: Arc<FileStore>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// Open the store, connect the bridge, and build the orchestrator. The
/// returned receiver carries the bridge's notifications.
pub async fn build_services(
    config: &Config,
) -> anyhow::Result<(Services, mpsc::Receiver<SourceNotification>)> {
    let store = Arc::new(
        FileStore::open(&config.storage.data_dir)
            .with_context(|| format!("opening store at {}", config.storage.data_dir.display()))?,
    );
    let (bridge, notifications) = BridgeClient::connect(&config.bridge);
    let orchestrator =
        CaptureOrchestrator::new(config, bridge, store.clone(), Arc::new(SystemClock))
            .await
            .context("initializing capture orchestrator")?;

    Ok((
        Services {
            orchestrator,
            store,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        },
        notifications,
    ))
}

impl Services {
    /// Periodically flush dirty dimension records to disk.
    pub fn spawn_background_tasks(&self, config: &Config) {
        let store = self.store.clone();
        let cancel = self.cancel.clone();
        let period = Duration::from_millis(config.storage.flush_interval_ms.max(1));
        self.tracker.spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = cancel.cancelled() => break,
                }
                if let Err(e) = store.flush_if_dirty().await {
                    tracing::warn!(error = %e, "store flush failed");
                }
            }
        });
    }

    /// Stop the orchestrator, then the flusher, then flush once more.
    pub async fn shutdown(self) {
        self.orchestrator.shutdown().await;
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        if let Err(e) = self.store.flush_if_dirty().await {
            tracing::warn!(error = %e, "store flush on shutdown failed");
        }
    }
}
