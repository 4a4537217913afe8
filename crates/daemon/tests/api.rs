//! The status surface served over a real socket against an orchestrator
//! driving a scripted source.

use std::sync::Arc;

use ct_capture::testkit::{event, FakeSource, MemoryStorage};
use ct_capture::{CaptureOrchestrator, ConnectionState, SystemClock};
use ct_daemon::api::{router, AppState};
use ct_domain::config::Config;
use ct_domain::source::SourceNotification;
use tokio::sync::mpsc;

async fn serve(orchestrator: Arc<CaptureOrchestrator>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(AppState { orchestrator });
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn health_and_status_follow_the_lifecycle() {
    let mut config = Config::default();
    // Keep the reconnect driver out of the way while we look.
    config.connection.base_delay_ms = 60_000;
    config.connection.max_delay_ms = 60_000;

    let source = Arc::new(FakeSource::new());
    let storage = Arc::new(MemoryStorage::new());
    let orchestrator = CaptureOrchestrator::new(&config, source, storage, Arc::new(SystemClock))
        .await
        .unwrap();
    let (notify, notifications) = mpsc::channel(16);
    orchestrator.start(notifications).await;
    assert_eq!(orchestrator.state(), ConnectionState::Connected);

    let base = serve(orchestrator.clone()).await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{base}/v1/health")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["healthy"], true);
    assert_eq!(body["state"], "connected");

    let now = chrono::Utc::now().timestamp_millis();
    notify
        .send(SourceNotification::Event(event("e1", "c1", "u1", now)))
        .await
        .unwrap();
    notify
        .send(SourceNotification::Disconnected {
            reason: "socket closed".into(),
        })
        .await
        .unwrap();
    let mut state = orchestrator.subscribe_state();
    state
        .wait_for(|s| *s == ConnectionState::Reconnecting)
        .await
        .unwrap();

    let resp = client.get(format!("{base}/v1/health")).send().await.unwrap();
    assert_eq!(resp.status(), 503);

    let snap: serde_json::Value = client
        .get(format!("{base}/v1/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(snap["state"], "reconnecting");
    assert_eq!(snap["retry_count"], 1);
    assert_eq!(snap["detail"], "socket closed");
    assert_eq!(snap["ingest"]["events_inserted"], 1);
    assert_eq!(snap["watermark_ms"], now);

    let summary = ct_daemon::cli::status::summarize(&snap);
    assert!(summary.contains("state:          reconnecting"));

    orchestrator.shutdown().await;
}
