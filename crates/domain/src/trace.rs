use serde::Serialize;

/// Structured trace events emitted across all continuum crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    LifecycleTransition {
        from: String,
        to: String,
        trigger: String,
        retry_count: u32,
    },
    ReconnectScheduled {
        attempt: u32,
        delay_ms: u64,
    },
    CredentialsPurged {
        retry_count: u32,
        reason: String,
    },
    IngestFailed {
        event_id: String,
        channel_id: String,
        op: String,
        error: String,
    },
    WatermarkStall {
        watermark_ms: i64,
        gap_ms: i64,
    },
    CatchupPhase {
        phase: String,
        outcome: String,
        attempt: u32,
        events: usize,
        delay_ms: Option<u64>,
    },
    SessionFlushed {
        session_id: String,
        status: String,
        duration_ms: Option<i64>,
    },
    IdentityResolved {
        identity: String,
        resolved: bool,
    },
    BridgeLink {
        connected: bool,
        detail: Option<String>,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "ct_event");
    }
}
