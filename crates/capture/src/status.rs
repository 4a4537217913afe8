//! Read-only status snapshot and the health predicate.

use serde::Serialize;

use crate::catchup::CatchupStatus;
use crate::identity::IdentityCacheStats;
use crate::lifecycle::ConnectionState;
use crate::pipeline::PipelineStats;

/// One applied lifecycle transition, kept in a short history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionRecord {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub trigger: &'static str,
    pub retry_count: u32,
    pub at_ms: i64,
}

/// Point-in-time view assembled on demand. Never authoritative.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub healthy: bool,
    pub state: ConnectionState,
    pub state_since_ms: i64,
    pub retry_count: u32,
    pub restart_count: u64,
    pub ever_connected: bool,
    pub ever_authenticated: bool,
    pub last_authenticated_ms: Option<i64>,
    pub last_ready_ms: Option<i64>,
    pub last_event_ms: Option<i64>,
    pub last_write_ms: Option<i64>,
    pub watermark_ms: i64,
    pub watermark_flush_failures: u64,
    pub stall_warnings: u64,
    pub active_sessions: usize,
    pub catchup: CatchupStatus,
    /// Most recent transitions, oldest first.
    pub recent_transitions: Vec<TransitionRecord>,
    pub ingest: PipelineStats,
    pub identity_cache: IdentityCacheStats,
    /// Most recent human-readable failure context.
    pub detail: Option<String>,
    pub generated_at_ms: i64,
}

/// Healthy iff connected and the last live event is younger than
/// `max_event_age_ms`. Before the first event of a connection the age is
/// measured from the moment it became ready.
pub fn is_healthy(
    state: ConnectionState,
    last_event_ms: Option<i64>,
    last_ready_ms: Option<i64>,
    now_ms: i64,
    max_event_age_ms: i64,
) -> bool {
    if state != ConnectionState::Connected {
        return false;
    }
    let reference = match (last_event_ms, last_ready_ms) {
        (Some(e), Some(r)) => e.max(r),
        (Some(t), None) | (None, Some(t)) => t,
        (None, None) => return false,
    };
    now_ms.saturating_sub(reference) < max_event_age_ms
}
