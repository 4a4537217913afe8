//! Heartbeat probe evaluation.
//!
//! The probe loop itself lives in the orchestrator; this module decides what
//! a single probe reading means.

use std::time::Duration;

use ct_domain::config::HeartbeatConfig;
use ct_domain::source::SourceConnectionState;

use crate::lifecycle::ConnectionState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    State(SourceConnectionState),
    Failed(String),
    TimedOut,
    /// Another source call held the gate for the whole probe budget.
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeVerdict {
    Healthy,
    /// Not connected, or the source was busy with another call.
    Skipped,
    /// A bad reading inside the post-authentication grace window.
    Suppressed,
    /// Treat exactly like an explicit disconnect.
    Lost { reason: String },
}

#[derive(Debug, Clone)]
pub struct HeartbeatPolicy {
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub grace_ms: i64,
}

impl HeartbeatPolicy {
    pub fn from_config(cfg: &HeartbeatConfig) -> Self {
        Self {
            interval: Duration::from_millis(cfg.interval_ms.max(1)),
            probe_timeout: Duration::from_millis(cfg.probe_timeout_ms.max(1)),
            grace_ms: i64::try_from(cfg.grace_ms).unwrap_or(i64::MAX),
        }
    }

    pub fn in_grace(&self, last_authenticated_ms: Option<i64>, now_ms: i64) -> bool {
        last_authenticated_ms.is_some_and(|at| now_ms.saturating_sub(at) < self.grace_ms)
    }

    pub fn evaluate(
        &self,
        state: ConnectionState,
        last_authenticated_ms: Option<i64>,
        now_ms: i64,
        probe: &ProbeResult,
    ) -> ProbeVerdict {
        if state != ConnectionState::Connected {
            return ProbeVerdict::Skipped;
        }

        let reason = match probe {
            ProbeResult::State(SourceConnectionState::Connected) => return ProbeVerdict::Healthy,
            ProbeResult::State(other) => format!("probe reported {other:?}"),
            ProbeResult::Failed(e) => format!("probe failed: {e}"),
            ProbeResult::TimedOut => "probe timed out".to_owned(),
            ProbeResult::Busy => return ProbeVerdict::Skipped,
        };

        if self.in_grace(last_authenticated_ms, now_ms) {
            return ProbeVerdict::Suppressed;
        }
        ProbeVerdict::Lost { reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> HeartbeatPolicy {
        HeartbeatPolicy {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            grace_ms: 60_000,
        }
    }

    #[test]
    fn connected_reading_is_healthy() {
        let v = policy().evaluate(
            ConnectionState::Connected,
            None,
            1_000,
            &ProbeResult::State(SourceConnectionState::Connected),
        );
        assert_eq!(v, ProbeVerdict::Healthy);
    }

    #[test]
    fn bad_reading_inside_grace_is_suppressed() {
        let p = policy();
        let v = p.evaluate(
            ConnectionState::Connected,
            Some(100_000),
            100_000 + 59_999,
            &ProbeResult::State(SourceConnectionState::Connecting),
        );
        assert_eq!(v, ProbeVerdict::Suppressed);
    }

    #[test]
    fn bad_reading_after_grace_is_lost() {
        let p = policy();
        for probe in [
            ProbeResult::State(SourceConnectionState::Disconnected),
            ProbeResult::Failed("page crashed".into()),
            ProbeResult::TimedOut,
        ] {
            let v = p.evaluate(ConnectionState::Connected, Some(0), 60_000, &probe);
            assert!(matches!(v, ProbeVerdict::Lost { .. }), "{probe:?} → {v:?}");
        }
    }

    #[test]
    fn never_authenticated_has_no_grace() {
        let v = policy().evaluate(
            ConnectionState::Connected,
            None,
            5,
            &ProbeResult::TimedOut,
        );
        assert!(matches!(v, ProbeVerdict::Lost { .. }));
    }

    #[test]
    fn busy_source_is_skipped_even_after_grace() {
        let v = policy().evaluate(ConnectionState::Connected, None, 500_000, &ProbeResult::Busy);
        assert_eq!(v, ProbeVerdict::Skipped);
    }

    #[test]
    fn probes_outside_connected_are_skipped() {
        let v = policy().evaluate(
            ConnectionState::Reconnecting,
            None,
            0,
            &ProbeResult::TimedOut,
        );
        assert_eq!(v, ProbeVerdict::Skipped);
    }
}
