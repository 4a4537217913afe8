use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connection lifecycle / reconnect
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Delay before the first reconnect attempt; doubles per failure.
    #[serde(default = "d_5000")]
    pub base_delay_ms: u64,
    /// Cap on the reconnect delay.
    #[serde(default = "d_60000")]
    pub max_delay_ms: u64,
    /// Consecutive failed reconnects tolerated before local credentials are
    /// purged and the connection is forced back through authentication.
    #[serde(default = "d_10")]
    pub auth_reset_threshold: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 5_000,
            max_delay_ms: 60_000,
            auth_reset_threshold: 10,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Heartbeat probe
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "d_30000")]
    pub interval_ms: u64,
    /// A probe that takes longer than this counts as failed.
    #[serde(default = "d_10000")]
    pub probe_timeout_ms: u64,
    /// Probe readings are ignored for this long after a successful
    /// authentication. Empirically tuned; the source reports transient
    /// non-connected states while a fresh session settles.
    #[serde(default = "d_60000")]
    pub grace_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            probe_timeout_ms: 10_000,
            grace_ms: 60_000,
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_5000() -> u64 {
    5_000
}

fn d_10000() -> u64 {
    10_000
}

fn d_30000() -> u64 {
    30_000
}

fn d_60000() -> u64 {
    60_000
}

fn d_10() -> u32 {
    10
}
