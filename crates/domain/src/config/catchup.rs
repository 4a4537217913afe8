use serde::{Deserialize, Serialize};

const HOUR_MS: u64 = 60 * 60 * 1_000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Historical catch-up (prefill → backfill → periodic refresh)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatchupConfig {
    /// Number of most recently active channels covered by prefill/backfill.
    #[serde(default = "d_prefill_channels")]
    pub prefill_channels: usize,
    #[serde(default = "d_5000")]
    pub prefill_base_delay_ms: u64,
    #[serde(default = "d_60000")]
    pub prefill_max_delay_ms: u64,
    /// The prefill attempt counter restarts after this many failures.
    #[serde(default = "d_attempt_reset")]
    pub prefill_attempt_reset: u32,
    /// Events fetched per channel during backfill.
    #[serde(default = "d_backfill_depth")]
    pub backfill_depth: usize,
    /// Fixed delay before a failed backfill is retried.
    #[serde(default = "d_backfill_retry")]
    pub backfill_retry_ms: u64,
    #[serde(default = "d_refresh_period")]
    pub refresh_period_ms: u64,
    /// Random offset in `[-jitter, +jitter]` applied to each refresh period.
    #[serde(default = "d_refresh_jitter")]
    pub refresh_jitter_ms: u64,
    /// Trailing window over which channel volume is ranked.
    #[serde(default = "d_refresh_window")]
    pub refresh_window_ms: u64,
    #[serde(default = "d_refresh_top_k")]
    pub refresh_top_k: usize,
    /// Channels with fewer persisted events than this get topped up.
    #[serde(default = "d_refresh_min_events")]
    pub refresh_min_events: u64,
    #[serde(default = "d_refresh_fetch_limit")]
    pub refresh_fetch_limit: usize,
}

impl Default for CatchupConfig {
    fn default() -> Self {
        Self {
            prefill_channels: d_prefill_channels(),
            prefill_base_delay_ms: d_5000(),
            prefill_max_delay_ms: d_60000(),
            prefill_attempt_reset: d_attempt_reset(),
            backfill_depth: d_backfill_depth(),
            backfill_retry_ms: d_backfill_retry(),
            refresh_period_ms: d_refresh_period(),
            refresh_jitter_ms: d_refresh_jitter(),
            refresh_window_ms: d_refresh_window(),
            refresh_top_k: d_refresh_top_k(),
            refresh_min_events: d_refresh_min_events(),
            refresh_fetch_limit: d_refresh_fetch_limit(),
        }
    }
}

fn d_prefill_channels() -> usize {
    10
}

fn d_5000() -> u64 {
    5_000
}

fn d_60000() -> u64 {
    60_000
}

fn d_attempt_reset() -> u32 {
    1_000
}

fn d_backfill_depth() -> usize {
    20
}

fn d_backfill_retry() -> u64 {
    30_000
}

fn d_refresh_period() -> u64 {
    24 * HOUR_MS
}

fn d_refresh_jitter() -> u64 {
    HOUR_MS
}

fn d_refresh_window() -> u64 {
    7 * 24 * HOUR_MS
}

fn d_refresh_top_k() -> usize {
    20
}

fn d_refresh_min_events() -> u64 {
    50
}

fn d_refresh_fetch_limit() -> usize {
    100
}
