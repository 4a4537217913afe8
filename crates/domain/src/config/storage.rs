use std::path::PathBuf;

use serde::{Deserialize, Serialize};

const HOUR_MS: u64 = 60 * 60 * 1_000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Storage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for the raw log, structured store, and watermark.
    #[serde(default = "d_data_dir")]
    pub data_dir: PathBuf,
    /// How often dirty dimension records are flushed to disk.
    #[serde(default = "d_30000")]
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: d_data_dir(),
            flush_interval_ms: 30_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Watermark
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatermarkConfig {
    #[serde(default = "d_60000")]
    pub stall_check_interval_ms: u64,
    /// Gap between wall clock and watermark that raises a stall warning
    /// while connected.
    #[serde(default = "d_stall_threshold")]
    pub stall_threshold_ms: u64,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            stall_check_interval_ms: 60_000,
            stall_threshold_ms: d_stall_threshold(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Identity resolution cache
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "d_ttl")]
    pub ttl_ms: u64,
    /// Upper bound on cached identities. `0` disables the bound.
    #[serde(default = "d_max_entries")]
    pub max_entries: usize,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            ttl_ms: d_ttl(),
            max_entries: d_max_entries(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn d_30000() -> u64 {
    30_000
}

fn d_60000() -> u64 {
    60_000
}

fn d_stall_threshold() -> u64 {
    HOUR_MS
}

fn d_ttl() -> u64 {
    24 * HOUR_MS
}

fn d_max_entries() -> usize {
    10_000
}
