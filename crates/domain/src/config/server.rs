use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_3211")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3211,
            host: "127.0.0.1".into(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Health predicate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Healthy requires an event to have been seen within this window.
    #[serde(default = "d_max_event_age")]
    pub max_event_age_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_event_age_ms: d_max_event_age(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_3211() -> u16 {
    3211
}

fn d_host() -> String {
    "127.0.0.1".into()
}

fn d_max_event_age() -> u64 {
    30 * 60 * 1_000
}
