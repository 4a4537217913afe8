use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Source bridge (WebSocket)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Connection to the external process that owns the messaging-source
/// session and speaks the bridge protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "d_url")]
    pub url: String,
    /// Environment variable holding the bridge bearer token. Unset means no
    /// token is sent.
    #[serde(default = "d_token_env")]
    pub token_env: String,
    #[serde(default = "d_30000")]
    pub request_timeout_ms: u64,
    /// Delay between attempts to re-open the bridge socket.
    #[serde(default = "d_2000")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "d_30000")]
    pub ping_interval_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: d_url(),
            token_env: d_token_env(),
            request_timeout_ms: 30_000,
            reconnect_delay_ms: 2_000,
            ping_interval_ms: 30_000,
        }
    }
}

impl BridgeConfig {
    /// Read the bearer token from the configured environment variable.
    pub fn token(&self) -> Option<String> {
        std::env::var(&self.token_env)
            .ok()
            .filter(|t| !t.is_empty())
    }
}

fn d_url() -> String {
    "ws://127.0.0.1:3399/v1/source".into()
}

fn d_token_env() -> String {
    "CT_BRIDGE_TOKEN".into()
}

fn d_2000() -> u64 {
    2_000
}

fn d_30000() -> u64 {
    30_000
}
