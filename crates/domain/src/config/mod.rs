mod bridge;
mod catchup;
mod connection;
mod observability;
mod server;
mod storage;

pub use bridge::*;
pub use catchup::*;
pub use connection::*;
pub use observability::*;
pub use server::*;
pub use storage::*;

use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub watermark: WatermarkConfig,
    #[serde(default)]
    pub catchup: CatchupConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl ConfigError {
    fn error(field: &str, message: &str) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            field: field.into(),
            message: message.into(),
        }
    }

    fn warning(field: &str, message: &str) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.connection.base_delay_ms == 0 {
            errors.push(ConfigError::error(
                "connection.base_delay_ms",
                "base delay must be greater than 0",
            ));
        }
        if self.connection.max_delay_ms < self.connection.base_delay_ms {
            errors.push(ConfigError::error(
                "connection.max_delay_ms",
                "max delay must be >= base delay",
            ));
        }
        if self.connection.auth_reset_threshold == 0 {
            errors.push(ConfigError::warning(
                "connection.auth_reset_threshold",
                "0 purges credentials on the first failed reconnect",
            ));
        }

        if self.heartbeat.interval_ms == 0 {
            errors.push(ConfigError::error(
                "heartbeat.interval_ms",
                "heartbeat interval must be greater than 0",
            ));
        }
        if self.heartbeat.probe_timeout_ms == 0 {
            errors.push(ConfigError::error(
                "heartbeat.probe_timeout_ms",
                "probe timeout must be greater than 0",
            ));
        }

        if self.watermark.stall_check_interval_ms == 0 {
            errors.push(ConfigError::error(
                "watermark.stall_check_interval_ms",
                "stall check interval must be greater than 0",
            ));
        }
        if self.heartbeat.grace_ms >= self.watermark.stall_threshold_ms {
            errors.push(ConfigError::warning(
                "heartbeat.grace_ms",
                "grace window is not shorter than the stall threshold",
            ));
        }

        if self.catchup.prefill_channels == 0 {
            errors.push(ConfigError::warning(
                "catchup.prefill_channels",
                "0 disables prefill and backfill",
            ));
        }
        if self.catchup.prefill_base_delay_ms == 0 {
            errors.push(ConfigError::error(
                "catchup.prefill_base_delay_ms",
                "base delay must be greater than 0",
            ));
        }
        if self.catchup.prefill_max_delay_ms < self.catchup.prefill_base_delay_ms {
            errors.push(ConfigError::error(
                "catchup.prefill_max_delay_ms",
                "max delay must be >= base delay",
            ));
        }
        if self.catchup.refresh_jitter_ms >= self.catchup.refresh_period_ms {
            errors.push(ConfigError::error(
                "catchup.refresh_jitter_ms",
                "jitter must be smaller than the refresh period",
            ));
        }

        if self.identity.ttl_ms == 0 {
            errors.push(ConfigError::warning(
                "identity.ttl_ms",
                "0 disables identity caching",
            ));
        }
        if self.identity.max_entries == 0 {
            errors.push(ConfigError::warning(
                "identity.max_entries",
                "identity cache is unbounded",
            ));
        }

        if self.bridge.url.is_empty() {
            errors.push(ConfigError::error("bridge.url", "url must not be empty"));
        }
        if self.server.port == 0 {
            errors.push(ConfigError::error(
                "server.port",
                "port must be greater than 0",
            ));
        }

        errors
    }
}
