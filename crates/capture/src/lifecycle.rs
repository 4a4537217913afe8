//! Connection lifecycle state machine.
//!
//! One enum, one transition table. Every change of state goes through
//! [`LifecycleMachine::apply`], which also owns the reconnect retry counter
//! and the escalation to re-authentication.

use std::time::Duration;

use serde::Serialize;

use crate::backoff::RetryPolicy;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// States and triggers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Starting,
    AwaitingAuthentication,
    Connected,
    Reconnecting,
    NeedsReauthentication,
    /// Terminal.
    ShuttingDown,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::AwaitingAuthentication => "awaiting_authentication",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::NeedsReauthentication => "needs_reauthentication",
            Self::ShuttingDown => "shutting_down",
        }
    }

    /// States in which the reconnect loop should keep driving
    /// `reinitialize()`.
    pub fn wants_reinitialize(self) -> bool {
        matches!(self, Self::Reconnecting | Self::NeedsReauthentication)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    AuthChallenge,
    Authenticated,
    /// The source reports a usable session (including a resumed one).
    Ready,
    Disconnected { reason: String },
    /// Heartbeat probe returned non-connected or failed after the grace window.
    ProbeFailed { reason: String },
    /// The first connect attempt and its immediate retry both failed.
    InitFailed { reason: String },
    ReconnectSucceeded,
    ReconnectFailed { reason: String },
    AuthExpired { reason: String },
    Shutdown,
}

impl Trigger {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AuthChallenge => "auth_challenge",
            Self::Authenticated => "authenticated",
            Self::Ready => "ready",
            Self::Disconnected { .. } => "disconnected",
            Self::ProbeFailed { .. } => "probe_failed",
            Self::InitFailed { .. } => "init_failed",
            Self::ReconnectSucceeded => "reconnect_succeeded",
            Self::ReconnectFailed { .. } => "reconnect_failed",
            Self::AuthExpired { .. } => "auth_expired",
            Self::Shutdown => "shutdown",
        }
    }

    fn reason(&self) -> Option<&str> {
        match self {
            Self::Disconnected { reason }
            | Self::ProbeFailed { reason }
            | Self::InitFailed { reason }
            | Self::ReconnectFailed { reason }
            | Self::AuthExpired { reason } => Some(reason),
            _ => None,
        }
    }
}

/// The transition table. `None` means the trigger is not valid in `from`.
pub fn next_state(from: ConnectionState, trigger: &Trigger) -> Option<ConnectionState> {
    use ConnectionState::*;

    match (from, trigger) {
        (ShuttingDown, _) => None,
        (_, Trigger::Shutdown) => Some(ShuttingDown),

        (Starting, Trigger::AuthChallenge) => Some(AwaitingAuthentication),
        (Starting, Trigger::Ready | Trigger::Authenticated) => Some(Connected),
        (Starting, Trigger::InitFailed { .. }) => Some(Reconnecting),

        (AwaitingAuthentication, Trigger::Authenticated | Trigger::Ready) => Some(Connected),

        (Connected, Trigger::Disconnected { .. } | Trigger::ProbeFailed { .. }) => {
            Some(Reconnecting)
        }

        (Reconnecting, Trigger::ReconnectSucceeded | Trigger::Ready | Trigger::Authenticated) => {
            Some(Connected)
        }
        (Reconnecting, Trigger::ReconnectFailed { .. }) => Some(Reconnecting),
        (Reconnecting, Trigger::AuthChallenge) => Some(AwaitingAuthentication),

        (NeedsReauthentication, Trigger::AuthChallenge) => Some(AwaitingAuthentication),
        (NeedsReauthentication, Trigger::ReconnectFailed { .. }) => Some(NeedsReauthentication),

        (Starting | Connected | Reconnecting, Trigger::AuthExpired { .. }) => {
            Some(NeedsReauthentication)
        }

        _ => None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connection context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionContext {
    pub state: ConnectionState,
    /// Consecutive failed connection attempts since the last success or
    /// credential reset.
    pub retry_count: u32,
    /// Number of `reinitialize()` calls issued over the process lifetime.
    pub restart_count: u64,
    pub last_authenticated_ms: Option<i64>,
    pub last_ready_ms: Option<i64>,
    pub state_since_ms: i64,
    pub ever_connected: bool,
    pub ever_authenticated: bool,
    /// Most recent human-readable failure context.
    pub last_error: Option<String>,
}

impl ConnectionContext {
    fn new(now_ms: i64) -> Self {
        Self {
            state: ConnectionState::Starting,
            retry_count: 0,
            restart_count: 0,
            last_authenticated_ms: None,
            last_ready_ms: None,
            state_since_ms: now_ms,
            ever_connected: false,
            ever_authenticated: false,
            last_error: None,
        }
    }
}

/// Result of an applied trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub trigger: &'static str,
    pub retry_count: u32,
    /// Local credentials must be purged and a fresh challenge requested.
    pub escalated: bool,
    /// How long to wait before the next `reinitialize()`, when `to` is a
    /// reconnecting state.
    pub delay: Option<Duration>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct LifecycleMachine {
    ctx: ConnectionContext,
    policy: RetryPolicy,
    auth_reset_threshold: u32,
}

impl LifecycleMachine {
    pub fn new(policy: RetryPolicy, auth_reset_threshold: u32, now_ms: i64) -> Self {
        Self {
            ctx: ConnectionContext::new(now_ms),
            policy,
            auth_reset_threshold,
        }
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.ctx
    }

    pub fn state(&self) -> ConnectionState {
        self.ctx.state
    }

    pub fn record_restart(&mut self) {
        self.ctx.restart_count += 1;
    }

    pub fn record_error(&mut self, detail: impl Into<String>) {
        self.ctx.last_error = Some(detail.into());
    }

    /// Delay before the next reconnect attempt under the current counter.
    pub fn reconnect_delay(&self) -> Duration {
        self.policy.delay_for(self.ctx.retry_count)
    }

    /// Apply `trigger`. Returns `None` (and changes nothing) when the
    /// trigger is not valid in the current state.
    pub fn apply(&mut self, trigger: &Trigger, now_ms: i64) -> Option<Transition> {
        let from = self.ctx.state;
        let mut to = next_state(from, trigger)?;
        let mut escalated = false;

        match trigger {
            Trigger::Authenticated => {
                self.ctx.last_authenticated_ms = Some(now_ms);
                self.ctx.ever_authenticated = true;
            }
            Trigger::Ready => {
                self.ctx.last_ready_ms = Some(now_ms);
            }
            Trigger::Disconnected { .. }
            | Trigger::ProbeFailed { .. }
            | Trigger::InitFailed { .. } => {
                // The drop itself is the first failure.
                self.ctx.retry_count = 1;
            }
            Trigger::ReconnectFailed { .. } => {
                self.ctx.retry_count = self.ctx.retry_count.saturating_add(1);
                if from == ConnectionState::Reconnecting
                    && self.ctx.retry_count > self.auth_reset_threshold
                {
                    to = ConnectionState::NeedsReauthentication;
                    self.ctx.retry_count = 0;
                    escalated = true;
                }
            }
            Trigger::AuthExpired { .. } => {
                self.ctx.retry_count = 0;
                escalated = true;
            }
            _ => {}
        }

        if let Some(reason) = trigger.reason() {
            self.ctx.last_error = Some(reason.to_owned());
        }

        if to == ConnectionState::Connected {
            self.ctx.retry_count = 0;
            self.ctx.ever_connected = true;
            self.ctx.last_error = None;
            if self.ctx.last_ready_ms.is_none() || matches!(trigger, Trigger::ReconnectSucceeded) {
                self.ctx.last_ready_ms = Some(now_ms);
            }
        }

        if to != from {
            self.ctx.state_since_ms = now_ms;
        }
        self.ctx.state = to;

        let delay = to
            .wants_reinitialize()
            .then(|| self.policy.delay_for(self.ctx.retry_count));

        Some(Transition {
            from,
            to,
            trigger: trigger.name(),
            retry_count: self.ctx.retry_count,
            escalated,
            delay,
        })
    }
}
