//! Backend lifecycle management
//!
//! One [`Backend`] per configured server. It owns the server's single
//! connection, drives the lifecycle state machine and enforces the startup
//! and tool timeouts. [`health`] runs the periodic supervisor on top.

pub mod health;
pub mod lifecycle;

use serde::Serialize;
use std::time::Duration;

use crate::config::TransportKind;

pub use health::{spawn_health_supervisor, HEALTH_CHECK_INTERVAL};
pub use lifecycle::Backend;

/// Restarts allowed before a stdio backend settles into `Failed`.
pub const MAX_RESTART_ATTEMPTS: u32 = 3;
pub const RESTART_BASE_DELAY: Duration = Duration::from_secs(1);
/// Bound on one health probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
/// Consecutive tool timeouts after which a backend counts as unresponsive.
pub const TIMEOUT_STRIKES: u32 = 3;
/// Upper bound on `tools/list` pages fetched from one backend.
pub const MAX_TOOL_PAGES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    Unstarted,
    Starting,
    Ready,
    Degraded,
    Stopped,
    Failed,
}

impl BackendState {
    /// Status string reported by `/health`.
    pub fn health_label(&self) -> &'static str {
        match self {
            BackendState::Unstarted => "not_started",
            BackendState::Starting => "starting",
            BackendState::Ready => "running",
            BackendState::Degraded => "degraded",
            BackendState::Stopped => "stopped",
            BackendState::Failed => "error",
        }
    }
}

/// How restarts are paced and bounded.
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RESTART_ATTEMPTS,
            base_delay: RESTART_BASE_DELAY,
        }
    }
}

impl RestartPolicy {
    /// Delay before restart number `attempt` (zero-based): base, 2x, 4x...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Point-in-time view of one backend, as reported by `/health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSnapshot {
    #[serde(skip)]
    pub id: String,
    #[serde(skip)]
    pub state: BackendState,
    pub status: &'static str,
    #[serde(rename = "type")]
    pub kind: TransportKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    pub restart_count: u32,
    pub tools: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Result of one health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    Healthy,
    Unhealthy(String),
    /// Not in a probeable state.
    Skipped,
}
