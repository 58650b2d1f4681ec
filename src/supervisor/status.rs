//! Lifecycle status of a supervised process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one managed child process.
///
/// # State Transitions
/// ```text
/// Stopped  → Starting | Failing | Failed
/// Starting → Running | Stopped | Failed
/// Running  → Stopping | Failing | Failed
/// Stopping → Stopped
/// Failing  → Failing | Stopped | Failed
/// Failed   → Stopped            (manual reset only)
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Running {
        pid: u32,
        started_at: DateTime<Utc>,
    },
    Stopping,
    Failing {
        restart_count: u32,
        last_error: String,
    },
    Failed {
        reason: String,
    },
}

impl ServiceStatus {
    pub fn can_transition_to(&self, next: &ServiceStatus) -> bool {
        use ServiceStatus::*;
        matches!(
            (self, next),
            (Stopped, Starting | Failing { .. } | Failed { .. })
                | (Starting, Running { .. } | Stopped | Failed { .. })
                | (Running { .. }, Stopping | Failing { .. } | Failed { .. })
                | (Stopping, Stopped)
                | (Failing { .. }, Failing { .. } | Stopped | Failed { .. })
                | (Failed { .. }, Stopped)
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ServiceStatus::Running { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ServiceStatus::Failed { .. })
    }

    /// The process is expected to be up, so the monitor should watch it.
    pub fn is_supervised(&self) -> bool {
        matches!(
            self,
            ServiceStatus::Running { .. } | ServiceStatus::Failing { .. }
        )
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            ServiceStatus::Running { pid, .. } => Some(*pid),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running { .. } => "running",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Failing { .. } => "failing",
            ServiceStatus::Failed { .. } => "failed",
        }
    }
}

/// Result of the most recent liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}
