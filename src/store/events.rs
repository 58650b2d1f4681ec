use crate::queue::{DeadLetterReason, ReplayReport};
use crate::resilience::BreakerState;
use crate::supervisor::ServiceStatus;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Discrete notifications published alongside snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreEvent {
    ProcessStatusChanged {
        process: String,
        from: ServiceStatus,
        to: ServiceStatus,
    },
    /// Restart limit exceeded; the process stays down until a manual reset.
    ProcessFailed {
        process: String,
        reason: String,
    },
    RestartScheduled {
        process: String,
        attempt: u32,
        delay_ms: u64,
    },
    BreakerTransition {
        dependency: String,
        from: BreakerState,
        to: BreakerState,
    },
    RequestQueued {
        dependency: String,
        id: Uuid,
    },
    RequestDeadLettered {
        dependency: String,
        id: Uuid,
        reason: DeadLetterReason,
    },
    ReplayCompleted {
        dependency: String,
        report: ReplayReport,
    },
}

impl CoreEvent {
    /// Process or dependency id the event is about.
    pub fn subject(&self) -> &str {
        match self {
            CoreEvent::ProcessStatusChanged { process, .. }
            | CoreEvent::ProcessFailed { process, .. }
            | CoreEvent::RestartScheduled { process, .. } => process,
            CoreEvent::BreakerTransition { dependency, .. }
            | CoreEvent::RequestQueued { dependency, .. }
            | CoreEvent::RequestDeadLettered { dependency, .. }
            | CoreEvent::ReplayCompleted { dependency, .. } => dependency,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CoreEvent::ProcessStatusChanged { .. } => "process_status_changed",
            CoreEvent::ProcessFailed { .. } => "process_failed",
            CoreEvent::RestartScheduled { .. } => "restart_scheduled",
            CoreEvent::BreakerTransition { .. } => "breaker_transition",
            CoreEvent::RequestQueued { .. } => "request_queued",
            CoreEvent::RequestDeadLettered { .. } => "request_dead_lettered",
            CoreEvent::ReplayCompleted { .. } => "replay_completed",
        }
    }
}
