use crate::queue::QueueError;
use crate::supervisor::SupervisorError;
use std::fmt::{Display, Formatter};
use std::time::Duration;
use uuid::Uuid;

/// Error surfaced to collaborators of the orchestrator.
///
/// Outbound-call variants say how many attempts ran and, when the payload
/// was parked for later delivery, the id of its offline-queue entry.
#[derive(Debug)]
pub enum CoreError {
    /// Network failure, timeout or retryable status, after all retries or
    /// after the failure that opened the breaker.
    Transient {
        dependency: String,
        message: String,
        attempts: u32,
        /// This call's failure opened the breaker.
        circuit_opened: bool,
        queued: Option<Uuid>,
    },
    /// Non-retryable failure (malformed request, auth). Never queued.
    Permanent {
        dependency: String,
        message: String,
        attempts: u32,
    },
    /// The breaker rejected the call without running it.
    CircuitOpen {
        dependency: String,
        attempts: u32,
        retry_after: Option<Duration>,
        queued: Option<Uuid>,
    },
    /// The call failed and was queued, but the queue was at capacity and
    /// older entries were dead-lettered to make room.
    QueueFull {
        dependency: String,
        /// The failure that caused the payload to be queued.
        message: String,
        attempts: u32,
        queued: Uuid,
        evicted: Vec<Uuid>,
    },
    Supervisor {
        process: String,
        source: SupervisorError,
    },
    UnknownProcess(String),
    UnknownDependency(String),
    /// The offline queue could not persist or read its journal.
    Storage {
        dependency: String,
        source: QueueError,
    },
}

impl CoreError {
    /// Id of the offline-queue entry holding the failed payload, if any.
    pub fn queued_id(&self) -> Option<Uuid> {
        match self {
            CoreError::Transient { queued, .. } | CoreError::CircuitOpen { queued, .. } => *queued,
            CoreError::QueueFull { queued, .. } => Some(*queued),
            _ => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::Transient { .. } | CoreError::CircuitOpen { .. } | CoreError::QueueFull { .. }
        )
    }
}

impl Display for CoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CoreError::Transient {
                dependency,
                message,
                attempts,
                circuit_opened,
                queued,
            } => {
                write!(
                    f,
                    "{}: transient failure after {} attempt(s): {}",
                    dependency, attempts, message
                )?;
                if *circuit_opened {
                    write!(f, " (circuit opened)")?;
                }
                if let Some(id) = queued {
                    write!(f, " (queued as {})", id)?;
                }
                Ok(())
            }
            CoreError::Permanent {
                dependency,
                message,
                attempts,
            } => write!(
                f,
                "{}: permanent failure after {} attempt(s): {}",
                dependency, attempts, message
            ),
            CoreError::CircuitOpen {
                dependency,
                queued,
                ..
            } => {
                write!(f, "{}: circuit open", dependency)?;
                if let Some(id) = queued {
                    write!(f, " (queued as {})", id)?;
                }
                Ok(())
            }
            CoreError::QueueFull {
                dependency,
                message,
                attempts,
                queued,
                evicted,
            } => write!(
                f,
                "{}: {} after {} attempt(s); offline queue full, dead-lettered {} older request(s) to queue {}",
                dependency,
                message,
                attempts,
                evicted.len(),
                queued
            ),
            CoreError::Supervisor { process, source } => write!(f, "{}: {}", process, source),
            CoreError::UnknownProcess(id) => write!(f, "unknown process '{}'", id),
            CoreError::UnknownDependency(id) => write!(f, "unknown dependency '{}'", id),
            CoreError::Storage { dependency, source } => write!(f, "{}: {}", dependency, source),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoreError::Supervisor { source, .. } => Some(source),
            CoreError::Storage { source, .. } => Some(source),
            _ => None,
        }
    }
}
