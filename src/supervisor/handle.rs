//! Shared, serialized access to a [`ProcessSupervisor`].

use super::process::{ProcessSupervisor, SupervisorError};
use super::status::ServiceStatus;
use crate::monitor::{Liveness, Supervised};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

/// Cloneable handle; every operation on the process goes through one async
/// mutex, so operator commands and monitor restarts never interleave.
#[derive(Clone)]
pub struct SupervisorHandle {
    id: String,
    inner: Arc<Mutex<ProcessSupervisor>>,
    stop_timeout: Duration,
}

impl SupervisorHandle {
    pub fn new(supervisor: ProcessSupervisor, stop_timeout: Duration) -> Self {
        Self {
            id: supervisor.id().to_string(),
            inner: Arc::new(Mutex::new(supervisor)),
            stop_timeout,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    pub async fn lock(&self) -> MutexGuard<'_, ProcessSupervisor> {
        self.inner.lock().await
    }
}

#[async_trait]
impl Supervised for SupervisorHandle {
    fn id(&self) -> &str {
        &self.id
    }

    async fn liveness(&self) -> Liveness {
        let Ok(mut supervisor) = self.inner.try_lock() else {
            return Liveness::Busy;
        };
        if !supervisor.status().is_supervised() {
            return Liveness::Idle(supervisor.status().clone());
        }
        match supervisor.check_liveness().await {
            Ok(()) => Liveness::Alive,
            Err(e) => Liveness::Dead(e.to_string()),
        }
    }

    async fn mark_failing(&self, restart_count: u32, last_error: String) {
        self.inner.lock().await.mark_failing(restart_count, last_error);
    }

    async fn mark_failed(&self, reason: String) {
        self.inner.lock().await.mark_failed(reason).await;
    }

    async fn restart_failing(&self) -> Result<ServiceStatus, SupervisorError> {
        let mut supervisor = self.inner.lock().await;
        let ServiceStatus::Failing { restart_count, .. } = supervisor.status().clone() else {
            // An operator took over while the restart was pending.
            return Ok(supervisor.status().clone());
        };

        match supervisor.restart(self.stop_timeout).await {
            Ok(status) => Ok(status),
            Err(e) => {
                tracing::warn!(process = %self.id, error = %e, "restart attempt failed");
                supervisor.mark_failing(restart_count, e.to_string());
                Err(e)
            }
        }
    }
}
