//! Background health monitor.
//!
//! On every tick the monitor:
//! 1. Probes each process that is expected to be up; an unhealthy process is
//!    marked `Failing` and restarted after an exponential backoff, unless its
//!    restart window is exhausted, in which case it is parked in `Failed`.
//!    The backoff and restart run in a task of their own, at most one per
//!    process, so a slow restart never holds up the rest of the pass.
//! 2. Replays the offline queue of every dependency whose breaker admits
//!    calls again (closed, or open with the probe cooldown elapsed).
//!
//! The monitor never writes process status itself; it asks the supervisor.

pub mod restart_tracker;

pub use restart_tracker::RestartTracker;

use crate::queue::{QueueError, ReplayReport};
use crate::resilience::BreakerState;
use crate::serde_util::duration_ms;
use crate::supervisor::{ServiceStatus, SupervisorError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_RESTART_LIMIT: u32 = 3;
pub const DEFAULT_RESTART_WINDOW: Duration = Duration::from_secs(300);
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_interval", with = "duration_ms", rename = "interval_ms")]
    pub interval: Duration,
    /// Automatic restarts allowed per window before a process is `Failed`.
    #[serde(default = "default_restart_limit")]
    pub restart_limit: u32,
    #[serde(
        default = "default_restart_window",
        with = "duration_ms",
        rename = "restart_window_ms"
    )]
    pub restart_window: Duration,
    #[serde(
        default = "default_backoff_base",
        with = "duration_ms",
        rename = "backoff_base_ms"
    )]
    pub backoff_base: Duration,
    #[serde(
        default = "default_backoff_max",
        with = "duration_ms",
        rename = "backoff_max_ms"
    )]
    pub backoff_max: Duration,
}

fn default_interval() -> Duration {
    DEFAULT_INTERVAL
}

fn default_restart_limit() -> u32 {
    DEFAULT_RESTART_LIMIT
}

fn default_restart_window() -> Duration {
    DEFAULT_RESTART_WINDOW
}

fn default_backoff_base() -> Duration {
    DEFAULT_BACKOFF_BASE
}

fn default_backoff_max() -> Duration {
    DEFAULT_BACKOFF_MAX
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            restart_limit: default_restart_limit(),
            restart_window: default_restart_window(),
            backoff_base: default_backoff_base(),
            backoff_max: default_backoff_max(),
        }
    }
}

impl MonitorConfig {
    /// Wait before restart `n` (1-based): `backoff_base * 2^(n-1)`, capped.
    pub fn backoff_for(&self, restart: u32) -> Duration {
        let exponent = restart.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

/// Outcome of a monitor liveness check.
#[derive(Debug, Clone, PartialEq)]
pub enum Liveness {
    Alive,
    Dead(String),
    /// Another operation holds the supervisor; skip this tick.
    Busy,
    /// Not expected to be running; carries the current status.
    Idle(ServiceStatus),
}

/// A process the monitor may restart.
#[async_trait]
pub trait Supervised: Send + Sync {
    fn id(&self) -> &str;

    async fn liveness(&self) -> Liveness;

    async fn mark_failing(&self, restart_count: u32, last_error: String);

    async fn mark_failed(&self, reason: String);

    /// Restarts the process if it is still `Failing`; otherwise returns the
    /// status an operator left it in.
    async fn restart_failing(&self) -> Result<ServiceStatus, SupervisorError>;
}

/// A dependency whose offline queue the monitor may replay.
#[async_trait]
pub trait Recoverable: Send + Sync {
    fn name(&self) -> &str;

    fn breaker_state(&self) -> BreakerState;

    /// Breaker is open and its reset timeout has elapsed.
    fn probe_ready(&self) -> bool;

    fn queue_depth(&self) -> usize;

    async fn replay(&self) -> Result<ReplayReport, QueueError>;
}

pub trait MonitorObserver: Send + Sync {
    fn restart_scheduled(&self, process: &str, attempt: u32, delay: Duration);

    fn restarts_in_window(&self, process: &str, restarts: u32);
}

pub struct HealthMonitor {
    config: MonitorConfig,
    processes: Vec<Arc<dyn Supervised>>,
    dependencies: Vec<Arc<dyn Recoverable>>,
    observer: Option<Arc<dyn MonitorObserver>>,
    trackers: HashMap<String, RestartTracker>,
    failed: HashSet<String>,
    last_breaker: HashMap<String, BreakerState>,
    /// In-flight backoff-and-restart task per process.
    restarts: HashMap<String, JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            processes: Vec::new(),
            dependencies: Vec::new(),
            observer: None,
            trackers: HashMap::new(),
            failed: HashSet::new(),
            last_breaker: HashMap::new(),
            restarts: HashMap::new(),
        }
    }

    pub fn with_process(mut self, process: Arc<dyn Supervised>) -> Self {
        self.processes.push(process);
        self
    }

    pub fn with_dependency(mut self, dependency: Arc<dyn Recoverable>) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn MonitorObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Ticks until `shutdown` turns true (or its sender is dropped). Shutdown
    /// also aborts an in-flight tick and every pending restart.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval = ?self.config.interval,
            processes = self.processes.len(),
            dependencies = self.dependencies.len(),
            "health monitor started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = self.tick() => {}
                        _ = shutdown_requested(&mut shutdown) => break,
                    }
                }
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
        for (id, restart) in self.restarts.drain() {
            if !restart.is_finished() {
                tracing::debug!(process = %id, "cancelling pending restart");
                restart.abort();
            }
        }
        tracing::info!("health monitor stopped");
    }

    /// One monitoring pass over all processes, then all dependencies.
    ///
    /// Restarts it schedules keep running after the pass returns; see
    /// [`HealthMonitor::settle_restarts`].
    pub async fn tick(&mut self) {
        for process in self.processes.clone() {
            self.check_process(process).await;
        }
        for dependency in self.dependencies.clone() {
            self.check_dependency(dependency.as_ref()).await;
        }
    }

    /// Waits for every scheduled restart to finish.
    pub async fn settle_restarts(&mut self) {
        for (id, restart) in self.restarts.drain() {
            if let Err(e) = restart.await {
                tracing::warn!(process = %id, error = %e, "restart task ended abnormally");
            }
        }
    }

    /// True while a restart of `process` is waiting out its backoff or running.
    pub fn restart_pending(&self, process: &str) -> bool {
        self.restarts
            .get(process)
            .is_some_and(|restart| !restart.is_finished())
    }

    async fn check_process(&mut self, process: Arc<dyn Supervised>) {
        let id = process.id().to_string();
        if self.restart_pending(&id) {
            tracing::debug!(process = %id, "restart pending, skipping");
            return;
        }
        self.restarts.remove(&id);

        let liveness = process.liveness().await;

        match &liveness {
            Liveness::Busy => {
                tracing::debug!(process = %id, "supervisor busy, skipping");
                return;
            }
            Liveness::Idle(status) if status.is_failed() => return,
            _ => {}
        }

        // Anything other than Failed after we parked it means a manual reset.
        if self.failed.remove(&id) {
            tracing::info!(process = %id, "manual reset observed, clearing restart history");
            if let Some(tracker) = self.trackers.get_mut(&id) {
                tracker.reset();
            }
            self.report_restarts(&id, 0);
        }

        let Liveness::Dead(reason) = liveness else {
            if let Some(tracker) = self.trackers.get_mut(&id) {
                let count = tracker.count();
                self.report_restarts(&id, count);
            }
            return;
        };

        let (limit, window) = (self.config.restart_limit, self.config.restart_window);
        let tracker = self
            .trackers
            .entry(id.clone())
            .or_insert_with(|| RestartTracker::new(limit, window));

        match tracker.try_record() {
            Some(attempt) => {
                let delay = self.config.backoff_for(attempt);
                tracing::warn!(
                    process = %id,
                    %reason,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "process unhealthy, scheduling restart"
                );
                process.mark_failing(attempt, reason).await;
                self.report_restarts(&id, attempt);
                if let Some(observer) = &self.observer {
                    observer.restart_scheduled(&id, attempt, delay);
                }

                let task_id = id.clone();
                let restart = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    match process.restart_failing().await {
                        Ok(status) => tracing::info!(
                            process = %task_id,
                            status = status.label(),
                            "restart finished"
                        ),
                        Err(e) => tracing::warn!(process = %task_id, error = %e, "restart failed"),
                    }
                });
                self.restarts.insert(id, restart);
            }
            None => {
                let reason = format!(
                    "restarted {} times within {:?}; last error: {}",
                    limit, window, reason
                );
                tracing::error!(process = %id, %reason, "restart limit reached, giving up");
                process.mark_failed(reason).await;
                self.failed.insert(id);
            }
        }
    }

    async fn check_dependency(&mut self, dependency: &dyn Recoverable) {
        let name = dependency.name().to_string();
        let state = dependency.breaker_state();
        let previous = self.last_breaker.insert(name.clone(), state);
        if state == BreakerState::Closed
            && matches!(previous, Some(BreakerState::Open | BreakerState::HalfOpen))
        {
            tracing::info!(dependency = %name, "dependency recovered");
        }

        let depth = dependency.queue_depth();
        if depth == 0 {
            return;
        }
        let admits = match state {
            BreakerState::Closed => true,
            BreakerState::Open => dependency.probe_ready(),
            BreakerState::HalfOpen => false,
        };
        if !admits {
            return;
        }

        match dependency.replay().await {
            Ok(report) => tracing::debug!(
                dependency = %name,
                succeeded = report.succeeded,
                failed = report.failed,
                dead_lettered = report.dead_lettered,
                "monitor replay done"
            ),
            Err(QueueError::Closed) => {
                tracing::debug!(dependency = %name, "queue closed, replay skipped")
            }
            Err(e) => tracing::warn!(dependency = %name, error = %e, "replay failed"),
        }
    }

    fn report_restarts(&self, process: &str, restarts: u32) {
        if let Some(observer) = &self.observer {
            observer.restarts_in_window(process, restarts);
        }
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
#[path = "tests/monitor_tests.rs"]
mod tests;
