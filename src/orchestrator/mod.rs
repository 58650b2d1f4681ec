//! The façade collaborators use: process commands, outbound calls, state
//! snapshots and events. Every mutation flows through the [`StateStore`].
//!
//! ```text
//! caller ──> Orchestrator ──> SupervisorHandle ──> ProcessSupervisor
//!                 │
//!                 └──> Dependency ──> RetryPolicy ──> CircuitBreaker ──> Transport
//!                                         └─ on failure ──> OfflineQueue
//! HealthMonitor ──> restarts / replays
//! all of the above ──> StateStore ──> snapshots + CoreEvents
//! ```

mod builder;
mod dependency;
mod error;

pub use builder::{DependencyEntry, OrchestratorBuilder, ProcessEntry};
pub use dependency::Dependency;
pub use error::CoreError;

use crate::monitor::{HealthMonitor, MonitorConfig};
use crate::queue::{DeadLetter, QueueError, ReplayReport};
use crate::resilience::CircuitBreakerState;
use crate::store::{AppSnapshot, CoreEvent, StateStore};
use crate::supervisor::{ProcessSpec, ServiceStatus, SupervisorError, SupervisorHandle};
use crate::transport::Response;
use futures::Stream;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

pub(crate) struct ManagedProcess {
    handle: SupervisorHandle,
    spec: ProcessSpec,
    autostart: bool,
}

pub struct Orchestrator {
    store: Arc<StateStore>,
    processes: BTreeMap<String, ManagedProcess>,
    dependencies: BTreeMap<String, Arc<Dependency>>,
    monitor_config: MonitorConfig,
    shutdown_tx: watch::Sender<bool>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn get_snapshot(&self) -> Arc<AppSnapshot> {
        self.store.snapshot()
    }

    /// Current snapshot first, then every later one in mutation order.
    pub fn subscribe(&self) -> impl Stream<Item = Arc<AppSnapshot>> + Send + 'static {
        self.store.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<CoreEvent> {
        self.store.events()
    }

    pub fn process_ids(&self) -> impl Iterator<Item = &str> {
        self.processes.keys().map(String::as_str)
    }

    pub fn dependency_ids(&self) -> impl Iterator<Item = &str> {
        self.dependencies.keys().map(String::as_str)
    }

    /// Starts the process. Starting one that is already up returns its
    /// current status.
    pub async fn request_start(&self, id: &str) -> Result<ServiceStatus, CoreError> {
        let process = self.process(id)?;
        let mut supervisor = process.handle.lock().await;
        match supervisor.start(process.spec.clone()).await {
            Ok(status) => Ok(status),
            Err(SupervisorError::AlreadyRunning(status)) => Ok(status),
            Err(source) => Err(supervisor_error(id, source)),
        }
    }

    /// Stops the process; also clears a `Failed` status.
    pub async fn request_stop(&self, id: &str) -> Result<ServiceStatus, CoreError> {
        let process = self.process(id)?;
        let mut supervisor = process.handle.lock().await;
        supervisor
            .stop(process.handle.stop_timeout())
            .await
            .map_err(|source| supervisor_error(id, source))?;
        Ok(supervisor.status().clone())
    }

    /// Manual reset (if `Failed`), stop, then start.
    pub async fn request_restart(&self, id: &str) -> Result<ServiceStatus, CoreError> {
        let process = self.process(id)?;
        let mut supervisor = process.handle.lock().await;
        supervisor.reset();
        supervisor
            .stop(process.handle.stop_timeout())
            .await
            .map_err(|source| supervisor_error(id, source))?;
        supervisor
            .start(process.spec.clone())
            .await
            .map_err(|source| supervisor_error(id, source))
    }

    /// Starts every process configured for autostart, in id order.
    pub async fn start_autostart(&self) -> Vec<(String, Result<ServiceStatus, CoreError>)> {
        let mut results = Vec::new();
        for (id, process) in &self.processes {
            if process.autostart {
                results.push((id.clone(), self.request_start(id).await));
            }
        }
        results
    }

    /// Sends `payload` to a dependency through its breaker and retry policy.
    /// A success while requests are queued kicks off a background replay.
    pub async fn dependency_call(&self, id: &str, payload: Vec<u8>) -> Result<Response, CoreError> {
        let dependency = self.dependency(id)?;
        let response = dependency.call(payload).await?;
        if dependency.queue().depth() > 0 && !*self.shutdown_tx.borrow() {
            let dependency = dependency.clone();
            tokio::spawn(async move {
                match dependency.replay().await {
                    Ok(_) | Err(QueueError::Closed) => {}
                    Err(e) => {
                        tracing::warn!(dependency = dependency.name(), error = %e, "replay failed")
                    }
                }
            });
        }
        Ok(response)
    }

    pub async fn replay(&self, id: &str) -> Result<ReplayReport, CoreError> {
        let dependency = self.dependency(id)?;
        dependency
            .replay()
            .await
            .map_err(|source| CoreError::Storage {
                dependency: id.to_string(),
                source,
            })
    }

    pub async fn dead_letters(&self, id: &str) -> Result<Vec<DeadLetter>, CoreError> {
        let dependency = self.dependency(id)?;
        dependency
            .dead_letters()
            .await
            .map_err(|source| CoreError::Storage {
                dependency: id.to_string(),
                source,
            })
    }

    /// Forces the dependency's breaker back to `Closed`.
    pub fn reset_breaker(&self, id: &str) -> Result<CircuitBreakerState, CoreError> {
        let dependency = self.dependency(id)?;
        dependency.breaker().reset();
        Ok(dependency.breaker().state())
    }

    /// Starts the health monitor. Returns false if it is already running.
    pub fn spawn_monitor(&self) -> bool {
        let mut task = self.monitor_task();
        if task.is_some() {
            return false;
        }

        let mut monitor =
            HealthMonitor::new(self.monitor_config.clone()).with_observer(self.store.clone());
        for process in self.processes.values() {
            monitor = monitor.with_process(Arc::new(process.handle.clone()));
        }
        for dependency in self.dependencies.values() {
            monitor = monitor.with_dependency(dependency.clone());
        }
        *task = Some(tokio::spawn(monitor.run(self.shutdown_tx.subscribe())));
        true
    }

    /// Cancels the monitor, lets in-flight replays finish their current
    /// entry, then stops every process. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);

        let task = self.monitor_task().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "health monitor task ended abnormally");
            }
        }

        for dependency in self.dependencies.values() {
            dependency.queue().close_and_wait().await;
        }

        let stops = self.processes.iter().map(|(id, process)| async move {
            let mut supervisor = process.handle.lock().await;
            if let Err(e) = supervisor.stop(process.handle.stop_timeout()).await {
                tracing::warn!(process = %id, error = %e, "stop during shutdown failed");
            }
        });
        futures::future::join_all(stops).await;
        tracing::info!("orchestrator shut down");
    }

    fn process(&self, id: &str) -> Result<&ManagedProcess, CoreError> {
        self.processes
            .get(id)
            .ok_or_else(|| CoreError::UnknownProcess(id.to_string()))
    }

    fn dependency(&self, id: &str) -> Result<&Arc<Dependency>, CoreError> {
        self.dependencies
            .get(id)
            .ok_or_else(|| CoreError::UnknownDependency(id.to_string()))
    }

    fn monitor_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.monitor_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn supervisor_error(process: &str, source: SupervisorError) -> CoreError {
    CoreError::Supervisor {
        process: process.to_string(),
        source,
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/orchestrator_tests.rs"]
mod tests;
