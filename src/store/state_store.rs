//! Single source of truth for process and dependency state.
//!
//! Every mutation runs under one synchronous lock, bumps the version, and
//! publishes the new snapshot (and any events) before the lock is released,
//! so subscribers observe changes in mutation order.

use super::events::CoreEvent;
use super::snapshot::{AppSnapshot, DependencyView, ProcessView};
use crate::monitor::MonitorObserver;
use crate::queue::{DeadLetter, QueueObserver, QueuedRequest, ReplayReport};
use crate::resilience::{BreakerObserver, BreakerState, CircuitBreakerState};
use crate::supervisor::{Health, ServiceStatus, StatusObserver};
use chrono::Utc;
use futures::Stream;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// Buffered events per lagging subscriber before it starts missing some.
pub const EVENT_CAPACITY: usize = 256;

#[derive(Default)]
struct CoreState {
    version: u64,
    processes: BTreeMap<String, ProcessView>,
    dependencies: BTreeMap<String, DependencyView>,
}

impl CoreState {
    fn to_snapshot(&self) -> AppSnapshot {
        AppSnapshot {
            version: self.version,
            taken_at: Utc::now(),
            processes: self.processes.clone(),
            dependencies: self.dependencies.clone(),
        }
    }
}

pub struct StateStore {
    state: Mutex<CoreState>,
    snapshot_tx: watch::Sender<Arc<AppSnapshot>>,
    event_tx: broadcast::Sender<CoreEvent>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(AppSnapshot::empty()));
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(CoreState::default()),
            snapshot_tx,
            event_tx,
        }
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<AppSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    /// Yields the current snapshot immediately, then every later one in
    /// order. A slow consumer skips intermediates but always sees the latest.
    pub fn subscribe(&self) -> impl Stream<Item = Arc<AppSnapshot>> + Send + 'static {
        let rx = self.snapshot_tx.subscribe();
        futures::stream::unfold((rx, true), |(mut rx, first)| async move {
            if !first && rx.changed().await.is_err() {
                return None;
            }
            let snapshot = rx.borrow_and_update().clone();
            Some((snapshot, (rx, false)))
        })
    }

    pub fn events(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_tx.subscribe()
    }

    pub fn register_process(&self, id: &str) {
        self.mutate(Vec::new(), |state| {
            state
                .processes
                .insert(id.to_string(), ProcessView::stopped());
            true
        });
    }

    pub fn register_dependency(&self, id: &str, breaker: CircuitBreakerState) {
        self.mutate(Vec::new(), |state| {
            state
                .dependencies
                .insert(id.to_string(), DependencyView::new(breaker));
            true
        });
    }

    /// Records the outcome of the latest outbound call; `None` clears it.
    pub fn record_dependency_error(&self, dependency: &str, error: Option<String>) {
        self.mutate(Vec::new(), |state| {
            let Some(view) = state.dependencies.get_mut(dependency) else {
                return false;
            };
            if view.last_error == error {
                return false;
            }
            view.last_error = error;
            true
        });
    }

    /// Publishes an event that carries no state change.
    pub fn publish(&self, event: CoreEvent) {
        let _state = self.lock();
        let _ = self.event_tx.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Applies `apply`; when it reports a change, bumps the version and
    /// publishes the snapshot and `events` while still holding the lock.
    fn mutate<F>(&self, events: Vec<CoreEvent>, apply: F)
    where
        F: FnOnce(&mut CoreState) -> bool,
    {
        let mut state = self.lock();
        if !apply(&mut state) {
            return;
        }
        state.version += 1;
        self.snapshot_tx.send_replace(Arc::new(state.to_snapshot()));
        for event in events {
            // No subscribers is not an error.
            let _ = self.event_tx.send(event);
        }
    }
}

impl StatusObserver for StateStore {
    fn status_changed(&self, process: &str, previous: &ServiceStatus, current: &ServiceStatus) {
        let mut events = vec![CoreEvent::ProcessStatusChanged {
            process: process.to_string(),
            from: previous.clone(),
            to: current.clone(),
        }];
        if let ServiceStatus::Failed { reason } = current {
            events.push(CoreEvent::ProcessFailed {
                process: process.to_string(),
                reason: reason.clone(),
            });
        }
        self.mutate(events, |state| {
            let view = state
                .processes
                .entry(process.to_string())
                .or_insert_with(ProcessView::stopped);
            view.status = current.clone();
            if !current.is_supervised() {
                view.health = Health::Unknown;
            }
            true
        });
    }

    fn health_changed(&self, process: &str, health: Health) {
        self.mutate(Vec::new(), |state| match state.processes.get_mut(process) {
            Some(view) if view.health != health => {
                view.health = health;
                true
            }
            _ => false,
        });
    }
}

impl BreakerObserver for StateStore {
    fn breaker_changed(&self, name: &str, previous: BreakerState, current: &CircuitBreakerState) {
        let events = if previous != current.state {
            vec![CoreEvent::BreakerTransition {
                dependency: name.to_string(),
                from: previous,
                to: current.state,
            }]
        } else {
            Vec::new()
        };
        self.mutate(events, |state| {
            let view = state
                .dependencies
                .entry(name.to_string())
                .or_insert_with(|| DependencyView::new(current.clone()));
            if view.breaker == *current {
                return false;
            }
            view.breaker = current.clone();
            true
        });
    }
}

impl QueueObserver for StateStore {
    fn queue_changed(&self, dependency: &str, depth: usize, dead_lettered: usize) {
        self.mutate(Vec::new(), |state| match state.dependencies.get_mut(dependency) {
            Some(view) if view.queue_depth != depth || view.dead_lettered != dead_lettered => {
                view.queue_depth = depth;
                view.dead_lettered = dead_lettered;
                true
            }
            _ => false,
        });
    }

    fn request_queued(&self, dependency: &str, request: &QueuedRequest) {
        self.publish(CoreEvent::RequestQueued {
            dependency: dependency.to_string(),
            id: request.id,
        });
    }

    fn request_dead_lettered(&self, dependency: &str, letter: &DeadLetter) {
        self.publish(CoreEvent::RequestDeadLettered {
            dependency: dependency.to_string(),
            id: letter.request.id,
            reason: letter.reason,
        });
    }

    fn replay_completed(&self, dependency: &str, report: &ReplayReport) {
        self.publish(CoreEvent::ReplayCompleted {
            dependency: dependency.to_string(),
            report: *report,
        });
    }
}

impl MonitorObserver for StateStore {
    fn restart_scheduled(&self, process: &str, attempt: u32, delay: Duration) {
        self.publish(CoreEvent::RestartScheduled {
            process: process.to_string(),
            attempt,
            delay_ms: delay.as_millis() as u64,
        });
    }

    fn restarts_in_window(&self, process: &str, restarts: u32) {
        self.mutate(Vec::new(), |state| match state.processes.get_mut(process) {
            Some(view) if view.restarts_in_window != restarts => {
                view.restarts_in_window = restarts;
                true
            }
            _ => false,
        });
    }
}

#[cfg(test)]
#[path = "tests/state_store_tests.rs"]
mod tests;
