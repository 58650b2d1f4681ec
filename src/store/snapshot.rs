use crate::resilience::CircuitBreakerState;
use crate::supervisor::{Health, ServiceStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessView {
    pub status: ServiceStatus,
    pub health: Health,
    /// Automatic restarts inside the current restart window.
    pub restarts_in_window: u32,
}

impl ProcessView {
    pub fn stopped() -> Self {
        Self {
            status: ServiceStatus::Stopped,
            health: Health::Unknown,
            restarts_in_window: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyView {
    pub breaker: CircuitBreakerState,
    pub queue_depth: usize,
    pub dead_lettered: usize,
    pub last_error: Option<String>,
}

impl DependencyView {
    pub fn new(breaker: CircuitBreakerState) -> Self {
        Self {
            breaker,
            queue_depth: 0,
            dead_lettered: 0,
            last_error: None,
        }
    }
}

/// Immutable view of the whole core, published after every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSnapshot {
    /// Increases by exactly one per mutation.
    pub version: u64,
    pub taken_at: DateTime<Utc>,
    pub processes: BTreeMap<String, ProcessView>,
    pub dependencies: BTreeMap<String, DependencyView>,
}

impl AppSnapshot {
    pub fn empty() -> Self {
        Self {
            version: 0,
            taken_at: Utc::now(),
            processes: BTreeMap::new(),
            dependencies: BTreeMap::new(),
        }
    }

    pub fn process(&self, id: &str) -> Option<&ProcessView> {
        self.processes.get(id)
    }

    pub fn dependency(&self, id: &str) -> Option<&DependencyView> {
        self.dependencies.get(id)
    }
}
