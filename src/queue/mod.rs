//! Durable offline queue for outbound requests that could not be delivered.
//!
//! Entries are written ahead to a [`QueueStore`] before `enqueue` returns and
//! are replayed in FIFO order once the dependency recovers. Entries that
//! exhaust their attempts, or are evicted because the queue is full, are
//! moved to a dead-letter log instead of being dropped.

pub mod offline;
pub mod store;

pub use offline::{OfflineQueue, QueueConfig};
pub use store::{FileQueueStore, MemoryQueueStore, QueueStore};

use crate::serde_util::base64_bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// One undelivered outbound request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub id: Uuid,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Error text of the most recent failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueuedRequest {
    pub fn new(payload: Vec<u8>, max_attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            enqueued_at: Utc::now(),
            attempt_count: 0,
            max_attempts,
            last_error: None,
        }
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    AttemptsExhausted,
    QueueFull,
}

impl Display for DeadLetterReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DeadLetterReason::AttemptsExhausted => write!(f, "attempts exhausted"),
            DeadLetterReason::QueueFull => write!(f, "queue full"),
        }
    }
}

/// A request that will never be replayed automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub request: QueuedRequest,
    pub reason: DeadLetterReason,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Result of [`OfflineQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    pub request: QueuedRequest,
    /// Older entries dead-lettered with `QueueFull` to make room.
    pub evicted: Vec<Uuid>,
}

/// What a replay delivery attempt reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// The attempt ran and failed; counts against `max_attempts`.
    Failed(String),
    /// The dependency refused to accept calls (open breaker); replay stops
    /// without counting an attempt.
    Rejected(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub succeeded: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

impl ReplayReport {
    pub fn is_empty(&self) -> bool {
        self.succeeded == 0 && self.failed == 0 && self.dead_lettered == 0
    }
}

#[derive(Debug)]
pub enum QueueError {
    Io(std::io::Error),
    Corrupt(String),
    /// The queue was closed for shutdown.
    Closed,
}

impl Display for QueueError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Io(e) => write!(f, "queue storage error: {}", e),
            QueueError::Corrupt(msg) => write!(f, "queue journal is corrupt: {}", msg),
            QueueError::Closed => write!(f, "queue is closed"),
        }
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            QueueError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for QueueError {
    fn from(e: std::io::Error) -> Self {
        QueueError::Io(e)
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        QueueError::Corrupt(e.to_string())
    }
}

/// Notified of queue-depth changes and dead-lettering.
pub trait QueueObserver: Send + Sync {
    fn queue_changed(&self, dependency: &str, depth: usize, dead_lettered: usize);

    fn request_queued(&self, _dependency: &str, _request: &QueuedRequest) {}

    fn request_dead_lettered(&self, _dependency: &str, _letter: &DeadLetter) {}

    fn replay_completed(&self, _dependency: &str, _report: &ReplayReport) {}
}
