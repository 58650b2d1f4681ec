use super::store::QueueStore;
use super::{
    DeadLetter, DeadLetterReason, DeliveryOutcome, Enqueued, QueueError, QueueObserver,
    QueuedRequest, ReplayReport,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const DEFAULT_MAX_SIZE: usize = 1000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Entries kept before the oldest are dead-lettered. Default: 1000
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Replay attempts per entry before it is dead-lettered. Default: 3
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_size() -> usize {
    DEFAULT_MAX_SIZE
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Per-dependency queue of undelivered requests.
///
/// `entries` mirrors the durable store; every change is written to the store
/// first and applied to the mirror only once the write succeeded.
pub struct OfflineQueue {
    dependency: String,
    store: Arc<dyn QueueStore>,
    config: QueueConfig,
    observer: Option<Arc<dyn QueueObserver>>,
    entries: Mutex<VecDeque<QueuedRequest>>,
    replay_lock: Mutex<()>,
    depth: AtomicUsize,
    dead_lettered: AtomicUsize,
    closing: AtomicBool,
}

impl OfflineQueue {
    /// Loads any entries persisted by a previous run.
    pub async fn open(
        dependency: impl Into<String>,
        store: Arc<dyn QueueStore>,
        config: QueueConfig,
        observer: Option<Arc<dyn QueueObserver>>,
    ) -> Result<Self, QueueError> {
        let dependency = dependency.into();
        let entries: VecDeque<QueuedRequest> = store.load().await?.into();
        let dead_lettered = store.dead_letters().await?.len();
        if !entries.is_empty() {
            tracing::info!(
                dependency = %dependency,
                pending = entries.len(),
                "restored offline queue"
            );
        }

        let queue = Self {
            dependency,
            store,
            config,
            observer,
            depth: AtomicUsize::new(entries.len()),
            entries: Mutex::new(entries),
            replay_lock: Mutex::new(()),
            dead_lettered: AtomicUsize::new(dead_lettered),
            closing: AtomicBool::new(false),
        };
        queue.publish_depth();
        Ok(queue)
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn dead_lettered(&self) -> usize {
        self.dead_lettered.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Live entries, oldest first.
    pub async fn pending(&self) -> Vec<QueuedRequest> {
        self.entries.lock().await.iter().cloned().collect()
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        self.store.dead_letters().await
    }

    /// Durably appends `payload`. Overflow dead-letters the oldest entries.
    pub async fn enqueue(
        &self,
        payload: Vec<u8>,
        last_error: Option<String>,
    ) -> Result<Enqueued, QueueError> {
        let mut request = QueuedRequest::new(payload, self.config.max_attempts);
        request.last_error = last_error;

        let mut entries = self.entries.lock().await;
        self.store.append(&request).await?;
        entries.push_back(request.clone());
        tracing::info!(
            dependency = %self.dependency,
            id = %request.id,
            depth = entries.len(),
            "queued request for later delivery"
        );
        if let Some(observer) = &self.observer {
            observer.request_queued(&self.dependency, &request);
        }

        let mut evicted = Vec::new();
        while entries.len() > self.config.max_size {
            let Some(oldest) = entries.front().cloned() else {
                break;
            };
            let id = oldest.id;
            self.bury(oldest, DeadLetterReason::QueueFull).await?;
            entries.pop_front();
            evicted.push(id);
        }
        self.set_depth(entries.len());
        Ok(Enqueued { request, evicted })
    }

    /// Delivers queued entries oldest-first until the queue drains, `deliver`
    /// reports a rejection, or the queue is closed.
    ///
    /// Only entries present when the replay starts are attempted, each at
    /// most once per replay. Fails with [`QueueError::Closed`] when the queue
    /// was closed before the replay began.
    pub async fn replay_all<F, Fut>(&self, mut deliver: F) -> Result<ReplayReport, QueueError>
    where
        F: FnMut(QueuedRequest) -> Fut,
        Fut: Future<Output = DeliveryOutcome>,
    {
        let _replay = self.replay_lock.lock().await;
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        let mut report = ReplayReport::default();
        let pending: Vec<Uuid> = self.entries.lock().await.iter().map(|r| r.id).collect();
        if pending.is_empty() {
            return Ok(report);
        }
        tracing::info!(dependency = %self.dependency, pending = pending.len(), "replaying offline queue");

        for id in pending {
            if self.is_closed() {
                tracing::info!(dependency = %self.dependency, "queue closed, stopping replay");
                break;
            }
            let Some(request) = self.find(id).await else {
                // Evicted while an earlier entry was being delivered.
                continue;
            };

            match deliver(request).await {
                DeliveryOutcome::Delivered => {
                    let mut entries = self.entries.lock().await;
                    self.store.remove(id).await?;
                    entries.retain(|r| r.id != id);
                    self.set_depth(entries.len());
                    report.succeeded += 1;
                }
                DeliveryOutcome::Rejected(reason) => {
                    tracing::debug!(dependency = %self.dependency, %reason, "replay rejected, stopping");
                    break;
                }
                DeliveryOutcome::Failed(error) => {
                    let mut entries = self.entries.lock().await;
                    let Some(pos) = entries.iter().position(|r| r.id == id) else {
                        continue;
                    };
                    let mut updated = entries[pos].clone();
                    updated.attempt_count = updated.attempt_count.saturating_add(1);
                    updated.last_error = Some(error);

                    if updated.attempts_exhausted() {
                        self.bury(updated, DeadLetterReason::AttemptsExhausted)
                            .await?;
                        entries.remove(pos);
                        self.set_depth(entries.len());
                        report.dead_lettered += 1;
                    } else {
                        self.store.update(&updated).await?;
                        entries[pos] = updated;
                        report.failed += 1;
                    }
                }
            }
        }

        tracing::info!(
            dependency = %self.dependency,
            succeeded = report.succeeded,
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            "replay finished"
        );
        if let Some(observer) = &self.observer {
            observer.replay_completed(&self.dependency, &report);
        }
        Ok(report)
    }

    /// Lets an in-flight replay finish its current entry, then stops it.
    /// Enqueue keeps working so late failures are still persisted.
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    /// `close`, then waits for an in-flight replay to settle its current entry.
    pub async fn close_and_wait(&self) {
        self.close();
        let _replay = self.replay_lock.lock().await;
    }

    async fn find(&self, id: Uuid) -> Option<QueuedRequest> {
        self.entries
            .lock()
            .await
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Writes a dead letter. The caller removes the entry from the mirror.
    async fn bury(&self, request: QueuedRequest, reason: DeadLetterReason) -> Result<(), QueueError> {
        let letter = DeadLetter {
            request,
            reason,
            dead_lettered_at: Utc::now(),
        };
        self.store.dead_letter(&letter).await?;
        self.dead_lettered.fetch_add(1, Ordering::SeqCst);
        tracing::warn!(
            dependency = %self.dependency,
            id = %letter.request.id,
            %reason,
            attempts = letter.request.attempt_count,
            "request dead-lettered"
        );
        if let Some(observer) = &self.observer {
            observer.request_dead_lettered(&self.dependency, &letter);
        }
        Ok(())
    }

    fn set_depth(&self, depth: usize) {
        self.depth.store(depth, Ordering::SeqCst);
        self.publish_depth();
    }

    fn publish_depth(&self) {
        if let Some(observer) = &self.observer {
            observer.queue_changed(&self.dependency, self.depth(), self.dead_lettered());
        }
    }
}

#[cfg(test)]
#[path = "tests/offline_tests.rs"]
mod tests;
