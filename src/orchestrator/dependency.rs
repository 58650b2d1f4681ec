//! One outbound dependency: its breaker, retry policy, offline queue and
//! transport, owned together.

use super::error::CoreError;
use crate::monitor::Recoverable;
use crate::queue::{DeadLetter, DeliveryOutcome, OfflineQueue, QueueError, ReplayReport};
use crate::resilience::{BreakerError, BreakerState, CircuitBreaker, RetryError, RetryPolicy};
use crate::store::StateStore;
use crate::transport::{Response, Transport, TransportError};
use async_trait::async_trait;
use std::sync::Arc;

pub struct Dependency {
    name: String,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    queue: OfflineQueue,
    transport: Arc<dyn Transport>,
    store: Arc<StateStore>,
}

impl Dependency {
    pub(crate) fn new(
        name: String,
        breaker: CircuitBreaker,
        retry: RetryPolicy,
        queue: OfflineQueue,
        transport: Arc<dyn Transport>,
        store: Arc<StateStore>,
    ) -> Self {
        Self {
            name,
            breaker,
            retry,
            queue,
            transport,
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    /// Sends `payload` through the breaker with retries.
    ///
    /// A transient failure that opens the breaker (or a call the breaker
    /// rejected outright) parks the payload in the offline queue.
    /// Permanent failures are returned as-is and never queued.
    pub async fn call(&self, payload: Vec<u8>) -> Result<Response, CoreError> {
        let transport = &self.transport;
        let body = &payload;
        let result = self
            .retry
            .execute(&self.breaker, TransportError::is_transient, move || {
                transport.send(body)
            })
            .await;

        match result {
            Ok(response) => {
                self.store.record_dependency_error(&self.name, None);
                Ok(response)
            }
            Err(failure) => {
                self.store
                    .record_dependency_error(&self.name, Some(failure.to_string()));
                self.handle_failure(failure, payload).await
            }
        }
    }

    async fn handle_failure(
        &self,
        failure: RetryError<TransportError>,
        payload: Vec<u8>,
    ) -> Result<Response, CoreError> {
        let RetryError {
            cause,
            attempts,
            transient,
            breaker_tripped,
        } = failure;

        let message = match &cause {
            BreakerError::Inner(e) => e.message().to_string(),
            rejected => rejected.to_string(),
        };
        let should_queue = match &cause {
            BreakerError::CircuitOpen { .. } => true,
            BreakerError::Inner(_) => transient && breaker_tripped,
        };
        let enqueued = if should_queue {
            let enqueued = self
                .queue
                .enqueue(payload, Some(message.clone()))
                .await
                .map_err(|source| {
                    tracing::error!(
                        dependency = %self.name,
                        transport = %self.transport.describe(),
                        error = %source,
                        "failed to persist undeliverable request"
                    );
                    CoreError::Storage {
                        dependency: self.name.clone(),
                        source,
                    }
                })?;
            Some(enqueued)
        } else {
            None
        };

        if let Some(enqueued) = &enqueued {
            if !enqueued.evicted.is_empty() {
                return Err(CoreError::QueueFull {
                    dependency: self.name.clone(),
                    message,
                    attempts,
                    queued: enqueued.request.id,
                    evicted: enqueued.evicted.clone(),
                });
            }
        }
        let queued = enqueued.map(|e| e.request.id);

        Err(match cause {
            BreakerError::CircuitOpen { retry_after, .. } => CoreError::CircuitOpen {
                dependency: self.name.clone(),
                attempts,
                retry_after,
                queued,
            },
            BreakerError::Inner(_) if transient => CoreError::Transient {
                dependency: self.name.clone(),
                message,
                attempts,
                circuit_opened: breaker_tripped,
                queued,
            },
            BreakerError::Inner(_) => CoreError::Permanent {
                dependency: self.name.clone(),
                message,
                attempts,
            },
        })
    }

    /// Replays the offline queue, one breaker-guarded attempt per entry.
    pub async fn replay(&self) -> Result<ReplayReport, QueueError> {
        let transport = &self.transport;
        self.queue
            .replay_all(move |request| async move {
                let outcome = self
                    .breaker
                    .call(|| transport.send(&request.payload))
                    .await;
                match outcome {
                    Ok(_) => DeliveryOutcome::Delivered,
                    Err(e @ BreakerError::CircuitOpen { .. }) => {
                        DeliveryOutcome::Rejected(e.to_string())
                    }
                    Err(BreakerError::Inner(e)) => DeliveryOutcome::Failed(e.to_string()),
                }
            })
            .await
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        self.queue.dead_letters().await
    }
}

#[async_trait]
impl Recoverable for Dependency {
    fn name(&self) -> &str {
        &self.name
    }

    fn breaker_state(&self) -> BreakerState {
        self.breaker.current()
    }

    fn probe_ready(&self) -> bool {
        self.breaker.ready_for_probe()
    }

    fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    async fn replay(&self) -> Result<ReplayReport, QueueError> {
        Dependency::replay(self).await
    }
}

#[cfg(test)]
#[path = "tests/dependency_tests.rs"]
mod tests;
