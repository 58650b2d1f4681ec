//! Circuit breaker for outbound dependencies.
//!
//! # State Transitions
//! ```text
//! Closed   → Open:     failure_count reaches failure_threshold
//! Open     → HalfOpen: reset_timeout elapsed since the last failure (one probe admitted)
//! HalfOpen → Closed:   the probe succeeds
//! HalfOpen → Open:     the probe fails (or is cancelled)
//! ```
//!
//! Admission decisions are taken under a synchronous lock that is released
//! before the wrapped operation is awaited.

use crate::serde_util::duration_ms;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Default number of consecutive failures before the breaker opens.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Default cooldown before a half-open probe is admitted.
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(30);

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation, calls pass through.
    Closed,
    /// Dependency assumed down, calls fail fast.
    Open,
    /// A single probe call is testing whether the dependency recovered.
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Tuning for one breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker. Default: 3
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Cooldown after the last failure before probing. Default: 30s
    #[serde(
        default = "default_reset_timeout",
        with = "duration_ms",
        rename = "reset_timeout_ms"
    )]
    pub reset_timeout: Duration,
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

fn default_reset_timeout() -> Duration {
    DEFAULT_RESET_TIMEOUT
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout: default_reset_timeout(),
        }
    }
}

/// Point-in-time view of a breaker, as published in snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub state: BreakerState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub last_failure: Option<DateTime<Utc>>,
    #[serde(with = "duration_ms", rename = "reset_timeout_ms")]
    pub reset_timeout: Duration,
    /// Calls admitted since construction.
    pub total_calls: u64,
    /// Admitted calls that failed.
    pub total_failures: u64,
    /// Calls rejected without invoking the operation.
    pub rejected_calls: u64,
}

impl CircuitBreakerState {
    /// A fresh, closed breaker view for the given configuration.
    pub fn closed(config: &BreakerConfig) -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            failure_threshold: config.failure_threshold,
            last_failure: None,
            reset_timeout: config.reset_timeout,
            total_calls: 0,
            total_failures: 0,
            rejected_calls: 0,
        }
    }
}

/// Receives every breaker change. Called while the breaker lock is held,
/// so implementations must not call back into the breaker.
pub trait BreakerObserver: Send + Sync {
    fn breaker_changed(&self, name: &str, previous: BreakerState, current: &CircuitBreakerState);
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug)]
pub enum BreakerError<E> {
    /// The breaker rejected the call without invoking the operation.
    CircuitOpen {
        breaker: String,
        /// Remaining cooldown, if the breaker is waiting for its reset timeout.
        retry_after: Option<Duration>,
    },
    /// The operation ran and failed.
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, BreakerError::CircuitOpen { .. })
    }

    pub fn inner(&self) -> Option<&E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            BreakerError::CircuitOpen { .. } => None,
        }
    }
}

impl<E: Display> Display for BreakerError<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerError::CircuitOpen {
                breaker,
                retry_after: Some(after),
            } => write!(
                f,
                "circuit '{}' is open (retry in {}ms)",
                breaker,
                after.as_millis()
            ),
            BreakerError::CircuitOpen { breaker, .. } => {
                write!(f, "circuit '{}' is open", breaker)
            }
            BreakerError::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BreakerError::Inner(e) => Some(e),
            BreakerError::CircuitOpen { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

struct Inner {
    view: CircuitBreakerState,
    last_failure_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Fault-isolation state machine wrapping any fallible async operation.
pub struct CircuitBreaker {
    name: String,
    inner: Mutex<Inner>,
    observer: Option<Arc<dyn BreakerObserver>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                view: CircuitBreakerState::closed(&config),
                last_failure_at: None,
                probe_in_flight: false,
            }),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn BreakerObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns a copy of the current breaker view.
    pub fn state(&self) -> CircuitBreakerState {
        self.lock().view.clone()
    }

    /// Returns the current breaker position.
    pub fn current(&self) -> BreakerState {
        self.lock().view.state
    }

    /// True when the breaker is open and its reset timeout has elapsed,
    /// i.e. the next call would be admitted as the half-open probe.
    pub fn ready_for_probe(&self) -> bool {
        let inner = self.lock();
        inner.view.state == BreakerState::Open && Self::cooldown_remaining(&inner).is_none()
    }

    /// Runs `op` under breaker protection.
    ///
    /// Fails fast with [`BreakerError::CircuitOpen`] when the breaker is open
    /// and cooling down, or when another caller holds the half-open probe.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = match self.admit() {
            Ok(admission) => admission,
            Err(retry_after) => {
                return Err(BreakerError::CircuitOpen {
                    breaker: self.name.clone(),
                    retry_after,
                })
            }
        };

        let mut permit = Permit {
            breaker: self,
            admission,
            settled: false,
        };
        let outcome = op().await;
        permit.settled = true;

        match outcome {
            Ok(value) => {
                self.record_success(admission);
                Ok(value)
            }
            Err(e) => {
                self.record_failure(admission);
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Manually closes the breaker and clears the failure count.
    pub fn reset(&self) {
        let mut inner = self.lock();
        let previous = inner.view.state;
        inner.view.state = BreakerState::Closed;
        inner.view.failure_count = 0;
        inner.last_failure_at = None;
        inner.probe_in_flight = false;
        tracing::info!(breaker = %self.name, "circuit manually reset");
        self.notify(previous, &inner.view);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cooldown_remaining(inner: &Inner) -> Option<Duration> {
        let last = inner.last_failure_at?;
        let elapsed = Instant::now().saturating_duration_since(last);
        if elapsed >= inner.view.reset_timeout {
            None
        } else {
            Some(inner.view.reset_timeout - elapsed)
        }
    }

    /// Decides whether a call may proceed. `Err` carries the remaining cooldown.
    fn admit(&self) -> Result<Admission, Option<Duration>> {
        let mut inner = self.lock();
        match inner.view.state {
            BreakerState::Closed => {
                inner.view.total_calls += 1;
                Ok(Admission::Normal)
            }
            BreakerState::HalfOpen => {
                inner.view.rejected_calls += 1;
                Err(None)
            }
            BreakerState::Open => match Self::cooldown_remaining(&inner) {
                Some(remaining) => {
                    inner.view.rejected_calls += 1;
                    Err(Some(remaining))
                }
                None => {
                    inner.view.state = BreakerState::HalfOpen;
                    inner.view.total_calls += 1;
                    inner.probe_in_flight = true;
                    tracing::info!(breaker = %self.name, "attempting recovery (half-open)");
                    self.notify(BreakerState::Open, &inner.view);
                    Ok(Admission::Probe)
                }
            },
        }
    }

    fn record_success(&self, admission: Admission) {
        let mut inner = self.lock();
        let previous = inner.view.state;
        inner.view.failure_count = 0;
        if admission == Admission::Probe {
            inner.probe_in_flight = false;
            if previous == BreakerState::HalfOpen {
                inner.view.state = BreakerState::Closed;
                tracing::info!(breaker = %self.name, "circuit closed after successful probe");
            }
        }
        self.notify(previous, &inner.view);
    }

    fn record_failure(&self, admission: Admission) {
        let mut inner = self.lock();
        let previous = inner.view.state;
        inner.view.failure_count = inner.view.failure_count.saturating_add(1);
        inner.view.total_failures += 1;
        inner.view.last_failure = Some(Utc::now());
        inner.last_failure_at = Some(Instant::now());

        match (admission, previous) {
            (Admission::Probe, _) => {
                inner.probe_in_flight = false;
                inner.view.state = BreakerState::Open;
                tracing::warn!(breaker = %self.name, "circuit reopened after failed probe");
            }
            (Admission::Normal, BreakerState::Closed)
                if inner.view.failure_count >= inner.view.failure_threshold =>
            {
                inner.view.state = BreakerState::Open;
                tracing::warn!(
                    breaker = %self.name,
                    failures = inner.view.failure_count,
                    "circuit opened"
                );
            }
            _ => {}
        }
        self.notify(previous, &inner.view);
    }

    /// The probe future was dropped before it produced an outcome.
    fn abandon_probe(&self) {
        let mut inner = self.lock();
        if inner.view.state == BreakerState::HalfOpen && inner.probe_in_flight {
            inner.probe_in_flight = false;
            inner.view.state = BreakerState::Open;
            tracing::debug!(breaker = %self.name, "probe cancelled, circuit back to open");
            self.notify(BreakerState::HalfOpen, &inner.view);
        }
    }

    fn notify(&self, previous: BreakerState, current: &CircuitBreakerState) {
        if let Some(observer) = &self.observer {
            observer.breaker_changed(&self.name, previous, current);
        }
    }
}

/// RAII guard that returns an unsettled probe to the breaker on drop.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Probe {
            self.breaker.abandon_probe();
        }
    }
}

#[cfg(test)]
#[path = "tests/breaker_tests.rs"]
mod tests;
