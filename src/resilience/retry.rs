//! Retry with exponential backoff, layered on top of a circuit breaker.

use super::breaker::{BreakerError, CircuitBreaker};
use crate::serde_util::duration_ms;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::time::Duration;

/// Default total number of attempts.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one. Default: 3
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(
        default = "default_base_delay",
        with = "duration_ms",
        rename = "base_delay_ms"
    )]
    pub base_delay: Duration,
    #[serde(
        default = "default_max_delay",
        with = "duration_ms",
        rename = "max_delay_ms"
    )]
    pub max_delay: Duration,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_base_delay() -> Duration {
    DEFAULT_BASE_DELAY
}

fn default_max_delay() -> Duration {
    DEFAULT_MAX_DELAY
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
        }
    }
}

/// Terminal failure of [`RetryPolicy::execute`].
#[derive(Debug)]
pub struct RetryError<E> {
    /// The last error observed. `CircuitOpen` only when the breaker
    /// rejected the call before the operation ever ran.
    pub cause: BreakerError<E>,
    /// Number of times the operation actually ran.
    pub attempts: u32,
    /// False when the caller's predicate classified the cause as permanent.
    pub transient: bool,
    /// The last attempt's failure left the breaker open.
    pub breaker_tripped: bool,
}

impl<E> RetryError<E> {
    pub fn breaker_rejected(&self) -> bool {
        self.cause.is_circuit_open()
    }

    /// The breaker either rejected the call or was opened by it.
    pub fn breaker_involved(&self) -> bool {
        self.breaker_rejected() || self.breaker_tripped
    }
}

impl<E: Display> Display for RetryError<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (after {} attempt(s)", self.cause, self.attempts)?;
        if self.breaker_tripped {
            write!(f, ", circuit opened")?;
        }
        write!(f, ")")
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay slept before retry `n` (1-based): `base_delay * 2^(n-1)`, capped.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.config
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.config.max_delay)
            .min(self.config.max_delay)
    }

    /// Runs `op` through `breaker`, retrying transient failures.
    ///
    /// Stops at once when the breaker rejects a call, when a failure opens
    /// the breaker, or when `is_transient` returns false for the error. A
    /// failure that opens the breaker is returned as the cause, not the
    /// rejection the next attempt would get.
    pub async fn execute<T, E, F, Fut, P>(
        &self,
        breaker: &CircuitBreaker,
        is_transient: P,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let max_attempts = self.config.max_retries.max(1);
        let mut attempts = 0u32;

        loop {
            match breaker.call(&mut op).await {
                Ok(value) => return Ok(value),
                Err(cause @ BreakerError::CircuitOpen { .. }) => {
                    return Err(RetryError {
                        cause,
                        attempts,
                        transient: true,
                        breaker_tripped: false,
                    });
                }
                Err(BreakerError::Inner(e)) => {
                    attempts += 1;
                    let transient = is_transient(&e);
                    let breaker_tripped = breaker.current() != super::BreakerState::Closed;
                    if !transient || breaker_tripped || attempts >= max_attempts {
                        return Err(RetryError {
                            cause: BreakerError::Inner(e),
                            attempts,
                            transient,
                            breaker_tripped,
                        });
                    }

                    let delay = self.delay_for_retry(attempts);
                    tracing::debug!(
                        breaker = breaker.name(),
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/retry_tests.rs"]
mod tests;
