//! Fault isolation for outbound dependencies.

pub mod breaker;
pub mod retry;

pub use breaker::{
    BreakerConfig, BreakerError, BreakerObserver, BreakerState, CircuitBreaker,
    CircuitBreakerState,
};
pub use retry::{RetryConfig, RetryError, RetryPolicy};
