use super::*;
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

fn config(threshold: u32, reset_secs: u64) -> BreakerConfig {
    BreakerConfig {
        failure_threshold: threshold,
        reset_timeout: Duration::from_secs(reset_secs),
    }
}

async fn fail(breaker: &CircuitBreaker) -> Result<(), BreakerError<String>> {
    breaker.call(|| async { Err::<(), _>("boom".to_string()) }).await
}

async fn succeed(breaker: &CircuitBreaker) -> Result<(), BreakerError<String>> {
    breaker.call(|| async { Ok::<(), String>(()) }).await
}

#[derive(Default)]
struct RecordingObserver {
    transitions: Mutex<Vec<(BreakerState, BreakerState)>>,
}

impl BreakerObserver for RecordingObserver {
    fn breaker_changed(&self, _name: &str, previous: BreakerState, current: &CircuitBreakerState) {
        if previous != current.state {
            self.transitions
                .lock()
                .expect("observer lock")
                .push((previous, current.state));
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_opens_at_threshold() {
    let breaker = CircuitBreaker::new("webhook", config(3, 30));

    for _ in 0..2 {
        assert!(matches!(fail(&breaker).await, Err(BreakerError::Inner(_))));
        assert_eq!(breaker.current(), BreakerState::Closed);
    }
    assert!(matches!(fail(&breaker).await, Err(BreakerError::Inner(_))));

    let state = breaker.state();
    assert_eq!(state.state, BreakerState::Open);
    assert_eq!(state.failure_count, 3);
    assert!(state.last_failure.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_success_resets_failure_count() {
    let breaker = CircuitBreaker::new("webhook", config(3, 30));

    fail(&breaker).await.unwrap_err();
    fail(&breaker).await.unwrap_err();
    succeed(&breaker).await.expect("success passes through");
    assert_eq!(breaker.state().failure_count, 0);

    fail(&breaker).await.unwrap_err();
    fail(&breaker).await.unwrap_err();
    assert_eq!(breaker.current(), BreakerState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_open_rejects_without_invoking_operation() {
    let breaker = CircuitBreaker::new("tts", config(1, 30));
    fail(&breaker).await.unwrap_err();

    let invoked = AtomicUsize::new(0);
    let result = breaker
        .call(|| async {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok::<(), String>(())
        })
        .await;

    match result {
        Err(BreakerError::CircuitOpen {
            breaker: name,
            retry_after,
        }) => {
            assert_eq!(name, "tts");
            assert_eq!(retry_after, Some(Duration::from_secs(30)));
        }
        other => panic!("expected CircuitOpen, got {:?}", other),
    }
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert_eq!(breaker.state().rejected_calls, 1);
}

#[tokio::test(start_paused = true)]
async fn test_probe_success_closes_circuit() {
    let observer = Arc::new(RecordingObserver::default());
    let breaker = CircuitBreaker::new("webhook", config(1, 30)).with_observer(observer.clone());
    fail(&breaker).await.unwrap_err();

    tokio::time::advance(Duration::from_secs(10)).await;
    assert!(!breaker.ready_for_probe());
    assert!(fail(&breaker).await.unwrap_err().is_circuit_open());

    tokio::time::advance(Duration::from_secs(20)).await;
    assert!(breaker.ready_for_probe());
    succeed(&breaker).await.expect("probe admitted");
    assert_eq!(breaker.current(), BreakerState::Closed);

    let transitions = observer.transitions.lock().expect("observer lock").clone();
    assert_eq!(
        transitions,
        vec![
            (BreakerState::Closed, BreakerState::Open),
            (BreakerState::Open, BreakerState::HalfOpen),
            (BreakerState::HalfOpen, BreakerState::Closed),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_probe_failure_reopens_and_restarts_cooldown() {
    let breaker = CircuitBreaker::new("webhook", config(2, 30));
    fail(&breaker).await.unwrap_err();
    fail(&breaker).await.unwrap_err();

    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(matches!(fail(&breaker).await, Err(BreakerError::Inner(_))));
    assert_eq!(breaker.current(), BreakerState::Open);

    tokio::time::advance(Duration::from_secs(29)).await;
    assert!(fail(&breaker).await.unwrap_err().is_circuit_open());
    tokio::time::advance(Duration::from_secs(1)).await;
    succeed(&breaker).await.expect("second probe admitted");
    assert_eq!(breaker.current(), BreakerState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_admits_exactly_one_probe() {
    let breaker = CircuitBreaker::new("webhook", config(1, 5));
    fail(&breaker).await.unwrap_err();
    tokio::time::advance(Duration::from_secs(5)).await;

    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let second_invoked = AtomicUsize::new(0);

    let probe = breaker.call(|| async {
        let _ = release_rx.await;
        Ok::<(), String>(())
    });
    let concurrent = async {
        tokio::task::yield_now().await;
        let rejected = breaker
            .call(|| async {
                second_invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            })
            .await;
        let _ = release_tx.send(());
        rejected
    };

    let (probe_result, concurrent_result) = tokio::join!(probe, concurrent);
    probe_result.expect("probe succeeds");
    assert!(concurrent_result.unwrap_err().is_circuit_open());
    assert_eq!(second_invoked.load(Ordering::SeqCst), 0);
    assert_eq!(breaker.current(), BreakerState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_probe_reverts_to_open() {
    let breaker = CircuitBreaker::new("webhook", config(1, 5));
    fail(&breaker).await.unwrap_err();
    tokio::time::advance(Duration::from_secs(5)).await;

    let stalled = breaker.call(|| async {
        std::future::pending::<()>().await;
        Ok::<(), String>(())
    });
    let timed_out = tokio::time::timeout(Duration::from_secs(1), stalled).await;
    assert!(timed_out.is_err());
    assert_eq!(breaker.current(), BreakerState::Open);

    // Cooldown already elapsed, so the next caller becomes the probe.
    succeed(&breaker).await.expect("new probe admitted");
    assert_eq!(breaker.current(), BreakerState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_manual_reset_closes_open_circuit() {
    let breaker = CircuitBreaker::new("tts", config(1, 300));
    fail(&breaker).await.unwrap_err();
    assert_eq!(breaker.current(), BreakerState::Open);

    breaker.reset();
    let state = breaker.state();
    assert_eq!(state.state, BreakerState::Closed);
    assert_eq!(state.failure_count, 0);
    assert_eq!(state.total_failures, 1);
    succeed(&breaker).await.expect("closed after reset");
}

#[test]
fn test_breaker_config_defaults_from_yaml() {
    let cfg: BreakerConfig = serde_yaml::from_str("failure_threshold: 5").expect("parse");
    assert_eq!(cfg.failure_threshold, 5);
    assert_eq!(cfg.reset_timeout, DEFAULT_RESET_TIMEOUT);
}

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .expect("runtime")
}

proptest! {
    #[test]
    fn test_open_iff_consecutive_failures_reach_threshold(
        threshold in 1u32..8,
        outcomes in proptest::collection::vec(any::<bool>(), 0..24),
    ) {
        let rt = paused_runtime();
        rt.block_on(async {
            let breaker = CircuitBreaker::new("prop", config(threshold, 3600));
            let mut consecutive = 0u32;
            for ok in outcomes {
                if breaker.current() == BreakerState::Open {
                    break;
                }
                if ok {
                    succeed(&breaker).await.expect("closed breaker admits");
                    consecutive = 0;
                } else {
                    fail(&breaker).await.unwrap_err();
                    consecutive += 1;
                }
                let state = breaker.state();
                prop_assert_eq!(state.failure_count, consecutive);
                prop_assert_eq!(state.state == BreakerState::Open, consecutive >= threshold);
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
