use super::*;
use crate::resilience::BreakerConfig;
use futures::StreamExt;

fn running(pid: u32) -> ServiceStatus {
    ServiceStatus::Running {
        pid,
        started_at: Utc::now(),
    }
}

#[test]
fn test_version_increments_once_per_mutation() {
    let store = StateStore::new();
    assert_eq!(store.snapshot().version, 0);

    store.register_process("stt");
    store.register_dependency("webhook", CircuitBreakerState::closed(&BreakerConfig::default()));
    assert_eq!(store.snapshot().version, 2);

    store.status_changed("stt", &ServiceStatus::Stopped, &ServiceStatus::Starting);
    assert_eq!(store.snapshot().version, 3);
    assert_eq!(
        store.snapshot().process("stt").map(|p| p.status.clone()),
        Some(ServiceStatus::Starting)
    );
}

#[test]
fn test_noop_updates_do_not_bump_version() {
    let store = StateStore::new();
    store.register_process("stt");
    store.register_dependency("webhook", CircuitBreakerState::closed(&BreakerConfig::default()));
    let before = store.snapshot().version;

    store.health_changed("stt", Health::Unknown);
    store.queue_changed("webhook", 0, 0);
    store.record_dependency_error("webhook", None);
    store.restarts_in_window("stt", 0);

    assert_eq!(store.snapshot().version, before);
}

#[test]
fn test_snapshots_are_immutable_values() {
    let store = StateStore::new();
    store.register_process("stt");
    let held = store.snapshot();

    store.status_changed("stt", &ServiceStatus::Stopped, &ServiceStatus::Starting);

    assert_eq!(held.process("stt").map(|p| &p.status), Some(&ServiceStatus::Stopped));
    assert_ne!(store.snapshot().version, held.version);
}

#[tokio::test]
async fn test_subscribe_yields_current_snapshot_first() {
    let store = StateStore::new();
    store.register_process("stt");

    let mut stream = Box::pin(store.subscribe());
    let first = stream.next().await.expect("current snapshot");
    assert_eq!(first.version, 1);

    store.status_changed("stt", &ServiceStatus::Stopped, &ServiceStatus::Starting);
    let second = stream.next().await.expect("next snapshot");
    assert_eq!(second.version, 2);
}

#[tokio::test]
async fn test_slow_subscriber_sees_latest_in_order() {
    let store = StateStore::new();
    store.register_process("stt");
    let mut stream = Box::pin(store.subscribe());
    let mut seen = vec![stream.next().await.expect("first").version];

    store.status_changed("stt", &ServiceStatus::Stopped, &ServiceStatus::Starting);
    store.status_changed("stt", &ServiceStatus::Starting, &running(7));
    store.health_changed("stt", Health::Healthy);

    let latest = stream.next().await.expect("latest");
    seen.push(latest.version);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(latest.version, store.snapshot().version);
    assert_eq!(latest.process("stt").map(|p| p.health), Some(Health::Healthy));
}

#[tokio::test]
async fn test_subscribe_ends_when_store_dropped() {
    let store = StateStore::new();
    let mut stream = Box::pin(store.subscribe());
    assert!(stream.next().await.is_some());
    drop(store);
    assert!(stream.next().await.is_none());
}

#[test]
fn test_failed_status_emits_process_failed_event() {
    let store = StateStore::new();
    store.register_process("stt");
    let mut events = store.events();

    let failed = ServiceStatus::Failed {
        reason: "restart limit reached".to_string(),
    };
    store.status_changed("stt", &running(7), &failed);

    assert!(matches!(
        events.try_recv(),
        Ok(CoreEvent::ProcessStatusChanged { .. })
    ));
    match events.try_recv() {
        Ok(CoreEvent::ProcessFailed { process, reason }) => {
            assert_eq!(process, "stt");
            assert_eq!(reason, "restart limit reached");
        }
        other => panic!("expected ProcessFailed, got {:?}", other),
    }
}

#[test]
fn test_breaker_transition_event_and_view() {
    let store = StateStore::new();
    let config = BreakerConfig::default();
    store.register_dependency("tts", CircuitBreakerState::closed(&config));
    let mut events = store.events();

    let mut open = CircuitBreakerState::closed(&config);
    open.state = BreakerState::Open;
    open.failure_count = 3;
    store.breaker_changed("tts", BreakerState::Closed, &open);

    let snapshot = store.snapshot();
    let view = snapshot.dependency("tts").expect("dependency view");
    assert_eq!(view.breaker.state, BreakerState::Open);
    assert_eq!(
        events.try_recv().expect("event"),
        CoreEvent::BreakerTransition {
            dependency: "tts".to_string(),
            from: BreakerState::Closed,
            to: BreakerState::Open,
        }
    );
}

#[test]
fn test_event_serializes_with_type_tag() {
    let event = CoreEvent::RestartScheduled {
        process: "stt".to_string(),
        attempt: 2,
        delay_ms: 2000,
    };
    let json = serde_json::to_value(&event).expect("serialize");
    assert_eq!(json["type"], "restart_scheduled");
    assert_eq!(json["delay_ms"], 2000);
}
