use super::*;
use crate::orchestrator::test_support::ScriptedTransport;
use crate::queue::FileQueueStore;
use crate::resilience::{BreakerConfig, BreakerState, RetryConfig};
use crate::supervisor::{FnProbe, LivenessProbe, ProbeError};
use crate::transport::{FnTransport, Response, Transport, TransportError};
use std::sync::Mutex as StdMutex;
use futures::FutureExt;
use std::time::Duration;
use tempfile::tempdir;

fn healthy_probe() -> Arc<dyn LivenessProbe> {
    Arc::new(FnProbe::new("always-ok", || async { Ok::<(), ProbeError>(()) }.boxed()))
}

fn sh(script: &str) -> ProcessSpec {
    ProcessSpec::new("sh")
        .with_args(["-c", script])
        .with_probe_interval(Duration::from_millis(20))
        .with_startup_timeout(Duration::from_secs(5))
}

fn webhook(transport: Arc<ScriptedTransport>) -> DependencyEntry {
    DependencyEntry::new("webhook", transport)
        .with_breaker(BreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
        })
        .with_retry(RetryConfig {
            max_retries: 1,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        })
}

async fn next_matching<F>(events: &mut broadcast::Receiver<CoreEvent>, mut wanted: F) -> CoreEvent
where
    F: FnMut(&CoreEvent) -> bool,
{
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event stream failed: {}", e),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(20), wait)
        .await
        .expect("timed out waiting for event")
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_probes_and_replays_queue_in_order() {
    let transport = ScriptedTransport::new();
    transport.fail_transient(3);
    let orchestrator = Orchestrator::builder()
        .with_dependency(webhook(transport.clone()))
        .build()
        .await
        .expect("build");
    let mut events = orchestrator.events();

    // Three transient failures trip the breaker; only the one that opened it is queued.
    for (n, payload) in [b"1", b"2", b"3"].iter().enumerate() {
        let err = orchestrator
            .dependency_call("webhook", payload.to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Transient { attempts: 1, .. }));
        assert_eq!(err.queued_id().is_some(), n == 2);
    }
    assert_eq!(
        orchestrator.get_snapshot().dependency("webhook").map(|d| d.breaker.state),
        Some(BreakerState::Open)
    );

    // The fourth call short-circuits without reaching the transport.
    let err = orchestrator
        .dependency_call("webhook", b"4".to_vec())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::CircuitOpen { attempts: 0, queued: Some(_), .. }));
    assert_eq!(transport.calls(), 3);

    // After the cooldown the fifth call is the probe; success closes the
    // breaker and the queue drains oldest-first.
    tokio::time::advance(Duration::from_secs(30)).await;
    orchestrator
        .dependency_call("webhook", b"5".to_vec())
        .await
        .expect("probe call");

    let completed = next_matching(&mut events, |e| matches!(e, CoreEvent::ReplayCompleted { .. })).await;
    match completed {
        CoreEvent::ReplayCompleted { report, .. } => assert_eq!(report.succeeded, 2),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(
        transport.sent(),
        vec![
            b"1".to_vec(),
            b"2".to_vec(),
            b"3".to_vec(),
            b"5".to_vec(),
            b"3".to_vec(),
            b"4".to_vec()
        ]
    );

    let snapshot = orchestrator.get_snapshot();
    let view = snapshot.dependency("webhook").expect("view");
    assert_eq!(view.breaker.state, BreakerState::Closed);
    assert_eq!(view.queue_depth, 0);
    assert_eq!(view.last_error, None);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_transitions_are_published_in_order() {
    let transport = ScriptedTransport::new();
    transport.fail_transient(3);
    let orchestrator = Orchestrator::builder()
        .with_dependency(webhook(transport))
        .build()
        .await
        .expect("build");
    let mut events = orchestrator.events();

    for _ in 0..3 {
        let _ = orchestrator.dependency_call("webhook", b"x".to_vec()).await;
    }
    tokio::time::advance(Duration::from_secs(30)).await;
    orchestrator
        .dependency_call("webhook", b"y".to_vec())
        .await
        .expect("probe");

    let mut transitions = Vec::new();
    while transitions.len() < 3 {
        if let CoreEvent::BreakerTransition { from, to, .. } =
            next_matching(&mut events, |e| matches!(e, CoreEvent::BreakerTransition { .. })).await
        {
            transitions.push((from, to));
        }
    }
    assert_eq!(
        transitions,
        vec![
            (BreakerState::Closed, BreakerState::Open),
            (BreakerState::Open, BreakerState::HalfOpen),
            (BreakerState::HalfOpen, BreakerState::Closed),
        ]
    );
}

#[tokio::test]
async fn test_unknown_ids_are_reported() {
    let orchestrator = Orchestrator::builder().build().await.expect("build");
    assert!(matches!(
        orchestrator.request_start("stt").await,
        Err(CoreError::UnknownProcess(id)) if id == "stt"
    ));
    assert!(matches!(
        orchestrator.dependency_call("tts", Vec::new()).await,
        Err(CoreError::UnknownDependency(id)) if id == "tts"
    ));
    assert!(orchestrator.reset_breaker("tts").is_err());
}

#[tokio::test]
async fn test_process_commands_are_idempotent() {
    let orchestrator = Orchestrator::builder()
        .with_process(ProcessEntry::new("stt", sh("sleep 30"), healthy_probe()))
        .build()
        .await
        .expect("build");

    let first = orchestrator.request_start("stt").await.expect("start");
    let again = orchestrator.request_start("stt").await.expect("start again");
    assert!(first.is_running());
    assert_eq!(first.pid(), again.pid());
    assert_eq!(
        orchestrator.get_snapshot().process("stt").map(|p| p.status.clone()),
        Some(first.clone())
    );

    assert_eq!(
        orchestrator.request_stop("stt").await.expect("stop"),
        ServiceStatus::Stopped
    );
    assert_eq!(
        orchestrator.request_stop("stt").await.expect("stop again"),
        ServiceStatus::Stopped
    );
    assert_eq!(
        orchestrator.get_snapshot().process("stt").map(|p| p.status.clone()),
        Some(ServiceStatus::Stopped)
    );
}

#[tokio::test]
async fn test_restart_clears_failed_status() {
    let orchestrator = Orchestrator::builder()
        .with_process(ProcessEntry::new("stt", sh("sleep 30"), healthy_probe()))
        .build()
        .await
        .expect("build");
    orchestrator.request_start("stt").await.expect("start");
    orchestrator.processes["stt"]
        .handle
        .lock()
        .await
        .mark_failed("restart limit reached")
        .await;

    assert!(matches!(
        orchestrator.request_start("stt").await,
        Err(CoreError::Supervisor {
            source: SupervisorError::Failed { .. },
            ..
        })
    ));
    let status = orchestrator.request_restart("stt").await.expect("restart");
    assert!(status.is_running());
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_monitor_gives_up_after_restart_limit() {
    let orchestrator = Orchestrator::builder()
        .with_monitor_config(MonitorConfig {
            interval: Duration::from_millis(100),
            restart_limit: 1,
            restart_window: Duration::from_secs(60),
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(10),
        })
        .with_process(ProcessEntry::new("stt", sh("sleep 0.3"), healthy_probe()))
        .build()
        .await
        .expect("build");
    let mut events = orchestrator.events();

    orchestrator.request_start("stt").await.expect("start");
    assert!(orchestrator.spawn_monitor());
    assert!(!orchestrator.spawn_monitor());

    let scheduled = next_matching(&mut events, |e| matches!(e, CoreEvent::RestartScheduled { .. })).await;
    assert!(matches!(scheduled, CoreEvent::RestartScheduled { attempt: 1, .. }));
    let failed = next_matching(&mut events, |e| matches!(e, CoreEvent::ProcessFailed { .. })).await;
    assert!(matches!(failed, CoreEvent::ProcessFailed { ref process, .. } if process == "stt"));

    let snapshot = orchestrator.get_snapshot();
    assert!(snapshot.process("stt").expect("process").status.is_failed());

    orchestrator.shutdown().await;
    assert_eq!(
        orchestrator.get_snapshot().process("stt").map(|p| p.status.clone()),
        Some(ServiceStatus::Stopped)
    );
}

#[tokio::test]
async fn test_shutdown_stops_processes_and_is_repeatable() {
    let orchestrator = Orchestrator::builder()
        .with_process(ProcessEntry::new("stt", sh("sleep 30"), healthy_probe()))
        .with_process(
            ProcessEntry::new("llm", sh("sleep 30"), healthy_probe()).with_autostart(false),
        )
        .build()
        .await
        .expect("build");

    let started = orchestrator.start_autostart().await;
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].0, "stt");
    assert!(orchestrator.spawn_monitor());

    orchestrator.shutdown().await;
    orchestrator.shutdown().await;
    let snapshot = orchestrator.get_snapshot();
    assert_eq!(snapshot.process("stt").map(|p| p.status.clone()), Some(ServiceStatus::Stopped));
    assert_eq!(snapshot.process("llm").map(|p| p.status.clone()), Some(ServiceStatus::Stopped));
}

#[tokio::test]
async fn test_queued_requests_survive_rebuild() {
    let dir = tempdir().expect("temp dir");
    let build = |transport: Arc<ScriptedTransport>| {
        let store = FileQueueStore::open(dir.path(), "webhook").expect("open store");
        Orchestrator::builder()
            .with_dependency(webhook(transport).with_queue_store(Arc::new(store)))
            .build()
    };

    {
        let transport = ScriptedTransport::new();
        transport.fail_transient(3);
        let orchestrator = build(transport).await.expect("build");
        for _ in 0..3 {
            let _ = orchestrator.dependency_call("webhook", b"speak".to_vec()).await;
        }
        assert_eq!(orchestrator.get_snapshot().dependency("webhook").map(|d| d.queue_depth), Some(1));
    }

    let transport = ScriptedTransport::new();
    let orchestrator = build(transport.clone()).await.expect("rebuild");
    assert_eq!(orchestrator.get_snapshot().dependency("webhook").map(|d| d.queue_depth), Some(1));

    let report = orchestrator.replay("webhook").await.expect("replay");
    assert_eq!(report.succeeded, 1);
    assert_eq!(transport.sent(), vec![b"speak".to_vec()]);
    assert!(orchestrator.dead_letters("webhook").await.expect("dead letters").is_empty());
}

#[tokio::test]
async fn test_reset_breaker_closes_circuit() {
    let transport = ScriptedTransport::new();
    transport.fail_transient(3);
    let orchestrator = Orchestrator::builder()
        .with_dependency(webhook(transport))
        .build()
        .await
        .expect("build");
    for _ in 0..3 {
        let _ = orchestrator.dependency_call("webhook", b"x".to_vec()).await;
    }

    let state = orchestrator.reset_breaker("webhook").expect("reset");
    assert_eq!(state.state, BreakerState::Closed);
    assert_eq!(state.failure_count, 0);
    assert_eq!(
        orchestrator.get_snapshot().dependency("webhook").map(|d| d.breaker.state),
        Some(BreakerState::Closed)
    );
}

#[tokio::test(start_paused = true)]
async fn test_closure_transport_receives_payloads() {
    let received = Arc::new(StdMutex::new(Vec::new()));
    let sink = received.clone();
    let transport = FnTransport::new("home-assistant", move |payload: Vec<u8>| {
        let sink = sink.clone();
        async move {
            let mut received = sink.lock().expect("received lock");
            received.push(payload);
            if received.len() == 1 {
                Err(TransportError::Transient("HTTP 502".to_string()))
            } else {
                Ok(Response {
                    status: 200,
                    body: Vec::new(),
                })
            }
        }
        .boxed()
    });
    assert_eq!(transport.describe(), "home-assistant");

    let orchestrator = Orchestrator::builder()
        .with_dependency(
            DependencyEntry::new("ha", Arc::new(transport)).with_retry(RetryConfig {
                max_retries: 2,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
            }),
        )
        .build()
        .await
        .expect("build");

    let response = orchestrator
        .dependency_call("ha", b"lights off".to_vec())
        .await
        .expect("second attempt succeeds");
    assert_eq!(response.status, 200);
    assert_eq!(
        *received.lock().expect("received lock"),
        vec![b"lights off".to_vec(), b"lights off".to_vec()]
    );
}
