use super::*;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::time::Instant;

struct FakeProcess {
    id: String,
    status: Mutex<ServiceStatus>,
    alive: AtomicBool,
    busy: AtomicBool,
    failing_marks: Mutex<Vec<u32>>,
    restarts: AtomicUsize,
}

impl FakeProcess {
    fn running_but_dead(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            status: Mutex::new(running()),
            alive: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            failing_marks: Mutex::new(Vec::new()),
            restarts: AtomicUsize::new(0),
        })
    }

    fn status(&self) -> ServiceStatus {
        self.status.lock().expect("status lock").clone()
    }

    fn set_status(&self, status: ServiceStatus) {
        *self.status.lock().expect("status lock") = status;
    }

    fn marks(&self) -> Vec<u32> {
        self.failing_marks.lock().expect("marks lock").clone()
    }
}

fn running() -> ServiceStatus {
    ServiceStatus::Running {
        pid: 42,
        started_at: Utc::now(),
    }
}

#[async_trait]
impl Supervised for FakeProcess {
    fn id(&self) -> &str {
        &self.id
    }

    async fn liveness(&self) -> Liveness {
        if self.busy.load(Ordering::SeqCst) {
            return Liveness::Busy;
        }
        let status = self.status();
        if !status.is_supervised() {
            return Liveness::Idle(status);
        }
        if self.alive.load(Ordering::SeqCst) {
            Liveness::Alive
        } else {
            Liveness::Dead("connection refused".to_string())
        }
    }

    async fn mark_failing(&self, restart_count: u32, last_error: String) {
        self.failing_marks
            .lock()
            .expect("marks lock")
            .push(restart_count);
        self.set_status(ServiceStatus::Failing {
            restart_count,
            last_error,
        });
    }

    async fn mark_failed(&self, reason: String) {
        self.set_status(ServiceStatus::Failed { reason });
    }

    async fn restart_failing(&self) -> Result<ServiceStatus, SupervisorError> {
        let status = self.status();
        if !matches!(status, ServiceStatus::Failing { .. }) {
            return Ok(status);
        }
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.set_status(running());
        Ok(self.status())
    }
}

struct FakeDependency {
    state: Mutex<BreakerState>,
    probe_ready: AtomicBool,
    depth: AtomicUsize,
    replays: AtomicUsize,
}

impl FakeDependency {
    fn new(state: BreakerState, depth: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            probe_ready: AtomicBool::new(false),
            depth: AtomicUsize::new(depth),
            replays: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Recoverable for FakeDependency {
    fn name(&self) -> &str {
        "webhook"
    }

    fn breaker_state(&self) -> BreakerState {
        *self.state.lock().expect("state lock")
    }

    fn probe_ready(&self) -> bool {
        self.probe_ready.load(Ordering::SeqCst)
    }

    fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    async fn replay(&self) -> Result<ReplayReport, QueueError> {
        self.replays.fetch_add(1, Ordering::SeqCst);
        let succeeded = self.depth.swap(0, Ordering::SeqCst);
        Ok(ReplayReport {
            succeeded,
            failed: 0,
            dead_lettered: 0,
        })
    }
}

#[derive(Default)]
struct RecordingObserver {
    scheduled: Mutex<Vec<(String, u32, Duration)>>,
}

impl MonitorObserver for RecordingObserver {
    fn restart_scheduled(&self, process: &str, attempt: u32, delay: Duration) {
        self.scheduled
            .lock()
            .expect("observer lock")
            .push((process.to_string(), attempt, delay));
    }

    fn restarts_in_window(&self, _process: &str, _restarts: u32) {}
}

fn config(limit: u32) -> MonitorConfig {
    MonitorConfig {
        interval: Duration::from_secs(10),
        restart_limit: limit,
        restart_window: Duration::from_secs(300),
        backoff_base: Duration::from_secs(1),
        backoff_max: Duration::from_secs(60),
    }
}

/// A tick followed by the restarts it scheduled.
async fn pass(monitor: &mut HealthMonitor) {
    monitor.tick().await;
    monitor.settle_restarts().await;
}

async fn timed_pass(monitor: &mut HealthMonitor) -> Duration {
    let start = Instant::now();
    pass(monitor).await;
    start.elapsed()
}

#[test]
fn test_backoff_doubles_and_caps() {
    let config = MonitorConfig::default();
    assert_eq!(config.backoff_for(1), Duration::from_secs(1));
    assert_eq!(config.backoff_for(2), Duration::from_secs(2));
    assert_eq!(config.backoff_for(3), Duration::from_secs(4));
    assert_eq!(config.backoff_for(10), Duration::from_secs(60));
    assert_eq!(config.backoff_for(u32::MAX), Duration::from_secs(60));
}

#[test]
fn test_config_defaults_from_empty_yaml() {
    let config: MonitorConfig = serde_yaml::from_str("{}").expect("parse");
    assert_eq!(config, MonitorConfig::default());

    let config: MonitorConfig =
        serde_yaml::from_str("restart_limit: 5\nbackoff_base_ms: 250").expect("parse");
    assert_eq!(config.restart_limit, 5);
    assert_eq!(config.backoff_base, Duration::from_millis(250));
    assert_eq!(config.interval, DEFAULT_INTERVAL);
}

#[tokio::test(start_paused = true)]
async fn test_dead_process_restarts_with_backoff_then_fails() {
    let process = FakeProcess::running_but_dead("stt");
    let observer = Arc::new(RecordingObserver::default());
    let mut monitor = HealthMonitor::new(config(3))
        .with_process(process.clone())
        .with_observer(observer.clone());

    assert_eq!(timed_pass(&mut monitor).await, Duration::from_secs(1));
    assert_eq!(timed_pass(&mut monitor).await, Duration::from_secs(2));
    assert_eq!(timed_pass(&mut monitor).await, Duration::from_secs(4));
    assert_eq!(process.restarts.load(Ordering::SeqCst), 3);
    assert_eq!(process.marks(), vec![1, 2, 3]);

    // Fourth failure inside the window exhausts the limit.
    assert_eq!(timed_pass(&mut monitor).await, Duration::ZERO);
    assert!(process.status().is_failed());
    assert_eq!(process.restarts.load(Ordering::SeqCst), 3);

    // Failed processes are left alone.
    pass(&mut monitor).await;
    assert_eq!(process.restarts.load(Ordering::SeqCst), 3);

    let scheduled = observer.scheduled.lock().expect("observer lock").clone();
    assert_eq!(
        scheduled.iter().map(|(_, a, _)| *a).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(scheduled.iter().all(|(p, _, _)| p == "stt"));
}

#[tokio::test(start_paused = true)]
async fn test_manual_reset_re_enables_restarts() {
    let process = FakeProcess::running_but_dead("tts");
    let mut monitor = HealthMonitor::new(config(1)).with_process(process.clone());

    pass(&mut monitor).await;
    pass(&mut monitor).await;
    assert!(process.status().is_failed());

    // Operator resets, then starts it again; it is still broken.
    process.set_status(ServiceStatus::Stopped);
    pass(&mut monitor).await;
    process.set_status(running());

    assert_eq!(timed_pass(&mut monitor).await, Duration::from_secs(1));
    assert_eq!(process.restarts.load(Ordering::SeqCst), 2);
    assert_eq!(process.marks(), vec![1, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_restart_window_slides() {
    let process = FakeProcess::running_but_dead("stt");
    let mut monitor = HealthMonitor::new(MonitorConfig {
        restart_window: Duration::from_secs(60),
        ..config(2)
    })
    .with_process(process.clone());

    pass(&mut monitor).await;
    tokio::time::advance(Duration::from_secs(61)).await;

    // The first restart aged out, so this is again restart #1.
    assert_eq!(timed_pass(&mut monitor).await, Duration::from_secs(1));
    assert_eq!(process.marks(), vec![1, 1]);
    assert!(!process.status().is_failed());
}

#[tokio::test(start_paused = true)]
async fn test_healthy_and_busy_processes_are_left_alone() {
    let healthy = FakeProcess::running_but_dead("stt");
    healthy.alive.store(true, Ordering::SeqCst);
    let busy = FakeProcess::running_but_dead("tts");
    busy.busy.store(true, Ordering::SeqCst);
    let idle = FakeProcess::running_but_dead("llm");
    idle.set_status(ServiceStatus::Stopped);

    let mut monitor = HealthMonitor::new(config(3))
        .with_process(healthy.clone())
        .with_process(busy.clone())
        .with_process(idle.clone());
    pass(&mut monitor).await;

    for process in [&healthy, &busy, &idle] {
        assert!(process.marks().is_empty());
        assert_eq!(process.restarts.load(Ordering::SeqCst), 0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_replay_runs_only_when_breaker_admits() {
    let closed = FakeDependency::new(BreakerState::Closed, 2);
    let open = FakeDependency::new(BreakerState::Open, 2);
    let half_open = FakeDependency::new(BreakerState::HalfOpen, 2);
    let empty = FakeDependency::new(BreakerState::Closed, 0);

    let mut monitor = HealthMonitor::new(config(3))
        .with_dependency(closed.clone())
        .with_dependency(open.clone())
        .with_dependency(half_open.clone())
        .with_dependency(empty.clone());
    monitor.tick().await;

    assert_eq!(closed.replays.load(Ordering::SeqCst), 1);
    assert_eq!(closed.depth.load(Ordering::SeqCst), 0);
    assert_eq!(open.replays.load(Ordering::SeqCst), 0);
    assert_eq!(half_open.replays.load(Ordering::SeqCst), 0);
    assert_eq!(empty.replays.load(Ordering::SeqCst), 0);

    open.probe_ready.store(true, Ordering::SeqCst);
    monitor.tick().await;
    assert_eq!(open.replays.load(Ordering::SeqCst), 1);
    assert_eq!(closed.replays.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_run_stops_on_shutdown_during_backoff() {
    let process = FakeProcess::running_but_dead("stt");
    let monitor = HealthMonitor::new(MonitorConfig {
        backoff_base: Duration::from_secs(60),
        ..config(3)
    })
    .with_process(process.clone());

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(monitor.run(rx));

    // First tick fires immediately and parks in the 60s backoff.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(process.marks(), vec![1]);

    tx.send(true).expect("monitor listening");
    handle.await.expect("monitor task");
    assert_eq!(process.restarts.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_run_stops_when_shutdown_sender_dropped() {
    let monitor = HealthMonitor::new(config(3));
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(monitor.run(rx));
    drop(tx);
    handle.await.expect("monitor task");
}

#[tokio::test(start_paused = true)]
async fn test_pending_restart_does_not_hold_up_the_pass() {
    let stt = FakeProcess::running_but_dead("stt");
    let tts = FakeProcess::running_but_dead("tts");
    let dependency = FakeDependency::new(BreakerState::Closed, 1);
    let mut monitor = HealthMonitor::new(MonitorConfig {
        backoff_base: Duration::from_secs(30),
        ..config(3)
    })
    .with_process(stt.clone())
    .with_process(tts.clone())
    .with_dependency(dependency.clone());

    let start = Instant::now();
    monitor.tick().await;
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(stt.marks(), vec![1]);
    assert_eq!(tts.marks(), vec![1]);
    assert_eq!(dependency.replays.load(Ordering::SeqCst), 1);
    assert!(monitor.restart_pending("stt"));

    // A pass while the restart waits out its backoff leaves the process alone.
    monitor.tick().await;
    assert_eq!(stt.marks(), vec![1]);

    monitor.settle_restarts().await;
    assert_eq!(start.elapsed(), Duration::from_secs(30));
    assert_eq!(stt.restarts.load(Ordering::SeqCst), 1);
    assert_eq!(tts.restarts.load(Ordering::SeqCst), 1);
    assert!(!monitor.restart_pending("stt"));
}
