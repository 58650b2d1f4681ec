//! Spawns, probes and stops a single child process.

use super::log_sink::{LogSink, OutputStream, TracingLogSink};
use super::probe::{LivenessProbe, ProbeError};
use super::status::{Health, ServiceStatus};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Maximum time to wait for the liveness probe after spawn.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period between SIGTERM and SIGKILL.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between liveness probes during startup.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// How long output readers may drain after the process exits.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Everything needed to launch the process.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub startup_timeout: Duration,
    pub probe_interval: Duration,
}

impl ProcessSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            probe_interval: DEFAULT_PROBE_INTERVAL,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }
}

/// Notified on every status and health change of a supervised process.
pub trait StatusObserver: Send + Sync {
    fn status_changed(&self, process: &str, previous: &ServiceStatus, current: &ServiceStatus);

    fn health_changed(&self, _process: &str, _health: Health) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorError {
    /// `start` called while the process is already up (or being recovered).
    AlreadyRunning(ServiceStatus),
    /// The process is `Failed`; a manual reset is required.
    Failed { reason: String },
    /// `restart` called before any spec was supplied.
    NotConfigured,
    /// The binary could not be resolved or spawned.
    SpawnFailed(String),
    /// The child exited before its liveness probe succeeded.
    ExitedDuringStartup { code: Option<i32> },
    /// The liveness probe never succeeded within the startup timeout.
    StartupTimeout(Duration),
    /// A termination signal could not be delivered.
    Signal(String),
}

impl Display for SupervisorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::AlreadyRunning(status) => {
                write!(f, "process is already {}", status.label())
            }
            SupervisorError::Failed { reason } => {
                write!(f, "process has failed and needs a manual reset: {}", reason)
            }
            SupervisorError::NotConfigured => write!(f, "process has no launch configuration"),
            SupervisorError::SpawnFailed(msg) => write!(f, "failed to spawn process: {}", msg),
            SupervisorError::ExitedDuringStartup { code: Some(code) } => {
                write!(f, "process exited during startup with code {}", code)
            }
            SupervisorError::ExitedDuringStartup { code: None } => {
                write!(f, "process was terminated by a signal during startup")
            }
            SupervisorError::StartupTimeout(after) => {
                write!(f, "process did not become healthy within {:?}", after)
            }
            SupervisorError::Signal(msg) => write!(f, "failed to signal process: {}", msg),
        }
    }
}

impl std::error::Error for SupervisorError {}

/// Owns exactly one child process and its lifecycle status.
pub struct ProcessSupervisor {
    id: String,
    probe: Arc<dyn LivenessProbe>,
    log_sink: Arc<dyn LogSink>,
    observer: Option<Arc<dyn StatusObserver>>,
    spec: Option<ProcessSpec>,
    child: Option<Child>,
    readers: Vec<JoinHandle<()>>,
    status: ServiceStatus,
}

impl ProcessSupervisor {
    pub fn new(id: impl Into<String>, probe: Arc<dyn LivenessProbe>) -> Self {
        Self {
            id: id.into(),
            probe,
            log_sink: Arc::new(TracingLogSink),
            observer: None,
            spec: None,
            child: None,
            readers: Vec::new(),
            status: ServiceStatus::Stopped,
        }
    }

    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = sink;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn StatusObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Stores a spec so that `restart` works before the first `start`.
    pub fn with_spec(mut self, spec: ProcessSpec) -> Self {
        self.spec = Some(spec);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> &ServiceStatus {
        &self.status
    }

    pub fn spec(&self) -> Option<&ProcessSpec> {
        self.spec.as_ref()
    }

    /// Spawns the process and waits until its liveness probe passes.
    pub async fn start(&mut self, spec: ProcessSpec) -> Result<ServiceStatus, SupervisorError> {
        match &self.status {
            ServiceStatus::Running { .. } | ServiceStatus::Starting | ServiceStatus::Failing { .. } => {
                return Err(SupervisorError::AlreadyRunning(self.status.clone()));
            }
            ServiceStatus::Failed { reason } => {
                return Err(SupervisorError::Failed {
                    reason: reason.clone(),
                });
            }
            ServiceStatus::Stopped | ServiceStatus::Stopping => {}
        }
        self.spec = Some(spec.clone());

        let program = which::which(&spec.command)
            .map_err(|e| SupervisorError::SpawnFailed(format!("{}: {}", spec.command, e)))?;

        let mut command = Command::new(&program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        command.process_group(0);

        self.transition(ServiceStatus::Starting);
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.transition(ServiceStatus::Stopped);
                return Err(SupervisorError::SpawnFailed(format!(
                    "{}: {}",
                    program.display(),
                    e
                )));
            }
        };
        self.attach_output(&mut child);
        tracing::info!(process = %self.id, pid = ?child.id(), "spawned, waiting for liveness");
        self.child = Some(child);

        let deadline = Instant::now() + spec.startup_timeout;
        loop {
            if let Some(code) = self.reap() {
                self.drain_readers().await;
                self.transition(ServiceStatus::Stopped);
                return Err(SupervisorError::ExitedDuringStartup { code });
            }
            if self.probe.check().await.is_ok() {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    process = %self.id,
                    timeout = ?spec.startup_timeout,
                    "liveness probe never succeeded, killing"
                );
                self.force_kill().await;
                self.transition(ServiceStatus::Stopped);
                return Err(SupervisorError::StartupTimeout(spec.startup_timeout));
            }
            tokio::time::sleep(spec.probe_interval).await;
        }

        let pid = self
            .child
            .as_ref()
            .and_then(|child| child.id())
            .unwrap_or_default();
        self.transition(ServiceStatus::Running {
            pid,
            started_at: Utc::now(),
        });
        self.report_health(Health::Healthy);
        Ok(self.status.clone())
    }

    /// Requests termination, escalating to SIGKILL after `timeout`.
    /// Always ends in `Stopped`; calling it on a stopped process is a no-op.
    pub async fn stop(&mut self, timeout: Duration) -> Result<(), SupervisorError> {
        let Some(mut child) = self.child.take() else {
            self.abort_readers();
            self.settle_stopped();
            return Ok(());
        };
        if self.status.is_running() {
            self.transition(ServiceStatus::Stopping);
        }

        let signalled = terminate(&mut child);
        if let Err(e) = &signalled {
            tracing::warn!(process = %self.id, error = %e, "SIGTERM failed, killing");
        }

        let graceful = match signalled {
            Ok(()) => tokio::time::timeout(timeout, child.wait()).await.ok(),
            Err(_) => None,
        };
        match graceful {
            Some(Ok(exit)) => tracing::info!(process = %self.id, %exit, "process exited"),
            Some(Err(e)) => tracing::warn!(process = %self.id, error = %e, "wait failed"),
            None => {
                tracing::warn!(
                    process = %self.id,
                    ?timeout,
                    "process did not exit after SIGTERM, force killing"
                );
                kill_group(&child);
                let _ = child.kill().await;
            }
        }

        self.drain_readers().await;
        self.settle_stopped();
        Ok(())
    }

    /// `stop` followed by `start` with the last spec. Not atomic.
    pub async fn restart(&mut self, stop_timeout: Duration) -> Result<ServiceStatus, SupervisorError> {
        let spec = self.spec.clone().ok_or(SupervisorError::NotConfigured)?;
        self.stop(stop_timeout).await?;
        self.start(spec).await
    }

    /// Non-blocking check that the child has not exited.
    pub fn is_alive(&mut self) -> bool {
        if self.child.is_none() {
            return false;
        }
        self.reap().is_none()
    }

    /// Process is alive and its probe answers.
    pub async fn check_liveness(&mut self) -> Result<(), ProbeError> {
        let result = if self.is_alive() {
            self.probe.check().await
        } else {
            Err(ProbeError::Unreachable("process is not running".to_string()))
        };
        self.report_health(if result.is_ok() {
            Health::Healthy
        } else {
            Health::Unhealthy
        });
        result
    }

    /// Manual reset out of `Failed`.
    pub fn reset(&mut self) -> ServiceStatus {
        if self.status.is_failed() {
            tracing::info!(process = %self.id, "manual reset");
            self.transition(ServiceStatus::Stopped);
        }
        self.status.clone()
    }

    pub fn mark_failing(&mut self, restart_count: u32, last_error: impl Into<String>) {
        self.transition(ServiceStatus::Failing {
            restart_count,
            last_error: last_error.into(),
        });
    }

    /// Gives up on the process: kills whatever is left and parks it in `Failed`.
    pub async fn mark_failed(&mut self, reason: impl Into<String>) {
        self.force_kill().await;
        self.transition(ServiceStatus::Failed {
            reason: reason.into(),
        });
    }

    fn transition(&mut self, next: ServiceStatus) {
        if !self.status.can_transition_to(&next) {
            tracing::warn!(
                process = %self.id,
                from = self.status.label(),
                to = next.label(),
                "ignoring invalid status transition"
            );
            return;
        }
        let previous = std::mem::replace(&mut self.status, next);
        tracing::debug!(
            process = %self.id,
            from = previous.label(),
            to = self.status.label(),
            "status changed"
        );
        if let Some(observer) = &self.observer {
            observer.status_changed(&self.id, &previous, &self.status);
        }
    }

    fn settle_stopped(&mut self) {
        // The child may already have been reaped while still reported Running.
        if self.status.is_running() {
            self.transition(ServiceStatus::Stopping);
        }
        if self.status != ServiceStatus::Stopped {
            self.transition(ServiceStatus::Stopped);
        }
        self.report_health(Health::Unknown);
    }

    fn report_health(&self, health: Health) {
        if let Some(observer) = &self.observer {
            observer.health_changed(&self.id, health);
        }
    }

    /// Returns `Some(exit code)` and forgets the child if it has exited.
    fn reap(&mut self) -> Option<Option<i32>> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(exit)) => {
                tracing::info!(process = %self.id, %exit, "process exited");
                self.child = None;
                Some(exit.code())
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(process = %self.id, error = %e, "try_wait failed");
                None
            }
        }
    }

    async fn force_kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            kill_group(&child);
            let _ = child.kill().await;
        }
        self.drain_readers().await;
    }

    fn attach_output(&mut self, child: &mut Child) {
        if let Some(stdout) = child.stdout.take() {
            self.readers.push(spawn_reader(
                self.id.clone(),
                OutputStream::Stdout,
                stdout,
                self.log_sink.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            self.readers.push(spawn_reader(
                self.id.clone(),
                OutputStream::Stderr,
                stderr,
                self.log_sink.clone(),
            ));
        }
    }

    /// Lets readers flush trailing output, then aborts any still blocked
    /// (e.g. on a pipe inherited by a grandchild).
    async fn drain_readers(&mut self) {
        for handle in self.readers.drain(..) {
            let abort = handle.abort_handle();
            if tokio::time::timeout(READER_DRAIN_TIMEOUT, handle).await.is_err() {
                abort.abort();
            }
        }
    }

    fn abort_readers(&mut self) {
        for handle in self.readers.drain(..) {
            handle.abort();
        }
    }
}

fn spawn_reader<R>(
    process: String,
    stream: OutputStream,
    reader: R,
    sink: Arc<dyn LogSink>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']);
                    sink.line(&process, stream, line);
                }
                Err(e) => {
                    tracing::debug!(process = %process, stream = stream.as_str(), error = %e, "output read failed");
                    break;
                }
            }
        }
    })
}

#[cfg(unix)]
fn terminate(child: &mut Child) -> Result<(), SupervisorError> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return Ok(());
    };
    match killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(SupervisorError::Signal(e.to_string())),
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> Result<(), SupervisorError> {
    child
        .start_kill()
        .map_err(|e| SupervisorError::Signal(e.to_string()))
}

/// SIGKILL the whole process group so grandchildren go down too.
#[cfg(unix)]
fn kill_group(child: &Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_child: &Child) {}

#[cfg(test)]
#[path = "tests/process_tests.rs"]
mod tests;
