use super::dependency::Dependency;
use super::error::CoreError;
use super::{ManagedProcess, Orchestrator};
use crate::config::CoreConfig;
use crate::monitor::MonitorConfig;
use crate::queue::{FileQueueStore, MemoryQueueStore, OfflineQueue, QueueConfig, QueueStore};
use crate::resilience::{BreakerConfig, CircuitBreaker, RetryConfig, RetryPolicy};
use crate::store::StateStore;
use crate::supervisor::{
    FileLogSink, LivenessProbe, LogSink, ProcessSpec, ProcessSupervisor, SupervisorHandle,
    TracingLogSink, DEFAULT_STOP_TIMEOUT,
};
use crate::transport::Transport;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// A managed child process and how to launch it.
pub struct ProcessEntry {
    id: String,
    spec: ProcessSpec,
    probe: Arc<dyn LivenessProbe>,
    log_sink: Arc<dyn LogSink>,
    stop_timeout: Duration,
    autostart: bool,
}

impl ProcessEntry {
    pub fn new(id: impl Into<String>, spec: ProcessSpec, probe: Arc<dyn LivenessProbe>) -> Self {
        Self {
            id: id.into(),
            spec,
            probe,
            log_sink: Arc::new(TracingLogSink),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            autostart: true,
        }
    }

    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = sink;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }
}

/// An outbound dependency. Queues in memory unless a durable store is set.
pub struct DependencyEntry {
    id: String,
    transport: Arc<dyn Transport>,
    breaker: BreakerConfig,
    retry: RetryConfig,
    queue: QueueConfig,
    queue_store: Option<Arc<dyn QueueStore>>,
}

impl DependencyEntry {
    pub fn new(id: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            id: id.into(),
            transport,
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
            queue: QueueConfig::default(),
            queue_store: None,
        }
    }

    pub fn with_breaker(mut self, config: BreakerConfig) -> Self {
        self.breaker = config;
        self
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    pub fn with_queue_config(mut self, config: QueueConfig) -> Self {
        self.queue = config;
        self
    }

    pub fn with_queue_store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.queue_store = Some(store);
        self
    }
}

#[derive(Default)]
pub struct OrchestratorBuilder {
    monitor: MonitorConfig,
    processes: Vec<ProcessEntry>,
    dependencies: Vec<DependencyEntry>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wires every process and dependency in `config`. Offline queues are
    /// journaled under `queue_dir`; child output goes to `<logs_dir>/<id>.log`
    /// when a logs directory is given and the process asks for it.
    pub fn from_config(config: &CoreConfig, queue_dir: &Path, logs_dir: Option<&Path>) -> Result<Self> {
        let mut builder = Self::new().with_monitor_config(config.monitor.clone());

        for (id, process) in &config.processes {
            let mut entry = ProcessEntry::new(id.clone(), process.spec(), process.probe())
                .with_stop_timeout(process.stop_timeout)
                .with_autostart(process.autostart);
            if let Some(dir) = logs_dir.filter(|_| process.log_to_file) {
                let path = dir.join(format!("{}.log", id));
                let sink = FileLogSink::open(&path)
                    .with_context(|| format!("Failed to open output log for process '{}'", id))?;
                entry = entry.with_log_sink(Arc::new(sink));
            }
            builder = builder.with_process(entry);
        }

        for (id, dependency) in &config.dependencies {
            let store = FileQueueStore::open(queue_dir, id)
                .with_context(|| format!("Failed to open offline queue for '{}'", id))?;
            builder = builder.with_dependency(
                DependencyEntry::new(id.clone(), Arc::new(dependency.transport()))
                    .with_breaker(dependency.breaker.clone())
                    .with_retry(dependency.retry.clone())
                    .with_queue_config(dependency.queue.clone())
                    .with_queue_store(Arc::new(store)),
            );
        }
        Ok(builder)
    }

    pub fn with_monitor_config(mut self, config: MonitorConfig) -> Self {
        self.monitor = config;
        self
    }

    pub fn with_process(mut self, entry: ProcessEntry) -> Self {
        self.processes.push(entry);
        self
    }

    pub fn with_dependency(mut self, entry: DependencyEntry) -> Self {
        self.dependencies.push(entry);
        self
    }

    /// Registers everything with a fresh state store and restores persisted
    /// offline queues. Processes are not started.
    pub async fn build(self) -> Result<Orchestrator, CoreError> {
        let store = Arc::new(StateStore::new());

        let mut processes = BTreeMap::new();
        for entry in self.processes {
            store.register_process(&entry.id);
            let supervisor = ProcessSupervisor::new(entry.id.clone(), entry.probe)
                .with_log_sink(entry.log_sink)
                .with_observer(store.clone())
                .with_spec(entry.spec.clone());
            let managed = ManagedProcess {
                handle: SupervisorHandle::new(supervisor, entry.stop_timeout),
                spec: entry.spec,
                autostart: entry.autostart,
            };
            if processes.insert(entry.id.clone(), managed).is_some() {
                tracing::warn!(process = %entry.id, "duplicate process id, keeping the last one");
            }
        }

        let mut dependencies = BTreeMap::new();
        for entry in self.dependencies {
            let breaker = CircuitBreaker::new(entry.id.clone(), entry.breaker)
                .with_observer(store.clone());
            store.register_dependency(&entry.id, breaker.state());

            let queue_store: Arc<dyn QueueStore> = match entry.queue_store {
                Some(custom) => custom,
                None => Arc::new(MemoryQueueStore::new()),
            };
            let queue = OfflineQueue::open(entry.id.clone(), queue_store, entry.queue, Some(store.clone()))
                .await
                .map_err(|source| CoreError::Storage {
                    dependency: entry.id.clone(),
                    source,
                })?;
            tracing::debug!(
                dependency = %entry.id,
                transport = %entry.transport.describe(),
                queued = queue.depth(),
                "dependency registered"
            );

            let dependency = Dependency::new(
                entry.id.clone(),
                breaker,
                RetryPolicy::new(entry.retry),
                queue,
                entry.transport,
                store.clone(),
            );
            if dependencies.insert(entry.id.clone(), Arc::new(dependency)).is_some() {
                tracing::warn!(dependency = %entry.id, "duplicate dependency id, keeping the last one");
            }
        }

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Orchestrator {
            store,
            processes,
            dependencies,
            monitor_config: self.monitor,
            shutdown_tx,
            monitor_task: Mutex::new(None),
        })
    }
}
