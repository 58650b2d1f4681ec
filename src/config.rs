use crate::monitor::MonitorConfig;
use crate::queue::QueueConfig;
use crate::resilience::{BreakerConfig, RetryConfig};
use crate::serde_util::duration_ms;
use crate::supervisor::probe::DEFAULT_PROBE_TIMEOUT;
use crate::supervisor::process::{DEFAULT_PROBE_INTERVAL, DEFAULT_STARTUP_TIMEOUT};
use crate::supervisor::{HttpProbe, LivenessProbe, ProcessSpec, TcpProbe, DEFAULT_STOP_TIMEOUT};
use crate::transport::{HttpTransport, DEFAULT_REQUEST_TIMEOUT};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_CONFIG_YAML: &str = include_str!("../voxkeeper.yaml");

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Managed child processes, keyed by id.
    #[serde(default)]
    pub processes: BTreeMap<String, ProcessConfig>,
    /// Outbound dependencies, keyed by id.
    #[serde(default)]
    pub dependencies: BTreeMap<String, DependencyConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProcessConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    pub health: HealthCheck,
    #[serde(
        default = "default_startup_timeout",
        with = "duration_ms",
        rename = "startup_timeout_ms"
    )]
    pub startup_timeout: Duration,
    #[serde(
        default = "default_probe_interval",
        with = "duration_ms",
        rename = "probe_interval_ms"
    )]
    pub probe_interval: Duration,
    #[serde(
        default = "default_stop_timeout",
        with = "duration_ms",
        rename = "stop_timeout_ms"
    )]
    pub stop_timeout: Duration,
    /// Started by `voxkeeper run`. Default: true
    #[serde(default = "default_true")]
    pub autostart: bool,
    /// Write stdout/stderr to `logs/<id>.log` instead of the daemon log. Default: true
    #[serde(default = "default_true")]
    pub log_to_file: bool,
}

/// How a managed process proves it is alive.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthCheck {
    /// GET `url`; any 2xx is healthy.
    Http {
        url: String,
        #[serde(default = "default_probe_timeout", with = "duration_ms", rename = "timeout_ms")]
        timeout: Duration,
    },
    /// A TCP connection to `addr` succeeds.
    Tcp {
        addr: String,
        #[serde(default = "default_probe_timeout", with = "duration_ms", rename = "timeout_ms")]
        timeout: Duration,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DependencyConfig {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Environment variable holding the API key, if the endpoint needs one.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Header carrying the raw key. Unset means `Authorization: Bearer <key>`.
    #[serde(default)]
    pub api_key_header: Option<String>,
    #[serde(
        default = "default_request_timeout",
        with = "duration_ms",
        rename = "request_timeout_ms"
    )]
    pub request_timeout: Duration,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

fn default_true() -> bool {
    true
}

fn default_startup_timeout() -> Duration {
    DEFAULT_STARTUP_TIMEOUT
}

fn default_probe_interval() -> Duration {
    DEFAULT_PROBE_INTERVAL
}

fn default_stop_timeout() -> Duration {
    DEFAULT_STOP_TIMEOUT
}

fn default_probe_timeout() -> Duration {
    DEFAULT_PROBE_TIMEOUT
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

impl CoreConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Loads `path` if it exists, otherwise the built-in configuration.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!(path = %path.display(), "no config file, using built-in defaults");
            Self::default_config()
        }
    }

    /// The configuration shipped in `voxkeeper.yaml`.
    pub fn default_config() -> Result<Self> {
        Self::from_yaml(DEFAULT_CONFIG_YAML).context("Built-in configuration is invalid")
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(content).context("Failed to parse config as YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let monitor = &self.monitor;
        if monitor.interval.is_zero() {
            anyhow::bail!("monitor.interval_ms must be greater than zero");
        }
        if monitor.restart_window.is_zero() {
            anyhow::bail!("monitor.restart_window_ms must be greater than zero");
        }
        if monitor.backoff_base > monitor.backoff_max {
            anyhow::bail!(
                "monitor.backoff_base_ms ({}) exceeds backoff_max_ms ({})",
                monitor.backoff_base.as_millis(),
                monitor.backoff_max.as_millis()
            );
        }

        for (id, process) in &self.processes {
            validate_id("process", id)?;
            if process.command.trim().is_empty() {
                anyhow::bail!("Process '{}' has an empty command", id);
            }
            if process.startup_timeout.is_zero() || process.probe_interval.is_zero() {
                anyhow::bail!(
                    "Process '{}' needs non-zero startup_timeout_ms and probe_interval_ms",
                    id
                );
            }
            match &process.health {
                HealthCheck::Http { url, .. } => validate_url(&format!("process '{}' health", id), url)?,
                HealthCheck::Tcp { addr, .. } if addr.trim().is_empty() => {
                    anyhow::bail!("Process '{}' has an empty health check address", id);
                }
                HealthCheck::Tcp { .. } => {}
            }
        }

        for (id, dependency) in &self.dependencies {
            validate_id("dependency", id)?;
            validate_url(&format!("dependency '{}'", id), &dependency.url)?;
            if dependency.breaker.failure_threshold == 0 {
                anyhow::bail!("Dependency '{}': breaker.failure_threshold must be at least 1", id);
            }
            if dependency.retry.max_retries == 0 {
                anyhow::bail!("Dependency '{}': retry.max_retries must be at least 1", id);
            }
            if dependency.queue.max_size == 0 || dependency.queue.max_attempts == 0 {
                anyhow::bail!(
                    "Dependency '{}': queue.max_size and queue.max_attempts must be at least 1",
                    id
                );
            }
        }
        Ok(())
    }
}

impl ProcessConfig {
    pub fn spec(&self) -> ProcessSpec {
        let mut spec = ProcessSpec::new(self.command.clone())
            .with_args(self.args.iter().cloned())
            .with_startup_timeout(self.startup_timeout)
            .with_probe_interval(self.probe_interval);
        for (key, value) in &self.env {
            spec = spec.with_env(key.clone(), value.clone());
        }
        if let Some(dir) = &self.working_dir {
            spec = spec.with_working_dir(dir.clone());
        }
        spec
    }

    pub fn probe(&self) -> Arc<dyn LivenessProbe> {
        match &self.health {
            HealthCheck::Http { url, timeout } => {
                Arc::new(HttpProbe::new(url.clone()).with_timeout(*timeout))
            }
            HealthCheck::Tcp { addr, timeout } => {
                Arc::new(TcpProbe::new(addr.clone()).with_timeout(*timeout))
            }
        }
    }
}

impl DependencyConfig {
    /// HTTP transport with configured headers. A missing API key variable is
    /// logged and the request goes out unauthenticated.
    pub fn transport(&self) -> HttpTransport {
        let mut transport = HttpTransport::new(self.url.clone()).with_timeout(self.request_timeout);
        for (name, value) in &self.headers {
            transport = transport.with_header(name.clone(), value.clone());
        }
        let Some(var) = &self.api_key_env else {
            return transport;
        };
        match std::env::var(var) {
            Ok(key) if !key.is_empty() => match &self.api_key_header {
                Some(header) => transport.with_header(header.clone(), key),
                None => transport.with_bearer_token(&key),
            },
            _ => {
                tracing::warn!(url = %self.url, env = %var, "API key variable not set");
                transport
            }
        }
    }
}

/// Ids name log and queue files, so keep them to a safe character set.
fn validate_id(kind: &str, id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        anyhow::bail!(
            "Invalid {} id '{}': use letters, digits, '-' or '_'",
            kind,
            id
        );
    }
    Ok(())
}

fn validate_url(what: &str, url: &str) -> Result<()> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        anyhow::bail!("{} url must start with http:// or https://, got '{}'", what, url);
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
