//! Liveness probes used during startup and by the health monitor.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Default bound on a single probe call.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// The probe did not answer within its bound.
    Timeout(Duration),
    /// Nothing is listening or the connection failed.
    Unreachable(String),
    /// The service answered but reported itself unhealthy.
    Unhealthy(String),
}

impl Display for ProbeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeError::Timeout(after) => write!(f, "probe timed out after {:?}", after),
            ProbeError::Unreachable(msg) => write!(f, "unreachable: {}", msg),
            ProbeError::Unhealthy(msg) => write!(f, "unhealthy: {}", msg),
        }
    }
}

impl std::error::Error for ProbeError {}

/// Answers "is the process actually serving?".
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn check(&self) -> Result<(), ProbeError>;

    fn describe(&self) -> String;
}

/// HTTP GET, any 2xx is healthy.
pub struct HttpProbe {
    url: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl LivenessProbe for HttpProbe {
    async fn check(&self) -> Result<(), ProbeError> {
        let url = self.url.clone();
        let timeout = self.timeout;
        let status = tokio::task::spawn_blocking(move || {
            let agent: ureq::Agent = ureq::Agent::config_builder()
                .timeout_global(Some(timeout))
                .http_status_as_error(false)
                .build()
                .into();
            agent
                .get(&url)
                .call()
                .map(|response| response.status().as_u16())
        })
        .await
        .map_err(|e| ProbeError::Unreachable(format!("probe task failed: {}", e)))?;

        match status {
            Ok(code) if (200..300).contains(&code) => Ok(()),
            Ok(code) => Err(ProbeError::Unhealthy(format!("HTTP {}", code))),
            Err(ureq::Error::Timeout(_)) => Err(ProbeError::Timeout(timeout)),
            Err(e) => Err(ProbeError::Unreachable(e.to_string())),
        }
    }

    fn describe(&self) -> String {
        format!("GET {}", self.url)
    }
}

/// Healthy when a TCP connection can be opened.
pub struct TcpProbe {
    addr: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl LivenessProbe for TcpProbe {
    async fn check(&self) -> Result<(), ProbeError> {
        match tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(&self.addr)).await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(ProbeError::Unreachable(e.to_string())),
            Err(_) => Err(ProbeError::Timeout(self.timeout)),
        }
    }

    fn describe(&self) -> String {
        format!("tcp {}", self.addr)
    }
}

/// Probe backed by a closure, bounded by a timeout.
pub struct FnProbe<F> {
    name: String,
    check: F,
    timeout: Duration,
}

impl<F> FnProbe<F>
where
    F: Fn() -> BoxFuture<'static, Result<(), ProbeError>> + Send + Sync,
{
    pub fn new(name: impl Into<String>, check: F) -> Self {
        Self {
            name: name.into(),
            check,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl<F> LivenessProbe for FnProbe<F>
where
    F: Fn() -> BoxFuture<'static, Result<(), ProbeError>> + Send + Sync,
{
    async fn check(&self) -> Result<(), ProbeError> {
        match tokio::time::timeout(self.timeout, (self.check)()).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout(self.timeout)),
        }
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
#[path = "tests/probe_tests.rs"]
mod tests;
