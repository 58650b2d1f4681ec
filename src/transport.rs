//! Outbound-call contract for remote dependencies.
//!
//! A transport only reports what happened on the wire; retry, breaker and
//! queueing decisions are made by the orchestrator.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt::{Display, Formatter};
use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Successful (2xx) reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Worth retrying: connection failure, timeout, 408, 429 or 5xx.
    Transient(String),
    /// Retrying will not help: any other non-2xx reply.
    Permanent(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            TransportError::Transient(msg) | TransportError::Permanent(msg) => msg,
        }
    }
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Transient(msg) => write!(f, "transient failure: {}", msg),
            TransportError::Permanent(msg) => write!(f, "permanent failure: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

/// Maps an HTTP status to success or a classified failure.
pub fn classify_status(status: u16) -> Result<(), TransportError> {
    match status {
        200..=299 => Ok(()),
        408 | 429 | 500..=599 => Err(TransportError::Transient(format!("HTTP {}", status))),
        _ => Err(TransportError::Permanent(format!("HTTP {}", status))),
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, payload: &[u8]) -> Result<Response, TransportError>;

    fn describe(&self) -> String;
}

/// JSON POST to a webhook or REST endpoint.
pub struct HttpTransport {
    url: String,
    headers: Vec<(String, String)>,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
        self
    }

    pub fn with_bearer_token(self, token: &str) -> Self {
        self.with_header("Authorization", format!("Bearer {}", token))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, payload: &[u8]) -> Result<Response, TransportError> {
        let url = self.url.clone();
        let headers = self.headers.clone();
        let timeout = self.timeout;
        let body = payload.to_vec();

        tokio::task::spawn_blocking(move || {
            let agent: ureq::Agent = ureq::Agent::config_builder()
                .timeout_global(Some(timeout))
                .http_status_as_error(false)
                .build()
                .into();

            let mut request = agent.post(&url);
            for (name, value) in &headers {
                request = request.header(name.as_str(), value.as_str());
            }
            let mut response = request
                .send(&body[..])
                .map_err(|e| TransportError::Transient(e.to_string()))?;

            let status = response.status().as_u16();
            classify_status(status)?;
            let body = response
                .body_mut()
                .read_to_vec()
                .map_err(|e| TransportError::Transient(format!("reading response: {}", e)))?;
            Ok(Response { status, body })
        })
        .await
        .map_err(|e| TransportError::Transient(format!("transport task failed: {}", e)))?
    }

    fn describe(&self) -> String {
        format!("POST {}", self.url)
    }
}

/// Transport backed by a closure; used for embedding and tests.
pub struct FnTransport<F> {
    name: String,
    send: F,
}

impl<F> FnTransport<F>
where
    F: Fn(Vec<u8>) -> BoxFuture<'static, Result<Response, TransportError>> + Send + Sync,
{
    pub fn new(name: impl Into<String>, send: F) -> Self {
        Self {
            name: name.into(),
            send,
        }
    }
}

#[async_trait]
impl<F> Transport for FnTransport<F>
where
    F: Fn(Vec<u8>) -> BoxFuture<'static, Result<Response, TransportError>> + Send + Sync,
{
    async fn send(&self, payload: &[u8]) -> Result<Response, TransportError> {
        (self.send)(payload.to_vec()).await
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}
