//! Test doubles shared by the orchestrator tests.

use crate::transport::{Response, Transport, TransportError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Replies from a script, then succeeds once the script runs out.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<Result<Response, TransportError>>>,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn fail_transient(&self, times: usize) {
        let mut script = self.script.lock().expect("script lock");
        for _ in 0..times {
            script.push_back(Err(TransportError::Transient("HTTP 503".to_string())));
        }
    }

    pub(crate) fn fail_permanent(&self) {
        self.script
            .lock()
            .expect("script lock")
            .push_back(Err(TransportError::Permanent("HTTP 401".to_string())));
    }

    pub(crate) fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub(crate) fn calls(&self) -> usize {
        self.sent.lock().expect("sent lock").len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, payload: &[u8]) -> Result<Response, TransportError> {
        self.sent.lock().expect("sent lock").push(payload.to_vec());
        let next = self.script.lock().expect("script lock").pop_front();
        next.unwrap_or_else(|| {
            Ok(Response {
                status: 200,
                body: b"ok".to_vec(),
            })
        })
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}
