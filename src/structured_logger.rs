//! Structured JSONL event log for post-mortem debugging.
//!
//! Every core event is appended to `events.jsonl` with:
//! - Monotonic sequence numbers for ordering
//! - ISO 8601 timestamps with microsecond precision
//! - A run ID that is fresh for each daemon start
//! - The event itself as tagged JSON

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::store::CoreEvent;

pub struct StructuredLogger {
    run_id: String,
    seq: AtomicU64,
    log_file: Mutex<File>,
    log_path: PathBuf,
}

/// A single log entry in JSONL format.
#[derive(Debug, Serialize, Deserialize)]
pub struct LogEntry {
    /// Monotonic sequence number within one run
    pub seq: u64,
    /// ISO 8601 timestamp with microseconds
    pub ts: String,
    pub run_id: String,
    /// Process or dependency the entry is about
    pub subject: String,
    pub event: Value,
}

impl StructuredLogger {
    /// Opens `<logs_dir>/events.jsonl` for appending.
    pub fn new(logs_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(logs_dir)?;
        Self::open(&logs_dir.join("events.jsonl"))
    }

    pub fn open(log_path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        Ok(Self {
            run_id: Uuid::new_v4().to_string(),
            seq: AtomicU64::new(0),
            log_file: Mutex::new(file),
            log_path: log_path.to_path_buf(),
        })
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Appends one entry. Write failures are dropped; the event log must
    /// never take the daemon down.
    pub fn log(&self, subject: &str, event: impl Serialize) {
        let entry = LogEntry {
            seq: self.next_seq(),
            ts: Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
            run_id: self.run_id.clone(),
            subject: subject.to_string(),
            event: serde_json::to_value(event).unwrap_or(Value::Null),
        };

        if let Ok(mut file) = self.log_file.lock() {
            if let Ok(line) = serde_json::to_string(&entry) {
                let _ = writeln!(file, "{}", line);
                let _ = file.flush();
            }
        }
    }

    pub fn log_event(&self, event: &CoreEvent) {
        self.log(event.subject(), event);
    }

    /// Records every event from `events` until the channel closes.
    pub async fn follow(&self, mut events: broadcast::Receiver<CoreEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.log_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event log fell behind");
                    self.log(
                        "voxkeeper",
                        serde_json::json!({ "type": "events_skipped", "count": skipped }),
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

#[cfg(test)]
#[path = "tests/structured_logger_tests.rs"]
mod tests;
