//! Destinations for child stdout/stderr lines.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// Receives every line a supervised process writes.
pub trait LogSink: Send + Sync {
    fn line(&self, process: &str, stream: OutputStream, line: &str);
}

/// Forwards lines to `tracing` under the `child` target.
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn line(&self, process: &str, stream: OutputStream, line: &str) {
        match stream {
            OutputStream::Stdout => {
                tracing::info!(target: "child", process, "{}", line)
            }
            OutputStream::Stderr => {
                tracing::warn!(target: "child", process, "{}", line)
            }
        }
    }
}

/// Appends lines to a per-process log file.
pub struct FileLogSink {
    file: Mutex<File>,
}

impl FileLogSink {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        writeln!(file, "\n=== process log started at {} ===", now)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl LogSink for FileLogSink {
    fn line(&self, process: &str, stream: OutputStream, line: &str) {
        let mut file = self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = chrono::Local::now().format("%H:%M:%S%.3f");
        let _ = writeln!(file, "[{}][{}][{}] {}", now, process, stream.as_str(), line);
        let _ = file.flush();
    }
}
