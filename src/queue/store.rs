//! Storage backends for the offline queue.
//!
//! The file backend keeps one JSONL journal per dependency:
//! - `<dependency>.queue.jsonl`: append / update / remove records, replayed on load
//! - `<dependency>.dead.jsonl`: dead letters, append-only
//!
//! Every write is fsynced under an exclusive `fs2` lock before it returns.
//! The journal is compacted (temp file + rename) every `compact_every` records.

use super::{DeadLetter, QueueError, QueuedRequest};
use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

/// Journal records between compactions.
pub const DEFAULT_COMPACT_EVERY: usize = 256;

/// Durable storage contract for one dependency's queue.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Persists a new entry. Must be durable when this returns.
    async fn append(&self, request: &QueuedRequest) -> Result<(), QueueError>;

    /// All live entries, oldest first.
    async fn load(&self) -> Result<Vec<QueuedRequest>, QueueError>;

    /// Replaces the stored entry with the same id.
    async fn update(&self, request: &QueuedRequest) -> Result<(), QueueError>;

    async fn remove(&self, id: Uuid) -> Result<(), QueueError>;

    /// Records a dead letter and removes its request from the live queue.
    async fn dead_letter(&self, letter: &DeadLetter) -> Result<(), QueueError>;

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError>;
}

/// Non-durable store for embedding and tests.
#[derive(Default)]
pub struct MemoryQueueStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    live: Vec<QueuedRequest>,
    dead: Vec<DeadLetter>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn append(&self, request: &QueuedRequest) -> Result<(), QueueError> {
        self.lock().live.push(request.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Vec<QueuedRequest>, QueueError> {
        Ok(self.lock().live.clone())
    }

    async fn update(&self, request: &QueuedRequest) -> Result<(), QueueError> {
        let mut inner = self.lock();
        if let Some(existing) = inner.live.iter_mut().find(|r| r.id == request.id) {
            *existing = request.clone();
        }
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<(), QueueError> {
        self.lock().live.retain(|r| r.id != id);
        Ok(())
    }

    async fn dead_letter(&self, letter: &DeadLetter) -> Result<(), QueueError> {
        let mut inner = self.lock();
        inner.live.retain(|r| r.id != letter.request.id);
        inner.dead.push(letter.clone());
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        Ok(self.lock().dead.clone())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
    Append { request: QueuedRequest },
    Update { request: QueuedRequest },
    Remove { id: Uuid },
}

/// JSONL journal on disk.
pub struct FileQueueStore {
    journal_path: PathBuf,
    dead_letter_path: PathBuf,
    compact_every: usize,
    records_since_compact: AtomicUsize,
    /// Serializes journal I/O so an append never races a compaction rename.
    io: tokio::sync::Mutex<()>,
}

impl FileQueueStore {
    /// Opens (creating `dir` if needed) the journal for `dependency`.
    pub fn open(dir: &Path, dependency: &str) -> Result<Self, QueueError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            journal_path: dir.join(format!("{}.queue.jsonl", dependency)),
            dead_letter_path: dir.join(format!("{}.dead.jsonl", dependency)),
            compact_every: DEFAULT_COMPACT_EVERY,
            records_since_compact: AtomicUsize::new(0),
            io: tokio::sync::Mutex::new(()),
        })
    }

    pub fn with_compact_every(mut self, records: usize) -> Self {
        self.compact_every = records.max(1);
        self
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    pub fn dead_letter_path(&self) -> &Path {
        &self.dead_letter_path
    }

    async fn write_record(&self, record: JournalRecord) -> Result<(), QueueError> {
        let _io = self.io.lock().await;
        self.write_record_locked(record).await
    }

    async fn write_record_locked(&self, record: JournalRecord) -> Result<(), QueueError> {
        let path = self.journal_path.clone();
        blocking(move || append_line(&path, &record)).await?;
        self.after_write().await
    }

    async fn after_write(&self) -> Result<(), QueueError> {
        let written = self.records_since_compact.fetch_add(1, Ordering::SeqCst) + 1;
        if written < self.compact_every {
            return Ok(());
        }
        self.records_since_compact.store(0, Ordering::SeqCst);
        let journal = self.journal_path.clone();
        let dead = self.dead_letter_path.clone();
        blocking(move || compact(&journal, &dead)).await
    }
}

#[async_trait]
impl QueueStore for FileQueueStore {
    async fn append(&self, request: &QueuedRequest) -> Result<(), QueueError> {
        self.write_record(JournalRecord::Append {
            request: request.clone(),
        })
        .await
    }

    async fn load(&self) -> Result<Vec<QueuedRequest>, QueueError> {
        let _io = self.io.lock().await;
        let journal = self.journal_path.clone();
        let dead = self.dead_letter_path.clone();
        let (live, records) = blocking(move || {
            let records = read_lines::<JournalRecord>(&journal)?;
            let count = records.len();
            let dead_ids = dead_letter_ids(&dead)?;
            Ok((apply_records(records, &dead_ids), count))
        })
        .await?;
        self.records_since_compact.store(records, Ordering::SeqCst);
        Ok(live)
    }

    async fn update(&self, request: &QueuedRequest) -> Result<(), QueueError> {
        self.write_record(JournalRecord::Update {
            request: request.clone(),
        })
        .await
    }

    async fn remove(&self, id: Uuid) -> Result<(), QueueError> {
        self.write_record(JournalRecord::Remove { id }).await
    }

    async fn dead_letter(&self, letter: &DeadLetter) -> Result<(), QueueError> {
        let dead = self.dead_letter_path.clone();
        let letter = letter.clone();
        let id = letter.request.id;
        let _io = self.io.lock().await;
        blocking(move || append_line(&dead, &letter)).await?;
        self.write_record_locked(JournalRecord::Remove { id }).await
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        let dead = self.dead_letter_path.clone();
        blocking(move || read_lines::<DeadLetter>(&dead)).await
    }
}

async fn blocking<T, F>(f: F) -> Result<T, QueueError>
where
    F: FnOnce() -> Result<T, QueueError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| QueueError::Io(std::io::Error::other(e.to_string())))?
}

fn append_line<T: Serialize>(path: &Path, value: &T) -> Result<(), QueueError> {
    let line = serde_json::to_string(value)?;
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;
    file.lock_exclusive()?;
    repair_torn_tail(&mut file, path)?;
    writeln!(file, "{}", line)?;
    file.flush()?;
    file.sync_all()?;
    Ok(())
}

/// Makes sure the file ends on a line boundary before anything is appended.
///
/// A final line without its newline is either a complete record whose
/// newline was lost (terminated in place) or a fragment from a crash
/// mid-write (truncated away). Caller holds the exclusive lock.
fn repair_torn_tail(file: &mut File, path: &Path) -> Result<(), QueueError> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(());
    }

    let mut content = Vec::with_capacity(len as usize);
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut content)?;
    let tail_start = content
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |pos| pos + 1);
    let tail = &content[tail_start..];
    if serde_json::from_slice::<serde_json::Value>(tail).is_ok() {
        file.write_all(b"\n")?;
    } else {
        tracing::warn!(
            path = %path.display(),
            bytes = tail.len(),
            "truncating torn final journal line"
        );
        file.set_len(tail_start as u64)?;
    }
    file.sync_all()?;
    Ok(())
}

/// Reads every JSONL record. A torn final line (crash mid-write) is skipped;
/// corruption anywhere else is an error.
fn read_lines<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>, QueueError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    file.lock_shared()?;

    let lines = BufReader::new(file)
        .lines()
        .collect::<Result<Vec<_>, _>>()?;
    let last = lines.len().saturating_sub(1);
    let mut values = Vec::with_capacity(lines.len());
    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(value) => values.push(value),
            Err(e) if idx == last => {
                tracing::warn!(path = %path.display(), error = %e, "skipping torn final journal line");
            }
            Err(e) => {
                return Err(QueueError::Corrupt(format!(
                    "{} line {}: {}",
                    path.display(),
                    idx + 1,
                    e
                )))
            }
        }
    }
    Ok(values)
}

fn dead_letter_ids(path: &Path) -> Result<HashSet<Uuid>, QueueError> {
    Ok(read_lines::<DeadLetter>(path)?
        .into_iter()
        .map(|letter| letter.request.id)
        .collect())
}

/// Folds journal records into the live entries, preserving insertion order.
fn apply_records(records: Vec<JournalRecord>, dead_ids: &HashSet<Uuid>) -> Vec<QueuedRequest> {
    let mut live: Vec<QueuedRequest> = Vec::new();
    for record in records {
        match record {
            JournalRecord::Append { request } => {
                if !live.iter().any(|r| r.id == request.id) {
                    live.push(request);
                }
            }
            JournalRecord::Update { request } => {
                if let Some(existing) = live.iter_mut().find(|r| r.id == request.id) {
                    *existing = request;
                }
            }
            JournalRecord::Remove { id } => live.retain(|r| r.id != id),
        }
    }
    // A crash between the dead-letter write and the journal removal leaves
    // the entry in both files; the dead-letter log wins.
    live.retain(|r| !dead_ids.contains(&r.id));
    live
}

fn compact(journal: &Path, dead: &Path) -> Result<(), QueueError> {
    let lock = match OpenOptions::new().read(true).write(true).open(journal) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    lock.lock_exclusive()?;

    let records = read_records_unlocked(journal)?;
    let live = apply_records(records, &dead_letter_ids(dead)?);

    let tmp_path = journal.with_extension("jsonl.tmp");
    {
        let mut tmp = File::create(&tmp_path)?;
        for request in &live {
            let line = serde_json::to_string(&JournalRecord::Append {
                request: request.clone(),
            })?;
            writeln!(tmp, "{}", line)?;
        }
        tmp.flush()?;
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, journal)?;
    tracing::debug!(path = %journal.display(), live = live.len(), "compacted queue journal");
    Ok(())
}

/// Like `read_lines`, for callers that already hold the exclusive lock.
fn read_records_unlocked(path: &Path) -> Result<Vec<JournalRecord>, QueueError> {
    let content = std::fs::read_to_string(path)?;
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    let last = lines.len().saturating_sub(1);
    let mut records = Vec::with_capacity(lines.len());
    for (idx, line) in lines.iter().enumerate() {
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(_) if idx == last => {}
            Err(e) => return Err(QueueError::Corrupt(e.to_string())),
        }
    }
    Ok(records)
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
