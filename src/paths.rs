//! Home-based storage paths under `~/.voxkeeper/`:
//! - `config.yaml` - default configuration file
//! - `queue/` - offline queue journals and dead-letter logs
//! - `logs/` - daemon log, event log, per-process output logs (`<id>.log`)
//!
//! `VOXKEEPER_HOME` replaces the home directory entirely.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

const VOXKEEPER_DIR: &str = ".voxkeeper";

pub const HOME_ENV: &str = "VOXKEEPER_HOME";

/// Returns the storage root, creating it if needed.
pub fn voxkeeper_home_dir() -> Result<PathBuf> {
    let dir = match std::env::var_os(HOME_ENV) {
        Some(custom) if !custom.is_empty() => PathBuf::from(custom),
        _ => dirs::home_dir()
            .context("Could not determine home directory")?
            .join(VOXKEEPER_DIR),
    };
    ensure_dir(&dir)?;
    Ok(dir)
}

/// Returns `~/.voxkeeper/config.yaml`. The file itself may not exist.
pub fn default_config_path() -> Result<PathBuf> {
    Ok(voxkeeper_home_dir()?.join("config.yaml"))
}

/// Returns the offline queue directory: `~/.voxkeeper/queue/`
pub fn queue_dir() -> Result<PathBuf> {
    subdir("queue")
}

/// Returns the logs directory: `~/.voxkeeper/logs/`
pub fn logs_dir() -> Result<PathBuf> {
    subdir("logs")
}

/// Returns the daemon log path: `~/.voxkeeper/logs/voxkeeper.log`
pub fn daemon_log_path() -> Result<PathBuf> {
    Ok(logs_dir()?.join("voxkeeper.log"))
}

/// Returns the structured event log path: `~/.voxkeeper/logs/events.jsonl`
pub fn event_log_path() -> Result<PathBuf> {
    Ok(logs_dir()?.join("events.jsonl"))
}

fn subdir(name: &str) -> Result<PathBuf> {
    let dir = voxkeeper_home_dir()?.join(name);
    ensure_dir(&dir)?;
    Ok(dir)
}

fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))
}

#[cfg(test)]
#[path = "tests/paths_tests.rs"]
mod tests;
