//! Checkpoint persistence: the `(log_file, log_pos)` pair a worker resumes
//! incremental sync from, plus a snapshot of its running metrics.
//!
//! Checkpoints are written atomically (temp file + rename) so a crash mid
//! write never leaves a torn file behind for the next `load` to choke on.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::metrics::Metrics;

/// Binlog replication position plus the metrics snapshot taken at the same
/// instant, so `status()` can report counters consistent with the position.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Checkpoint {
    pub log_file: String,
    pub log_pos: u64,
    #[serde(default)]
    pub metrics: Metrics,
}

impl Checkpoint {
    pub fn new(log_file: impl Into<String>, log_pos: u64) -> Self {
        Self {
            log_file: log_file.into(),
            log_pos,
            metrics: Metrics::default(),
        }
    }
}

/// Loads and atomically persists one task's checkpoint under `state/<task_id>.json`.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.json"))
    }

    pub fn load(&self, task_id: &str) -> Result<Option<Checkpoint>> {
        let path = self.path(task_id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Write-temp-then-rename so a reader never observes a partial file.
    pub fn save(&self, task_id: &str, checkpoint: &Checkpoint) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        let tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        fs::write(tmp.path(), &bytes)?;
        tmp.persist(self.path(task_id))
            .map_err(|e| crate::error::SyncError::Io(e.error))?;
        Ok(())
    }

    /// Deletes a task's checkpoint so the next `start` re-runs full sync.
    pub fn reset(&self, task_id: &str) -> Result<()> {
        let path = self.path(task_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn exists(&self, task_id: &str) -> bool {
        self.path(task_id).exists()
    }
}

/// Rate-limits checkpoint saves to at most once per `min_interval`, except a
/// forced save always writes through. Mirrors the worker's own
/// `state_save_interval_sec` throttling of `_maybe_save_state`.
pub struct SaveThrottle {
    min_interval: std::time::Duration,
    last_saved: Option<std::time::Instant>,
}

impl SaveThrottle {
    pub fn new(min_interval: std::time::Duration) -> Self {
        Self {
            min_interval,
            last_saved: None,
        }
    }

    pub fn should_save(&self, force: bool) -> bool {
        if force {
            return true;
        }
        match self.last_saved {
            None => true,
            Some(t) => t.elapsed() >= self.min_interval,
        }
    }

    pub fn mark_saved(&mut self) {
        self.last_saved = Some(std::time::Instant::now());
    }
}
