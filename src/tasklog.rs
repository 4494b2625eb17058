//! Per-task human-readable log file, append-only under `logs/<task_id>.log`.
//!
//! This sits alongside the crate-wide `log` facade: `log::info!` etc. go to
//! whatever subscriber the binary installs, while `TaskLog` keeps a durable
//! per-task transcript an operator can fetch through `logs(id, pagination)`
//! without depending on the process's own stdout history.

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;

use chrono::Local;

use crate::error::Result;

pub struct TaskLog {
    dir: PathBuf,
}

impl TaskLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.log"))
    }

    /// Appends one timestamped line. Never fails the caller's operation if
    /// the log write itself fails is a design choice the worker makes at
    /// the call site, not here — this returns the error so the caller can
    /// decide.
    pub fn append(&self, task_id: &str, msg: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let ts = Local::now().format("%Y-%m-%d %H:%M:%S");
        let line = format!("[{ts}] [{task_id}] {msg}\n");
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(task_id))?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Reads a page of lines, 0-indexed from the start of the file.
    pub fn read(&self, task_id: &str, offset: usize, limit: usize) -> Result<Vec<String>> {
        let path = self.path(task_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(path)?;
        Ok(text
            .lines()
            .skip(offset)
            .take(limit)
            .map(|s| s.to_string())
            .collect())
    }

    pub fn delete(&self, task_id: &str) -> Result<()> {
        let path = self.path(task_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}
