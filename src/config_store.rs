//! Persists task configs as JSON files under `configs/<task_id>.json`.
//!
//! The core always round-trips plain JSON; a caller that wants at-rest
//! encryption supplies a [`ConfigCodec`] and the store runs bytes through it
//! on the way in and out without knowing anything about the cipher.

use std::fs;
use std::path::PathBuf;

use crate::config::{ConfigCodec, PlainTextCodec, TaskConfig};
use crate::error::Result;

pub struct ConfigStore {
    dir: PathBuf,
    codec: Box<dyn ConfigCodec>,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            codec: Box::new(PlainTextCodec),
        }
    }

    pub fn with_codec(dir: impl Into<PathBuf>, codec: Box<dyn ConfigCodec>) -> Self {
        Self {
            dir: dir.into(),
            codec,
        }
    }

    fn path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.json"))
    }

    pub fn save(&self, config: &TaskConfig) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let plaintext = serde_json::to_vec_pretty(config)?;
        let encoded = self.codec.encode(&plaintext)?;
        let tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        fs::write(tmp.path(), &encoded)?;
        tmp.persist(self.path(&config.task_id))
            .map_err(|e| crate::error::SyncError::Io(e.error))?;
        Ok(())
    }

    pub fn load(&self, task_id: &str) -> Result<Option<TaskConfig>> {
        let path = self.path(task_id);
        if !path.exists() {
            return Ok(None);
        }
        let encoded = fs::read(&path)?;
        let plaintext = self.codec.decode(&encoded)?;
        Ok(Some(serde_json::from_slice(&plaintext)?))
    }

    pub fn delete(&self, task_id: &str) -> Result<()> {
        let path = self.path(task_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Iterates every persisted task config, skipping non-`.json` entries.
    /// Used by `restore_from_disk` at boot.
    pub fn list_task_ids(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(task_id) = name.strip_suffix(".json") {
                ids.push(task_id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}
