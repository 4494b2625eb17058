//! Reconnect loop wrapping one task's incremental phase. Mirrors
//! `do_inc_sync_with_reconnect`: on any error out of a single incremental
//! pass, reload the checkpoint from disk (never trust the in-memory
//! position, which may be stale relative to what was actually flushed),
//! back off, and reopen the source stream.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{error, info};
use rand::Rng;

use crate::checkpoint::CheckpointStore;
use crate::error::{Result, SyncError};
use crate::introspector::Introspector;
use crate::sink::Sink;
use crate::source::BinlogSource;
use crate::worker::SyncWorker;

/// Builds a fresh [`BinlogSource`] positioned at the given checkpoint, or at
/// the source's current position when `None`. Injected so the supervisor can
/// reopen a connection after every failed attempt without depending on
/// `mysql_cdc` directly.
pub trait SourceOpener: Send + Sync {
    fn open(&self, position: Option<(String, u64)>) -> Result<Box<dyn BinlogSource>>;
}

pub struct Supervisor {
    task_id: String,
    checkpoints: Arc<CheckpointStore>,
    backoff_base: f64,
    backoff_max: f64,
    max_retry: u32,
}

impl Supervisor {
    pub fn new(
        task_id: impl Into<String>,
        checkpoints: Arc<CheckpointStore>,
        backoff_base_sec: f64,
        backoff_max_sec: f64,
        max_retry: u32,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            checkpoints,
            backoff_base: backoff_base_sec,
            backoff_max: backoff_max_sec,
            max_retry,
        }
    }

    /// Runs `worker`'s incremental phase, reopening the source and retrying
    /// with jittered exponential backoff after every failure, until the
    /// phase completes cleanly, the stop flag is observed, or `max_retry`
    /// attempts (0 = unlimited) are exhausted.
    pub fn run_inc_sync_with_reconnect(
        &self,
        worker: &mut SyncWorker,
        opener: &dyn SourceOpener,
        sink: Arc<dyn Sink>,
        introspector: Arc<dyn Introspector>,
        start: Option<(String, u64)>,
    ) -> Result<()> {
        let stop = worker.stop_flag();
        let mut retry = 0u32;
        let mut position = start.or_else(|| self.load_checkpoint_position());
        let mut backoff = self.backoff_base;

        while !stop.load(Ordering::SeqCst) {
            let attempt = opener
                .open(position.clone())
                .and_then(|source| worker.run_inc_sync_once(source, Arc::clone(&sink), Arc::clone(&introspector)));
            match attempt {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if stop.load(Ordering::SeqCst) {
                        info!("task={} IncSync stopped by user", self.task_id);
                        return Ok(());
                    }
                    retry += 1;
                    position = self.load_checkpoint_position().or(position);
                    error!("task={} IncSync crash retry={retry} err={e}", self.task_id);
                }
            }

            if self.max_retry > 0 && retry >= self.max_retry {
                error!("task={} IncSync stopped after max retries", self.task_id);
                return Err(SyncError::source_fatal("max reconnect retries exceeded"));
            }

            let jitter = rand::thread_rng().gen_range(0.0..0.2);
            let sleep_sec = backoff.min(self.backoff_max) + jitter;
            info!(
                "task={} reconnect after {sleep_sec:.2}s from {:?}",
                self.task_id, position
            );
            thread::sleep(Duration::from_secs_f64(sleep_sec));
            backoff = (backoff * 2.0).min(self.backoff_max);
        }
        Ok(())
    }

    fn load_checkpoint_position(&self) -> Option<(String, u64)> {
        self.checkpoints
            .load(&self.task_id)
            .ok()
            .flatten()
            .map(|cp| (cp.log_file, cp.log_pos))
    }
}
