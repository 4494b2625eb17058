//! Registry of running sync tasks: start/stop/reset/delete/status, backed by
//! persisted configs and checkpoints so tasks survive a process restart.
//!
//! Mirrors `TaskManager` from the Python source: a lock guards the registry
//! map itself, but a worker's actual run loop executes on its own thread,
//! outside that lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::info;

use crate::checkpoint::CheckpointStore;
use crate::config::TaskConfig;
use crate::config_store::ConfigStore;
use crate::error::{Result, SyncError};
use crate::metrics::Metrics;
use crate::tasklog::TaskLog;
use crate::worker::{Phase, WorkerStatus};

/// Everything needed to drive one task to completion, injected so the
/// manager has no direct dependency on MySQL/MongoDB client construction —
/// only the worker and supervisor modules know about those.
pub trait TaskRunner: Send + Sync {
    fn run(
        &self,
        config: TaskConfig,
        checkpoints: Arc<CheckpointStore>,
        task_log: Arc<TaskLog>,
        stop: Arc<AtomicBool>,
        status: Arc<Mutex<WorkerStatus>>,
    );
}

struct RunningTask {
    stop: Arc<AtomicBool>,
    status: Arc<Mutex<WorkerStatus>>,
    handle: Option<JoinHandle<()>>,
}

pub struct TaskManager {
    runner: Arc<dyn TaskRunner>,
    configs: Arc<ConfigStore>,
    checkpoints: Arc<CheckpointStore>,
    task_log: Arc<TaskLog>,
    tasks: Mutex<HashMap<String, RunningTask>>,
}

impl TaskManager {
    pub fn new(
        runner: Arc<dyn TaskRunner>,
        configs: Arc<ConfigStore>,
        checkpoints: Arc<CheckpointStore>,
        task_log: Arc<TaskLog>,
    ) -> Self {
        Self {
            runner,
            configs,
            checkpoints,
            task_log,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.tasks.lock().unwrap().contains_key(task_id)
    }

    /// Persists `config` and spawns a supervised worker thread for it.
    pub fn start(&self, config: TaskConfig) -> Result<()> {
        config.validate()?;
        self.configs.save(&config)?;
        self.spawn(config);
        Ok(())
    }

    /// Loads a previously persisted config and starts it (resuming from
    /// whatever checkpoint the task already has).
    pub fn start_by_id(&self, task_id: &str) -> Result<()> {
        let config = self
            .configs
            .load(task_id)?
            .ok_or_else(|| SyncError::config_invalid(format!("no config for task {task_id}")))?;
        self.spawn(config);
        Ok(())
    }

    fn spawn(&self, config: TaskConfig) {
        let task_id = config.task_id.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let status = Arc::new(Mutex::new(WorkerStatus {
            task_id: task_id.clone(),
            phase: Phase::Initializing,
            metrics: Metrics::default(),
        }));

        let runner = Arc::clone(&self.runner);
        let checkpoints = Arc::clone(&self.checkpoints);
        let task_log = Arc::clone(&self.task_log);
        let stop_for_thread = Arc::clone(&stop);
        let status_for_thread = Arc::clone(&status);

        let handle = thread::spawn(move || {
            runner.run(config, checkpoints, task_log, stop_for_thread, status_for_thread);
        });

        let mut tasks = self.tasks.lock().unwrap();
        tasks.insert(
            task_id,
            RunningTask {
                stop,
                status,
                handle: Some(handle),
            },
        );
    }

    /// Signals the worker to stop and removes it from the registry. The
    /// thread is left to exit on its own (detached, not joined) — mirrors
    /// the Python source's daemon threads, which are never waited on either.
    pub fn stop(&self, task_id: &str) {
        let removed = self.tasks.lock().unwrap().remove(task_id);
        if let Some(task) = removed {
            task.stop.store(true, Ordering::SeqCst);
        }
        info!("task={task_id} stopped");
    }

    /// Signals the worker but leaves the registry entry intact, for a
    /// graceful drain before process shutdown.
    pub fn stop_soft(&self, task_id: &str) {
        if let Some(task) = self.tasks.lock().unwrap().get(task_id) {
            task.stop.store(true, Ordering::SeqCst);
        }
    }

    /// Deletes the task's checkpoint only; the next start re-runs full sync.
    pub fn reset(&self, task_id: &str) -> Result<()> {
        self.checkpoints.reset(task_id)?;
        info!("task={task_id} reset (checkpoint cleared)");
        Ok(())
    }

    /// Stops the task and deletes its config, checkpoint, and log.
    pub fn delete(&self, task_id: &str) -> Result<()> {
        self.stop(task_id);
        self.configs.delete(task_id)?;
        self.checkpoints.reset(task_id)?;
        self.task_log.delete(task_id)?;
        info!("task={task_id} deleted");
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<String>> {
        self.configs.list_task_ids()
    }

    /// Status of a running task from its live, shared snapshot; falls back
    /// to the persisted checkpoint's metrics for a task that isn't running.
    pub fn status(&self, task_id: &str) -> Result<Option<WorkerStatus>> {
        if let Some(task) = self.tasks.lock().unwrap().get(task_id) {
            return Ok(Some(task.status.lock().unwrap().clone()));
        }
        let checkpoint = self.checkpoints.load(task_id)?;
        Ok(checkpoint.map(|cp| WorkerStatus {
            task_id: task_id.to_string(),
            phase: Phase::Stopped,
            metrics: cp.metrics,
        }))
    }

    pub fn status_all(&self) -> Result<Vec<WorkerStatus>> {
        let mut seen = std::collections::HashSet::new();
        let mut result = Vec::new();
        for (task_id, task) in self.tasks.lock().unwrap().iter() {
            seen.insert(task_id.clone());
            result.push(task.status.lock().unwrap().clone());
        }
        for task_id in self.configs.list_task_ids()? {
            if seen.contains(&task_id) {
                continue;
            }
            if let Some(status) = self.status(&task_id)? {
                result.push(status);
            }
        }
        Ok(result)
    }

    /// Starts every persisted config at boot. Mirrors restoring only the
    /// tasks the Python source's DB marks `status="running"` — here that
    /// distinction collapses to "every config on disk", since a stopped
    /// task's config is deleted (`delete`) rather than left in place.
    pub fn restore_from_disk(&self) -> Result<()> {
        for task_id in self.configs.list_task_ids()? {
            if let Err(e) = self.start_by_id(&task_id) {
                info!("task={task_id} restore failed: {e}");
            }
        }
        Ok(())
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        let mut tasks = self.tasks.lock().unwrap();
        for (_, task) in tasks.iter_mut() {
            task.stop.store(true, Ordering::SeqCst);
            if let Some(handle) = task.handle.take() {
                let _ = handle.join();
            }
        }
    }
}
