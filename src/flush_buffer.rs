//! Buffers pending writes per collection and drains them on a size or time
//! trigger. Background draining runs on its own thread, following the same
//! shutdown-flag-plus-join shape the teacher's background workers use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::sink::BulkOp;

type WriterFn = dyn Fn(&str, &[BulkOp]) + Send + Sync;
type OnFlushDone = dyn Fn() + Send + Sync;

struct Inner {
    pending: Mutex<HashMap<String, Vec<BulkOp>>>,
    last_flush: Mutex<Instant>,
    shutdown: Mutex<bool>,
    wake: Condvar,
}

/// Time-and-size-bounded write buffer shared between the worker's event
/// loop (which calls `add`/`flush_if_reach_batch`) and a background thread
/// (which calls `flush(force = true)` on a timer).
pub struct FlushBuffer {
    inner: Arc<Inner>,
    batch_size: usize,
    flush_interval: Duration,
    writer: Arc<WriterFn>,
    on_flush_done: Option<Arc<OnFlushDone>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    stop_requested: Arc<AtomicBool>,
}

impl FlushBuffer {
    pub fn new(
        batch_size: usize,
        flush_interval_sec: u64,
        writer: impl Fn(&str, &[BulkOp]) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(HashMap::new()),
                last_flush: Mutex::new(Instant::now()),
                shutdown: Mutex::new(false),
                wake: Condvar::new(),
            }),
            batch_size: batch_size.max(1),
            flush_interval: Duration::from_secs(flush_interval_sec.max(1)),
            writer: Arc::new(writer),
            on_flush_done: None,
            thread: Mutex::new(None),
            stop_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_on_flush_done(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_flush_done = Some(Arc::new(callback));
        self
    }

    pub fn add(&self, collection: &str, op: BulkOp) {
        self.inner
            .pending
            .lock()
            .unwrap()
            .entry(collection.to_string())
            .or_default()
            .push(op);
    }

    pub fn size(&self, collection: &str) -> usize {
        self.inner
            .pending
            .lock()
            .unwrap()
            .get(collection)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Drains every non-empty collection queue and calls `writer` for each.
    /// Skips draining if `force` is false and the interval hasn't elapsed.
    pub fn flush(&self, force: bool) {
        {
            let last = self.inner.last_flush.lock().unwrap();
            if !force && last.elapsed() < self.flush_interval {
                return;
            }
        }

        let items: Vec<(String, Vec<BulkOp>)> = {
            let mut pending = self.inner.pending.lock().unwrap();
            pending
                .iter_mut()
                .filter(|(_, ops)| !ops.is_empty())
                .map(|(name, ops)| (name.clone(), std::mem::take(ops)))
                .collect()
        };

        if items.is_empty() {
            *self.inner.last_flush.lock().unwrap() = Instant::now();
            return;
        }

        for (collection, ops) in &items {
            (self.writer)(collection, ops);
        }

        if let Some(cb) = &self.on_flush_done {
            cb();
        }

        *self.inner.last_flush.lock().unwrap() = Instant::now();
    }

    /// Forces a full drain if any collection has reached `batch_size`.
    pub fn flush_if_reach_batch(&self) {
        let reached = {
            let pending = self.inner.pending.lock().unwrap();
            pending.values().any(|ops| ops.len() >= self.batch_size)
        };
        if reached {
            self.flush(true);
        }
    }

    /// Starts the background timer thread. Idempotent: calling twice is a
    /// no-op.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.thread.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let this = Arc::clone(self);
        *guard = Some(thread::spawn(move || this.background_loop()));
    }

    fn background_loop(&self) {
        loop {
            let timed_out = {
                let shutdown = self.inner.shutdown.lock().unwrap();
                let (guard, result) = self
                    .inner
                    .wake
                    .wait_timeout(shutdown, self.flush_interval)
                    .unwrap();
                if *guard {
                    break;
                }
                result.timed_out()
            };
            if timed_out {
                self.flush(true);
            }
        }
    }

    /// Signals the background thread to exit, joins it, then forces one
    /// last drain so nothing buffered is lost on stop.
    pub fn stop(&self) {
        *self.inner.shutdown.lock().unwrap() = true;
        self.stop_requested.store(true, Ordering::SeqCst);
        self.inner.wake.notify_all();
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.flush(true);
    }
}
