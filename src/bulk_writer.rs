//! Retries bulk writes against a [`Sink`] with exponential backoff,
//! tolerating batches whose only failures are duplicate keys.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, warn};
use rand::Rng;

use crate::sink::{BulkOp, BulkWriteAttempt, Sink, WriteErrorDetail};
use crate::tasklog::TaskLog;

const DUPLICATE_KEY_CODE: i32 = 11000;
/// Write-conflict-like code the source policy treats as worth one more
/// retry attempt even though other errors in the same batch were not dups.
const RETRYABLE_PARTIAL_CODE: i32 = 215;

/// Owns `Arc`s rather than borrowing so a writer can be moved into the
/// flush buffer's background-thread closure, which must be `'static`.
#[derive(Clone)]
pub struct BulkWriter {
    task_id: String,
    task_log: Arc<TaskLog>,
    max_retry: u32,
    base_backoff: Duration,
    max_backoff: Duration,
    stop: Arc<AtomicBool>,
}

impl BulkWriter {
    pub fn new(task_id: impl Into<String>, task_log: Arc<TaskLog>, stop: Arc<AtomicBool>) -> Self {
        Self {
            task_id: task_id.into(),
            task_log,
            max_retry: 6,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            stop,
        }
    }

    fn log(&self, msg: &str) {
        let _ = self.task_log.append(&self.task_id, msg);
    }

    fn log_bulk_error(&self, table: &str, coll_name: &str, errors: &[WriteErrorDetail]) {
        let mut code_counts: HashMap<i32, usize> = HashMap::new();
        for e in errors {
            *code_counts.entry(e.code).or_insert(0) += 1;
        }
        let samples: Vec<String> = errors
            .iter()
            .take(3)
            .map(|e| {
                format!(
                    "idx={} code={} msg={}",
                    e.index,
                    e.code,
                    &e.message[..e.message.len().min(180)]
                )
            })
            .collect();
        error!(
            "bulk write errors table={table} collection={coll_name} count={} codes={:?} samples={:?}",
            errors.len(),
            code_counts,
            samples
        );
        self.log(&format!(
            "BulkWriteError t={table} c={coll_name} errors={} codes={:?} samples={:?}",
            errors.len(),
            code_counts,
            samples
        ));
    }

    /// Applies `ops` to `collection`, retrying transient failures with
    /// jittered exponential backoff. Returns `true` if the batch is
    /// considered applied (including the dup-tolerant case), `false` if it
    /// was abandoned after `max_retry` attempts or a non-retryable failure.
    pub fn safe_bulk_write(
        &self,
        sink: &dyn Sink,
        collection: &str,
        ops: &[BulkOp],
        table: &str,
    ) -> crate::error::Result<bool> {
        if ops.is_empty() {
            return Ok(true);
        }

        let mut backoff = self.base_backoff;
        for _ in 0..self.max_retry {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(false);
            }

            match sink.bulk_write(collection, ops)? {
                BulkWriteAttempt::Ok => return Ok(true),
                BulkWriteAttempt::PartialFailure(errors) => {
                    let only_dup = !errors.is_empty() && errors.iter().all(|e| e.code == DUPLICATE_KEY_CODE);
                    if only_dup {
                        return Ok(true);
                    }

                    self.log_bulk_error(table, collection, &errors);

                    let has_retryable = errors.iter().any(|e| e.code == RETRYABLE_PARTIAL_CODE);
                    if !has_retryable {
                        return Ok(false);
                    }
                }
                BulkWriteAttempt::TransientError(msg) => {
                    warn!("sink transient error task={} table={table}: {msg}", self.task_id);
                    self.log(&format!("Mongo transient error: {}", &msg[..msg.len().min(180)]));
                }
            }

            let jitter_ms = rand::thread_rng().gen_range(0..200);
            std::thread::sleep(backoff.min(self.max_backoff) + Duration::from_millis(jitter_ms));
            backoff *= 2;
        }

        self.log(&format!(
            "Mongo write failed after retries t={table} c={collection} batch={}",
            ops.len()
        ));
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    struct FakeSink {
        attempts: Mutex<Vec<Vec<BulkOp>>>,
        responses: Mutex<Vec<BulkWriteAttempt>>,
    }

    impl Sink for FakeSink {
        fn bulk_write(&self, _collection: &str, ops: &[BulkOp]) -> crate::error::Result<BulkWriteAttempt> {
            self.attempts.lock().unwrap().push(ops.to_vec());
            let mut responses = self.responses.lock().unwrap();
            Ok(if responses.is_empty() {
                BulkWriteAttempt::Ok
            } else {
                responses.remove(0)
            })
        }
    }

    fn sample_ops() -> Vec<BulkOp> {
        vec![BulkOp::Insert {
            doc: bson::doc! {"a": 1},
        }]
    }

    #[test]
    fn dup_only_errors_count_as_success() {
        let sink = FakeSink {
            attempts: Mutex::new(Vec::new()),
            responses: Mutex::new(vec![BulkWriteAttempt::PartialFailure(vec![WriteErrorDetail {
                index: 0,
                code: 11000,
                message: "dup".into(),
            }])]),
        };
        let stop = Arc::new(AtomicBool::new(false));
        let tmp = tempfile::tempdir().unwrap();
        let log = Arc::new(TaskLog::new(tmp.path()));
        let writer = BulkWriter::new("t1", log, stop);
        let ok = writer.safe_bulk_write(&sink, "coll", &sample_ops(), "table").unwrap();
        assert!(ok);
        assert_eq!(sink.attempts.lock().unwrap().len(), 1);
    }

    #[test]
    fn non_dup_non_retryable_failure_gives_up_immediately() {
        let sink = FakeSink {
            attempts: Mutex::new(Vec::new()),
            responses: Mutex::new(vec![BulkWriteAttempt::PartialFailure(vec![WriteErrorDetail {
                index: 0,
                code: 121,
                message: "validation failed".into(),
            }])]),
        };
        let stop = Arc::new(AtomicBool::new(false));
        let tmp = tempfile::tempdir().unwrap();
        let log = Arc::new(TaskLog::new(tmp.path()));
        let writer = BulkWriter::new("t1", log, stop);
        let ok = writer.safe_bulk_write(&sink, "coll", &sample_ops(), "table").unwrap();
        assert!(!ok);
        assert_eq!(sink.attempts.lock().unwrap().len(), 1);
    }

    #[test]
    fn stop_flag_aborts_before_first_attempt() {
        let sink = FakeSink {
            attempts: Mutex::new(Vec::new()),
            responses: Mutex::new(Vec::new()),
        };
        let stop = Arc::new(AtomicBool::new(true));
        let tmp = tempfile::tempdir().unwrap();
        let log = Arc::new(TaskLog::new(tmp.path()));
        let writer = BulkWriter::new("t1", log, stop);
        let ok = writer.safe_bulk_write(&sink, "coll", &sample_ops(), "table").unwrap();
        assert!(!ok);
        assert!(sink.attempts.lock().unwrap().is_empty());
    }

    #[test]
    fn empty_ops_short_circuit_to_success() {
        let sink = FakeSink {
            attempts: Mutex::new(Vec::new()),
            responses: Mutex::new(Vec::new()),
        };
        let stop = Arc::new(AtomicBool::new(false));
        let tmp = tempfile::tempdir().unwrap();
        let log = Arc::new(TaskLog::new(tmp.path()));
        let writer = BulkWriter::new("t1", log, stop);
        let ok = writer.safe_bulk_write(&sink, "coll", &[], "table").unwrap();
        assert!(ok);
        assert!(sink.attempts.lock().unwrap().is_empty());
    }
}
