//! The sync state machine: full-sync snapshot followed by incremental
//! replication, driven by one call to [`SyncWorker::run`]. Reconnection
//! across incremental failures is the [`crate::supervisor::Supervisor`]'s
//! job, not this module's — `run_inc_sync_once` returns a plain `Result`
//! and lets the caller decide whether to retry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bson::{doc, Bson};
use log::info;

use crate::bulk_writer::BulkWriter;
use crate::checkpoint::{Checkpoint, CheckpointStore, SaveThrottle};
use crate::config::TaskConfig;
use crate::converter::{Converter, Op};
use crate::error::Result;
use crate::introspector::{Introspector, TableMapRefresher};
use crate::metrics::Metrics;
use crate::sink::{BulkOp, Sink};
use crate::source::{BinlogSource, EventPolicy, RowEvent};
use crate::tasklog::TaskLog;
use crate::value::Row;

/// Current high-level phase, reported by `status()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    FullSync,
    IncSync,
    Stopped,
    Error,
}

/// Snapshot returned by `status()`: the phase plus the metrics counters.
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub task_id: String,
    pub phase: Phase,
    pub metrics: Metrics,
}

pub struct SyncWorker {
    config: TaskConfig,
    converter: Converter,
    checkpoints: Arc<CheckpointStore>,
    task_log: Arc<TaskLog>,
    stop: Arc<AtomicBool>,
    metrics: Arc<Mutex<Metrics>>,
    table_refresher: TableMapRefresher,
    auto_mode: bool,
}

impl SyncWorker {
    pub fn new(config: TaskConfig, checkpoints: Arc<CheckpointStore>, task_log: Arc<TaskLog>) -> Self {
        let auto_mode = config.table_map.is_empty();
        let converter = Converter::new(config.pk_field.clone(), config.use_pk_as_mongo_id);
        let table_refresher = TableMapRefresher::new(config.auto_discover_interval_sec);
        Self {
            config,
            converter,
            checkpoints,
            task_log,
            stop: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(Mutex::new(Metrics::default())),
            table_refresher,
            auto_mode,
        }
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Replaces the worker's stop flag with one owned by a caller (the task
    /// manager), so stopping a task and stopping this worker's loops are the
    /// same atomic. No effect on an in-flight `run_full_sync`/`run_inc_sync_once`
    /// call — set this before driving either.
    pub fn set_stop_flag(&mut self, stop: Arc<AtomicBool>) {
        self.stop = stop;
    }

    pub fn status(&self, phase: Phase) -> WorkerStatus {
        WorkerStatus {
            task_id: self.config.task_id.clone(),
            phase,
            metrics: self.metrics.lock().unwrap().clone(),
        }
    }

    fn with_metrics<R>(&self, f: impl FnOnce(&mut Metrics) -> R) -> R {
        f(&mut self.metrics.lock().unwrap())
    }

    fn log(&self, msg: &str) {
        info!("task={} {msg}", self.config.task_id);
        let _ = self.task_log.append(&self.config.task_id, msg);
    }

    fn event_policy(&self) -> EventPolicy {
        EventPolicy {
            want_insert: true,
            want_update: !self.config.insert_only,
            want_delete: self.config.handle_deletes,
        }
    }

    /// Builds `table_map` from introspection when the config left it empty.
    pub fn auto_build_table_map_if_needed(&mut self, introspector: &dyn Introspector) -> Result<()> {
        if !self.config.table_map.is_empty() {
            return Ok(());
        }
        let tables = introspector.list_tables()?;
        self.config.table_map = tables
            .into_iter()
            .map(|t| {
                let coll = format!("{t}{}", self.config.collection_suffix);
                (t, coll)
            })
            .collect();
        self.log(&format!("Auto table_map built size={}", self.config.table_map.len()));
        Ok(())
    }

    fn refresh_table_map(&mut self, introspector: &dyn Introspector, reason: &str) {
        match self.table_refresher.refresh_if_needed(
            introspector,
            &mut self.config.table_map,
            &self.config.collection_suffix,
            self.auto_mode,
            self.config.auto_discover_new_tables,
        ) {
            Ok(added) if added > 0 => {
                self.log(&format!("Discovered new tables={added} reason={reason}"));
            }
            Ok(_) => {}
            Err(e) => self.log(&format!("Refresh table_map failed: {e}")),
        }
    }

    /// Snapshots every mapped table, base-document upsert per row. Runs
    /// once before the worker ever enters incremental mode.
    pub fn run_full_sync(
        &mut self,
        source: &dyn FullSyncSource,
        sink: &dyn Sink,
    ) -> Result<()> {
        self.with_metrics(|m| m.set_phase("full_sync"));
        let writer = BulkWriter::new(
            self.config.task_id.clone(),
            Arc::clone(&self.task_log),
            Arc::clone(&self.stop),
        );
        let fetch_batch = self.config.mysql_fetch_batch;
        let mongo_batch = self.config.mongo_bulk_batch;

        let table_map = self.config.table_map.clone();
        for (table, collection) in &table_map {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            self.with_metrics(|m| m.current_table = table.clone());
            self.log(&format!("FullSync table={table} -> collection={collection}"));

            let mut last_id: Option<Bson> = None;
            let mut ops: Vec<BulkOp> = Vec::new();
            let mut processed: u64 = 0;
            let mut last_progress = Instant::now();

            loop {
                if self.stop.load(Ordering::SeqCst) {
                    break;
                }
                let rows = source.fetch_page(table, last_id.clone(), fetch_batch)?;
                if rows.is_empty() {
                    break;
                }

                for row in &rows {
                    if let Some(pk) = self.converter.pk_value(row) {
                        last_id = Some(self.converter.convert(pk));
                    }
                    let doc = self.converter.to_base(row);
                    match doc.get("_id") {
                        Some(id) if self.config.use_pk_as_mongo_id => {
                            ops.push(BulkOp::ReplaceUpsert {
                                id: id.clone(),
                                doc,
                            });
                        }
                        _ => ops.push(BulkOp::Insert { doc }),
                    }
                    processed += 1;
                    self.with_metrics(|m| m.record_full_insert(1));

                    if ops.len() >= mongo_batch {
                        writer.safe_bulk_write(sink, collection, &ops, table)?;
                        ops.clear();
                    }
                }

                if last_progress.elapsed() >= Duration::from_secs(self.config.progress_interval_sec) {
                    self.log(&format!("FullSync prog table={table} done={processed}"));
                    last_progress = Instant::now();
                }
            }

            if !ops.is_empty() {
                writer.safe_bulk_write(sink, collection, &ops, table)?;
            }
        }
        Ok(())
    }

    /// Runs one uninterrupted pass of incremental replication starting at
    /// `checkpoint`. Returns when the source errors or the stop flag is
    /// set; the caller (the supervisor) decides whether to reconnect.
    pub fn run_inc_sync_once(
        &mut self,
        mut source: Box<dyn BinlogSource>,
        sink: Arc<dyn Sink>,
        introspector: Arc<dyn Introspector>,
    ) -> Result<()> {
        self.with_metrics(|m| m.set_phase("inc_sync"));
        let (log_file, log_pos) = source.position();
        self.log(&format!(
            "IncSync started from={log_file}:{log_pos} insert_only={} handle_deletes={}",
            self.config.insert_only, self.config.handle_deletes
        ));
        self.log(&format!(
            "Mode: UPDATE->newDoc={}, DELETE->softMarkBaseOnly={}, hard_delete={}",
            self.config.update_insert_new_doc, self.config.delete_mark_only_base_doc, self.config.hard_delete
        ));

        let sink_for_closure = Arc::clone(&sink);
        let task_id = self.config.task_id.clone();
        let writer_for_closure = BulkWriter::new(
            task_id,
            Arc::clone(&self.task_log),
            Arc::clone(&self.stop),
        );

        let save_throttle = std::sync::Mutex::new(SaveThrottle::new(Duration::from_secs(
            self.config.state_save_interval_sec,
        )));
        let checkpoints = Arc::clone(&self.checkpoints);
        let task_id_for_save = self.config.task_id.clone();
        let position = Arc::new(std::sync::Mutex::new((log_file.clone(), log_pos)));
        let metrics_for_save = Arc::clone(&self.metrics);

        let position_for_flush = Arc::clone(&position);
        let on_flush_done = move || {
            let mut throttle = save_throttle.lock().unwrap();
            if throttle.should_save(false) {
                let (file, pos) = position_for_flush.lock().unwrap().clone();
                let checkpoint = Checkpoint {
                    log_file: file,
                    log_pos: pos,
                    metrics: metrics_for_save.lock().unwrap().clone(),
                };
                if checkpoint.log_pos > 0 && !checkpoint.log_file.is_empty() {
                    let _ = checkpoints.save(&task_id_for_save, &checkpoint);
                }
                throttle.mark_saved();
            }
        };

        let buffer = Arc::new(
            crate::flush_buffer::FlushBuffer::new(
                self.config.inc_flush_batch,
                self.config.inc_flush_interval_sec,
                move |collection, ops| {
                    let _ = writer_for_closure.safe_bulk_write(sink_for_closure.as_ref(), collection, ops, "*");
                },
            )
            .with_on_flush_done(on_flush_done),
        );
        buffer.start();

        let policy = self.event_policy();
        let result = self.drive_events(source.as_mut(), introspector.as_ref(), &buffer, policy, &position);

        buffer.stop();
        let (file, pos) = position.lock().unwrap().clone();
        if !file.is_empty() {
            let checkpoint = Checkpoint {
                log_file: file,
                log_pos: pos,
                metrics: self.metrics.lock().unwrap().clone(),
            };
            let _ = self.checkpoints.save(&self.config.task_id, &checkpoint);
        }
        self.log("IncSync stopped (once)");
        result
    }

    fn drive_events(
        &mut self,
        source: &mut dyn BinlogSource,
        introspector: &dyn Introspector,
        buffer: &crate::flush_buffer::FlushBuffer,
        policy: EventPolicy,
        position: &std::sync::Mutex<(String, u64)>,
    ) -> Result<()> {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(());
            }
            let event = source.next_event(policy)?;
            let (file, pos) = event.position();
            *position.lock().unwrap() = (file.to_string(), pos);
            self.with_metrics(|m| m.set_binlog_position(file, pos));

            if self.config.debug_binlog_events {
                self.log(&format!("EV {} table={}", event.kind(), event.table()));
            }

            match event {
                RowEvent::Write { table, rows, .. } => self.handle_insert(&table, rows, introspector, buffer)?,
                RowEvent::Update { table, rows, .. } => self.handle_update(&table, rows, introspector, buffer)?,
                RowEvent::Delete { table, rows, .. } => self.handle_delete(&table, rows, introspector, buffer)?,
                RowEvent::Other { .. } => {}
            }

            buffer.flush_if_reach_batch();
            buffer.flush(false);
        }
    }

    fn resolve_collection(&mut self, table: &str, introspector: &dyn Introspector) -> Option<String> {
        if let Some(coll) = self.config.table_map.get(table) {
            return Some(coll.clone());
        }
        self.refresh_table_map(introspector, &format!("unknown:{table}"));
        self.config.table_map.get(table).cloned()
    }

    fn handle_insert(
        &mut self,
        table: &str,
        rows: Vec<Row>,
        introspector: &dyn Introspector,
        buffer: &crate::flush_buffer::FlushBuffer,
    ) -> Result<()> {
        self.with_metrics(|m| {
            m.current_table = table.to_string();
            m.record_inc_insert(rows.len().max(1) as u64);
        });
        let Some(collection) = self.resolve_collection(table, introspector) else {
            return Ok(());
        };
        for row in rows {
            let row = introspector.fix_unknown_cols(table, row)?;
            let doc = self.converter.to_base(&row);
            match doc.get("_id") {
                Some(id) if self.config.use_pk_as_mongo_id => {
                    buffer.add(&collection, BulkOp::ReplaceUpsert { id: id.clone(), doc });
                }
                _ => buffer.add(&collection, BulkOp::Insert { doc }),
            }
        }
        Ok(())
    }

    fn handle_update(
        &mut self,
        table: &str,
        rows: Vec<(Row, Row)>,
        introspector: &dyn Introspector,
        buffer: &crate::flush_buffer::FlushBuffer,
    ) -> Result<()> {
        self.with_metrics(|m| {
            m.current_table = table.to_string();
            m.record_update(rows.len().max(1) as u64);
        });
        let Some(collection) = self.resolve_collection(table, introspector) else {
            return Ok(());
        };
        for (_before, after) in rows {
            let after = introspector.fix_unknown_cols(table, after)?;
            let Some(pk_val) = introspector.extract_pk(table, &after)? else {
                self.log(&format!("Update skipped (no pk) table={table}"));
                continue;
            };
            let base_id = self.converter.convert(&pk_val);

            if self.config.handle_updates_as_insert && !self.config.update_insert_new_doc {
                let doc = self.converter.to_base(&after);
                buffer.add(&collection, BulkOp::Insert { doc });
            } else if self.config.update_insert_new_doc {
                let vdoc = self.converter.to_version(&after, &pk_val, &base_id, Op::Update);
                buffer.add(&collection, BulkOp::Insert { doc: vdoc });
            } else {
                let doc = self.converter.to_base(&after);
                match doc.get("_id") {
                    Some(id) if self.config.use_pk_as_mongo_id => {
                        buffer.add(&collection, BulkOp::ReplaceUpsert { id: id.clone(), doc });
                    }
                    _ => buffer.add(&collection, BulkOp::Insert { doc }),
                }
            }
        }
        Ok(())
    }

    fn handle_delete(
        &mut self,
        table: &str,
        rows: Vec<Row>,
        introspector: &dyn Introspector,
        buffer: &crate::flush_buffer::FlushBuffer,
    ) -> Result<()> {
        self.with_metrics(|m| {
            m.current_table = table.to_string();
            m.record_delete(rows.len().max(1) as u64);
        });
        let Some(collection) = self.resolve_collection(table, introspector) else {
            return Ok(());
        };
        for row in rows {
            let row = introspector.fix_unknown_cols(table, row)?;
            let Some(pk_val) = introspector.extract_pk(table, &row)? else {
                self.log(&format!("Delete skipped (no pk) table={table}"));
                continue;
            };
            let pk_bson = self.converter.convert(&pk_val);

            if self.config.delete_append_new_doc {
                let vdoc = self.converter.to_version(&row, &pk_val, &pk_bson, Op::Delete);
                buffer.add(&collection, BulkOp::Insert { doc: vdoc });
                continue;
            }

            let now = bson::DateTime::from_chrono(chrono::Utc::now());
            let set_doc = doc! {
                self.config.delete_flag_field.clone(): true,
                self.config.delete_time_field.clone(): now,
                "_op": "delete",
                "_ts": now,
            };

            if self.config.delete_mark_only_base_doc {
                buffer.add(
                    &collection,
                    BulkOp::Update {
                        filter: doc! {"_id": pk_bson},
                        update: doc! {"$set": set_doc},
                        upsert: self.config.delete_upsert_tombstone,
                    },
                );
            } else {
                buffer.add(
                    &collection,
                    BulkOp::UpdateMany {
                        filter: doc! {self.config.pk_field.clone(): pk_bson.clone()},
                        update: doc! {"$set": set_doc.clone()},
                    },
                );
                buffer.add(
                    &collection,
                    BulkOp::Update {
                        filter: doc! {"_id": pk_bson},
                        update: doc! {"$set": set_doc},
                        upsert: self.config.delete_upsert_tombstone,
                    },
                );
            }
        }
        Ok(())
    }
}

/// The subset of a MySQL source the full-sync snapshot phase needs:
/// keyset-paginated page reads. Kept separate from `BinlogSource` since
/// full sync runs a plain `SELECT`, not a replication stream.
pub trait FullSyncSource: Send + Sync {
    fn fetch_page(&self, table: &str, last_pk: Option<Bson>, batch: usize) -> Result<Vec<Row>>;
}
