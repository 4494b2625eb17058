//! Running counters reported by `status()` and persisted alongside each
//! checkpoint so a restart can resume the displayed totals instead of
//! resetting them to zero.

use serde::{Deserialize, Serialize};

/// Snapshot of one task's progress. Cheap to clone; the worker mutates its
/// own copy in place and the supervisor reads a clone for `status()`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metrics {
    pub phase: String,
    pub current_table: String,
    pub processed_count: u64,
    pub binlog_file: String,
    pub binlog_pos: u64,
    pub insert_count: u64,
    pub full_insert_count: u64,
    pub inc_insert_count: u64,
    pub update_count: u64,
    pub delete_count: u64,
    pub last_error: Option<String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            phase: "init".to_string(),
            current_table: String::new(),
            processed_count: 0,
            binlog_file: String::new(),
            binlog_pos: 0,
            insert_count: 0,
            full_insert_count: 0,
            inc_insert_count: 0,
            update_count: 0,
            delete_count: 0,
            last_error: None,
        }
    }
}

impl Metrics {
    pub fn set_phase(&mut self, phase: &str) {
        self.phase = phase.to_string();
    }

    pub fn record_full_insert(&mut self, n: u64) {
        self.full_insert_count += n;
        self.processed_count += n;
    }

    pub fn record_inc_insert(&mut self, n: u64) {
        self.inc_insert_count += n;
        self.insert_count += n;
        self.processed_count += n;
    }

    pub fn record_update(&mut self, n: u64) {
        self.update_count += n;
        self.processed_count += n;
    }

    pub fn record_delete(&mut self, n: u64) {
        self.delete_count += n;
        self.processed_count += n;
    }

    pub fn set_binlog_position(&mut self, file: &str, pos: u64) {
        self.binlog_file = file.to_string();
        self.binlog_pos = pos;
    }
}
