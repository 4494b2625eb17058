//! Task configuration: connection endpoints, policy flags, and throughput knobs.
//!
//! `TaskConfig` is the serializable description of one sync task. Every
//! numeric/boolean knob carries the same default as the original service so
//! that an empty config produces the same behavior an operator would expect.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Connection settings shared by the MySQL source and the MongoDB sink.
/// Fields that don't apply to one side are left at their default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub database: Option<String>,

    // MongoDB-specific.
    pub replica_set: Option<String>,
    pub hosts: Option<Vec<String>>,
    #[serde(default = "default_auth_source")]
    pub auth_source: String,

    // MySQL-specific.
    #[serde(default = "default_true")]
    pub use_ssl: bool,
    pub ssl_ca: Option<String>,
    pub ssl_cert: Option<String>,
    pub ssl_key: Option<String>,
    #[serde(default)]
    pub ssl_verify_cert: bool,
    #[serde(default = "default_charset")]
    pub charset: String,
}

fn default_auth_source() -> String {
    "admin".to_string()
}

fn default_charset() -> String {
    "utf8mb4".to_string()
}

fn default_true() -> bool {
    true
}

/// Full configuration for one sync task: which tables to copy, how to map
/// them onto collections, and every policy and throughput knob governing
/// the worker's behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub task_id: String,
    pub mysql_conf: DbConfig,
    pub mongo_conf: DbConfig,

    /// source table -> sink collection. Empty means auto-discover.
    #[serde(default)]
    pub table_map: HashMap<String, String>,

    #[serde(default = "default_pk_field")]
    pub pk_field: String,
    #[serde(default)]
    pub collection_suffix: String,

    #[serde(default = "default_progress_interval")]
    pub progress_interval_sec: u64,

    // Full sync.
    #[serde(default = "default_batch")]
    pub mysql_fetch_batch: usize,
    #[serde(default = "default_batch")]
    pub mongo_bulk_batch: usize,

    // Incremental sync.
    #[serde(default = "default_batch")]
    pub inc_flush_batch: usize,
    #[serde(default = "default_flush_interval")]
    pub inc_flush_interval_sec: u64,
    #[serde(default = "default_flush_interval")]
    pub state_save_interval_sec: u64,

    // Behavior policy.
    #[serde(default)]
    pub insert_only: bool,
    #[serde(default)]
    pub handle_updates_as_insert: bool,
    #[serde(default = "default_true")]
    pub handle_deletes: bool,
    #[serde(default)]
    pub hard_delete: bool,
    #[serde(default = "default_true")]
    pub use_pk_as_mongo_id: bool,

    // Mongo connection settings.
    #[serde(default = "default_mongo_pool_size")]
    pub mongo_max_pool_size: u32,
    #[serde(default = "default_write_w")]
    pub mongo_write_w: i32,
    #[serde(default)]
    pub mongo_write_j: bool,
    #[serde(default = "default_socket_timeout_ms")]
    pub mongo_socket_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub mongo_connect_timeout_ms: u64,

    // MySQL connection settings.
    #[serde(default = "default_connect_timeout_sec")]
    pub mysql_connect_timeout_sec: u64,
    #[serde(default = "default_read_write_timeout_sec")]
    pub mysql_read_timeout_sec: u64,
    #[serde(default = "default_read_write_timeout_sec")]
    pub mysql_write_timeout_sec: u64,

    // Auto-discovery of new tables.
    #[serde(default = "default_true")]
    pub auto_discover_new_tables: bool,
    #[serde(default = "default_discover_interval")]
    pub auto_discover_interval_sec: u64,
    #[serde(default = "default_true")]
    pub auto_discover_only_base_table: bool,

    // Reconnect policy.
    #[serde(default)]
    pub inc_reconnect_max_retry: u32,
    #[serde(default = "default_reconnect_backoff_base")]
    pub inc_reconnect_backoff_base_sec: f64,
    #[serde(default = "default_reconnect_backoff_max")]
    pub inc_reconnect_backoff_max_sec: f64,

    // UNKNOWN_COL repair.
    #[serde(default = "default_true")]
    pub unknown_col_fix_enabled: bool,
    #[serde(default = "default_schema_cache_sec")]
    pub unknown_col_schema_cache_sec: u64,

    // Soft delete.
    #[serde(default = "default_delete_flag_field")]
    pub delete_flag_field: String,
    #[serde(default = "default_delete_time_field")]
    pub delete_time_field: String,
    #[serde(default = "default_true")]
    pub delete_upsert_tombstone: bool,
    #[serde(default = "default_true")]
    pub delete_append_new_doc: bool,

    #[serde(default = "default_true")]
    pub update_insert_new_doc: bool,
    #[serde(default = "default_true")]
    pub delete_mark_only_base_doc: bool,

    #[serde(default)]
    pub debug_binlog_events: bool,
}

fn default_pk_field() -> String {
    "id".to_string()
}
fn default_progress_interval() -> u64 {
    10
}
fn default_batch() -> usize {
    2000
}
fn default_flush_interval() -> u64 {
    2
}
fn default_mongo_pool_size() -> u32 {
    50
}
fn default_write_w() -> i32 {
    1
}
fn default_socket_timeout_ms() -> u64 {
    20_000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_connect_timeout_sec() -> u64 {
    10
}
fn default_read_write_timeout_sec() -> u64 {
    60
}
fn default_discover_interval() -> u64 {
    10
}
fn default_reconnect_backoff_base() -> f64 {
    1.0
}
fn default_reconnect_backoff_max() -> f64 {
    30.0
}
fn default_schema_cache_sec() -> u64 {
    30
}
fn default_delete_flag_field() -> String {
    "deleted".to_string()
}
fn default_delete_time_field() -> String {
    "deleted_at".to_string()
}

impl TaskConfig {
    /// Validate cross-field invariants that serde's per-field defaults can't
    /// express on their own.
    pub fn validate(&self) -> Result<()> {
        if self.task_id.trim().is_empty() {
            return Err(SyncError::config_invalid("task_id must not be empty"));
        }
        if self.mysql_conf.database.is_none() {
            return Err(SyncError::config_invalid("mysql_conf.database is required"));
        }
        if self.mongo_conf.database.is_none() {
            return Err(SyncError::config_invalid("mongo_conf.database is required"));
        }
        if self.inc_reconnect_backoff_base_sec <= 0.0 {
            return Err(SyncError::config_invalid(
                "inc_reconnect_backoff_base_sec must be positive",
            ));
        }
        if self.inc_reconnect_backoff_max_sec < self.inc_reconnect_backoff_base_sec {
            return Err(SyncError::config_invalid(
                "inc_reconnect_backoff_max_sec must be >= inc_reconnect_backoff_base_sec",
            ));
        }
        Ok(())
    }

    /// Sink collection name for a given source table, applying `table_map`
    /// and `collection_suffix` in that order.
    pub fn collection_for_table(&self, table: &str) -> String {
        let base = self
            .table_map
            .get(table)
            .cloned()
            .unwrap_or_else(|| table.to_string());
        format!("{base}{}", self.collection_suffix)
    }
}

/// Hook for at-rest encryption of persisted config bytes. The core always
/// writes/reads plain JSON through the default `PlainTextCodec`; a caller
/// that needs encryption at rest implements this trait and passes it to
/// `ConfigStore`.
pub trait ConfigCodec: Send + Sync {
    fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decode(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Identity codec: the bytes on disk are the plain JSON bytes.
pub struct PlainTextCodec;

impl ConfigCodec for PlainTextCodec {
    fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decode(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }
}
