//! Schema introspection: table discovery, primary key detection, and the
//! `UNKNOWN_COL<idx>` repair that lets binlog rows without `TABLE_MAP`
//! metadata still be addressed by real column name.
//!
//! Column lists are cached with a TTL so every repaired row doesn't cost a
//! `SHOW COLUMNS` round trip; the cache is invalidated whenever a table is
//! (re)discovered.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::warn;
use mysql::prelude::*;
use mysql::{Opts, OptsBuilder};

use bigdecimal::BigDecimal;
use chrono::NaiveDate;

use crate::error::{Result, SyncError};
use crate::value::{unknown_col_index, Row, RowValue};
use crate::worker::FullSyncSource;

/// Everything a worker needs from the source schema, abstracted behind a
/// trait so the worker and its tests can run against a fake.
pub trait Introspector: Send + Sync {
    fn list_tables(&self) -> Result<Vec<String>>;
    fn get_primary_key(&self, table: &str) -> Result<Option<String>>;
    fn get_table_columns(&self, table: &str) -> Result<Vec<String>>;
    fn fix_unknown_cols(&self, table: &str, row: Row) -> Result<Row>;
    fn extract_pk(&self, table: &str, row: &Row) -> Result<Option<RowValue>>;

    /// Drops any cached column list / PK index for `table`. Called whenever
    /// a table is (re)discovered so a stale cache entry never shadows a
    /// column added after the cache was first populated.
    fn invalidate(&self, _table: &str) {}
}

struct CachedColumns {
    columns: Vec<String>,
    fetched_at: Instant,
}

/// MySQL-backed introspector. Opens a short-lived connection per call —
/// introspection calls are infrequent (table discovery, cache refresh) next
/// to the row volume flowing through the binlog stream, so a dedicated pool
/// would be wasted capacity.
pub struct MySqlIntrospector {
    opts: Opts,
    pk_field: String,
    pk_field_lower: String,
    unknown_col_fix_enabled: bool,
    column_cache_ttl: Duration,
    auto_discover_only_base_table: bool,
    columns_cache: Mutex<HashMap<String, CachedColumns>>,
    pk_index_cache: Mutex<HashMap<String, usize>>,
    composite_pk_warned: Mutex<HashSet<String>>,
}

impl MySqlIntrospector {
    pub fn new(
        opts: OptsBuilder,
        pk_field: impl Into<String>,
        unknown_col_fix_enabled: bool,
        column_cache_ttl_sec: u64,
        auto_discover_only_base_table: bool,
    ) -> Self {
        let pk_field = pk_field.into();
        let pk_field_lower = pk_field.to_lowercase();
        Self {
            opts: Opts::from(opts),
            pk_field,
            pk_field_lower,
            unknown_col_fix_enabled,
            column_cache_ttl: Duration::from_secs(column_cache_ttl_sec.max(1)),
            auto_discover_only_base_table,
            columns_cache: Mutex::new(HashMap::new()),
            pk_index_cache: Mutex::new(HashMap::new()),
            composite_pk_warned: Mutex::new(HashSet::new()),
        }
    }

    fn connect(&self) -> Result<mysql::Conn> {
        mysql::Conn::new(self.opts.clone())
            .map_err(|e| SyncError::source_transient(format!("mysql connect failed: {e}")))
    }
}

impl Introspector for MySqlIntrospector {
    fn list_tables(&self) -> Result<Vec<String>> {
        let mut conn = self.connect()?;
        let query = if self.auto_discover_only_base_table {
            "SHOW FULL TABLES WHERE Table_type='BASE TABLE'"
        } else {
            "SHOW TABLES"
        };
        let rows: Vec<(String, Option<String>)> = conn
            .query(query)
            .map_err(|e| SyncError::source_transient(format!("list_tables failed: {e}")))?;
        Ok(rows.into_iter().map(|(name, _)| name).collect())
    }

    fn get_primary_key(&self, table: &str) -> Result<Option<String>> {
        let mut conn = self.connect()?;
        let sql = format!("SHOW KEYS FROM `{table}` WHERE Key_name = 'PRIMARY'");
        let rows: Vec<mysql::Row> = conn
            .query(sql)
            .map_err(|e| SyncError::source_transient(format!("get_primary_key failed: {e}")))?;
        // Column_name is index 4 in SHOW KEYS output. A composite key returns
        // multiple rows in Seq_in_index order; only the first column is used.
        if rows.len() > 1 && self.composite_pk_warned.lock().unwrap().insert(table.to_string()) {
            warn!("table={table} has a composite primary key; only the first column is used");
        }
        Ok(rows.into_iter().next().and_then(|r| r.get::<String, _>(4)))
    }

    fn invalidate(&self, table: &str) {
        self.columns_cache.lock().unwrap().remove(table);
        self.pk_index_cache.lock().unwrap().remove(table);
    }

    fn get_table_columns(&self, table: &str) -> Result<Vec<String>> {
        if let Some(cached) = self.columns_cache.lock().unwrap().get(table) {
            if cached.fetched_at.elapsed() < self.column_cache_ttl {
                return Ok(cached.columns.clone());
            }
        }

        let mut conn = self.connect()?;
        let sql = format!("SHOW COLUMNS FROM `{table}`");
        let rows: Vec<mysql::Row> = conn
            .query(sql)
            .map_err(|e| SyncError::source_transient(format!("get_table_columns failed: {e}")))?;
        let columns: Vec<String> = rows
            .into_iter()
            .filter_map(|r| r.get::<String, _>(0))
            .collect();

        if !columns.is_empty() {
            if let Some(idx) = columns.iter().position(|c| c.to_lowercase() == self.pk_field_lower) {
                self.pk_index_cache.lock().unwrap().insert(table.to_string(), idx);
            } else {
                self.pk_index_cache.lock().unwrap().remove(table);
            }
            self.columns_cache.lock().unwrap().insert(
                table.to_string(),
                CachedColumns {
                    columns: columns.clone(),
                    fetched_at: Instant::now(),
                },
            );
        }
        Ok(columns)
    }

    fn fix_unknown_cols(&self, table: &str, row: Row) -> Result<Row> {
        if !self.unknown_col_fix_enabled || !row.keys().any(|k| unknown_col_index(k).is_some()) {
            return Ok(row);
        }
        let columns = self.get_table_columns(table)?;
        if columns.is_empty() {
            return Ok(row);
        }
        let mut fixed = Row::new();
        for (k, v) in row {
            match unknown_col_index(&k) {
                Some(idx) if idx < columns.len() => {
                    fixed.insert(columns[idx].clone(), v);
                }
                _ => {
                    fixed.insert(k, v);
                }
            }
        }
        Ok(fixed)
    }

    fn extract_pk(&self, table: &str, row: &Row) -> Result<Option<RowValue>> {
        if let Some((_, v)) = row.iter().find(|(k, _)| k.to_lowercase() == self.pk_field_lower) {
            return Ok(Some(v.clone()));
        }

        let pk_idx = match self.pk_index_cache.lock().unwrap().get(table).copied() {
            Some(idx) => Some(idx),
            None => {
                self.get_table_columns(table)?;
                self.pk_index_cache.lock().unwrap().get(table).copied()
            }
        };
        let Some(pk_idx) = pk_idx else {
            return Ok(None);
        };
        for (k, v) in row {
            if let Some(idx) = unknown_col_index(k) {
                if idx == pk_idx {
                    return Ok(Some(v.clone()));
                }
            }
        }
        Ok(None)
    }
}

fn convert_mysql_value(value: mysql::Value, column_type: mysql::consts::ColumnType) -> RowValue {
    use std::str::FromStr;
    use mysql::consts::ColumnType;
    match value {
        mysql::Value::NULL => RowValue::Null,
        mysql::Value::Int(i) => RowValue::Integer(i),
        mysql::Value::UInt(u) => RowValue::Integer(u as i64),
        mysql::Value::Float(f) => RowValue::Float(f as f64),
        mysql::Value::Double(f) => RowValue::Float(f),
        mysql::Value::Bytes(bytes) => {
            let s = String::from_utf8_lossy(&bytes).into_owned();
            let is_decimal = matches!(
                column_type,
                ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL
            );
            if is_decimal {
                BigDecimal::from_str(&s).map(RowValue::Decimal).unwrap_or(RowValue::String(s))
            } else {
                RowValue::String(s)
            }
        }
        mysql::Value::Date(year, month, day, hour, minute, second, micros) => {
            let date = NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
                .unwrap_or_else(|| NaiveDate::from_ymd_opt(1970, 1, 1).unwrap());
            if hour == 0 && minute == 0 && second == 0 && micros == 0 {
                RowValue::Date(date)
            } else {
                let naive = date
                    .and_hms_micro_opt(hour as u32, minute as u32, second as u32, micros)
                    .unwrap_or_else(|| date.and_hms_opt(0, 0, 0).unwrap());
                RowValue::DateTime(naive.and_utc())
            }
        }
        mysql::Value::Time(neg, days, hours, minutes, seconds, micros) => {
            let sign = if neg { "-" } else { "" };
            RowValue::String(format!(
                "{sign}{}:{hours:02}:{minutes:02}:{seconds:02}.{micros:06}",
                days * 24
            ))
        }
    }
}

/// Keyset-paginated full-table snapshot reads, driving `SyncWorker::run_full_sync`.
/// Pagination by primary key rather than `OFFSET` avoids the quadratic cost of
/// re-scanning skipped rows on a large table.
pub struct MySqlFullSyncSource {
    opts: Opts,
    pk_field: String,
}

impl MySqlFullSyncSource {
    pub fn new(opts: OptsBuilder, pk_field: impl Into<String>) -> Self {
        Self {
            opts: Opts::from(opts),
            pk_field: pk_field.into(),
        }
    }

    fn connect(&self) -> Result<mysql::Conn> {
        mysql::Conn::new(self.opts.clone())
            .map_err(|e| SyncError::source_transient(format!("mysql connect failed: {e}")))
    }
}

impl FullSyncSource for MySqlFullSyncSource {
    fn fetch_page(&self, table: &str, last_pk: Option<bson::Bson>, batch: usize) -> Result<Vec<Row>> {
        let mut conn = self.connect()?;
        let pk = &self.pk_field;
        let rows: Vec<mysql::Row> = match last_pk {
            None => {
                let sql = format!("SELECT * FROM `{table}` ORDER BY `{pk}` LIMIT {batch}");
                conn.query(sql)
            }
            Some(bson::Bson::Int64(v)) => {
                let sql = format!("SELECT * FROM `{table}` WHERE `{pk}` > ? ORDER BY `{pk}` LIMIT {batch}");
                conn.exec(sql, (v,))
            }
            Some(bson::Bson::String(v)) => {
                let sql = format!("SELECT * FROM `{table}` WHERE `{pk}` > ? ORDER BY `{pk}` LIMIT {batch}");
                conn.exec(sql, (v,))
            }
            Some(other) => {
                return Err(SyncError::schema_missing(format!(
                    "unsupported primary key bson type for keyset pagination: {other:?}"
                )))
            }
        }
        .map_err(|e| SyncError::source_transient(format!("full sync fetch_page failed: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|r| {
                let columns = r.columns();
                let mut row = Row::new();
                for (idx, col) in columns.iter().enumerate() {
                    let value = r.as_ref(idx).cloned().unwrap_or(mysql::Value::NULL);
                    row.insert(
                        col.name_str().into_owned(),
                        convert_mysql_value(value, col.column_type()),
                    );
                }
                row
            })
            .collect())
    }
}

/// Tracks when a table map was last auto-refreshed and throttles refreshes
/// to `auto_discover_interval_sec`. Owned by the worker, driven on its
/// incremental-sync tick.
pub struct TableMapRefresher {
    last_refresh: Option<Instant>,
    interval: Duration,
}

impl TableMapRefresher {
    pub fn new(interval_sec: u64) -> Self {
        Self {
            last_refresh: None,
            interval: Duration::from_secs(interval_sec.max(1)),
        }
    }

    /// Discovers new tables not already present in `table_map`, inserting
    /// `table -> table + suffix` and invalidating any stale column cache
    /// entries for them. Returns the number of tables added.
    pub fn refresh_if_needed(
        &mut self,
        introspector: &dyn Introspector,
        table_map: &mut HashMap<String, String>,
        collection_suffix: &str,
        auto_mode: bool,
        auto_discover_enabled: bool,
    ) -> Result<usize> {
        if !auto_mode || !auto_discover_enabled {
            return Ok(0);
        }
        if let Some(t) = self.last_refresh {
            if t.elapsed() < self.interval {
                return Ok(0);
            }
        }

        let tables = introspector.list_tables()?;
        let mut added = 0;
        for table in tables {
            if !table_map.contains_key(&table) {
                introspector.invalidate(&table);
                table_map.insert(table.clone(), format!("{table}{collection_suffix}"));
                added += 1;
            }
        }
        self.last_refresh = Some(Instant::now());
        Ok(added)
    }
}
