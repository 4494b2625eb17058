//! Row value domain shared by the source introspector, the converter, and the sink.
//!
//! Row images arriving from the binlog and from full-sync `SELECT`s are dynamically
//! typed dictionaries on the source side; this is the tagged-variant replacement for
//! that dynamic typing described in the design notes.

use std::collections::BTreeMap;
use std::fmt;

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};

/// A single source-row value, covering every MySQL column type this crate converts.
#[derive(Debug, Clone, PartialEq)]
pub enum RowValue {
    Null,
    Integer(i64),
    Float(f64),
    Decimal(BigDecimal),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
    String(String),
    Blob(Vec<u8>),
    Map(Row),
    List(Vec<RowValue>),
}

impl RowValue {
    pub fn is_null(&self) -> bool {
        matches!(self, RowValue::Null)
    }
}

impl fmt::Display for RowValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowValue::Null => write!(f, "NULL"),
            RowValue::Integer(i) => write!(f, "{i}"),
            RowValue::Float(v) => write!(f, "{v}"),
            RowValue::Decimal(d) => write!(f, "{d}"),
            RowValue::Date(d) => write!(f, "{d}"),
            RowValue::DateTime(dt) => write!(f, "{dt}"),
            RowValue::String(s) => write!(f, "{s}"),
            RowValue::Blob(b) => write!(f, "<{} bytes>", b.len()),
            RowValue::Map(_) => write!(f, "<map>"),
            RowValue::List(items) => write!(f, "<list of {}>", items.len()),
        }
    }
}

/// A row image keyed by column name. `BTreeMap` keeps key order deterministic for
/// logging and for the `UNKNOWN_COL<i>` repair pass, which needs to iterate keys
/// without caring about insertion order.
pub type Row = BTreeMap<String, RowValue>;

/// Synthetic column name the source emits when a binlog row event carries no
/// schema (row-based replication without `TABLE_MAP` metadata, or a cache miss
/// on the introspector's column list at decode time).
pub fn unknown_col_index(key: &str) -> Option<usize> {
    key.strip_prefix("UNKNOWN_COL")?.parse().ok()
}
