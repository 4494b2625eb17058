//! Error types for the sync engine.
//!
//! Every fallible operation in this crate returns `Result<T, SyncError>`. The
//! variants mirror the retry policy: transient kinds are worth a backoff and
//! retry, fatal/application kinds are not.

use std::fmt;
use std::io;

/// Unified error type for sync worker operations.
#[derive(Debug)]
pub enum SyncError {
    /// Task config failed validation or could not be parsed.
    ConfigInvalid(String),
    /// Source-side error that is expected to clear on reconnect (dropped
    /// connection, read timeout, server restart).
    SourceTransient(String),
    /// Source-side error that will not clear on retry (bad credentials,
    /// binlog position purged off the source server, unsupported format).
    SourceFatal(String),
    /// Sink-side error that is expected to clear on retry (network blip,
    /// replica election, write concern timeout).
    SinkTransient(String),
    /// Sink bulk write reported conflicts that were not all duplicate-key.
    SinkConflict(String),
    /// Sink rejected a write for a reason retrying will not fix (validation
    /// error, immutable field change, schema mismatch on the Mongo side).
    SinkApplicationError(String),
    /// Table map or column metadata needed to convert a row is missing.
    SchemaMissing(String),
    /// Anything else: invariant violations, caught panics, logic errors.
    Bug(String),
    /// I/O error underlying any of the above (file persistence, sockets).
    Io(io::Error),
    /// JSON (de)serialization error underlying config/checkpoint persistence.
    Json(String),
}

impl SyncError {
    /// Whether a supervisor loop should back off and retry after this error,
    /// as opposed to surfacing it as a fatal task failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::SourceTransient(_) | SyncError::SinkTransient(_) | SyncError::SinkConflict(_)
        )
    }

    pub fn config_invalid(msg: impl Into<String>) -> Self {
        SyncError::ConfigInvalid(msg.into())
    }

    pub fn source_transient(msg: impl Into<String>) -> Self {
        SyncError::SourceTransient(msg.into())
    }

    pub fn source_fatal(msg: impl Into<String>) -> Self {
        SyncError::SourceFatal(msg.into())
    }

    pub fn sink_transient(msg: impl Into<String>) -> Self {
        SyncError::SinkTransient(msg.into())
    }

    pub fn sink_conflict(msg: impl Into<String>) -> Self {
        SyncError::SinkConflict(msg.into())
    }

    pub fn sink_application_error(msg: impl Into<String>) -> Self {
        SyncError::SinkApplicationError(msg.into())
    }

    pub fn schema_missing(msg: impl Into<String>) -> Self {
        SyncError::SchemaMissing(msg.into())
    }

    pub fn bug(msg: impl Into<String>) -> Self {
        SyncError::Bug(msg.into())
    }

    /// Short, stable tag for structured logging and status reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::ConfigInvalid(_) => "config_invalid",
            SyncError::SourceTransient(_) => "source_transient",
            SyncError::SourceFatal(_) => "source_fatal",
            SyncError::SinkTransient(_) => "sink_transient",
            SyncError::SinkConflict(_) => "sink_conflict",
            SyncError::SinkApplicationError(_) => "sink_application_error",
            SyncError::SchemaMissing(_) => "schema_missing",
            SyncError::Bug(_) => "bug",
            SyncError::Io(_) => "io",
            SyncError::Json(_) => "json",
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::ConfigInvalid(msg) => write!(f, "invalid task config: {msg}"),
            SyncError::SourceTransient(msg) => write!(f, "source error (transient): {msg}"),
            SyncError::SourceFatal(msg) => write!(f, "source error (fatal): {msg}"),
            SyncError::SinkTransient(msg) => write!(f, "sink error (transient): {msg}"),
            SyncError::SinkConflict(msg) => write!(f, "sink write conflict: {msg}"),
            SyncError::SinkApplicationError(msg) => write!(f, "sink rejected write: {msg}"),
            SyncError::SchemaMissing(msg) => write!(f, "schema missing: {msg}"),
            SyncError::Bug(msg) => write!(f, "internal error: {msg}"),
            SyncError::Io(e) => write!(f, "{e}"),
            SyncError::Json(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<io::Error> for SyncError {
    fn from(e: io::Error) -> Self {
        SyncError::Io(e)
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Json(e.to_string())
    }
}

/// Result type alias for sync worker operations.
pub type Result<T> = std::result::Result<T, SyncError>;
