//! Error types for the mirrorsync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use std::time::Duration;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Translate(#[from] TranslateError),

    #[error(transparent)]
    Cursor(#[from] CursorError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

// ---------------------------------------------------------------------------
// Error classes
// ---------------------------------------------------------------------------

/// How the orchestrator should react to a failed store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The store asked us to slow down. Back off and retry.
    Throttled,
    /// Transient failure (network, timeout, 5xx). Back off and retry.
    Retryable,
    /// Retrying will not help (schema violation, permission denied).
    Fatal,
}

// ---------------------------------------------------------------------------
// Store client errors
// ---------------------------------------------------------------------------

/// Errors surfaced by primary / mirror store clients.
#[derive(Debug, Error)]
pub enum StoreError {
    /// HTTP 429 or equivalent.
    #[error("store throttled the request{}", retry_after_suffix(.retry_after))]
    Throttled { retry_after: Option<Duration> },

    /// Network failure, 5xx, connection reset.
    #[error("transient store error: {0}")]
    Transient(String),

    /// The call exceeded its deadline.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// The store refused the write or read (schema violation, permissions).
    #[error("store rejected request{}: {detail}", status_suffix(.status))]
    Rejected { status: Option<u16>, detail: String },

    /// The store answered with something we could not interpret.
    #[error("malformed store response: {0}")]
    Protocol(String),
}

impl StoreError {
    /// Classify this error for retry handling.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Throttled { .. } => ErrorClass::Throttled,
            Self::Transient(_) | Self::Timeout(_) => ErrorClass::Retryable,
            Self::Rejected { .. } | Self::Protocol(_) => ErrorClass::Fatal,
        }
    }

    /// Server-suggested wait before retrying, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Throttled { retry_after } => *retry_after,
            _ => None,
        }
    }
}

fn retry_after_suffix(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}ms)", d.as_millis()),
        None => String::new(),
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(s) => format!(" (HTTP {s})"),
        None => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A required environment variable is not set.
    #[error("required environment variable '{var}' is not set (referenced by config field '{field}')")]
    EnvVarMissing { var: String, field: String },

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Schema registry errors
// ---------------------------------------------------------------------------

/// Errors from loading or querying the schema registry.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// No mapping is registered for the entity type.
    #[error("unknown entity type '{0}'")]
    UnknownEntity(String),

    /// The mapping for an entity is inconsistent.
    #[error("invalid mapping for entity '{entity}': {detail}")]
    InvalidMapping { entity: String, detail: String },

    /// Required references form a cycle, so no leaves-first order exists.
    #[error("required references form a cycle through: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    /// The mapping file could not be parsed.
    #[error("mapping file parse error: {0}")]
    ParseError(String),

    /// The mapping file does not exist.
    #[error("mapping file not found: {0}")]
    FileNotFound(String),

    /// Generic I/O error.
    #[error("mapping file I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A stored JSON column could not be (de)serialized.
    #[error("database serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Cursor errors
// ---------------------------------------------------------------------------

/// Errors from the cursor store.
#[derive(Debug, Error)]
pub enum CursorError {
    /// Another run advanced this pair since we read the cursor.
    #[error(
        "stale cursor for {entity}/{direction}: expected generation {expected}, stored {stored}"
    )]
    Stale {
        entity: String,
        direction: String,
        expected: i64,
        stored: i64,
    },

    #[error("cursor database error: {0}")]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Translation errors
// ---------------------------------------------------------------------------

/// Record-level translation failures. Field-level problems are reported as
/// [`crate::models::FieldError`] values instead.
#[derive(Debug, Error)]
pub enum TranslateError {
    /// A required reference field points at a record with no identity
    /// mapping yet.
    #[error("required reference '{field}' -> {entity}:{id} is not resolved")]
    UnresolvedReference {
        field: String,
        entity: String,
        id: String,
    },

    /// The identity lookup itself failed.
    #[error("identity lookup failed: {0}")]
    Identity(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Apply errors
// ---------------------------------------------------------------------------

/// Errors from the write applier.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The target store refused or failed the write.
    #[error("write failed: {0}")]
    Store(#[from] StoreError),

    /// Recording the identity pair failed after the write.
    #[error("identity map update failed: {0}")]
    Identity(#[from] DatabaseError),
}

impl ApplyError {
    /// Classify this error for retry handling.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Store(e) => e.class(),
            // A local SQLite failure is not something backing off will fix.
            Self::Identity(_) => ErrorClass::Fatal,
        }
    }
}

// ---------------------------------------------------------------------------
// Sync engine errors
// ---------------------------------------------------------------------------

/// Run-level errors from the sync engine. Pair-level failures are reported
/// in the run summary rather than as errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The scheduler tried to start a run while one is in progress.
    #[error("sync already in progress (started at {started_at})")]
    AlreadyRunning { started_at: String },

    /// The run references an entity the registry does not know.
    #[error("sync schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Database error outside of any single pair.
    #[error("sync database error: {0}")]
    Database(#[from] DatabaseError),

    /// Cursor store error outside of any single pair.
    #[error("sync cursor error: {0}")]
    Cursor(#[from] CursorError),
}
