//! Domain model types used throughout mirrorsync.
//!
//! These types bridge the sync engine, database layer, and CLI.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Sides and directions
// ---------------------------------------------------------------------------

/// One of the two stores being kept in sync.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// The document-oriented system of record.
    Primary,
    /// The relational mirror.
    Mirror,
}

impl Side {
    pub fn other(self) -> Self {
        match self {
            Self::Primary => Self::Mirror,
            Self::Mirror => Self::Primary,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Mirror => write!(f, "mirror"),
        }
    }
}

/// Direction of a single (entity, direction) sync pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    PrimaryToMirror,
    MirrorToPrimary,
}

impl Direction {
    /// The side records are read from.
    pub fn source(self) -> Side {
        match self {
            Self::PrimaryToMirror => Side::Primary,
            Self::MirrorToPrimary => Side::Mirror,
        }
    }

    /// The side records are written to.
    pub fn target(self) -> Side {
        self.source().other()
    }

    /// The direction whose source is `side`.
    pub fn from_source(side: Side) -> Self {
        match side {
            Side::Primary => Self::PrimaryToMirror,
            Side::Mirror => Self::MirrorToPrimary,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PrimaryToMirror => "primary_to_mirror",
            Self::MirrorToPrimary => "mirror_to_primary",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary_to_mirror" => Ok(Self::PrimaryToMirror),
            "mirror_to_primary" => Ok(Self::MirrorToPrimary),
            other => Err(format!("unknown direction '{other}'")),
        }
    }
}

/// Direction requested for a whole sync run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunDirection {
    PrimaryToMirror,
    MirrorToPrimary,
    #[default]
    Bidirectional,
}

impl RunDirection {
    /// The pair directions this run covers.
    pub fn directions(self) -> &'static [Direction] {
        match self {
            Self::PrimaryToMirror => &[Direction::PrimaryToMirror],
            Self::MirrorToPrimary => &[Direction::MirrorToPrimary],
            Self::Bidirectional => &[Direction::PrimaryToMirror, Direction::MirrorToPrimary],
        }
    }
}

impl std::fmt::Display for RunDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PrimaryToMirror => write!(f, "primary_to_mirror"),
            Self::MirrorToPrimary => write!(f, "mirror_to_primary"),
            Self::Bidirectional => write!(f, "bidirectional"),
        }
    }
}

impl FromStr for RunDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary_to_mirror" => Ok(Self::PrimaryToMirror),
            "mirror_to_primary" => Ok(Self::MirrorToPrimary),
            "bidirectional" => Ok(Self::Bidirectional),
            other => Err(format!(
                "unknown direction '{other}' (expected primary_to_mirror, mirror_to_primary or bidirectional)"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// Sync watermark for one (entity, direction) pair.
///
/// Positions are ordered by `(timestamp, record_id)`; a fetch "since" a
/// cursor returns only records strictly after that position.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cursor {
    /// Store-assigned modification time (epoch milliseconds).
    pub timestamp: i64,
    /// Tie-breaker among records sharing `timestamp`.
    pub record_id: String,
    /// Incremented on every successful advance.
    pub generation: i64,
}

impl Cursor {
    /// The zero cursor used when a pair has never been synced.
    pub fn epoch() -> Self {
        Self::default()
    }

    pub fn at(timestamp: i64, record_id: impl Into<String>) -> Self {
        Self {
            timestamp,
            record_id: record_id.into(),
            generation: 0,
        }
    }

    pub fn is_epoch(&self) -> bool {
        self.timestamp == 0 && self.record_id.is_empty()
    }

    /// Whether a record at `(timestamp, id)` lies strictly after this cursor.
    pub fn admits(&self, timestamp: i64, id: &str) -> bool {
        (timestamp, id) > (self.timestamp, self.record_id.as_str())
    }

    /// Whether this cursor's position is strictly after `other`'s.
    pub fn is_ahead_of(&self, other: &Cursor) -> bool {
        other.admits(self.timestamp, &self.record_id)
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_epoch() {
            write!(f, "epoch")
        } else {
            write!(f, "{}@{} (gen {})", self.timestamp, self.record_id, self.generation)
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A record as returned by a store's change feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceRecord {
    /// Store-native identifier.
    pub id: String,
    /// Store-assigned modification time (epoch milliseconds).
    pub modified_at: i64,
    /// Tombstone flag.
    #[serde(default)]
    pub deleted: bool,
    /// Field payload. Documents may nest; relational rows are flat.
    #[serde(default)]
    pub fields: Map<String, Value>,
    /// Per-field (or per-field-group) modification times, keyed by field path.
    /// Fields without an entry fall back to `modified_at`.
    #[serde(default)]
    pub field_timestamps: BTreeMap<String, i64>,
}

impl SourceRecord {
    pub fn new(id: impl Into<String>, modified_at: i64, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            modified_at,
            deleted: false,
            fields,
            field_timestamps: BTreeMap::new(),
        }
    }

    pub fn tombstone(id: impl Into<String>, modified_at: i64) -> Self {
        Self {
            id: id.into(),
            modified_at,
            deleted: true,
            fields: Map::new(),
            field_timestamps: BTreeMap::new(),
        }
    }

    /// Modification time of the field at `path`.
    ///
    /// A timestamp registered for a parent path (a field group such as
    /// `profile`) applies to every field beneath it.
    pub fn field_timestamp(&self, path: &str) -> i64 {
        if let Some(ts) = self.field_timestamps.get(path) {
            return *ts;
        }
        let mut prefix = path;
        while let Some(idx) = prefix.rfind('.') {
            prefix = &prefix[..idx];
            if let Some(ts) = self.field_timestamps.get(prefix) {
                return *ts;
            }
        }
        self.modified_at
    }
}

/// A record translated into the target store's shape, ready to write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetRecord {
    pub entity: String,
    /// Side being written.
    pub side: Side,
    /// Identifier on the source side.
    pub source_id: String,
    /// Identifier on the target side, when already known.
    pub target_id: Option<String>,
    pub fields: Map<String, Value>,
    pub deleted: bool,
    /// Modification time of the source record this was derived from.
    pub source_modified_at: i64,
}

impl TargetRecord {
    /// Idempotency key for the write: `entity:source_side:source_id`. A
    /// create retried after a lost response carries the same key and lands
    /// on the row the first attempt made.
    pub fn write_key(&self) -> String {
        format!("{}:{}:{}", self.entity, self.side.other(), self.source_id)
    }
}

/// Why a single field could not be translated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldErrorKind {
    /// The value had the wrong JSON type for the coercion.
    TypeMismatch,
    /// A string could not be parsed as a timestamp.
    InvalidTimestamp,
    /// An enum value has no counterpart in the remap table.
    UnmappedEnumValue,
    /// An optional reference has no identity mapping yet.
    UnresolvedReference,
}

impl std::fmt::Display for FieldErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TypeMismatch => write!(f, "type_mismatch"),
            Self::InvalidTimestamp => write!(f, "invalid_timestamp"),
            Self::UnmappedEnumValue => write!(f, "unmapped_enum_value"),
            Self::UnresolvedReference => write!(f, "unresolved_reference"),
        }
    }
}

/// A field-level translation failure. The field is omitted from the write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub kind: FieldErrorKind,
    pub detail: String,
}

/// Result of writing one record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum WriteOutcome {
    /// The record was upserted.
    Applied { target_id: String, modified_at: i64 },
    /// The record was deleted on the target.
    Deleted { target_id: String },
    /// Nothing to do (tombstone for a record never mirrored, or an echo).
    Skipped { reason: String },
    /// The write failed for good.
    Failed { reason: String },
}

/// In-flight unit of work for a single source record. Lives only for the
/// duration of one run.
#[derive(Debug, Clone)]
pub struct SyncRecord {
    pub entity: String,
    pub direction: Direction,
    pub source: SourceRecord,
    pub target: Option<TargetRecord>,
    pub field_errors: Vec<FieldError>,
    pub outcome: Option<WriteOutcome>,
}

impl SyncRecord {
    pub fn new(entity: impl Into<String>, direction: Direction, source: SourceRecord) -> Self {
        Self {
            entity: entity.into(),
            direction,
            source,
            target: None,
            field_errors: Vec::new(),
            outcome: None,
        }
    }

    /// Cursor position of the underlying source record.
    pub fn position(&self) -> Cursor {
        Cursor::at(self.source.modified_at, self.source.id.clone())
    }
}

// ---------------------------------------------------------------------------
// Run reporting
// ---------------------------------------------------------------------------

/// Per-pair counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityCounts {
    pub fetched: u64,
    pub translated: u64,
    pub conflicted: u64,
    pub applied: u64,
    pub failed: u64,
    pub skipped: u64,
    pub field_errors: u64,
}

/// Pipeline step of a pair, used for state tracking and logging.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PairState {
    Idle,
    Fetching,
    Translating,
    Resolving,
    Applying,
    Advancing,
    Retrying,
    Failed,
}

impl std::fmt::Display for PairState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Fetching => write!(f, "fetching"),
            Self::Translating => write!(f, "translating"),
            Self::Resolving => write!(f, "resolving"),
            Self::Applying => write!(f, "applying"),
            Self::Advancing => write!(f, "advancing"),
            Self::Retrying => write!(f, "retrying"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Terminal state of a pair at the end of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PairStatus {
    /// Every fetched record was applied or skipped.
    Succeeded,
    /// The pair finished but some records failed; the cursor stops before
    /// the first failure.
    Degraded,
    /// The pair gave up (retries exhausted or a pair-level fatal error).
    Failed,
    /// Another run advanced the cursor first; this run backed off.
    Stale,
    /// The run was cancelled before the pair finished.
    Cancelled,
}

impl std::fmt::Display for PairStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Degraded => write!(f, "degraded"),
            Self::Failed => write!(f, "failed"),
            Self::Stale => write!(f, "stale"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of one (entity, direction) pair within a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairReport {
    pub entity: String,
    pub direction: Direction,
    pub status: PairStatus,
    pub counts: EntityCounts,
    pub cursor_before: Cursor,
    pub cursor_after: Cursor,
    pub error: Option<String>,
}

/// Terminal status of a whole run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One invocation of the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncRun {
    pub id: String,
    pub direction: RunDirection,
    /// Explicit start override (epoch milliseconds), if supplied.
    pub since: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub pairs: Vec<PairReport>,
    pub status: RunStatus,
}

impl SyncRun {
    pub fn start(direction: RunDirection, since: Option<i64>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            direction,
            since,
            started_at: Utc::now(),
            completed_at: None,
            pairs: Vec::new(),
            status: RunStatus::Running,
        }
    }

    /// Close the run and compute its terminal status. A run fails if any
    /// pair failed; stale pairs are not failures.
    pub fn finalize(&mut self, cancelled: bool) {
        self.pairs
            .sort_by(|a, b| (&a.entity, a.direction.as_str()).cmp(&(&b.entity, b.direction.as_str())));
        self.completed_at = Some(Utc::now());
        self.status = if self.pairs.iter().any(|p| p.status == PairStatus::Failed) {
            RunStatus::Failed
        } else if cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Succeeded
        };
    }

    pub fn failed_pairs(&self) -> impl Iterator<Item = &PairReport> {
        self.pairs.iter().filter(|p| p.status == PairStatus::Failed)
    }

    pub fn pair(&self, entity: &str, direction: Direction) -> Option<&PairReport> {
        self.pairs
            .iter()
            .find(|p| p.entity == entity && p.direction == direction)
    }

    /// Sum of counters across all pairs.
    pub fn totals(&self) -> EntityCounts {
        self.pairs.iter().fold(EntityCounts::default(), |mut acc, p| {
            acc.fetched += p.counts.fetched;
            acc.translated += p.counts.translated;
            acc.conflicted += p.counts.conflicted;
            acc.applied += p.counts.applied;
            acc.failed += p.counts.failed;
            acc.skipped += p.counts.skipped;
            acc.field_errors += p.counts.field_errors;
            acc
        })
    }
}

// ---------------------------------------------------------------------------
// Audit Entry
// ---------------------------------------------------------------------------

/// An audit-log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: String,
    pub details: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    /// Create a success audit entry.
    pub fn success(action: &str, details: &str) -> Self {
        Self {
            action: action.to_string(),
            details: details.to_string(),
            success: true,
            timestamp: Utc::now(),
        }
    }

    /// Create a failure audit entry.
    pub fn failure(action: &str, details: &str) -> Self {
        Self {
            action: action.to_string(),
            details: details.to_string(),
            success: false,
            timestamp: Utc::now(),
        }
    }
}
