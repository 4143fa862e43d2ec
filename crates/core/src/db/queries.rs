//! Typed query helpers for every table in the mirrorsync database.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::Database;
use crate::errors::DatabaseError;
use crate::models::{self, Cursor, Direction, Side, SyncRun};

// ---------------------------------------------------------------------------
// Domain structs returned by queries
// ---------------------------------------------------------------------------

/// A row from the `sync_cursors` table.
#[derive(Debug, Clone)]
pub struct CursorEntry {
    pub entity_type: String,
    pub direction: String,
    pub cursor: Cursor,
    pub updated_at: String,
}

/// Result of a compare-and-advance on a cursor row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// The cursor moved; carries the stored value after the update.
    Advanced(Cursor),
    /// The new position was not ahead of the stored one; nothing changed.
    Unchanged(Cursor),
    /// The stored generation differs from the expected one.
    GenerationMismatch { stored: i64 },
}

/// A row from the `identity_map` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityEntry {
    pub entity_type: String,
    pub primary_id: String,
    pub mirror_id: String,
    /// Modification time the primary store assigned to our last write there.
    pub primary_written_at: Option<i64>,
    /// Modification time the mirror store assigned to our last write there.
    pub mirror_written_at: Option<i64>,
}

impl IdentityEntry {
    pub fn id_on(&self, side: Side) -> &str {
        match side {
            Side::Primary => &self.primary_id,
            Side::Mirror => &self.mirror_id,
        }
    }

    pub fn written_at(&self, side: Side) -> Option<i64> {
        match side {
            Side::Primary => self.primary_written_at,
            Side::Mirror => self.mirror_written_at,
        }
    }
}

/// A new row for the `conflict_log` table.
#[derive(Debug, Clone)]
pub struct NewConflictLog<'a> {
    pub run_id: Option<&'a str>,
    pub entity_type: &'a str,
    pub primary_id: &'a str,
    pub mirror_id: &'a str,
    pub primary: &'a serde_json::Value,
    pub mirror: &'a serde_json::Value,
    pub resolved: &'a serde_json::Value,
    pub outcome: &'a str,
}

/// A row from the `conflict_log` table.
#[derive(Debug, Clone)]
pub struct ConflictLogEntry {
    pub id: i64,
    pub run_id: Option<String>,
    pub entity_type: String,
    pub primary_id: String,
    pub mirror_id: String,
    pub primary_json: String,
    pub mirror_json: String,
    pub resolved_json: String,
    pub outcome: String,
    pub created_at: String,
}

/// A row from the `audit_log` table.
#[derive(Debug, Clone)]
pub struct AuditLogEntry {
    pub id: i64,
    pub action: String,
    pub entity_type: Option<String>,
    pub details: Option<String>,
    pub success: bool,
    pub created_at: String,
}

// ---------------------------------------------------------------------------
// Query implementations
// ---------------------------------------------------------------------------

impl Database {
    // -- sync_cursors -------------------------------------------------------

    /// Read the stored cursor for a pair, if one exists.
    pub fn get_cursor(
        &self,
        entity_type: &str,
        direction: Direction,
    ) -> Result<Option<Cursor>, DatabaseError> {
        let conn = self.conn();
        read_cursor(&conn, entity_type, direction)
    }

    /// Atomically move a pair's cursor forward.
    ///
    /// Fails with [`AdvanceOutcome::GenerationMismatch`] when the stored
    /// generation is not `expected_generation`. A position at or behind the
    /// stored one leaves the row untouched.
    pub fn advance_cursor(
        &self,
        entity_type: &str,
        direction: Direction,
        expected_generation: i64,
        new_position: &Cursor,
    ) -> Result<AdvanceOutcome, DatabaseError> {
        self.transaction(|conn| {
            let stored = read_cursor(conn, entity_type, direction)?.unwrap_or_else(Cursor::epoch);

            if stored.generation != expected_generation {
                return Ok(AdvanceOutcome::GenerationMismatch {
                    stored: stored.generation,
                });
            }
            if !new_position.is_ahead_of(&stored) {
                return Ok(AdvanceOutcome::Unchanged(stored));
            }

            let next = Cursor {
                timestamp: new_position.timestamp,
                record_id: new_position.record_id.clone(),
                generation: stored.generation + 1,
            };
            conn.execute(
                "INSERT INTO sync_cursors (entity_type, direction, last_timestamp, last_record_id, generation, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(entity_type, direction) DO UPDATE SET
                    last_timestamp = excluded.last_timestamp,
                    last_record_id = excluded.last_record_id,
                    generation = excluded.generation,
                    updated_at = excluded.updated_at",
                params![
                    entity_type,
                    direction.as_str(),
                    next.timestamp,
                    next.record_id,
                    next.generation,
                    Utc::now().to_rfc3339()
                ],
            )?;
            debug!(entity_type, %direction, cursor = %next, "advanced cursor");
            Ok(AdvanceOutcome::Advanced(next))
        })
    }

    /// List all stored cursors ordered by entity then direction.
    pub fn list_cursors(&self) -> Result<Vec<CursorEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT entity_type, direction, last_timestamp, last_record_id, generation, updated_at
             FROM sync_cursors ORDER BY entity_type, direction",
        )?;
        let entries = stmt
            .query_map([], |row| {
                Ok(CursorEntry {
                    entity_type: row.get(0)?,
                    direction: row.get(1)?,
                    cursor: Cursor {
                        timestamp: row.get(2)?,
                        record_id: row.get(3)?,
                        generation: row.get(4)?,
                    },
                    updated_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // -- identity_map -------------------------------------------------------

    /// Look up the identity row for a record known by its id on `side`.
    pub fn find_identity(
        &self,
        entity_type: &str,
        side: Side,
        id: &str,
    ) -> Result<Option<IdentityEntry>, DatabaseError> {
        let sql = match side {
            Side::Primary => {
                "SELECT entity_type, primary_id, mirror_id, primary_written_at, mirror_written_at
                 FROM identity_map WHERE entity_type = ?1 AND primary_id = ?2"
            }
            Side::Mirror => {
                "SELECT entity_type, primary_id, mirror_id, primary_written_at, mirror_written_at
                 FROM identity_map WHERE entity_type = ?1 AND mirror_id = ?2"
            }
        };
        let conn = self.conn();
        let entry = conn
            .query_row(sql, params![entity_type, id], identity_from_row)
            .optional()?;
        Ok(entry)
    }

    /// Insert or replace the pairing `(entity, primary_id) <-> mirror_id`.
    ///
    /// A stale row that paired either id with something else is removed
    /// first so both unique indexes stay satisfied.
    pub fn upsert_identity(
        &self,
        entity_type: &str,
        primary_id: &str,
        mirror_id: &str,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.transaction(|conn| {
            conn.execute(
                "DELETE FROM identity_map
                 WHERE entity_type = ?1 AND mirror_id = ?2 AND primary_id != ?3",
                params![entity_type, mirror_id, primary_id],
            )?;
            conn.execute(
                "INSERT INTO identity_map (entity_type, primary_id, mirror_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(entity_type, primary_id) DO UPDATE SET
                    mirror_id = excluded.mirror_id,
                    updated_at = excluded.updated_at",
                params![entity_type, primary_id, mirror_id, now],
            )?;
            Ok(())
        })?;
        debug!(entity_type, primary_id, mirror_id, "recorded identity pair");
        Ok(())
    }

    /// Store the modification time a store assigned to one of our writes.
    pub fn set_written_at(
        &self,
        entity_type: &str,
        primary_id: &str,
        side: Side,
        modified_at: i64,
    ) -> Result<(), DatabaseError> {
        let sql = match side {
            Side::Primary => {
                "UPDATE identity_map SET primary_written_at = ?3, updated_at = ?4
                 WHERE entity_type = ?1 AND primary_id = ?2"
            }
            Side::Mirror => {
                "UPDATE identity_map SET mirror_written_at = ?3, updated_at = ?4
                 WHERE entity_type = ?1 AND primary_id = ?2"
            }
        };
        let conn = self.conn();
        let changed = conn.execute(
            sql,
            params![entity_type, primary_id, modified_at, Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: format!("identity {entity_type}"),
                id: primary_id.to_string(),
            });
        }
        Ok(())
    }

    /// Remove an identity pairing (after a propagated delete).
    pub fn delete_identity(&self, entity_type: &str, primary_id: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let changed = conn.execute(
            "DELETE FROM identity_map WHERE entity_type = ?1 AND primary_id = ?2",
            params![entity_type, primary_id],
        )?;
        Ok(changed > 0)
    }

    /// List identity rows for one entity type.
    pub fn list_identities(&self, entity_type: &str) -> Result<Vec<IdentityEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT entity_type, primary_id, mirror_id, primary_written_at, mirror_written_at
             FROM identity_map WHERE entity_type = ?1 ORDER BY primary_id",
        )?;
        let entries = stmt
            .query_map(params![entity_type], identity_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn count_identities(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM identity_map", [], |row| row.get(0))?;
        Ok(count)
    }

    // -- sync_runs ----------------------------------------------------------

    /// Persist a run summary. Re-saving the same run id replaces it.
    pub fn save_sync_run(&self, run: &SyncRun) -> Result<(), DatabaseError> {
        let summary = serde_json::to_string(run)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sync_runs (id, direction, status, since, started_at, completed_at, summary)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                completed_at = excluded.completed_at,
                summary = excluded.summary",
            params![
                run.id,
                run.direction.to_string(),
                run.status.to_string(),
                run.since,
                run.started_at.to_rfc3339(),
                run.completed_at.map(|t| t.to_rfc3339()),
                summary
            ],
        )?;
        debug!(run_id = %run.id, status = %run.status, "saved sync run");
        Ok(())
    }

    /// Most recent runs first.
    pub fn list_sync_runs(&self, limit: u32) -> Result<Vec<SyncRun>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT summary FROM sync_runs ORDER BY started_at DESC, rowid DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|s| serde_json::from_str(s).map_err(DatabaseError::from))
            .collect()
    }

    pub fn get_latest_sync_run(&self) -> Result<Option<SyncRun>, DatabaseError> {
        Ok(self.list_sync_runs(1)?.into_iter().next())
    }

    // -- conflict_log -------------------------------------------------------

    /// Record one conflict resolution.
    pub fn insert_conflict_log(&self, entry: &NewConflictLog<'_>) -> Result<i64, DatabaseError> {
        let primary_json = serde_json::to_string(entry.primary)?;
        let mirror_json = serde_json::to_string(entry.mirror)?;
        let resolved_json = serde_json::to_string(entry.resolved)?;
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO conflict_log
                (run_id, entity_type, primary_id, mirror_id, primary_json, mirror_json, resolved_json, outcome, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.run_id,
                entry.entity_type,
                entry.primary_id,
                entry.mirror_id,
                primary_json,
                mirror_json,
                resolved_json,
                entry.outcome,
                now
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, entity_type = entry.entity_type, primary_id = entry.primary_id, "logged conflict");
        Ok(id)
    }

    /// Most recent resolutions first, optionally for one entity type.
    pub fn list_conflict_log(
        &self,
        entity_type: Option<&str>,
        limit: u32,
    ) -> Result<Vec<ConflictLogEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, entity_type, primary_id, mirror_id, primary_json, mirror_json,
                    resolved_json, outcome, created_at
             FROM conflict_log
             WHERE ?1 IS NULL OR entity_type = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(params![entity_type, limit], |row| {
                Ok(ConflictLogEntry {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    entity_type: row.get(2)?,
                    primary_id: row.get(3)?,
                    mirror_id: row.get(4)?,
                    primary_json: row.get(5)?,
                    mirror_json: row.get(6)?,
                    resolved_json: row.get(7)?,
                    outcome: row.get(8)?,
                    created_at: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn count_conflict_log(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM conflict_log", [], |row| row.get(0))?;
        Ok(count)
    }

    // -- audit_log ----------------------------------------------------------

    /// Insert an audit-log entry.
    pub fn insert_audit_log(
        &self,
        action: &str,
        entity_type: Option<&str>,
        details: Option<&str>,
        success: bool,
    ) -> Result<i64, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO audit_log (action, entity_type, details, success, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![action, entity_type, details, success, now],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, action, "inserted audit_log entry");
        Ok(id)
    }

    /// Insert an audit entry from a model struct.
    pub fn insert_audit_entry(&self, entry: &models::AuditEntry) -> Result<i64, DatabaseError> {
        self.insert_audit_log(&entry.action, None, Some(&entry.details), entry.success)
    }

    /// List recent audit-log entries.
    pub fn list_audit_log(&self, limit: u32) -> Result<Vec<AuditLogEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, action, entity_type, details, success, created_at
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit], |row| {
                Ok(AuditLogEntry {
                    id: row.get(0)?,
                    action: row.get(1)?,
                    entity_type: row.get(2)?,
                    details: row.get(3)?,
                    success: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Count failed audit entries.
    pub fn count_errors(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM audit_log WHERE success = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn read_cursor(
    conn: &Connection,
    entity_type: &str,
    direction: Direction,
) -> Result<Option<Cursor>, DatabaseError> {
    let cursor = conn
        .query_row(
            "SELECT last_timestamp, last_record_id, generation
             FROM sync_cursors WHERE entity_type = ?1 AND direction = ?2",
            params![entity_type, direction.as_str()],
            |row| {
                Ok(Cursor {
                    timestamp: row.get(0)?,
                    record_id: row.get(1)?,
                    generation: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(cursor)
}

fn identity_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IdentityEntry> {
    Ok(IdentityEntry {
        entity_type: row.get(0)?,
        primary_id: row.get(1)?,
        mirror_id: row.get(2)?,
        primary_written_at: row.get(3)?,
        mirror_written_at: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PairReport, PairStatus, RunDirection, EntityCounts};
    use serde_json::json;

    fn test_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    #[test]
    fn test_advance_cursor_increments_generation() {
        let db = test_db();
        assert!(db
            .get_cursor("Contact", Direction::PrimaryToMirror)
            .unwrap()
            .is_none());

        let outcome = db
            .advance_cursor("Contact", Direction::PrimaryToMirror, 0, &Cursor::at(100, "c1"))
            .unwrap();
        let AdvanceOutcome::Advanced(stored) = outcome else {
            panic!("expected advance, got {outcome:?}");
        };
        assert_eq!(stored.generation, 1);
        assert_eq!(
            db.get_cursor("Contact", Direction::PrimaryToMirror)
                .unwrap()
                .unwrap(),
            stored
        );

        // Other direction is independent.
        assert!(db
            .get_cursor("Contact", Direction::MirrorToPrimary)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_advance_cursor_rejects_generation_mismatch() {
        let db = test_db();
        db.advance_cursor("Contact", Direction::PrimaryToMirror, 0, &Cursor::at(100, "c1"))
            .unwrap();
        let outcome = db
            .advance_cursor("Contact", Direction::PrimaryToMirror, 0, &Cursor::at(200, "c2"))
            .unwrap();
        assert_eq!(outcome, AdvanceOutcome::GenerationMismatch { stored: 1 });
    }

    #[test]
    fn test_advance_cursor_never_moves_backward() {
        let db = test_db();
        db.advance_cursor("Contact", Direction::PrimaryToMirror, 0, &Cursor::at(100, "c5"))
            .unwrap();
        for behind in [Cursor::at(100, "c5"), Cursor::at(100, "c4"), Cursor::at(50, "z")] {
            let outcome = db
                .advance_cursor("Contact", Direction::PrimaryToMirror, 1, &behind)
                .unwrap();
            assert!(matches!(outcome, AdvanceOutcome::Unchanged(ref c) if c.record_id == "c5"));
        }
    }

    #[test]
    fn test_identity_roundtrip_and_written_at() {
        let db = test_db();
        db.upsert_identity("Contact", "p1", "m1").unwrap();

        let by_primary = db.find_identity("Contact", Side::Primary, "p1").unwrap().unwrap();
        assert_eq!(by_primary.mirror_id, "m1");
        let by_mirror = db.find_identity("Contact", Side::Mirror, "m1").unwrap().unwrap();
        assert_eq!(by_mirror.primary_id, "p1");
        assert!(db.find_identity("Account", Side::Primary, "p1").unwrap().is_none());

        db.set_written_at("Contact", "p1", Side::Mirror, 555).unwrap();
        let entry = db.find_identity("Contact", Side::Primary, "p1").unwrap().unwrap();
        assert_eq!(entry.written_at(Side::Mirror), Some(555));
        assert_eq!(entry.written_at(Side::Primary), None);

        assert!(db.set_written_at("Contact", "nope", Side::Mirror, 1).is_err());
    }

    #[test]
    fn test_upsert_identity_replaces_stale_pairing() {
        let db = test_db();
        db.upsert_identity("Contact", "p1", "m1").unwrap();
        db.upsert_identity("Contact", "p2", "m1").unwrap();

        assert!(db.find_identity("Contact", Side::Primary, "p1").unwrap().is_none());
        assert_eq!(
            db.find_identity("Contact", Side::Mirror, "m1").unwrap().unwrap().primary_id,
            "p2"
        );
        assert_eq!(db.count_identities().unwrap(), 1);
    }

    #[test]
    fn test_sync_run_history() {
        let db = test_db();
        let mut run = SyncRun::start(RunDirection::PrimaryToMirror, Some(10));
        run.pairs.push(PairReport {
            entity: "Contact".into(),
            direction: Direction::PrimaryToMirror,
            status: PairStatus::Succeeded,
            counts: EntityCounts {
                fetched: 3,
                applied: 3,
                ..Default::default()
            },
            cursor_before: Cursor::epoch(),
            cursor_after: Cursor::at(30, "c3"),
            error: None,
        });
        run.finalize(false);
        db.save_sync_run(&run).unwrap();
        db.save_sync_run(&run).unwrap();

        let runs = db.list_sync_runs(10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0], run);
        assert_eq!(db.get_latest_sync_run().unwrap().unwrap().id, run.id);
    }

    #[test]
    fn test_conflict_log_filter() {
        let db = test_db();
        let p = json!({"email": "a@x"});
        let m = json!({"phone": "1"});
        let r = json!({"email": "a@x", "phone": "1"});
        for entity in ["Contact", "Account"] {
            db.insert_conflict_log(&NewConflictLog {
                run_id: Some("run-1"),
                entity_type: entity,
                primary_id: "p1",
                mirror_id: "m1",
                primary: &p,
                mirror: &m,
                resolved: &r,
                outcome: "merged",
            })
            .unwrap();
        }

        assert_eq!(db.count_conflict_log().unwrap(), 2);
        let contacts = db.list_conflict_log(Some("Contact"), 10).unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].outcome, "merged");
        assert_eq!(db.list_conflict_log(None, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_audit_log_counts_failures() {
        let db = test_db();
        db.insert_audit_entry(&models::AuditEntry::success("sync_run", "ok"))
            .unwrap();
        db.insert_audit_log("pair_failed", Some("Contact"), Some("boom"), false)
            .unwrap();
        let entries = db.list_audit_log(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "pair_failed");
        assert!(!entries[0].success);
        assert_eq!(db.count_errors().unwrap(), 1);
    }
}
