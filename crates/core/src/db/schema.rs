//! Database schema definitions and migration runner.
//!
//! Migrations are simple SQL strings applied in order. The `schema_version`
//! user-version pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
/// Versions start at 1. The current schema version is stored in the SQLite
/// `user_version` pragma.
pub(crate) static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "initial schema",
        r#"
        CREATE TABLE IF NOT EXISTS sync_cursors (
            entity_type     TEXT    NOT NULL,
            direction       TEXT    NOT NULL CHECK (direction IN ('primary_to_mirror', 'mirror_to_primary')),
            last_timestamp  INTEGER NOT NULL DEFAULT 0,
            last_record_id  TEXT    NOT NULL DEFAULT '',
            generation      INTEGER NOT NULL DEFAULT 0,
            updated_at      TEXT    NOT NULL,
            PRIMARY KEY (entity_type, direction)
        );

        CREATE TABLE IF NOT EXISTS identity_map (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            primary_id  TEXT NOT NULL,
            mirror_id   TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_identity_primary ON identity_map (entity_type, primary_id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_identity_mirror ON identity_map (entity_type, mirror_id);

        CREATE TABLE IF NOT EXISTS sync_runs (
            id           TEXT PRIMARY KEY,
            direction    TEXT NOT NULL,
            status       TEXT NOT NULL,
            since        INTEGER,
            started_at   TEXT NOT NULL,
            completed_at TEXT,
            summary      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sync_runs_started_at ON sync_runs (started_at);

        CREATE TABLE IF NOT EXISTS conflict_log (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id        TEXT,
            entity_type   TEXT NOT NULL,
            primary_id    TEXT NOT NULL,
            mirror_id     TEXT NOT NULL,
            primary_json  TEXT NOT NULL,
            mirror_json   TEXT NOT NULL,
            resolved_json TEXT NOT NULL,
            outcome       TEXT NOT NULL,
            created_at    TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_conflict_log_entity ON conflict_log (entity_type, primary_id);

        CREATE TABLE IF NOT EXISTS audit_log (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            action      TEXT NOT NULL,
            entity_type TEXT,
            details     TEXT,
            success     INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_log_created_at ON audit_log (created_at);
        CREATE INDEX IF NOT EXISTS idx_audit_log_action ON audit_log (action);

        "#,
    ),
    (
        2,
        "identity map write timestamps",
        r#"
        ALTER TABLE identity_map ADD COLUMN primary_written_at INTEGER;
        ALTER TABLE identity_map ADD COLUMN mirror_written_at INTEGER;
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

/// Read the current schema version from the SQLite `user_version` pragma.
pub(crate) fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Set the schema version via the SQLite `user_version` pragma.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_run_idempotently() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 2);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .filter_map(|r| r.ok())
                .collect()
        };

        for table in [
            "sync_cursors",
            "identity_map",
            "sync_runs",
            "conflict_log",
            "audit_log",
        ] {
            assert!(tables.contains(&table.to_string()), "missing table {table}");
        }
    }

    #[test]
    fn test_cursor_direction_is_constrained() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let result = conn.execute(
            "INSERT INTO sync_cursors (entity_type, direction, updated_at) VALUES ('Contact', 'sideways', 'now')",
            [],
        );
        assert!(result.is_err());
    }
}
