//! SQLite persistence layer for mirrorsync.
//!
//! Holds everything the engine must remember between runs: cursors, the
//! cross-store identity map, run history, the conflict log and the audit
//! trail. Typed accessors live in [`queries`]; migrations in [`schema`].

pub mod queries;
pub mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::errors::DatabaseError;

/// Shared handle to the state database.
///
/// One connection behind a `Mutex`, so the handle can sit in an `Arc` and
/// be used from every pair task. Statements are short; no lock is held
/// across an `.await`.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the state database at `path`, creating missing
    /// parent directories.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        info!(path = %path.display(), "opening state database");

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;

        debug!("state database opened in WAL mode");
        Ok(Self::wrap(conn))
    }

    /// Private in-memory database; gone when the handle drops.
    pub fn in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self::wrap(conn))
    }

    fn wrap(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Apply pending migrations.
    pub fn initialize(&self) -> Result<(), DatabaseError> {
        schema::run_migrations(&self.conn())
    }

    /// Migration level the database is at.
    pub fn schema_version(&self) -> Result<u32, DatabaseError> {
        schema::get_schema_version(&self.conn())
    }

    /// Lock the connection. A poisoned lock is taken over: every write is
    /// a single statement or a transaction, so a panicking holder cannot
    /// leave half-applied state behind.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("state database lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Run `f` in a transaction; committed on `Ok`, rolled back on `Err`.
    pub fn transaction<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    fn cursor_rows(db: &Database, entity: &str) -> i64 {
        db.conn()
            .query_row(
                "SELECT COUNT(*) FROM sync_cursors WHERE entity_type = ?1",
                params![entity],
                |row| row.get(0),
            )
            .unwrap()
    }

    fn insert_cursor(conn: &Connection, entity: &str) -> Result<(), DatabaseError> {
        conn.execute(
            "INSERT INTO sync_cursors (entity_type, direction, updated_at)
             VALUES (?1, 'primary_to_mirror', '2026-01-01T00:00:00Z')",
            params![entity],
        )?;
        Ok(())
    }

    #[test]
    fn test_initialize_reaches_latest_version() {
        let db = Database::in_memory().unwrap();
        assert_eq!(db.schema_version().unwrap(), 0);
        db.initialize().unwrap();
        let latest = schema::MIGRATIONS.last().map(|m| m.0).unwrap();
        assert_eq!(db.schema_version().unwrap(), latest);
    }

    #[test]
    fn test_file_database_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("nested").join("mirrorsync.db");
        let db = Database::new(&path).unwrap();
        db.initialize().unwrap();
        assert!(path.exists());

        drop(db);
        let reopened = Database::new(&path).unwrap();
        reopened.initialize().unwrap();
        assert!(reopened.schema_version().unwrap() > 0);
    }

    #[test]
    fn test_transaction_commits_on_ok() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db.transaction(|conn| insert_cursor(conn, "Contact")).unwrap();
        assert_eq!(cursor_rows(&db, "Contact"), 1);
    }

    #[test]
    fn test_transaction_rolls_back_on_err() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();

        let result: Result<(), DatabaseError> = db.transaction(|conn| {
            insert_cursor(conn, "Account")?;
            Err(DatabaseError::NotFound {
                entity: "Account".into(),
                id: "a1".into(),
            })
        });
        assert!(result.is_err());
        assert_eq!(cursor_rows(&db, "Account"), 0);
    }
}
