//! Cross-store identity map.
//!
//! [`IdentityMap`] answers "which mirror row is primary document X?" and the
//! reverse. It is backed by the `identity_map` table and fronted by two
//! in-memory caches so lookups during a run rarely hit SQLite.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::db::queries::IdentityEntry;
use crate::db::Database;
use crate::errors::DatabaseError;
use crate::models::Side;
use crate::schema::{IdentityStrategy, MappingSpec};

type Key = (String, String);

/// Thread-safe bidirectional identity map.
pub struct IdentityMap {
    db: Arc<Database>,
    /// (entity, primary id) -> row.
    cache: RwLock<HashMap<Key, IdentityEntry>>,
    /// (entity, mirror id) -> primary id.
    reverse_cache: RwLock<HashMap<Key, String>>,
}

impl IdentityMap {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            cache: RwLock::new(HashMap::new()),
            reverse_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Find the identity row for a record known by its id on `side`.
    pub fn lookup(
        &self,
        entity: &str,
        side: Side,
        id: &str,
    ) -> Result<Option<IdentityEntry>, DatabaseError> {
        let primary_id = match side {
            Side::Primary => Some(id.to_string()),
            Side::Mirror => self
                .reverse()
                .get(&(entity.to_string(), id.to_string()))
                .cloned(),
        };
        if let Some(primary_id) = primary_id {
            if let Some(entry) = self.forward().get(&(entity.to_string(), primary_id)) {
                return Ok(Some(entry.clone()));
            }
        }

        let entry = self.db.find_identity(entity, side, id)?;
        if let Some(ref entry) = entry {
            self.remember(entry.clone());
        }
        Ok(entry)
    }

    /// Id of the counterpart of `id` (which lives on `side`), if mapped.
    pub fn counterpart(
        &self,
        entity: &str,
        side: Side,
        id: &str,
    ) -> Result<Option<String>, DatabaseError> {
        Ok(self
            .lookup(entity, side, id)?
            .map(|e| e.id_on(side.other()).to_string()))
    }

    /// Id to write under on the target side. Shared-identity entities reuse
    /// the source id even before the first write; mapped entities only know
    /// a target id once a pairing has been recorded.
    pub fn target_id(
        &self,
        spec: &MappingSpec,
        source_side: Side,
        source_id: &str,
    ) -> Result<Option<String>, DatabaseError> {
        match spec.identity {
            IdentityStrategy::Shared => Ok(Some(source_id.to_string())),
            IdentityStrategy::Mapped => self.counterpart(&spec.name, source_side, source_id),
        }
    }

    /// Record that `primary_id` and `mirror_id` are the same logical record.
    pub fn record(&self, entity: &str, primary_id: &str, mirror_id: &str) -> Result<(), DatabaseError> {
        self.db.upsert_identity(entity, primary_id, mirror_id)?;
        self.invalidate(entity, primary_id, Some(mirror_id));
        Ok(())
    }

    /// Remember the modification time `side` assigned to our write, so the
    /// change feed on that side can recognize the write as our own echo.
    pub fn record_write(
        &self,
        entity: &str,
        primary_id: &str,
        side: Side,
        modified_at: i64,
    ) -> Result<(), DatabaseError> {
        self.db.set_written_at(entity, primary_id, side, modified_at)?;
        let mut cache = self.forward_mut();
        if let Some(entry) = cache.get_mut(&(entity.to_string(), primary_id.to_string())) {
            match side {
                Side::Primary => entry.primary_written_at = Some(modified_at),
                Side::Mirror => entry.mirror_written_at = Some(modified_at),
            }
        }
        Ok(())
    }

    /// Drop a pairing after its record was deleted on both sides.
    pub fn forget(&self, entity: &str, primary_id: &str) -> Result<(), DatabaseError> {
        self.db.delete_identity(entity, primary_id)?;
        self.invalidate(entity, primary_id, None);
        Ok(())
    }

    /// Whether a record read from `side` is the echo of our own write: its
    /// modification time is not newer than the one the store gave our write.
    pub fn is_echo(
        &self,
        entity: &str,
        side: Side,
        id: &str,
        modified_at: i64,
    ) -> Result<bool, DatabaseError> {
        let echo = self
            .lookup(entity, side, id)?
            .and_then(|e| e.written_at(side))
            .is_some_and(|written| modified_at <= written);
        if echo {
            debug!(entity, %side, id, modified_at, "suppressing echo of own write");
        }
        Ok(echo)
    }

    // -- cache plumbing ----------------------------------------------------

    fn remember(&self, entry: IdentityEntry) {
        self.reverse_mut().insert(
            (entry.entity_type.clone(), entry.mirror_id.clone()),
            entry.primary_id.clone(),
        );
        self.forward_mut()
            .insert((entry.entity_type.clone(), entry.primary_id.clone()), entry);
    }

    fn invalidate(&self, entity: &str, primary_id: &str, mirror_id: Option<&str>) {
        let old = self
            .forward_mut()
            .remove(&(entity.to_string(), primary_id.to_string()));
        let mut reverse = self.reverse_mut();
        if let Some(old) = old {
            reverse.remove(&(entity.to_string(), old.mirror_id));
        }
        if let Some(mirror_id) = mirror_id {
            reverse.remove(&(entity.to_string(), mirror_id.to_string()));
        }
    }

    fn forward(&self) -> RwLockReadGuard<'_, HashMap<Key, IdentityEntry>> {
        self.cache.read().unwrap_or_else(|p| p.into_inner())
    }

    fn forward_mut(&self) -> RwLockWriteGuard<'_, HashMap<Key, IdentityEntry>> {
        self.cache.write().unwrap_or_else(|p| p.into_inner())
    }

    fn reverse(&self) -> RwLockReadGuard<'_, HashMap<Key, String>> {
        self.reverse_cache.read().unwrap_or_else(|p| p.into_inner())
    }

    fn reverse_mut(&self) -> RwLockWriteGuard<'_, HashMap<Key, String>> {
        self.reverse_cache.write().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaRegistry;

    fn map() -> IdentityMap {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        IdentityMap::new(Arc::new(db))
    }

    #[test]
    fn test_lookup_both_directions() {
        let ids = map();
        ids.record("Contact", "p1", "m1").unwrap();

        assert_eq!(
            ids.counterpart("Contact", Side::Primary, "p1").unwrap().as_deref(),
            Some("m1")
        );
        assert_eq!(
            ids.counterpart("Contact", Side::Mirror, "m1").unwrap().as_deref(),
            Some("p1")
        );
        assert!(ids.counterpart("Contact", Side::Mirror, "m2").unwrap().is_none());
    }

    #[test]
    fn test_rerecord_updates_cached_pairing() {
        let ids = map();
        ids.record("Contact", "p1", "m1").unwrap();
        // Warm the caches.
        ids.lookup("Contact", Side::Mirror, "m1").unwrap();

        ids.record("Contact", "p1", "m9").unwrap();
        assert_eq!(
            ids.counterpart("Contact", Side::Primary, "p1").unwrap().as_deref(),
            Some("m9")
        );
        assert!(ids.counterpart("Contact", Side::Mirror, "m1").unwrap().is_none());
    }

    #[test]
    fn test_echo_detection() {
        let ids = map();
        ids.record("Contact", "p1", "m1").unwrap();
        ids.record_write("Contact", "p1", Side::Mirror, 500).unwrap();

        assert!(ids.is_echo("Contact", Side::Mirror, "m1", 500).unwrap());
        assert!(ids.is_echo("Contact", Side::Mirror, "m1", 499).unwrap());
        assert!(!ids.is_echo("Contact", Side::Mirror, "m1", 501).unwrap());
        // Nothing was written to the primary.
        assert!(!ids.is_echo("Contact", Side::Primary, "p1", 1).unwrap());
    }

    #[test]
    fn test_target_id_by_strategy() {
        let reg = SchemaRegistry::from_toml_str(
            r#"
[[entities]]
name = "Account"
primary_collection = "accounts"
mirror_table = "accounts"
identity = "shared"

[[entities]]
name = "Contact"
primary_collection = "contacts"
mirror_table = "contacts"
"#,
        )
        .unwrap();
        let ids = map();

        let account = reg.resolve("Account").unwrap();
        assert_eq!(
            ids.target_id(account, Side::Primary, "a1").unwrap().as_deref(),
            Some("a1")
        );

        let contact = reg.resolve("Contact").unwrap();
        assert!(ids.target_id(contact, Side::Primary, "p1").unwrap().is_none());
        ids.record("Contact", "p1", "m1").unwrap();
        assert_eq!(
            ids.target_id(contact, Side::Primary, "p1").unwrap().as_deref(),
            Some("m1")
        );
    }

    #[test]
    fn test_forget_removes_pairing() {
        let ids = map();
        ids.record("Contact", "p1", "m1").unwrap();
        ids.forget("Contact", "p1").unwrap();
        assert!(ids.lookup("Contact", Side::Mirror, "m1").unwrap().is_none());
    }
}
