//! Conflict detection between the two sides' change sets.
//!
//! Two changes conflict when they touch the same logical record: the primary
//! document and the mirror row are paired through the identity map (or share
//! an id, for entities using shared identity).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::DatabaseError;
use crate::identity::IdentityMap;
use crate::models::{Side, SourceRecord};
use crate::schema::MappingSpec;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// How the two sides diverged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides modified the record.
    ModifyModify,
    /// Primary deleted, mirror modified.
    DeleteModify,
    /// Primary modified, mirror deleted.
    ModifyDelete,
    /// Both sides deleted the record.
    DeleteDelete,
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ModifyModify => write!(f, "modify_modify"),
            Self::DeleteModify => write!(f, "delete_modify"),
            Self::ModifyDelete => write!(f, "modify_delete"),
            Self::DeleteDelete => write!(f, "delete_delete"),
        }
    }
}

/// One record changed on both sides since the respective cursors.
#[derive(Debug, Clone)]
pub struct Conflict {
    pub entity: String,
    pub conflict_type: ConflictType,
    pub primary: SourceRecord,
    pub mirror: SourceRecord,
}

impl Conflict {
    pub fn new(entity: impl Into<String>, primary: SourceRecord, mirror: SourceRecord) -> Self {
        let conflict_type = match (primary.deleted, mirror.deleted) {
            (false, false) => ConflictType::ModifyModify,
            (true, false) => ConflictType::DeleteModify,
            (false, true) => ConflictType::ModifyDelete,
            (true, true) => ConflictType::DeleteDelete,
        };
        Self {
            entity: entity.into(),
            conflict_type,
            primary,
            mirror,
        }
    }

    /// The conflicting record as seen from `side`.
    pub fn record(&self, side: Side) -> &SourceRecord {
        match side {
            Side::Primary => &self.primary,
            Side::Mirror => &self.mirror,
        }
    }
}

/// Changes of one entity split into overlapping and one-sided sets. Each
/// set keeps the fetch order of its records.
#[derive(Debug, Default)]
pub struct ChangeSet {
    pub conflicts: Vec<Conflict>,
    pub primary_only: Vec<SourceRecord>,
    pub mirror_only: Vec<SourceRecord>,
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Stateless detector pairing primary and mirror changes of one entity.
pub struct ConflictDetector;

impl ConflictDetector {
    pub fn detect(
        spec: &MappingSpec,
        primary: Vec<SourceRecord>,
        mirror: Vec<SourceRecord>,
        identity: &IdentityMap,
    ) -> Result<ChangeSet, DatabaseError> {
        info!(
            entity = %spec.name,
            primary_count = primary.len(),
            mirror_count = mirror.len(),
            "detecting conflicts"
        );

        let mut mirror_slots: Vec<Option<SourceRecord>> = mirror.into_iter().map(Some).collect();
        let by_id: HashMap<String, usize> = mirror_slots
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().map(|r| (r.id.clone(), i)))
            .collect();

        let mut set = ChangeSet::default();
        for record in primary {
            let paired = identity
                .target_id(spec, Side::Primary, &record.id)?
                .and_then(|mirror_id| by_id.get(&mirror_id).copied())
                .and_then(|idx| mirror_slots[idx].take());

            match paired {
                Some(mirror_record) => {
                    let conflict = Conflict::new(&spec.name, record, mirror_record);
                    debug!(
                        entity = %spec.name,
                        primary_id = %conflict.primary.id,
                        mirror_id = %conflict.mirror.id,
                        conflict_type = %conflict.conflict_type,
                        "conflict detected"
                    );
                    set.conflicts.push(conflict);
                }
                None => set.primary_only.push(record),
            }
        }
        set.mirror_only = mirror_slots.into_iter().flatten().collect();

        if !set.conflicts.is_empty() {
            info!(entity = %spec.name, count = set.conflicts.len(), "conflicts detected");
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::schema::SchemaRegistry;
    use serde_json::Map;
    use std::sync::Arc;

    const MAPPING: &str = r#"
[[entities]]
name = "Contact"
primary_collection = "contacts"
mirror_table = "contacts"

[[entities.fields]]
source = "email"
target = "email"

[[entities]]
name = "Tag"
primary_collection = "tags"
mirror_table = "tags"
identity = "shared"

[[entities.fields]]
source = "label"
target = "label"
"#;

    fn setup() -> (SchemaRegistry, IdentityMap) {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        (
            SchemaRegistry::from_toml_str(MAPPING).unwrap(),
            IdentityMap::new(Arc::new(db)),
        )
    }

    fn rec(id: &str, ts: i64) -> SourceRecord {
        SourceRecord::new(id, ts, Map::new())
    }

    #[test]
    fn test_pairs_through_identity_map() {
        let (reg, ids) = setup();
        ids.record("Contact", "p1", "m1").unwrap();
        ids.record("Contact", "p2", "m2").unwrap();
        let spec = reg.resolve("Contact").unwrap();

        let set = ConflictDetector::detect(
            spec,
            vec![rec("p1", 10), rec("p2", 11), rec("p3", 12)],
            vec![rec("m1", 5), rec("m9", 6)],
            &ids,
        )
        .unwrap();

        assert_eq!(set.conflicts.len(), 1);
        assert_eq!(set.conflicts[0].primary.id, "p1");
        assert_eq!(set.conflicts[0].mirror.id, "m1");
        assert_eq!(set.conflicts[0].conflict_type, ConflictType::ModifyModify);
        let primary_only: Vec<_> = set.primary_only.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(primary_only, vec!["p2", "p3"]);
        let mirror_only: Vec<_> = set.mirror_only.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(mirror_only, vec!["m9"]);
    }

    #[test]
    fn test_shared_identity_pairs_by_id() {
        let (reg, ids) = setup();
        let spec = reg.resolve("Tag").unwrap();
        let set = ConflictDetector::detect(
            spec,
            vec![rec("t1", 10), SourceRecord::tombstone("t2", 11)],
            vec![rec("t2", 3)],
            &ids,
        )
        .unwrap();

        assert_eq!(set.conflicts.len(), 1);
        assert_eq!(set.conflicts[0].conflict_type, ConflictType::DeleteModify);
        assert_eq!(set.primary_only.len(), 1);
        assert!(set.mirror_only.is_empty());
    }

    #[test]
    fn test_conflict_type_display() {
        assert_eq!(ConflictType::ModifyModify.to_string(), "modify_modify");
        assert_eq!(ConflictType::DeleteDelete.to_string(), "delete_delete");
        let c = Conflict::new("X", rec("a", 1), SourceRecord::tombstone("b", 2));
        assert_eq!(c.conflict_type, ConflictType::ModifyDelete);
        assert_eq!(c.record(Side::Mirror).id, "b");
    }
}
