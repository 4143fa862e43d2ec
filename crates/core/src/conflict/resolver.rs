//! Field-level last-write-wins resolution.
//!
//! Each field mapped in both directions goes to whichever side stamped it
//! later; ties go to the primary. One-way fields always come from their
//! source side. A delete on either side beats any modification.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::detector::{Conflict, ConflictType};
use crate::db::queries::NewConflictLog;
use crate::db::Database;
use crate::errors::{DatabaseError, TranslateError};
use crate::identity::IdentityMap;
use crate::models::{Direction, FieldError, Side, SourceRecord, TargetRecord};
use crate::schema::{FieldDirection, MappingSpec};
use crate::translator::{get_path, set_path, translate};

/// How a conflict was settled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOutcome {
    /// Every decided field came from the primary.
    PrimaryWins,
    /// Every decided field came from the mirror.
    MirrorWins,
    /// Fields came from both sides.
    Merged,
    /// The primary deleted the record; the delete goes to the mirror.
    PrimaryDeleted,
    /// The mirror deleted the record; the delete goes to the primary.
    MirrorDeleted,
    /// Both sides deleted the record.
    BothDeleted,
}

impl std::fmt::Display for ResolutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PrimaryWins => write!(f, "primary_wins"),
            Self::MirrorWins => write!(f, "mirror_wins"),
            Self::Merged => write!(f, "merged"),
            Self::PrimaryDeleted => write!(f, "primary_deleted"),
            Self::MirrorDeleted => write!(f, "mirror_deleted"),
            Self::BothDeleted => write!(f, "both_deleted"),
        }
    }
}

/// Which side supplied one field, and why.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldDecision {
    /// Field path in primary shape.
    pub field: String,
    pub winner: Side,
    pub primary_ts: i64,
    pub mirror_ts: i64,
}

/// The settled state of a conflict and the writes that bring both sides to
/// it.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub entity: String,
    pub primary_id: String,
    pub mirror_id: String,
    pub conflict_type: ConflictType,
    pub outcome: ResolutionOutcome,
    pub decisions: Vec<FieldDecision>,
    /// Merged document in primary shape.
    pub resolved: Map<String, Value>,
    pub primary_write: Option<TargetRecord>,
    pub mirror_write: Option<TargetRecord>,
    pub field_errors: Vec<FieldError>,
}

impl Resolution {
    /// Pending writes, primary first.
    pub fn writes(&self) -> impl Iterator<Item = &TargetRecord> {
        self.primary_write.iter().chain(self.mirror_write.iter())
    }
}

/// Stateless resolver.
pub struct ConflictResolver;

impl ConflictResolver {
    /// Settle `conflict`. Fails only when the merged record cannot be
    /// translated (an unresolved required reference).
    pub fn resolve(
        conflict: &Conflict,
        spec: &MappingSpec,
        identity: &IdentityMap,
    ) -> Result<Resolution, TranslateError> {
        let primary = &conflict.primary;
        let mirror = &conflict.mirror;

        let mut resolution = Resolution {
            entity: spec.name.clone(),
            primary_id: primary.id.clone(),
            mirror_id: mirror.id.clone(),
            conflict_type: conflict.conflict_type,
            outcome: ResolutionOutcome::BothDeleted,
            decisions: Vec::new(),
            resolved: Map::new(),
            primary_write: None,
            mirror_write: None,
            field_errors: Vec::new(),
        };

        match conflict.conflict_type {
            ConflictType::DeleteDelete => {}
            ConflictType::DeleteModify => {
                resolution.outcome = ResolutionOutcome::PrimaryDeleted;
                resolution.mirror_write = Some(tombstone(spec, Side::Mirror, primary, &mirror.id));
            }
            ConflictType::ModifyDelete => {
                resolution.outcome = ResolutionOutcome::MirrorDeleted;
                resolution.primary_write = Some(tombstone(spec, Side::Primary, mirror, &primary.id));
            }
            ConflictType::ModifyModify => Self::merge(conflict, spec, identity, &mut resolution)?,
        }

        info!(
            entity = %spec.name,
            primary_id = %primary.id,
            mirror_id = %mirror.id,
            conflict_type = %conflict.conflict_type,
            outcome = %resolution.outcome,
            "resolved conflict"
        );
        Ok(resolution)
    }

    fn merge(
        conflict: &Conflict,
        spec: &MappingSpec,
        identity: &IdentityMap,
        resolution: &mut Resolution,
    ) -> Result<(), TranslateError> {
        let primary = &conflict.primary;
        let mirror = &conflict.mirror;

        // The mirror row in primary shape, so values compare like for like.
        let mirror_view = translate(mirror, spec, Direction::MirrorToPrimary, identity)?;
        resolution.field_errors.extend(mirror_view.field_errors);
        let mirror_fields = mirror_view.target.fields;

        let mut to_primary = Map::new();
        let mut to_mirror = Map::new();

        for field in &spec.fields {
            let path = field.source.as_str();
            let pv = get_path(&primary.fields, path);
            let mv = get_path(&mirror_fields, path);
            let primary_ts = primary.field_timestamp(path);
            let mirror_ts = mirror.field_timestamp(&field.target);

            let winner = match (field.direction, pv, mv) {
                (_, None, None) => continue,
                (FieldDirection::PrimaryToMirror, None, _) => continue,
                (FieldDirection::MirrorToPrimary, _, None) => continue,
                (FieldDirection::PrimaryToMirror, Some(_), _) => Side::Primary,
                (FieldDirection::MirrorToPrimary, _, Some(_)) => Side::Mirror,
                (FieldDirection::Both, Some(_), None) => Side::Primary,
                (FieldDirection::Both, None, Some(_)) => Side::Mirror,
                (FieldDirection::Both, Some(_), Some(_)) if mirror_ts > primary_ts => Side::Mirror,
                (FieldDirection::Both, Some(_), Some(_)) => Side::Primary,
            };

            let (value, other) = match winner {
                Side::Primary => (pv, mv),
                Side::Mirror => (mv, pv),
            };
            let Some(value) = value else { continue };
            set_path(&mut resolution.resolved, path, value.clone());

            if other != Some(value) {
                match winner {
                    Side::Primary => set_path(&mut to_mirror, path, value.clone()),
                    Side::Mirror => set_path(&mut to_primary, path, value.clone()),
                }
            }

            debug!(field = path, winner = %winner, primary_ts, mirror_ts, "field decided");
            resolution.decisions.push(FieldDecision {
                field: path.to_string(),
                winner,
                primary_ts,
                mirror_ts,
            });
        }

        resolution.outcome = if resolution.decisions.iter().all(|d| d.winner == Side::Primary) {
            ResolutionOutcome::PrimaryWins
        } else if resolution.decisions.iter().all(|d| d.winner == Side::Mirror) {
            ResolutionOutcome::MirrorWins
        } else {
            ResolutionOutcome::Merged
        };

        if !to_primary.is_empty() {
            resolution.primary_write = Some(TargetRecord {
                entity: spec.name.clone(),
                side: Side::Primary,
                source_id: mirror.id.clone(),
                target_id: Some(primary.id.clone()),
                fields: to_primary,
                deleted: false,
                source_modified_at: mirror.modified_at,
            });
        }

        if !to_mirror.is_empty() {
            let patch = SourceRecord::new(primary.id.clone(), primary.modified_at, to_mirror);
            let translated = translate(&patch, spec, Direction::PrimaryToMirror, identity)?;
            resolution.field_errors.extend(translated.field_errors);
            let mut target = translated.target;
            target.target_id = Some(mirror.id.clone());
            if !target.fields.is_empty() {
                resolution.mirror_write = Some(target);
            }
        }
        Ok(())
    }

    /// Append the resolution to the `conflict_log` table.
    pub fn record(
        db: &Database,
        run_id: Option<&str>,
        conflict: &Conflict,
        resolution: &Resolution,
    ) -> Result<i64, DatabaseError> {
        let primary = serde_json::to_value(&conflict.primary)?;
        let mirror = serde_json::to_value(&conflict.mirror)?;
        let resolved = json!({
            "fields": resolution.resolved,
            "decisions": resolution.decisions,
            "write_primary": resolution.primary_write.is_some(),
            "write_mirror": resolution.mirror_write.is_some(),
        });
        let outcome = resolution.outcome.to_string();
        db.insert_conflict_log(&NewConflictLog {
            run_id,
            entity_type: &resolution.entity,
            primary_id: &resolution.primary_id,
            mirror_id: &resolution.mirror_id,
            primary: &primary,
            mirror: &mirror,
            resolved: &resolved,
            outcome: &outcome,
        })
    }
}

fn tombstone(spec: &MappingSpec, side: Side, deleted: &SourceRecord, target_id: &str) -> TargetRecord {
    TargetRecord {
        entity: spec.name.clone(),
        side,
        source_id: deleted.id.clone(),
        target_id: Some(target_id.to_string()),
        fields: Map::new(),
        deleted: true,
        source_modified_at: deleted.modified_at,
    }
}
