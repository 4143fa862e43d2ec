//! Mapping file types: one [`MappingSpec`] per entity type, each holding the
//! field-level translation rules between the primary document shape and the
//! mirror table.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::Direction;

/// How records of an entity are identified across the two stores.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStrategy {
    /// Each store assigns its own id; the pair is kept in the identity map.
    #[default]
    Mapped,
    /// Both stores use the same id.
    Shared,
}

/// Which directions a field participates in.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldDirection {
    #[default]
    Both,
    PrimaryToMirror,
    MirrorToPrimary,
}

impl FieldDirection {
    pub fn allows(self, direction: Direction) -> bool {
        match self {
            Self::Both => true,
            Self::PrimaryToMirror => direction == Direction::PrimaryToMirror,
            Self::MirrorToPrimary => direction == Direction::MirrorToPrimary,
        }
    }
}

/// Type coercion applied to a field. Written with the primary store as the
/// source; the translator inverts it for the mirror-to-primary direction.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Coercion {
    /// Copy the value unchanged.
    #[default]
    Identity,
    /// RFC 3339 string on the primary, epoch milliseconds on the mirror.
    StringToTimestamp,
    /// Primary enum value -> mirror enum value. Must be one-to-one.
    EnumRemap { values: BTreeMap<String, String> },
    /// The value is the id of a record of another entity type; it is
    /// rewritten to the counterpart id on the target side.
    Reference {
        entity: String,
        #[serde(default)]
        required: bool,
    },
}

impl Coercion {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::StringToTimestamp => "string_to_timestamp",
            Self::EnumRemap { .. } => "enum_remap",
            Self::Reference { .. } => "reference",
        }
    }
}

/// One field mapping: dotted document path <-> mirror column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldMapping {
    /// Dotted path into the primary document (e.g. `profile.email`).
    pub source: String,
    /// Mirror column name.
    pub target: String,
    #[serde(default)]
    pub coercion: Coercion,
    #[serde(default)]
    pub direction: FieldDirection,
}

impl FieldMapping {
    /// Path read on the source side of `direction`.
    pub fn read_path(&self, direction: Direction) -> &str {
        match direction {
            Direction::PrimaryToMirror => &self.source,
            Direction::MirrorToPrimary => &self.target,
        }
    }

    /// Path written on the target side of `direction`.
    pub fn write_path(&self, direction: Direction) -> &str {
        match direction {
            Direction::PrimaryToMirror => &self.target,
            Direction::MirrorToPrimary => &self.source,
        }
    }

    /// The referenced entity when this field is a required reference.
    pub fn required_reference(&self) -> Option<&str> {
        match &self.coercion {
            Coercion::Reference {
                entity,
                required: true,
            } => Some(entity),
            _ => None,
        }
    }
}

/// Translation rules for one entity type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MappingSpec {
    /// Logical entity name (e.g. `Contact`).
    pub name: String,
    /// Collection name in the primary store.
    pub primary_collection: String,
    /// Table name in the mirror store.
    pub mirror_table: String,
    #[serde(default)]
    pub identity: IdentityStrategy,
    #[serde(default)]
    pub fields: Vec<FieldMapping>,
}

impl MappingSpec {
    /// Collection/table name on the given side.
    pub fn collection(&self, side: crate::models::Side) -> &str {
        match side {
            crate::models::Side::Primary => &self.primary_collection,
            crate::models::Side::Mirror => &self.mirror_table,
        }
    }

    /// Fields that flow in `direction`.
    pub fn fields_for(&self, direction: Direction) -> impl Iterator<Item = &FieldMapping> {
        self.fields
            .iter()
            .filter(move |f| f.direction.allows(direction))
    }

    /// Entity types this one must follow (required references, excluding
    /// self-references).
    pub fn dependencies(&self) -> Vec<&str> {
        let mut deps: Vec<&str> = self
            .fields
            .iter()
            .filter_map(FieldMapping::required_reference)
            .filter(|e| *e != self.name)
            .collect();
        deps.sort_unstable();
        deps.dedup();
        deps
    }
}

/// Root of the mapping file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappingFile {
    #[serde(default)]
    pub entities: Vec<MappingSpec>,
}
