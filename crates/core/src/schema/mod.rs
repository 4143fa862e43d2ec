//! Schema registry: the static set of entity mappings loaded at startup.
//!
//! The registry is immutable once built. Loading validates every mapping
//! and computes the leaves-first processing order over required references.

pub mod mapping;

pub use mapping::{Coercion, FieldDirection, FieldMapping, IdentityStrategy, MappingFile, MappingSpec};

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use tracing::{debug, info};

use crate::errors::SchemaError;

/// Validated, immutable collection of [`MappingSpec`]s.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    specs: Vec<MappingSpec>,
    by_name: HashMap<String, usize>,
    layers: Vec<Vec<String>>,
}

impl SchemaRegistry {
    /// Load and validate a mapping file from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading entity mappings");

        if !path.exists() {
            return Err(SchemaError::FileNotFound(path.display().to_string()));
        }
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate mapping TOML.
    pub fn from_toml_str(contents: &str) -> Result<Self, SchemaError> {
        let file: MappingFile =
            toml::from_str(contents).map_err(|e| SchemaError::ParseError(e.to_string()))?;
        Self::new(file.entities)
    }

    /// Build a registry from already-parsed specs.
    pub fn new(specs: Vec<MappingSpec>) -> Result<Self, SchemaError> {
        let mut by_name = HashMap::with_capacity(specs.len());
        for (idx, spec) in specs.iter().enumerate() {
            if spec.name.trim().is_empty() {
                return Err(SchemaError::InvalidMapping {
                    entity: format!("#{idx}"),
                    detail: "entity name must not be empty".into(),
                });
            }
            if by_name.insert(spec.name.clone(), idx).is_some() {
                return Err(invalid(&spec.name, "entity is declared more than once"));
            }
        }

        for spec in &specs {
            validate_spec(spec, &by_name)?;
        }

        let layers = dependency_layers(&specs)?;
        debug!(entities = specs.len(), layers = layers.len(), "schema registry built");

        Ok(Self {
            specs,
            by_name,
            layers,
        })
    }

    /// Look up the mapping for an entity type.
    pub fn resolve(&self, entity: &str) -> Result<&MappingSpec, SchemaError> {
        self.by_name
            .get(entity)
            .map(|&idx| &self.specs[idx])
            .ok_or_else(|| SchemaError::UnknownEntity(entity.to_string()))
    }

    /// All specs in declaration order.
    pub fn entities(&self) -> &[MappingSpec] {
        &self.specs
    }

    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.specs.iter().map(|s| s.name.as_str())
    }

    /// Entity names grouped into layers. Every entity's required references
    /// live in an earlier layer, so layers run in order and entities within
    /// a layer may run concurrently.
    pub fn dependency_layers(&self) -> &[Vec<String>] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

fn invalid(entity: &str, detail: impl Into<String>) -> SchemaError {
    SchemaError::InvalidMapping {
        entity: entity.to_string(),
        detail: detail.into(),
    }
}

fn validate_spec(spec: &MappingSpec, known: &HashMap<String, usize>) -> Result<(), SchemaError> {
    if spec.primary_collection.trim().is_empty() {
        return Err(invalid(&spec.name, "primary_collection must not be empty"));
    }
    if spec.mirror_table.trim().is_empty() {
        return Err(invalid(&spec.name, "mirror_table must not be empty"));
    }

    let mut sources = HashSet::new();
    let mut targets = HashSet::new();
    for field in &spec.fields {
        if field.source.is_empty() || field.source.split('.').any(str::is_empty) {
            return Err(invalid(
                &spec.name,
                format!("malformed source path '{}'", field.source),
            ));
        }
        if field.target.is_empty() || field.target.contains('.') {
            return Err(invalid(
                &spec.name,
                format!("malformed target column '{}'", field.target),
            ));
        }
        if !sources.insert(field.source.as_str()) {
            return Err(invalid(
                &spec.name,
                format!("duplicate source path '{}'", field.source),
            ));
        }
        if !targets.insert(field.target.as_str()) {
            return Err(invalid(
                &spec.name,
                format!("duplicate target column '{}'", field.target),
            ));
        }

        match &field.coercion {
            Coercion::Reference { entity, .. } if !known.contains_key(entity) => {
                return Err(invalid(
                    &spec.name,
                    format!(
                        "field '{}' references unknown entity type '{entity}'",
                        field.source
                    ),
                ));
            }
            Coercion::EnumRemap { values } => {
                let distinct: BTreeSet<&String> = values.values().collect();
                if distinct.len() != values.len() {
                    return Err(invalid(
                        &spec.name,
                        format!("enum_remap on '{}' is not one-to-one", field.source),
                    ));
                }
            }
            _ => {}
        }
    }

    // A source path may not be both a leaf and a parent of another path.
    for path in &sources {
        let prefix = format!("{path}.");
        if let Some(child) = sources.iter().find(|p| p.starts_with(&prefix)) {
            return Err(invalid(
                &spec.name,
                format!("source path '{path}' overlaps '{child}'"),
            ));
        }
    }

    Ok(())
}

/// Kahn's algorithm over required-reference edges, emitting one layer per
/// round. Entities left over once no progress is possible form a cycle.
fn dependency_layers(specs: &[MappingSpec]) -> Result<Vec<Vec<String>>, SchemaError> {
    let mut remaining: Vec<(&str, Vec<&str>)> = specs
        .iter()
        .map(|s| (s.name.as_str(), s.dependencies()))
        .collect();
    let mut placed: HashSet<&str> = HashSet::new();
    let mut layers = Vec::new();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<_>, Vec<_>) = remaining
            .into_iter()
            .partition(|(_, deps)| deps.iter().all(|d| placed.contains(d)));

        if ready.is_empty() {
            return Err(SchemaError::DependencyCycle(find_cycle(&blocked)));
        }

        let layer: Vec<String> = ready.iter().map(|(n, _)| n.to_string()).collect();
        placed.extend(ready.iter().map(|(n, _)| *n));
        layers.push(layer);
        remaining = blocked;
    }

    Ok(layers)
}

/// Walk dependency edges from the first blocked entity until a name
/// repeats, returning the loop (first name repeated at the end).
fn find_cycle(blocked: &[(&str, Vec<&str>)]) -> Vec<String> {
    let edges: HashMap<&str, &Vec<&str>> = blocked.iter().map(|(n, d)| (*n, d)).collect();
    let Some((start, _)) = blocked.first() else {
        return Vec::new();
    };

    let mut path: Vec<&str> = vec![*start];
    let mut current = *start;
    loop {
        let next = edges
            .get(current)
            .and_then(|deps| deps.iter().find(|d| edges.contains_key(*d)));
        let Some(&next) = next else {
            break;
        };
        if let Some(pos) = path.iter().position(|p| *p == next) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(next.to_string());
            return cycle;
        }
        path.push(next);
        current = next;
    }
    path.into_iter().map(String::from).collect()
}
