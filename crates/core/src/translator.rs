//! Record translator: reshapes a source record into the target store's
//! schema, coercing each field independently.
//!
//! A field that fails to coerce is reported as a [`FieldError`] and left out
//! of the write; it is never replaced with a default. Only an unresolved
//! *required* reference fails the whole record.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::errors::TranslateError;
use crate::identity::IdentityMap;
use crate::models::{Direction, FieldError, FieldErrorKind, SourceRecord, TargetRecord};
use crate::schema::{Coercion, FieldMapping, MappingSpec};

/// A translated record plus the field-level problems met on the way.
#[derive(Debug, Clone)]
pub struct Translation {
    pub target: TargetRecord,
    pub field_errors: Vec<FieldError>,
}

/// Translate `source` for `direction` using `spec`.
pub fn translate(
    source: &SourceRecord,
    spec: &MappingSpec,
    direction: Direction,
    identity: &IdentityMap,
) -> Result<Translation, TranslateError> {
    let target_id = identity.target_id(spec, direction.source(), &source.id)?;

    let mut target = TargetRecord {
        entity: spec.name.clone(),
        side: direction.target(),
        source_id: source.id.clone(),
        target_id,
        fields: Map::new(),
        deleted: source.deleted,
        source_modified_at: source.modified_at,
    };
    let mut field_errors = Vec::new();

    if source.deleted {
        return Ok(Translation {
            target,
            field_errors,
        });
    }

    for field in spec.fields_for(direction) {
        let Some(value) = get_path(&source.fields, field.read_path(direction)) else {
            continue;
        };
        match coerce(value, field, direction, identity)? {
            Ok(coerced) => set_path(&mut target.fields, field.write_path(direction), coerced),
            Err((kind, detail)) => field_errors.push(FieldError {
                field: field.read_path(direction).to_string(),
                kind,
                detail,
            }),
        }
    }

    Ok(Translation {
        target,
        field_errors,
    })
}

type Coerced = Result<Value, (FieldErrorKind, String)>;

/// Outer `Err` fails the record; inner `Err` fails only the field.
fn coerce(
    value: &Value,
    field: &FieldMapping,
    direction: Direction,
    identity: &IdentityMap,
) -> Result<Coerced, TranslateError> {
    if value.is_null() {
        return Ok(Ok(Value::Null));
    }

    let coerced = match &field.coercion {
        Coercion::Identity => Ok(value.clone()),
        Coercion::StringToTimestamp => match direction {
            Direction::PrimaryToMirror => string_to_millis(value),
            Direction::MirrorToPrimary => millis_to_string(value),
        },
        Coercion::EnumRemap { values } => {
            let Some(s) = value.as_str() else {
                return Ok(Err((
                    FieldErrorKind::TypeMismatch,
                    format!("expected string enum value, got {value}"),
                )));
            };
            let mapped = match direction {
                Direction::PrimaryToMirror => values.get(s).cloned(),
                Direction::MirrorToPrimary => values
                    .iter()
                    .find(|(_, v)| v.as_str() == s)
                    .map(|(k, _)| k.clone()),
            };
            mapped.map(Value::String).ok_or_else(|| {
                (
                    FieldErrorKind::UnmappedEnumValue,
                    format!("no mapping for enum value '{s}'"),
                )
            })
        }
        Coercion::Reference { entity, required } => {
            let id = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                other => {
                    return Ok(Err((
                        FieldErrorKind::TypeMismatch,
                        format!("expected reference id, got {other}"),
                    )))
                }
            };
            match identity.counterpart(entity, direction.source(), &id)? {
                Some(counterpart) => Ok(Value::String(counterpart)),
                None if *required => {
                    return Err(TranslateError::UnresolvedReference {
                        field: field.read_path(direction).to_string(),
                        entity: entity.clone(),
                        id,
                    })
                }
                None => Err((
                    FieldErrorKind::UnresolvedReference,
                    format!("{entity}:{id} has no counterpart yet"),
                )),
            }
        }
    };
    Ok(coerced)
}

fn string_to_millis(value: &Value) -> Coerced {
    let Some(s) = value.as_str() else {
        return Err((
            FieldErrorKind::TypeMismatch,
            format!("expected RFC 3339 string, got {value}"),
        ));
    };
    DateTime::parse_from_rfc3339(s)
        .map(|dt| Value::from(dt.timestamp_millis()))
        .map_err(|e| (FieldErrorKind::InvalidTimestamp, format!("'{s}': {e}")))
}

fn millis_to_string(value: &Value) -> Coerced {
    let Some(ms) = value.as_i64() else {
        return Err((
            FieldErrorKind::TypeMismatch,
            format!("expected epoch milliseconds, got {value}"),
        ));
    };
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true)))
        .ok_or_else(|| (FieldErrorKind::InvalidTimestamp, format!("{ms} is out of range")))
}

/// Read a dotted path out of a JSON object.
pub fn get_path<'a>(fields: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = fields.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Write a dotted path into a JSON object, creating intermediate objects.
pub fn set_path(fields: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            fields.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = fields
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(map) = child {
                set_path(map, rest, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::schema::SchemaRegistry;
    use serde_json::json;
    use std::sync::Arc;

    const MAPPING: &str = r#"
[[entities]]
name = "Account"
primary_collection = "accounts"
mirror_table = "accounts"

[[entities]]
name = "Contact"
primary_collection = "contacts"
mirror_table = "contacts"

[[entities.fields]]
source = "profile.email"
target = "email"

[[entities.fields]]
source = "born_at"
target = "born_at_ms"
coercion = { kind = "string_to_timestamp" }

[[entities.fields]]
source = "status"
target = "status"
coercion = { kind = "enum_remap", values = { active = "A", archived = "X" } }

[[entities.fields]]
source = "account"
target = "account_id"
coercion = { kind = "reference", entity = "Account", required = true }

[[entities.fields]]
source = "referrer"
target = "referrer_id"
coercion = { kind = "reference", entity = "Account" }

[[entities.fields]]
source = "internal_note"
target = "internal_note"
direction = "primary_to_mirror"
"#;

    fn setup() -> (SchemaRegistry, IdentityMap) {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        let ids = IdentityMap::new(Arc::new(db));
        ids.record("Account", "acc-p1", "acc-m1").unwrap();
        (SchemaRegistry::from_toml_str(MAPPING).unwrap(), ids)
    }

    fn fields(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_primary_to_mirror_coercions() {
        let (reg, ids) = setup();
        let spec = reg.resolve("Contact").unwrap();
        let src = SourceRecord::new(
            "c1",
            100,
            fields(json!({
                "profile": {"email": "a@example.com"},
                "born_at": "2024-01-02T03:04:05.678Z",
                "status": "archived",
                "account": "acc-p1",
                "internal_note": "vip"
            })),
        );

        let t = translate(&src, spec, Direction::PrimaryToMirror, &ids).unwrap();
        assert!(t.field_errors.is_empty(), "{:?}", t.field_errors);
        assert_eq!(
            Value::Object(t.target.fields),
            json!({
                "email": "a@example.com",
                "born_at_ms": 1704164645678i64,
                "status": "X",
                "account_id": "acc-m1",
                "internal_note": "vip"
            })
        );
        assert_eq!(t.target.target_id, None);
        assert_eq!(t.target.source_modified_at, 100);
    }

    #[test]
    fn test_mirror_to_primary_inverts_and_skips_one_way_fields() {
        let (reg, ids) = setup();
        let spec = reg.resolve("Contact").unwrap();
        let src = SourceRecord::new(
            "m-c1",
            100,
            fields(json!({
                "email": "b@example.com",
                "born_at_ms": 0,
                "status": "A",
                "account_id": "acc-m1",
                "internal_note": "should not flow back"
            })),
        );

        let t = translate(&src, spec, Direction::MirrorToPrimary, &ids).unwrap();
        assert!(t.field_errors.is_empty());
        assert_eq!(
            Value::Object(t.target.fields),
            json!({
                "profile": {"email": "b@example.com"},
                "born_at": "1970-01-01T00:00:00.000Z",
                "status": "active",
                "account": "acc-p1"
            })
        );
    }

    #[test]
    fn test_bad_fields_are_omitted_not_defaulted() {
        let (reg, ids) = setup();
        let spec = reg.resolve("Contact").unwrap();
        let src = SourceRecord::new(
            "c2",
            100,
            fields(json!({
                "profile": {"email": "c@example.com"},
                "born_at": "yesterday",
                "status": "deleted",
                "account": "acc-p1",
                "referrer": "acc-unknown"
            })),
        );

        let t = translate(&src, spec, Direction::PrimaryToMirror, &ids).unwrap();
        let kinds: Vec<_> = t.field_errors.iter().map(|e| e.kind.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                FieldErrorKind::InvalidTimestamp,
                FieldErrorKind::UnmappedEnumValue,
                FieldErrorKind::UnresolvedReference,
            ]
        );
        assert!(!t.target.fields.contains_key("born_at_ms"));
        assert!(!t.target.fields.contains_key("status"));
        assert!(!t.target.fields.contains_key("referrer_id"));
        assert_eq!(t.target.fields["email"], json!("c@example.com"));
    }

    #[test]
    fn test_unresolved_required_reference_fails_record() {
        let (reg, ids) = setup();
        let spec = reg.resolve("Contact").unwrap();
        let src = SourceRecord::new("c3", 100, fields(json!({"account": "acc-p9"})));

        let err = translate(&src, spec, Direction::PrimaryToMirror, &ids).unwrap_err();
        assert!(matches!(
            err,
            TranslateError::UnresolvedReference { ref entity, ref id, .. }
                if entity == "Account" && id == "acc-p9"
        ));
    }

    #[test]
    fn test_missing_and_null_fields() {
        let (reg, ids) = setup();
        let spec = reg.resolve("Contact").unwrap();
        let src = SourceRecord::new("c4", 100, fields(json!({"born_at": null})));

        let t = translate(&src, spec, Direction::PrimaryToMirror, &ids).unwrap();
        assert_eq!(Value::Object(t.target.fields), json!({"born_at_ms": null}));
    }

    #[test]
    fn test_tombstone_translates_to_delete() {
        let (reg, ids) = setup();
        ids.record("Contact", "c5", "m5").unwrap();
        let spec = reg.resolve("Contact").unwrap();
        let t = translate(
            &SourceRecord::tombstone("c5", 200),
            spec,
            Direction::PrimaryToMirror,
            &ids,
        )
        .unwrap();
        assert!(t.target.deleted);
        assert_eq!(t.target.target_id.as_deref(), Some("m5"));
        assert!(t.target.fields.is_empty());
    }

    #[test]
    fn test_path_helpers() {
        let mut m = Map::new();
        set_path(&mut m, "a.b.c", json!(1));
        set_path(&mut m, "a.d", json!(2));
        assert_eq!(get_path(&m, "a.b.c"), Some(&json!(1)));
        assert_eq!(get_path(&m, "a.d"), Some(&json!(2)));
        assert_eq!(get_path(&m, "a.x"), None);
        assert_eq!(get_path(&m, "a.d.e"), None);
    }
}
