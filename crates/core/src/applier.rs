//! Write applier: puts translated records into the target store and keeps
//! the identity map in step with what was written.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument};

use crate::errors::ApplyError;
use crate::identity::IdentityMap;
use crate::models::{Side, TargetRecord, WriteOutcome};
use crate::retry::{call_with_retry, RetryPolicy};
use crate::schema::MappingSpec;
use crate::store::StorePair;

/// Applies [`TargetRecord`]s to whichever side they target.
///
/// Upserts are keyed by the identity map, so applying the same record twice
/// writes the same row twice and the store reports the second write as a
/// no-op. Creates carry [`TargetRecord::write_key`], so a create retried
/// after a lost response does not make a second row.
pub struct WriteApplier {
    stores: StorePair,
    identity: Arc<IdentityMap>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl WriteApplier {
    pub fn new(stores: StorePair, identity: Arc<IdentityMap>, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            stores,
            identity,
            retry,
            timeout,
        }
    }

    /// Write `record`. Throttled and transient failures are retried under
    /// the policy; the returned error is whatever was left once retries ran
    /// out, or the first fatal one.
    #[instrument(skip(self, spec, record), fields(entity = %record.entity, side = %record.side, source_id = %record.source_id))]
    pub async fn apply(&self, spec: &MappingSpec, record: &TargetRecord) -> Result<WriteOutcome, ApplyError> {
        if record.deleted {
            return self.apply_delete(spec, record).await;
        }

        let store = Arc::clone(self.stores.side(record.side));
        let collection = spec.collection(record.side).to_string();
        let target_id = record.target_id.clone();
        let write_key = record.write_key();

        let outcome = call_with_retry(
            &self.retry,
            self.timeout,
            "upsert",
            || {
                let store = Arc::clone(&store);
                let collection = collection.clone();
                let target_id = target_id.clone();
                let write_key = write_key.clone();
                let fields = record.fields.clone();
                async move {
                    store
                        .upsert(&collection, target_id.as_deref(), &write_key, &fields)
                        .await
                }
            },
            |_| {},
        )
        .await?;

        let (primary_id, mirror_id) = match record.side {
            Side::Mirror => (record.source_id.as_str(), outcome.id.as_str()),
            Side::Primary => (outcome.id.as_str(), record.source_id.as_str()),
        };
        if record.target_id.as_deref() != Some(outcome.id.as_str()) {
            info!(entity = %record.entity, primary_id, mirror_id, "recorded new identity pair");
        }
        self.identity.record(&record.entity, primary_id, mirror_id)?;
        self.identity
            .record_write(&record.entity, primary_id, record.side, outcome.modified_at)?;

        debug!(target_id = %outcome.id, modified_at = outcome.modified_at, "applied record");
        Ok(WriteOutcome::Applied {
            target_id: outcome.id,
            modified_at: outcome.modified_at,
        })
    }

    async fn apply_delete(&self, spec: &MappingSpec, record: &TargetRecord) -> Result<WriteOutcome, ApplyError> {
        let Some(target_id) = record.target_id.clone() else {
            debug!("tombstone for a record never mirrored");
            return Ok(WriteOutcome::Skipped {
                reason: "tombstone for a record never mirrored".into(),
            });
        };

        let store = Arc::clone(self.stores.side(record.side));
        let collection = spec.collection(record.side).to_string();
        call_with_retry(
            &self.retry,
            self.timeout,
            "delete",
            || {
                let store = Arc::clone(&store);
                let collection = collection.clone();
                let target_id = target_id.clone();
                async move { store.delete(&collection, &target_id).await }
            },
            |_| {},
        )
        .await?;

        let primary_id = match record.side {
            Side::Mirror => record.source_id.as_str(),
            Side::Primary => target_id.as_str(),
        };
        self.identity.forget(&record.entity, primary_id)?;

        debug!(target_id = %target_id, "deleted record");
        Ok(WriteOutcome::Deleted { target_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::errors::{ErrorClass, StoreError};
    use crate::schema::SchemaRegistry;
    use crate::store::MemoryStore;
    use serde_json::{json, Map, Value};

    const MAPPING: &str = r#"
[[entities]]
name = "Contact"
primary_collection = "contacts"
mirror_table = "contact_rows"

[[entities.fields]]
source = "email"
target = "email"
"#;

    struct Fixture {
        primary: Arc<MemoryStore>,
        mirror: Arc<MemoryStore>,
        identity: Arc<IdentityMap>,
        applier: WriteApplier,
        registry: SchemaRegistry,
    }

    fn fixture() -> Fixture {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        let identity = Arc::new(IdentityMap::new(Arc::new(db)));
        let primary = Arc::new(MemoryStore::new("primary"));
        let mirror = Arc::new(MemoryStore::new("mirror"));
        let applier = WriteApplier::new(
            StorePair::new(primary.clone(), mirror.clone()),
            identity.clone(),
            RetryPolicy::no_retry(),
            Duration::from_secs(5),
        );
        Fixture {
            primary,
            mirror,
            identity,
            applier,
            registry: SchemaRegistry::from_toml_str(MAPPING).unwrap(),
        }
    }

    fn to_mirror(source_id: &str, target_id: Option<&str>, fields: Value) -> TargetRecord {
        TargetRecord {
            entity: "Contact".into(),
            side: Side::Mirror,
            source_id: source_id.into(),
            target_id: target_id.map(String::from),
            fields: fields.as_object().cloned().unwrap_or_default(),
            deleted: false,
            source_modified_at: 10,
        }
    }

    #[tokio::test]
    async fn test_insert_records_identity_and_echo_stamp() {
        let f = fixture();
        let spec = f.registry.resolve("Contact").unwrap();
        let outcome = f
            .applier
            .apply(spec, &to_mirror("p1", None, json!({"email": "a@x"})))
            .await
            .unwrap();

        let WriteOutcome::Applied { target_id, modified_at } = outcome else {
            panic!("expected applied, got {outcome:?}");
        };
        assert_eq!(target_id, "mirror-1");
        assert_eq!(
            f.identity.counterpart("Contact", Side::Primary, "p1").unwrap().as_deref(),
            Some("mirror-1")
        );
        assert!(f.identity.is_echo("Contact", Side::Mirror, "mirror-1", modified_at).unwrap());
        assert_eq!(f.mirror.live_records("contact_rows").len(), 1);
    }

    #[tokio::test]
    async fn test_reapply_is_noop() {
        let f = fixture();
        let spec = f.registry.resolve("Contact").unwrap();
        let record = to_mirror("p1", None, json!({"email": "a@x"}));
        let first = f.applier.apply(spec, &record).await.unwrap();

        let again = TargetRecord {
            target_id: Some("mirror-1".into()),
            ..record
        };
        let second = f.applier.apply(spec, &again).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(f.mirror.live_records("contact_rows").len(), 1);
    }

    #[tokio::test]
    async fn test_create_retried_after_lost_response_writes_one_row() {
        let mut f = fixture();
        f.applier.retry = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            multiplier: 1.0,
            jitter: false,
        };
        f.mirror.lose_next_acks(1);

        let spec = f.registry.resolve("Contact").unwrap();
        let outcome = f
            .applier
            .apply(spec, &to_mirror("p1", None, json!({"email": "a@x"})))
            .await
            .unwrap();

        assert!(matches!(outcome, WriteOutcome::Applied { ref target_id, .. } if target_id == "mirror-1"));
        assert_eq!(f.mirror.write_calls(), 2);
        assert_eq!(f.mirror.live_records("contact_rows").len(), 1);
        assert_eq!(
            f.identity.counterpart("Contact", Side::Primary, "p1").unwrap().as_deref(),
            Some("mirror-1")
        );
    }

    #[test]
    fn test_write_key_names_source_side() {
        let record = to_mirror("p1", None, json!({}));
        assert_eq!(record.write_key(), "Contact:primary:p1");
        let back = TargetRecord {
            side: Side::Primary,
            ..to_mirror("m1", None, json!({}))
        };
        assert_eq!(back.write_key(), "Contact:mirror:m1");
    }

    #[tokio::test]
    async fn test_write_to_primary_orients_identity() {
        let f = fixture();
        let spec = f.registry.resolve("Contact").unwrap();
        let record = TargetRecord {
            side: Side::Primary,
            ..to_mirror("m7", None, json!({"email": "b@x"}))
        };
        f.applier.apply(spec, &record).await.unwrap();

        let entry = f.identity.lookup("Contact", Side::Mirror, "m7").unwrap().unwrap();
        assert_eq!(entry.primary_id, "primary-1");
        assert!(entry.primary_written_at.is_some());
        assert!(entry.mirror_written_at.is_none());
        assert!(f.primary.record("contacts", "primary-1").is_some());
    }

    #[tokio::test]
    async fn test_delete_forgets_identity() {
        let f = fixture();
        let spec = f.registry.resolve("Contact").unwrap();
        f.applier
            .apply(spec, &to_mirror("p1", None, json!({"email": "a@x"})))
            .await
            .unwrap();

        let tombstone = TargetRecord {
            deleted: true,
            fields: Map::new(),
            ..to_mirror("p1", Some("mirror-1"), json!({}))
        };
        let outcome = f.applier.apply(spec, &tombstone).await.unwrap();
        assert_eq!(
            outcome,
            WriteOutcome::Deleted {
                target_id: "mirror-1".into()
            }
        );
        assert!(f.mirror.live_records("contact_rows").is_empty());
        assert!(f.identity.lookup("Contact", Side::Primary, "p1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tombstone_without_counterpart_is_skipped() {
        let f = fixture();
        let spec = f.registry.resolve("Contact").unwrap();
        let tombstone = TargetRecord {
            deleted: true,
            ..to_mirror("p9", None, json!({}))
        };
        let outcome = f.applier.apply(spec, &tombstone).await.unwrap();
        assert!(matches!(outcome, WriteOutcome::Skipped { .. }));
        assert_eq!(f.mirror.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_rejected_write_is_fatal() {
        let f = fixture();
        let spec = f.registry.resolve("Contact").unwrap();
        f.mirror.add_write_fault(Box::new(|_: &str, _: Option<&str>, _: &Map<String, Value>| {
            Some(StoreError::Rejected {
                status: Some(422),
                detail: "email column too short".into(),
            })
        }));
        let err = f
            .applier
            .apply(spec, &to_mirror("p1", None, json!({"email": "a@x"})))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert!(f.identity.lookup("Contact", Side::Primary, "p1").unwrap().is_none());
    }
}
