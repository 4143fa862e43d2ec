//! In-memory [`StoreClient`] with a logical clock and fault injection.
//!
//! Each write ticks the clock and stamps the record and every leaf field it
//! changed, so the store reports per-field timestamps the same way the real
//! services do.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use super::{Page, StoreClient, UpsertOutcome};
use crate::errors::StoreError;
use crate::models::{Cursor, SourceRecord};

/// Decides whether a write should fail: `(collection, id, fields)`.
pub type WriteFault = Box<dyn Fn(&str, Option<&str>, &Map<String, Value>) -> Option<StoreError> + Send + Sync>;

#[derive(Default)]
struct State {
    clock: i64,
    next_id: u64,
    collections: HashMap<String, BTreeMap<String, SourceRecord>>,
    /// `(collection, write_key) -> id` of every record created under a key.
    created: HashMap<(String, String), String>,
    throttle_remaining: u32,
    transient_remaining: u32,
    lost_acks_remaining: u32,
    write_faults: Vec<WriteFault>,
}

/// Thread-safe in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    name: String,
    state: Mutex<State>,
    list_calls: AtomicU64,
    write_calls: AtomicU64,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Current logical time.
    pub fn now(&self) -> i64 {
        self.state().clock
    }

    /// Move the clock forward to `t` (never backward).
    pub fn set_clock(&self, t: i64) {
        let mut state = self.state();
        state.clock = state.clock.max(t);
    }

    /// Insert a record exactly as given, timestamps included.
    pub fn seed(&self, collection: &str, record: SourceRecord) {
        let mut state = self.state();
        state.clock = state.clock.max(record.modified_at);
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(record.id.clone(), record);
    }

    /// Snapshot of a record, tombstones included.
    pub fn record(&self, collection: &str, id: &str) -> Option<SourceRecord> {
        self.state()
            .collections
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned()
    }

    /// Live (non-deleted) records in id order.
    pub fn live_records(&self, collection: &str) -> Vec<SourceRecord> {
        self.state()
            .collections
            .get(collection)
            .map(|c| c.values().filter(|r| !r.deleted).cloned().collect())
            .unwrap_or_default()
    }

    /// Fail the next `n` calls of any kind with `Throttled`.
    pub fn throttle_next(&self, n: u32) {
        self.state().throttle_remaining = n;
    }

    /// Fail the next `n` calls of any kind with a transient error.
    pub fn fail_next_transient(&self, n: u32) {
        self.state().transient_remaining = n;
    }

    /// Commit the next `n` upserts but answer them with a timeout, as when
    /// the response is lost on the way back.
    pub fn lose_next_acks(&self, n: u32) {
        self.state().lost_acks_remaining = n;
    }

    /// Install a write fault checked on every upsert.
    pub fn add_write_fault(&self, fault: WriteFault) {
        self.state().write_faults.push(fault);
    }

    pub fn list_calls(&self) -> u64 {
        self.list_calls.load(Ordering::Relaxed)
    }

    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::Relaxed)
    }

    fn injected_failure(state: &mut State) -> Option<StoreError> {
        if state.throttle_remaining > 0 {
            state.throttle_remaining -= 1;
            return Some(StoreError::Throttled {
                retry_after: Some(Duration::from_millis(1)),
            });
        }
        if state.transient_remaining > 0 {
            state.transient_remaining -= 1;
            return Some(StoreError::Transient("injected failure".into()));
        }
        None
    }
}

fn parse_token(token: &str) -> Result<Cursor, StoreError> {
    let (ts, id) = token
        .split_once(':')
        .ok_or_else(|| StoreError::Protocol(format!("bad page token '{token}'")))?;
    let ts = ts
        .parse::<i64>()
        .map_err(|_| StoreError::Protocol(format!("bad page token '{token}'")))?;
    Ok(Cursor::at(ts, id))
}

/// Flatten nested objects into dotted leaf paths.
fn flatten(prefix: &str, value: &Value, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (k, v) in map {
                let path = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}.{k}")
                };
                flatten(&path, v, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), other.clone());
        }
    }
}

/// Deep-merge `patch` into `base`; nested objects merge, everything else
/// replaces.
fn merge(base: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (k, v) in patch {
        match (base.get_mut(k), v) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => merge(existing, incoming),
            _ => {
                base.insert(k.clone(), v.clone());
            }
        }
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn list_modified_since(
        &self,
        collection: &str,
        since: &Cursor,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<Page, StoreError> {
        self.list_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state();
        if let Some(err) = Self::injected_failure(&mut state) {
            return Err(err);
        }

        let after = match page_token {
            Some(token) => parse_token(token)?,
            None => since.clone(),
        };

        let mut matching: Vec<&SourceRecord> = state
            .collections
            .get(collection)
            .map(|c| c.values().filter(|r| after.admits(r.modified_at, &r.id)).collect())
            .unwrap_or_default();
        matching.sort_by(|a, b| (a.modified_at, &a.id).cmp(&(b.modified_at, &b.id)));

        let more = matching.len() > page_size;
        let records: Vec<SourceRecord> = matching.into_iter().take(page_size).cloned().collect();
        let next_token = match records.last() {
            Some(last) if more => Some(format!("{}:{}", last.modified_at, last.id)),
            _ => None,
        };

        Ok(Page {
            records,
            next_token,
        })
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<SourceRecord>, StoreError> {
        let mut state = self.state();
        if let Some(err) = Self::injected_failure(&mut state) {
            return Err(err);
        }
        Ok(state
            .collections
            .get(collection)
            .and_then(|c| c.get(id))
            .filter(|r| !r.deleted)
            .cloned())
    }

    async fn upsert(
        &self,
        collection: &str,
        id: Option<&str>,
        write_key: &str,
        fields: &Map<String, Value>,
    ) -> Result<UpsertOutcome, StoreError> {
        self.write_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state();
        if let Some(err) = Self::injected_failure(&mut state) {
            return Err(err);
        }
        if let Some(err) = state
            .write_faults
            .iter()
            .find_map(|fault| fault(collection, id, fields))
        {
            return Err(err);
        }

        let key = (collection.to_string(), write_key.to_string());
        let replayed = state.created.get(&key).cloned();
        let id = match (id, replayed) {
            (Some(id), _) => id.to_string(),
            (None, Some(existing)) => {
                debug!(store = %self.name, collection, write_key, id = %existing, "create replayed onto existing record");
                existing
            }
            (None, None) => {
                state.next_id += 1;
                let id = format!("{}-{}", self.name, state.next_id);
                state.created.insert(key, id.clone());
                id
            }
        };

        let existing = state
            .collections
            .get(collection)
            .and_then(|c| c.get(&id))
            .cloned();

        let mut record = existing.unwrap_or_else(|| SourceRecord::tombstone(id.clone(), 0));
        let was_deleted = record.deleted;
        let mut before = BTreeMap::new();
        flatten("", &Value::Object(record.fields.clone()), &mut before);

        merge(&mut record.fields, fields);
        let mut after = BTreeMap::new();
        flatten("", &Value::Object(record.fields.clone()), &mut after);

        let changed: Vec<String> = after
            .iter()
            .filter(|(path, v)| before.get(*path) != Some(*v))
            .map(|(path, _)| path.clone())
            .collect();

        if changed.is_empty() && !was_deleted {
            debug!(store = %self.name, collection, id = %id, "upsert was a no-op");
            return Ok(UpsertOutcome {
                id,
                modified_at: record.modified_at,
            });
        }

        state.clock += 1;
        let now = state.clock;
        record.deleted = false;
        record.modified_at = now;
        for path in changed {
            record.field_timestamps.insert(path, now);
        }
        debug!(store = %self.name, collection, id = %id, modified_at = now, "upserted");

        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), record);

        if state.lost_acks_remaining > 0 {
            state.lost_acks_remaining -= 1;
            return Err(StoreError::Timeout(Duration::from_millis(1)));
        }
        Ok(UpsertOutcome {
            id,
            modified_at: now,
        })
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        self.write_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state();
        if let Some(err) = Self::injected_failure(&mut state) {
            return Err(err);
        }
        state.clock += 1;
        let now = state.clock;
        if let Some(record) = state
            .collections
            .get_mut(collection)
            .and_then(|c| c.get_mut(id))
        {
            if !record.deleted {
                record.deleted = true;
                record.fields.clear();
                record.field_timestamps.clear();
                record.modified_at = now;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn test_paging_is_exclusive_and_ordered() {
        let store = MemoryStore::new("mem");
        for (ts, id) in [(10, "b"), (10, "a"), (20, "c"), (5, "z")] {
            store.seed("t", SourceRecord::new(id, ts, Map::new()));
        }

        let since = Cursor::at(10, "a");
        let page = store.list_modified_since("t", &since, 1, None).await.unwrap();
        assert_eq!(page.records[0].id, "b");
        let token = page.next_token.clone().unwrap();

        let page = store
            .list_modified_since("t", &since, 1, Some(&token))
            .await
            .unwrap();
        assert_eq!(page.records[0].id, "c");
        assert!(page.next_token.is_none());
    }

    #[tokio::test]
    async fn test_upsert_stamps_changed_fields_only() {
        let store = MemoryStore::new("mem");
        let created = store
            .upsert("c", None, "k-profile", &fields(json!({"profile": {"email": "a", "phone": "1"}})))
            .await
            .unwrap();
        assert_eq!(created.modified_at, 1);

        let updated = store
            .upsert("c", Some(&created.id), "k-profile", &fields(json!({"profile": {"email": "b"}})))
            .await
            .unwrap();
        assert_eq!(updated.modified_at, 2);

        let rec = store.record("c", &created.id).unwrap();
        assert_eq!(rec.field_timestamp("profile.email"), 2);
        assert_eq!(rec.field_timestamp("profile.phone"), 1);
        assert_eq!(rec.fields["profile"]["phone"], json!("1"));
    }

    #[tokio::test]
    async fn test_identical_upsert_is_noop() {
        let store = MemoryStore::new("mem");
        let f = fields(json!({"name": "x"}));
        let first = store.upsert("c", Some("id1"), "k1", &f).await.unwrap();
        let second = store.upsert("c", Some("id1"), "k1", &f).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.now(), 1);
    }

    #[tokio::test]
    async fn test_delete_leaves_tombstone_in_feed() {
        let store = MemoryStore::new("mem");
        store
            .upsert("c", Some("id1"), "k1", &fields(json!({"name": "x"})))
            .await
            .unwrap();
        store.delete("c", "id1").await.unwrap();
        assert!(store.get("c", "id1").await.unwrap().is_none());

        let page = store
            .list_modified_since("c", &Cursor::at(1, "id1"), 10, None)
            .await
            .unwrap();
        assert_eq!(page.records.len(), 1);
        assert!(page.records[0].deleted);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let store = MemoryStore::new("mem");
        store.throttle_next(1);
        let err = store
            .list_modified_since("c", &Cursor::epoch(), 10, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Throttled { .. }));
        assert!(store
            .list_modified_since("c", &Cursor::epoch(), 10, None)
            .await
            .is_ok());

        store.add_write_fault(Box::new(|_: &str, _: Option<&str>, f: &Map<String, Value>| {
            (f.get("name") == Some(&json!("bad"))).then(|| StoreError::Rejected {
                status: Some(422),
                detail: "invalid name".into(),
            })
        }));
        assert!(store
            .upsert("c", None, "k-bad", &fields(json!({"name": "bad"})))
            .await
            .is_err());
        assert!(store
            .upsert("c", None, "k-good", &fields(json!({"name": "good"})))
            .await
            .is_ok());
        assert_eq!(store.list_calls(), 2);
    }

    #[tokio::test]
    async fn test_replayed_create_lands_on_same_record() {
        let store = MemoryStore::new("mem");
        let f = fields(json!({"name": "x"}));
        store.lose_next_acks(1);
        let err = store.upsert("c", None, "Contact:primary:p1", &f).await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));
        assert_eq!(store.live_records("c").len(), 1);

        let retried = store.upsert("c", None, "Contact:primary:p1", &f).await.unwrap();
        assert_eq!(retried.id, "mem-1");
        assert_eq!(retried.modified_at, 1);
        assert_eq!(store.live_records("c").len(), 1);

        let other = store.upsert("c", None, "Contact:primary:p2", &f).await.unwrap();
        assert_eq!(other.id, "mem-2");
    }
}
