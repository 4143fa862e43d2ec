//! Store clients.
//!
//! Both the primary and the mirror are reached through [`StoreClient`], so
//! the engine never knows which kind of database sits behind a side. The
//! HTTP adapter talks to the real services; the in-memory store backs tests
//! and local dry runs.

pub mod http;
pub mod memory;

pub use http::HttpStore;
pub use memory::MemoryStore;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::StoreError;
use crate::models::{Cursor, Side, SourceRecord};

/// One page of a change feed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Page {
    pub records: Vec<SourceRecord>,
    /// Continuation token; `None` on the last page.
    #[serde(default)]
    pub next_token: Option<String>,
}

/// Store-assigned identity and timestamp of a successful upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub id: String,
    pub modified_at: i64,
}

/// Operations the engine needs from either store.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Records in `collection` strictly after `since`, ascending by
    /// `(modified_at, id)`, tombstones included.
    async fn list_modified_since(
        &self,
        collection: &str,
        since: &Cursor,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<Page, StoreError>;

    /// Fetch one record. `Ok(None)` when it does not exist.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<SourceRecord>, StoreError>;

    /// Create (`id == None`) or update a record. Only the given fields are
    /// written; other fields on an existing record are left alone.
    ///
    /// `write_key` is stable per logical record. A create whose key the
    /// store has already seen must update the record created under it, so
    /// retrying a create that committed without acknowledging is a no-op.
    async fn upsert(
        &self,
        collection: &str,
        id: Option<&str>,
        write_key: &str,
        fields: &Map<String, Value>,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Delete a record. Deleting a missing record succeeds.
    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError>;
}

/// The two stores being synchronized.
#[derive(Clone)]
pub struct StorePair {
    pub primary: Arc<dyn StoreClient>,
    pub mirror: Arc<dyn StoreClient>,
}

impl StorePair {
    pub fn new(primary: Arc<dyn StoreClient>, mirror: Arc<dyn StoreClient>) -> Self {
        Self { primary, mirror }
    }

    pub fn side(&self, side: Side) -> &Arc<dyn StoreClient> {
        match side {
            Side::Primary => &self.primary,
            Side::Mirror => &self.mirror,
        }
    }
}
