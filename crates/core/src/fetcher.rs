//! Change fetcher: pages through one store's change feed for one
//! (entity, direction) pair.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::errors::StoreError;
use crate::models::{Cursor, SourceRecord};
use crate::retry::{call_with_retry, RetryPolicy};
use crate::store::StoreClient;

/// Iterates the records of a collection modified strictly after a cursor.
///
/// Every page is re-checked: records at or before the starting cursor (or
/// repeated from an earlier page) are dropped, and a record that sorts
/// before one already returned is a protocol error, since it would break
/// the cursor invariant.
pub struct ChangeFetcher {
    store: Arc<dyn StoreClient>,
    collection: String,
    since: Cursor,
    last_seen: Option<Cursor>,
    page_size: usize,
    token: Option<String>,
    exhausted: bool,
    retry: RetryPolicy,
    timeout: Duration,
    pages: u64,
    retries: u64,
}

impl ChangeFetcher {
    pub fn new(
        store: Arc<dyn StoreClient>,
        collection: impl Into<String>,
        since: Cursor,
        page_size: usize,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            collection: collection.into(),
            since,
            last_seen: None,
            page_size: page_size.max(1),
            token: None,
            exhausted: false,
            retry,
            timeout,
            pages: 0,
            retries: 0,
        }
    }

    /// Pages fetched so far.
    pub fn pages(&self) -> u64 {
        self.pages
    }

    /// Backoff retries taken so far.
    pub fn retries(&self) -> u64 {
        self.retries
    }

    /// Next non-empty batch, or `None` once the feed is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<SourceRecord>>, StoreError> {
        while !self.exhausted {
            let store = Arc::clone(&self.store);
            let collection = self.collection.clone();
            let since = self.since.clone();
            let token = self.token.clone();
            let page_size = self.page_size;
            let mut retries = 0u64;

            let page = call_with_retry(
                &self.retry,
                self.timeout,
                "list_modified_since",
                || {
                    let store = Arc::clone(&store);
                    let collection = collection.clone();
                    let since = since.clone();
                    let token = token.clone();
                    async move {
                        store
                            .list_modified_since(&collection, &since, page_size, token.as_deref())
                            .await
                    }
                },
                |_| retries += 1,
            )
            .await?;
            self.retries += retries;
            self.pages += 1;

            match page.next_token {
                Some(ref next) if self.token.as_deref() == Some(next.as_str()) => {
                    return Err(StoreError::Protocol(format!(
                        "change feed for '{}' repeated page token '{next}'",
                        self.collection
                    )));
                }
                Some(next) => self.token = Some(next),
                None => self.exhausted = true,
            }

            let records = self.screen(page.records)?;
            debug!(
                collection = %self.collection,
                count = records.len(),
                page = self.pages,
                "fetched change page"
            );
            if !records.is_empty() {
                return Ok(Some(records));
            }
        }
        Ok(None)
    }

    fn screen(&mut self, mut records: Vec<SourceRecord>) -> Result<Vec<SourceRecord>, StoreError> {
        records.sort_by(|a, b| (a.modified_at, &a.id).cmp(&(b.modified_at, &b.id)));

        let mut kept = Vec::with_capacity(records.len());
        for record in records {
            if !self.since.admits(record.modified_at, &record.id) {
                warn!(
                    collection = %self.collection,
                    record_id = %record.id,
                    modified_at = record.modified_at,
                    "store returned a record at or before the cursor, dropping"
                );
                continue;
            }
            if let Some(ref last) = self.last_seen {
                if record.modified_at == last.timestamp && record.id == last.record_id {
                    debug!(record_id = %record.id, "dropping record repeated across pages");
                    continue;
                }
                if !last.admits(record.modified_at, &record.id) {
                    return Err(StoreError::Protocol(format!(
                        "change feed for '{}' went backwards: {}@{} after {}",
                        self.collection, record.modified_at, record.id, last
                    )));
                }
            }
            self.last_seen = Some(Cursor::at(record.modified_at, record.id.clone()));
            kept.push(record);
        }
        Ok(kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Page};
    use async_trait::async_trait;
    use serde_json::{Map, Value};
    use std::sync::Mutex;

    async fn drain(fetcher: &mut ChangeFetcher) -> Vec<String> {
        let mut ids = Vec::new();
        while let Some(batch) = fetcher.next_page().await.unwrap() {
            ids.extend(batch.into_iter().map(|r| r.id));
        }
        ids
    }

    #[tokio::test]
    async fn test_boundary_is_exclusive() {
        let store = Arc::new(MemoryStore::new("mem"));
        for (ts, id) in [(100, "a"), (100, "b"), (100, "c"), (101, "a")] {
            store.seed("contacts", SourceRecord::new(id, ts, Map::new()));
        }

        let mut fetcher = ChangeFetcher::new(
            store.clone(),
            "contacts",
            Cursor::at(100, "b"),
            2,
            RetryPolicy::no_retry(),
            Duration::from_secs(5),
        );
        assert_eq!(drain(&mut fetcher).await, vec!["c", "a"]);
    }

    #[tokio::test]
    async fn test_pages_until_no_token() {
        let store = Arc::new(MemoryStore::new("mem"));
        for i in 0..25 {
            store.seed("t", SourceRecord::new(format!("r{i:03}"), 10 + i, Map::new()));
        }
        let mut fetcher = ChangeFetcher::new(
            store.clone(),
            "t",
            Cursor::epoch(),
            10,
            RetryPolicy::no_retry(),
            Duration::from_secs(5),
        );
        assert_eq!(drain(&mut fetcher).await.len(), 25);
        assert_eq!(fetcher.pages(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_is_retried() {
        let store = Arc::new(MemoryStore::new("mem"));
        store.seed("t", SourceRecord::new("x", 5, Map::new()));
        store.throttle_next(2);
        let mut fetcher = ChangeFetcher::new(
            store.clone(),
            "t",
            Cursor::epoch(),
            10,
            RetryPolicy::default(),
            Duration::from_secs(5),
        );
        assert_eq!(drain(&mut fetcher).await, vec!["x"]);
        assert_eq!(fetcher.retries(), 2);
    }

    /// Replays canned pages regardless of the cursor it is given.
    struct ScriptedStore {
        pages: Mutex<Vec<Page>>,
    }

    #[async_trait]
    impl StoreClient for ScriptedStore {
        async fn list_modified_since(
            &self,
            _collection: &str,
            _since: &Cursor,
            _page_size: usize,
            _page_token: Option<&str>,
        ) -> Result<Page, StoreError> {
            let mut pages = self.pages.lock().unwrap();
            Ok(if pages.is_empty() {
                Page::default()
            } else {
                pages.remove(0)
            })
        }

        async fn get(&self, _: &str, _: &str) -> Result<Option<SourceRecord>, StoreError> {
            Ok(None)
        }

        async fn upsert(
            &self,
            _: &str,
            _: Option<&str>,
            _: &str,
            _: &Map<String, Value>,
        ) -> Result<crate::store::UpsertOutcome, StoreError> {
            Err(StoreError::Protocol("read only".into()))
        }

        async fn delete(&self, _: &str, _: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn rec(ts: i64, id: &str) -> SourceRecord {
        SourceRecord::new(id, ts, Map::new())
    }

    #[tokio::test]
    async fn test_sloppy_store_is_screened() {
        let store = Arc::new(ScriptedStore {
            pages: Mutex::new(vec![
                Page {
                    // Includes the cursor record itself and arrives unsorted.
                    records: vec![rec(20, "b"), rec(10, "a"), rec(15, "z")],
                    next_token: Some("p2".into()),
                },
                Page {
                    // Repeats the last record of the previous page.
                    records: vec![rec(20, "b"), rec(30, "c")],
                    next_token: None,
                },
            ]),
        });
        let mut fetcher = ChangeFetcher::new(
            store,
            "t",
            Cursor::at(10, "a"),
            10,
            RetryPolicy::no_retry(),
            Duration::from_secs(5),
        );
        assert_eq!(drain(&mut fetcher).await, vec!["z", "b", "c"]);
    }

    #[tokio::test]
    async fn test_backwards_feed_is_protocol_error() {
        let store = Arc::new(ScriptedStore {
            pages: Mutex::new(vec![
                Page {
                    records: vec![rec(20, "b")],
                    next_token: Some("p2".into()),
                },
                Page {
                    records: vec![rec(15, "a")],
                    next_token: None,
                },
            ]),
        });
        let mut fetcher = ChangeFetcher::new(
            store,
            "t",
            Cursor::epoch(),
            10,
            RetryPolicy::no_retry(),
            Duration::from_secs(5),
        );
        assert!(fetcher.next_page().await.unwrap().is_some());
        assert!(matches!(
            fetcher.next_page().await,
            Err(StoreError::Protocol(_))
        ));
    }
}
