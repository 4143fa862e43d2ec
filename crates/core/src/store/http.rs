//! REST adapter for a store exposing the mirrorsync change-feed API.
//!
//! Routes (relative to `base_url`):
//!
//! - `GET    /collections/{c}/changes?since_ts=&since_id=&limit=&page_token=`
//! - `GET    /collections/{c}/records/{id}`
//! - `POST   /collections/{c}/records`        (create, store assigns the id)
//! - `PUT    /collections/{c}/records/{id}`   (partial update)
//! - `DELETE /collections/{c}/records/{id}`
//!
//! Writes carry an `Idempotency-Key` header; the service must answer a
//! repeated create with the record it already made for that key.

use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, RETRY_AFTER, USER_AGENT};
use reqwest::StatusCode;
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument};

use super::{Page, StoreClient, UpsertOutcome};
use crate::config::StoreConfig;
use crate::errors::StoreError;
use crate::models::{Cursor, SourceRecord};

const IDEMPOTENCY_KEY: &str = "Idempotency-Key";

/// Asynchronous HTTP store client.
pub struct HttpStore {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    timeout: Duration,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl HttpStore {
    /// Build a client from a `[primary]` / `[mirror]` config section.
    pub fn new(name: &str, config: &StoreConfig) -> Result<Self, StoreError> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        let timeout = Duration::from_secs(config.timeout_secs);

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("mirrorsync/0.1"));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Protocol(format!("failed to build HTTP client: {e}")))?;

        let limiter = config
            .requests_per_second
            .and_then(NonZeroU32::new)
            .map(|rps| RateLimiter::direct(Quota::per_second(rps)));

        info!(store = name, base_url = %base_url, rate_limited = limiter.is_some(), "created HttpStore");
        Ok(Self {
            http,
            base_url,
            token: config.token.clone(),
            timeout,
            limiter,
        })
    }

    fn records_url(&self, collection: &str) -> String {
        format!("{}/collections/{}/records", self.base_url, collection)
    }

    fn record_url(&self, collection: &str, id: &str) -> String {
        format!("{}/collections/{}/records/{}", self.base_url, collection, id)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, StoreError> {
        if let Some(ref limiter) = self.limiter {
            limiter.until_ready().await;
        }
        let req = match self.token {
            Some(ref token) => req.bearer_auth(token),
            None => req,
        };
        req.send().await.map_err(|e| self.map_transport_error(e))
    }

    fn map_transport_error(&self, err: reqwest::Error) -> StoreError {
        if err.is_timeout() {
            StoreError::Timeout(self.timeout)
        } else if err.is_decode() {
            StoreError::Protocol(err.to_string())
        } else {
            StoreError::Transient(err.to_string())
        }
    }

    async fn check_response(&self, resp: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = resp.text().await.unwrap_or_default();
        Err(classify_status(status, retry_after, body))
    }

    async fn decode<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, StoreError> {
        resp.json::<T>()
            .await
            .map_err(|e| StoreError::Protocol(e.to_string()))
    }
}

/// Map a non-success HTTP status onto the store error taxonomy.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: String) -> StoreError {
    match status.as_u16() {
        429 => StoreError::Throttled { retry_after },
        408 => StoreError::Transient(format!("HTTP {status}")),
        s if status.is_server_error() => {
            if s == 503 && retry_after.is_some() {
                StoreError::Throttled { retry_after }
            } else {
                StoreError::Transient(format!("HTTP {status}: {}", truncate_body(&body)))
            }
        }
        s => StoreError::Rejected {
            status: Some(s),
            detail: truncate_body(&body),
        },
    }
}

/// `Retry-After` is either delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    if body.chars().count() <= MAX {
        body.to_string()
    } else {
        let cut: String = body.chars().take(MAX).collect();
        format!("{cut}...")
    }
}

#[async_trait]
impl StoreClient for HttpStore {
    #[instrument(skip(self, since), fields(since = %since))]
    async fn list_modified_since(
        &self,
        collection: &str,
        since: &Cursor,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<Page, StoreError> {
        let url = format!("{}/collections/{}/changes", self.base_url, collection);
        let mut req = self.http.get(&url).query(&[
            ("since_ts", since.timestamp.to_string()),
            ("since_id", since.record_id.clone()),
            ("limit", page_size.to_string()),
        ]);
        if let Some(token) = page_token {
            req = req.query(&[("page_token", token)]);
        }
        let resp = self.check_response(self.send(req).await?).await?;
        let page: Page = Self::decode(resp).await?;
        debug!(count = page.records.len(), more = page.next_token.is_some(), "fetched page");
        Ok(page)
    }

    #[instrument(skip(self))]
    async fn get(&self, collection: &str, id: &str) -> Result<Option<SourceRecord>, StoreError> {
        let resp = self.send(self.http.get(self.record_url(collection, id))).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = self.check_response(resp).await?;
        Ok(Some(Self::decode(resp).await?))
    }

    #[instrument(skip(self, fields))]
    async fn upsert(
        &self,
        collection: &str,
        id: Option<&str>,
        write_key: &str,
        fields: &Map<String, Value>,
    ) -> Result<UpsertOutcome, StoreError> {
        let body = json!({ "fields": fields });
        let req = match id {
            Some(id) => self.http.put(self.record_url(collection, id)),
            None => self.http.post(self.records_url(collection)),
        };
        let req = req.header(IDEMPOTENCY_KEY, write_key).json(&body);
        let resp = self.check_response(self.send(req).await?).await?;
        let outcome: UpsertOutcome = Self::decode(resp).await?;
        debug!(id = %outcome.id, modified_at = outcome.modified_at, "upserted record");
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let resp = self
            .send(self.http.delete(self.record_url(collection, id)))
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            debug!("record already absent");
            return Ok(());
        }
        self.check_response(resp).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorClass;

    #[test]
    fn test_classify_throttle_and_transient() {
        let err = classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(2)),
            String::new(),
        );
        assert_eq!(err.class(), ErrorClass::Throttled);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));

        for status in [
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert_eq!(
                classify_status(status, None, String::new()).class(),
                ErrorClass::Retryable,
                "{status}"
            );
        }
    }

    #[test]
    fn test_classify_client_errors_are_fatal() {
        for status in [
            StatusCode::BAD_REQUEST,
            StatusCode::FORBIDDEN,
            StatusCode::UNPROCESSABLE_ENTITY,
            StatusCode::CONFLICT,
        ] {
            let err = classify_status(status, None, "no".into());
            assert_eq!(err.class(), ErrorClass::Fatal, "{status}");
            assert!(matches!(err, StoreError::Rejected { status: Some(s), .. } if s == status.as_u16()));
        }
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("5"), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after(" 0 "), Some(Duration::ZERO));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn test_truncate_body() {
        let long = "x".repeat(500);
        let out = truncate_body(&long);
        assert!(out.ends_with("..."));
        assert_eq!(out.len(), 203);
        assert_eq!(truncate_body("short"), "short");
    }

    /// Answer exactly one request with `response`; the join handle yields
    /// the raw request text.
    async fn respond_once(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let body_len = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if raw.len() >= end + 4 + body_len {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&raw).to_string()
        });
        (base_url, handle)
    }

    fn store_at(base_url: &str) -> HttpStore {
        let config = StoreConfig {
            base_url: base_url.into(),
            token_env: None,
            timeout_secs: 5,
            requests_per_second: None,
            token: Some("secret".into()),
        };
        HttpStore::new("test", &config).unwrap()
    }

    #[tokio::test]
    async fn test_get_missing_record_is_none() {
        let (url, server) =
            respond_once("HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n").await;
        let got = store_at(&url).get("contacts", "c404").await.unwrap();
        assert!(got.is_none());

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /collections/contacts/records/c404 "));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer secret"));
    }

    #[tokio::test]
    async fn test_get_decodes_record() {
        let (url, server) = respond_once(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 44\r\nconnection: close\r\n\r\n{\"id\":\"c1\",\"modified_at\":7,\"fields\":{\"n\":1}}",
        )
        .await;
        let got = store_at(&url).get("contacts", "c1").await.unwrap().unwrap();
        assert_eq!(got.id, "c1");
        assert_eq!(got.modified_at, 7);
        assert_eq!(got.fields["n"], json!(1));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_get_server_error_is_retryable() {
        let (url, server) = respond_once(
            "HTTP/1.1 502 Bad Gateway\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;
        let err = store_at(&url).get("contacts", "c1").await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Retryable);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_create_sends_idempotency_key() {
        let (url, server) = respond_once(
            "HTTP/1.1 201 Created\r\ncontent-type: application/json\r\ncontent-length: 31\r\nconnection: close\r\n\r\n{\"id\":\"row-9\",\"modified_at\":12}",
        )
        .await;
        let mut fields = Map::new();
        fields.insert("email".into(), json!("a@x"));
        let outcome = store_at(&url)
            .upsert("contacts", None, "Contact:primary:p1", &fields)
            .await
            .unwrap();
        assert_eq!(outcome.id, "row-9");
        assert_eq!(outcome.modified_at, 12);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /collections/contacts/records "));
        assert!(request
            .to_ascii_lowercase()
            .contains("idempotency-key: contact:primary:p1"));
    }

    #[test]
    fn test_new_normalizes_base_url() {
        let config = StoreConfig {
            base_url: "http://localhost:9000/".into(),
            token_env: None,
            timeout_secs: 5,
            requests_per_second: Some(10),
            token: None,
        };
        let store = HttpStore::new("primary", &config).unwrap();
        assert_eq!(store.base_url, "http://localhost:9000");
        assert!(store.limiter.is_some());
        assert_eq!(
            store.record_url("contacts", "c1"),
            "http://localhost:9000/collections/contacts/records/c1"
        );
    }
}
