//! HTTP implementation of the Upstream client.
//!
//! Thin typed wrappers over the service's REST surface plus one shared
//! request path that owns rate-limit admission, retries with jittered
//! exponential backoff, and status-code classification.

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use super::{RateLimiter, SearchFilters, UpstreamClient, UpstreamError, UpstreamResult};
use crate::models::{RelationKind, RelationPage, SearchPage};

/// Connection settings for the HTTP client.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Service base URL, without trailing slash
    pub base_url: String,

    /// Credential sent as `x-api-key`, when present
    pub api_key: Option<String>,

    /// Per-request timeout
    pub timeout: Duration,

    /// Sustained requests per second for the token bucket
    pub rate_limit_rps: u32,

    /// Retries for retryable failures (attempts = retries + 1)
    pub retry_attempts: u32,

    /// Base delay for exponential backoff
    pub retry_backoff_base: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.semanticscholar.org/graph/v1".to_string(),
            api_key: None,
            timeout: Duration::from_secs(60),
            rate_limit_rps: 10,
            retry_attempts: 3,
            retry_backoff_base: Duration::from_millis(500),
        }
    }
}

/// Reqwest-backed [`UpstreamClient`].
pub struct HttpUpstreamClient {
    client: reqwest::Client,
    config: UpstreamConfig,
    limiter: RateLimiter,
}

impl HttpUpstreamClient {
    /// Build a client from connection settings.
    ///
    /// # Errors
    /// Returns `UpstreamError::Transport` if the underlying HTTP client
    /// cannot be constructed.
    pub fn new(config: UpstreamConfig) -> UpstreamResult<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = &config.api_key {
            let value = reqwest::header::HeaderValue::from_str(key)
                .map_err(|e| UpstreamError::Transport(format!("invalid api key: {e}")))?;
            headers.insert("x-api-key", value);
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let limiter = RateLimiter::new(config.rate_limit_rps);
        Ok(Self {
            client,
            config,
            limiter,
        })
    }

    /// Shared request path: admission, send, classify, retry.
    async fn request_json(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> UpstreamResult<Value> {
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), path);

        let mut attempt: u32 = 0;
        loop {
            self.limiter.acquire().await;
            debug!(%method, url, attempt, "upstream request");

            let outcome = self.send_once(method.clone(), &url, query, body).await;
            match outcome {
                Err(err) if err.is_retryable() && attempt < self.config.retry_attempts => {
                    let delay = self.backoff_delay(attempt, &err);
                    warn!(
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        attempt,
                        "retrying upstream request"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> UpstreamResult<Value> {
        let mut request = self.client.request(method, url).query(query);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(classify_reqwest_error)?;
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| UpstreamError::Transport(format!("invalid json body: {e}")));
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, retry_after, &body))
    }

    /// Exponential backoff with uniform jitter; a Retry-After hint from a
    /// 429 overrides the computed delay.
    fn backoff_delay(&self, attempt: u32, err: &UpstreamError) -> Duration {
        if let UpstreamError::RateLimited {
            retry_after: Some(secs),
        } = err
        {
            return Duration::from_secs(*secs);
        }

        let base = self.config.retry_backoff_base.as_millis() as u64;
        let exp = base.saturating_mul(1 << attempt.min(10));
        let jitter = rand::thread_rng().gen_range(0..=exp / 2);
        Duration::from_millis(exp + jitter)
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> UpstreamError {
    if e.is_timeout() {
        UpstreamError::Timeout
    } else if e.is_connect() {
        UpstreamError::Unavailable(e.to_string())
    } else {
        UpstreamError::Transport(e.to_string())
    }
}

/// Map a non-success HTTP status onto the failure taxonomy.
fn classify_status(status: StatusCode, retry_after: Option<u64>, body: &str) -> UpstreamError {
    match status {
        StatusCode::NOT_FOUND => UpstreamError::NotFound,
        StatusCode::BAD_REQUEST => UpstreamError::BadRequest(truncate(body, 200)),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => UpstreamError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => UpstreamError::RateLimited { retry_after },
        s if s.is_server_error() => UpstreamError::Unavailable(format!("http {s}")),
        s => UpstreamError::Transport(format!("unexpected http {s}: {}", truncate(body, 200))),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

/// Decode a relation or search page from Upstream's envelope.
///
/// Upstream answers `{total, offset, next?, data: [...]}`; a missing
/// `next` signals the last page, a missing `total` falls back to the item
/// count.
fn page_from_value(value: Value, requested_offset: u64) -> (u64, u64, Option<u64>, Vec<Value>) {
    let items = value
        .get("data")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let total = value
        .get("total")
        .and_then(Value::as_u64)
        .unwrap_or(items.len() as u64);
    let offset = value
        .get("offset")
        .and_then(Value::as_u64)
        .unwrap_or(requested_offset);
    let next = value.get("next").and_then(Value::as_u64);
    (total, offset, next, items)
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn fetch_paper(&self, paper_ref: &str, fields: Option<&str>) -> UpstreamResult<Value> {
        let mut query = Vec::new();
        if let Some(fields) = fields {
            query.push(("fields", fields.to_string()));
        }
        self.request_json(Method::GET, &format!("paper/{paper_ref}"), &query, None)
            .await
    }

    async fn fetch_relation_page(
        &self,
        paper_id: &str,
        kind: RelationKind,
        offset: u64,
        limit: u64,
        fields: Option<&str>,
    ) -> UpstreamResult<RelationPage> {
        let mut query = vec![
            ("offset", offset.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(fields) = fields {
            query.push(("fields", fields.to_string()));
        }

        let value = self
            .request_json(
                Method::GET,
                &format!("paper/{paper_id}/{}", kind.as_str()),
                &query,
                None,
            )
            .await?;
        let (total, offset, next, items) = page_from_value(value, offset);
        Ok(RelationPage {
            total,
            offset,
            next,
            items,
        })
    }

    async fn fetch_batch(
        &self,
        refs: &[String],
        fields: Option<&str>,
    ) -> UpstreamResult<Vec<Option<Value>>> {
        let mut query = Vec::new();
        if let Some(fields) = fields {
            query.push(("fields", fields.to_string()));
        }
        let body = json!({ "ids": refs });

        let value = self
            .request_json(Method::POST, "paper/batch", &query, Some(&body))
            .await?;
        let items = value
            .as_array()
            .cloned()
            .ok_or_else(|| UpstreamError::Transport("batch response is not a list".into()))?;

        Ok(items
            .into_iter()
            .map(|item| if item.is_null() { None } else { Some(item) })
            .collect())
    }

    async fn search(
        &self,
        query_text: &str,
        filters: &SearchFilters,
        offset: u64,
        limit: u64,
        fields: Option<&str>,
    ) -> UpstreamResult<SearchPage> {
        let mut query = vec![
            ("query", query_text.to_string()),
            ("offset", offset.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(fields) = fields {
            query.push(("fields", fields.to_string()));
        }
        if let Some(year) = &filters.year {
            query.push(("year", year.clone()));
        }
        if let Some(venue) = &filters.venue {
            query.push(("venue", venue.clone()));
        }
        if let Some(fos) = &filters.fields_of_study {
            query.push(("fieldsOfStudy", fos.clone()));
        }

        let value = self
            .request_json(Method::GET, "paper/search", &query, None)
            .await?;
        let (total, offset, next, items) = page_from_value(value, offset);
        Ok(SearchPage {
            total,
            offset,
            next,
            items,
        })
    }

    async fn search_by_title_match(
        &self,
        query_text: &str,
        filters: &SearchFilters,
        fields: Option<&str>,
    ) -> UpstreamResult<Option<Value>> {
        let mut query = vec![("query", query_text.to_string())];
        if let Some(fields) = fields {
            query.push(("fields", fields.to_string()));
        }
        if let Some(year) = &filters.year {
            query.push(("year", year.clone()));
        }

        match self
            .request_json(Method::GET, "paper/search/match", &query, None)
            .await
        {
            Ok(value) => {
                let best = value
                    .get("data")
                    .and_then(Value::as_array)
                    .and_then(|items| items.first())
                    .cloned();
                Ok(best)
            }
            Err(UpstreamError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, None, ""),
            UpstreamError::NotFound
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, None, "bad fields"),
            UpstreamError::BadRequest(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, ""),
            UpstreamError::Unauthorized
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(30), ""),
            UpstreamError::RateLimited {
                retry_after: Some(30)
            }
        ));
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, None, ""),
            UpstreamError::Unavailable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::IM_A_TEAPOT, None, ""),
            UpstreamError::Transport(_)
        ));
    }

    #[test]
    fn test_page_from_value_full_envelope() {
        let (total, offset, next, items) = page_from_value(
            json!({"total": 3500, "offset": 100, "next": 200, "data": [{"a": 1}, {"a": 2}]}),
            100,
        );
        assert_eq!(total, 3500);
        assert_eq!(offset, 100);
        assert_eq!(next, Some(200));
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn test_page_from_value_tolerates_missing_keys() {
        let (total, offset, next, items) =
            page_from_value(json!({"data": [{"a": 1}]}), 40);
        assert_eq!(total, 1);
        assert_eq!(offset, 40);
        assert_eq!(next, None);
        assert_eq!(items.len(), 1);

        let (total, _, _, items) = page_from_value(json!({}), 0);
        assert_eq!(total, 0);
        assert!(items.is_empty());
    }

    #[test]
    fn test_backoff_respects_retry_after() {
        let client = HttpUpstreamClient::new(UpstreamConfig::default()).unwrap();
        let delay = client.backoff_delay(
            0,
            &UpstreamError::RateLimited {
                retry_after: Some(7),
            },
        );
        assert_eq!(delay, Duration::from_secs(7));
    }

    #[test]
    fn test_backoff_grows_with_attempts() {
        let client = HttpUpstreamClient::new(UpstreamConfig {
            retry_backoff_base: Duration::from_millis(100),
            ..UpstreamConfig::default()
        })
        .unwrap();

        let d0 = client.backoff_delay(0, &UpstreamError::Timeout);
        let d3 = client.backoff_delay(3, &UpstreamError::Timeout);
        assert!(d0 >= Duration::from_millis(100) && d0 <= Duration::from_millis(150));
        assert!(d3 >= Duration::from_millis(800) && d3 <= Duration::from_millis(1200));
    }
}
