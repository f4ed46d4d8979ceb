//! Upstream client abstraction.
//!
//! The Upstream client is the only component that talks to the academic
//! graph service. It exposes typed methods for each logical query, maps
//! HTTP outcomes onto a typed failure taxonomy, retries transient kinds
//! with exponential backoff, and funnels every request through a shared
//! token bucket so the process as a whole respects Upstream's rate limit.

pub mod http;

use async_trait::async_trait;
use serde_json::Value;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

use crate::models::{RelationKind, RelationPage, SearchPage};

/// Failure taxonomy surfaced to callers.
///
/// Only `RateLimited`, `Timeout`, `Unavailable`, and `Transport` are
/// retried internally; everything else surfaces immediately.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Upstream does not know the paper (HTTP 404)
    #[error("not found")]
    NotFound,

    /// Upstream rejected the request shape (HTTP 400)
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Missing or rejected credential (HTTP 401/403)
    #[error("unauthorized")]
    Unauthorized,

    /// Upstream throttled us (HTTP 429)
    #[error("rate limited")]
    RateLimited {
        /// Retry-After hint in seconds, when Upstream sent one
        retry_after: Option<u64>,
    },

    /// The request ran past its deadline
    #[error("request timed out")]
    Timeout,

    /// Upstream is failing (HTTP 5xx)
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    /// Connection-level failure
    #[error("transport error: {0}")]
    Transport(String),
}

impl UpstreamError {
    /// Whether the retry loop may attempt this failure again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UpstreamError::RateLimited { .. }
                | UpstreamError::Timeout
                | UpstreamError::Unavailable(_)
                | UpstreamError::Transport(_)
        )
    }
}

/// Result type for upstream operations.
pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// Search filters forwarded to Upstream alongside the query text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilters {
    /// Publication year or range (`2020`, `2018-2020`)
    pub year: Option<String>,

    /// Comma-separated venue list
    pub venue: Option<String>,

    /// Comma-separated fields of study
    pub fields_of_study: Option<String>,
}

/// Typed client for the academic graph service.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Fetch one paper by reference (canonical id or prefixed alias).
    ///
    /// The field expression is forwarded verbatim.
    async fn fetch_paper(&self, paper_ref: &str, fields: Option<&str>) -> UpstreamResult<Value>;

    /// Fetch one page of a relation list.
    async fn fetch_relation_page(
        &self,
        paper_id: &str,
        kind: RelationKind,
        offset: u64,
        limit: u64,
        fields: Option<&str>,
    ) -> UpstreamResult<RelationPage>;

    /// Fetch many papers in one call; the result is position-preserving
    /// and unknown references come back as `None`.
    async fn fetch_batch(
        &self,
        refs: &[String],
        fields: Option<&str>,
    ) -> UpstreamResult<Vec<Option<Value>>>;

    /// Relevance search.
    async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        offset: u64,
        limit: u64,
        fields: Option<&str>,
    ) -> UpstreamResult<SearchPage>;

    /// Single best title match, or `None` when Upstream finds nothing.
    async fn search_by_title_match(
        &self,
        query: &str,
        filters: &SearchFilters,
        fields: Option<&str>,
    ) -> UpstreamResult<Option<Value>>;
}

/// Process-wide token bucket governing Upstream admission.
///
/// Saturated callers wait for refill instead of failing; the caller's own
/// deadline bounds the wait. Capacity equals one second of refill so short
/// bursts are absorbed without ever exceeding the sustained rate.
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    state: tokio::sync::Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Bucket admitting `requests_per_sec` sustained requests.
    pub fn new(requests_per_sec: u32) -> Self {
        let rate = f64::from(requests_per_sec.max(1));
        Self {
            capacity: rate,
            refill_per_sec: rate,
            state: tokio::sync::Mutex::new(BucketState {
                tokens: rate,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, waiting for refill when the bucket is empty.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                let deficit = 1.0 - state.tokens;
                Duration::from_secs_f64(deficit / self.refill_per_sec)
            };
            warn!(wait_ms = wait.as_millis() as u64, "rate limit saturated, waiting");
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(UpstreamError::RateLimited { retry_after: None }.is_retryable());
        assert!(UpstreamError::Timeout.is_retryable());
        assert!(UpstreamError::Unavailable("503".into()).is_retryable());
        assert!(UpstreamError::Transport("reset".into()).is_retryable());

        assert!(!UpstreamError::NotFound.is_retryable());
        assert!(!UpstreamError::BadRequest("bad fields".into()).is_retryable());
        assert!(!UpstreamError::Unauthorized.is_retryable());
    }

    #[tokio::test]
    async fn test_rate_limiter_allows_burst_up_to_capacity() {
        let limiter = RateLimiter::new(100);
        let start = Instant::now();
        for _ in 0..50 {
            limiter.acquire().await;
        }
        // well inside the initial bucket, no waiting
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_rate_limiter_waits_when_drained() {
        let limiter = RateLimiter::new(10);
        for _ in 0..10 {
            limiter.acquire().await;
        }
        // bucket empty: the 11th token needs ~100ms of refill
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
