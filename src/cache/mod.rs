//! Hot cache abstraction and key namespaces.
//!
//! The hot cache is a short-TTL key/value tier holding full paper records,
//! merged relation views, raw relation pages, search results, negative
//! entries, and single-flight tokens. Set-with-TTL is the only write
//! primitive: structured values are always replaced whole, never updated
//! in place.
//!
//! The trait is store-agnostic; [`memory::MemoryCache`] is the in-process
//! implementation the proxy ships with, and the same contract fits an
//! external store (Redis and friends) unchanged.

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache backend is unreachable
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be encoded or decoded
    #[error("cache serialization error: {0}")]
    Serialization(String),
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Short-TTL key/value tier with single-flight token support.
///
/// All values are JSON documents. TTLs are mandatory on every write; the
/// per-namespace TTL policy lives in [`crate::config::Settings`], not here.
#[async_trait]
pub trait HotCache: Send + Sync {
    /// Fetch a value, or `None` on miss/expiry.
    async fn get(&self, key: &str) -> CacheResult<Option<Value>>;

    /// Replace the value at `key`, expiring after `ttl`.
    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> CacheResult<()>;

    /// Delete a key; returns whether it existed.
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Delete every key starting with `prefix`; returns the count.
    async fn delete_prefix(&self, prefix: &str) -> CacheResult<u64>;

    /// Batched get, position-preserving.
    async fn mget(&self, keys: &[String]) -> CacheResult<Vec<Option<Value>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    /// Atomic set-if-absent of a single-flight token.
    ///
    /// Returns `true` when this caller acquired the token. The token
    /// expires after `ttl` so a crashed holder cannot block peers forever.
    async fn acquire_lock(&self, key: &str, owner: &str, ttl: Duration) -> CacheResult<bool>;

    /// Release a single-flight token, conditional on ownership.
    ///
    /// Returns `true` when the token existed and belonged to `owner`.
    async fn release_lock(&self, key: &str, owner: &str) -> CacheResult<bool>;
}

/// Cache key builders, one per namespace.
///
/// Every key for one paper shares the `paper:{id}:` prefix so that
/// invalidation can drop them in a single prefix delete.
pub mod keys {
    use crate::models::RelationKind;

    /// Merged full paper record.
    pub fn paper_full(paper_id: &str) -> String {
        format!("paper:{paper_id}:full")
    }

    /// Prefix covering every key belonging to one paper.
    pub fn paper_prefix(paper_id: &str) -> String {
        format!("paper:{paper_id}:")
    }

    /// Merged relation view.
    pub fn relation_view(paper_id: &str, kind: RelationKind) -> String {
        format!("paper:{paper_id}:relations:{kind}")
    }

    /// One raw relation page.
    pub fn relation_page(paper_id: &str, kind: RelationKind, page: u64) -> String {
        format!("paper:{paper_id}:relations:{kind}:page:{page}")
    }

    /// Ingest progress mirror.
    pub fn ingest_progress(paper_id: &str, kind: RelationKind) -> String {
        format!("paper:{paper_id}:ingest_progress:{kind}")
    }

    /// Search result page by query fingerprint.
    pub fn search(fingerprint: &str) -> String {
        format!("search:{fingerprint}")
    }

    /// Single-flight token for one paper fetch.
    pub fn paper_lock(paper_id: &str) -> String {
        format!("lock:paper:{paper_id}")
    }

    /// Single-flight token for one relation ingest run.
    pub fn ingest_lock(paper_id: &str, kind: RelationKind) -> String {
        format!("lock:ingest:{paper_id}:{kind}")
    }

    /// Negative cache for a confirmed not-found paper.
    pub fn negative_paper(paper_id: &str) -> String {
        format!("neg:paper:{paper_id}")
    }
}
