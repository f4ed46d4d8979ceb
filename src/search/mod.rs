//! Search result caching.
//!
//! Search queries are cached by a fingerprint of the canonicalized query
//! tuple (text, filters, offset, limit), deliberately independent of the
//! field expression: the cache stores a rich superset record per result
//! and the projector narrows it per request. Results expire faster than
//! papers.
//!
//! After a cache miss is filled from Upstream, the coordinator warms the
//! top results in the background so likely follow-up detail queries land
//! in the hot tiers.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::alias::{normalize_title, AliasIndex};
use crate::cache::{keys, HotCache};
use crate::config::Settings;
use crate::fields::FieldExpr;
use crate::models::SearchPage;
use crate::resolver::{PaperResolver, ResolveResult};
use crate::store::GraphStore;
use crate::upstream::{SearchFilters, UpstreamClient};
use crate::DEFAULT_SEARCH_FIELDS;

/// A search answer: projected items plus the Upstream paging envelope.
#[derive(Debug, Clone)]
pub struct SearchQueryResult {
    pub total: u64,
    pub offset: u64,
    pub items: Vec<Value>,
}

/// Caches search pages and coordinates optional local-first matching.
pub struct SearchCoordinator<U, C, S, A> {
    upstream: Arc<U>,
    cache: Arc<C>,
    store: Arc<S>,
    resolver: Arc<PaperResolver<U, C, S, A>>,
    settings: Arc<Settings>,
}

impl<U, C, S, A> SearchCoordinator<U, C, S, A>
where
    U: UpstreamClient + Send + Sync + 'static,
    C: HotCache + Send + Sync + 'static,
    S: GraphStore + Send + Sync + 'static,
    A: AliasIndex + Send + Sync + 'static,
{
    pub fn new(
        upstream: Arc<U>,
        cache: Arc<C>,
        store: Arc<S>,
        resolver: Arc<PaperResolver<U, C, S, A>>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            upstream,
            cache,
            store,
            resolver,
            settings,
        }
    }

    /// Cached relevance search.
    pub async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        offset: u64,
        limit: u64,
        fields: Option<&str>,
    ) -> ResolveResult<SearchQueryResult> {
        let expr = FieldExpr::parse_opt(fields)?;
        let cache_key = keys::search(&fingerprint(query, filters, offset, limit));

        if let Ok(Some(value)) = self.cache.get(&cache_key).await {
            if let Ok(page) = serde_json::from_value::<SearchPage>(value) {
                debug!(query, "search cache hit");
                return Ok(project_page(&page, &expr));
            }
        }

        let page = self
            .upstream
            .search(query, filters, offset, limit, Some(DEFAULT_SEARCH_FIELDS))
            .await?;

        if let Ok(value) = serde_json::to_value(&page) {
            if let Err(e) = self
                .cache
                .set(&cache_key, &value, self.settings.search_ttl())
                .await
            {
                warn!(error = %e, "search cache write failed");
            }
        }
        self.spawn_background_warm(&page.items);

        Ok(project_page(&page, &expr))
    }

    /// Local-first search over the graph store's normalized-title index.
    ///
    /// Best-effort: serves stored papers when enough match, with no claim
    /// to Upstream's ranking; falls back to the cached Upstream path
    /// otherwise.
    pub async fn search_prefer_local(
        &self,
        query: &str,
        filters: &SearchFilters,
        offset: u64,
        limit: u64,
        fields: Option<&str>,
    ) -> ResolveResult<SearchQueryResult> {
        let expr = FieldExpr::parse_opt(fields)?;
        let prefix = normalize_title(query);

        if !prefix.is_empty() {
            match self
                .store
                .find_by_title_prefix(&prefix, offset + limit)
                .await
            {
                Ok(found) if found.len() >= self.settings.search_local_min_results => {
                    debug!(query, hits = found.len(), "serving local title matches");
                    let start = (offset as usize).min(found.len());
                    let end = start
                        .saturating_add(limit as usize)
                        .min(found.len());
                    return Ok(SearchQueryResult {
                        total: found.len() as u64,
                        offset,
                        items: found[start..end]
                            .iter()
                            .map(|r| expr.project_paper(&r.data))
                            .collect(),
                    });
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "local title search failed, degrading"),
            }
        }

        self.search(query, filters, offset, limit, fields).await
    }

    /// Single best title match, cached like a search page.
    pub async fn title_match(
        &self,
        query: &str,
        filters: &SearchFilters,
        fields: Option<&str>,
    ) -> ResolveResult<Option<Value>> {
        let expr = FieldExpr::parse_opt(fields)?;
        let cache_key = keys::search(&fingerprint(&format!("match\u{1}{query}"), filters, 0, 1));

        if let Ok(Some(value)) = self.cache.get(&cache_key).await {
            if value.is_null() {
                return Ok(None);
            }
            return Ok(Some(expr.project_paper(&value)));
        }

        let best = self
            .upstream
            .search_by_title_match(query, filters, Some(DEFAULT_SEARCH_FIELDS))
            .await?;

        let cached = best.clone().unwrap_or(Value::Null);
        if let Err(e) = self
            .cache
            .set(&cache_key, &cached, self.settings.search_ttl())
            .await
        {
            warn!(error = %e, "title match cache write failed");
        }

        Ok(best.map(|doc| expr.project_paper(&doc)))
    }

    /// Warm the top results in the background, staggered so the rate
    /// bucket is not burst-drained. Failures are logged and swallowed.
    fn spawn_background_warm(&self, items: &[Value]) {
        let top_n = self.settings.search_ingest_top_n;
        if top_n == 0 {
            return;
        }
        let ids: Vec<String> = items
            .iter()
            .take(top_n)
            .filter_map(|item| item.get("paperId").and_then(Value::as_str))
            .map(str::to_owned)
            .collect();
        if ids.is_empty() {
            return;
        }

        let resolver = Arc::clone(&self.resolver);
        let step = std::time::Duration::from_millis(self.settings.search_ingest_delay_step_ms);
        tokio::spawn(async move {
            for (i, id) in ids.into_iter().enumerate() {
                sleep(step * i as u32).await;
                if let Err(e) = resolver.warm(&id).await {
                    debug!(error = %e, paper_id = id, "background search warm failed");
                }
            }
        });
    }
}

/// Canonical fingerprint of a search tuple.
///
/// Query text is lowercased with whitespace collapsed; filters are folded
/// in a fixed order. The field expression is deliberately excluded.
fn fingerprint(query: &str, filters: &SearchFilters, offset: u64, limit: u64) -> String {
    let canonical_query = query
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    let mut hasher = Sha256::new();
    hasher.update(canonical_query.as_bytes());
    for part in [
        filters.year.as_deref().unwrap_or(""),
        filters.venue.as_deref().unwrap_or(""),
        filters.fields_of_study.as_deref().unwrap_or(""),
    ] {
        hasher.update([0u8]);
        hasher.update(part.as_bytes());
    }
    hasher.update(offset.to_le_bytes());
    hasher.update(limit.to_le_bytes());
    hex::encode(hasher.finalize())
}

fn project_page(page: &SearchPage, expr: &FieldExpr) -> SearchQueryResult {
    SearchQueryResult {
        total: page.total,
        offset: page.offset,
        items: page.items.iter().map(|i| expr.project_paper(i)).collect(),
    }
}
