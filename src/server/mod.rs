//! Inbound service surface.
//!
//! This module carries the contracts the HTTP edge consumes: request and
//! response DTOs in Upstream's JSON shape, the error-to-status mapping,
//! and a [`ProxyService`] facade that applies the read deadline and routes
//! each operation to the resolver or search coordinator.
//!
//! Routing, authentication, and transport live outside the core; nothing
//! here depends on an HTTP framework.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use crate::alias::AliasIndex;
use crate::cache::HotCache;
use crate::config::Settings;
use crate::models::RelationKind;
use crate::resolver::{PaperResolver, ResolveError, ResolveResult};
use crate::search::SearchCoordinator;
use crate::store::GraphStore;
use crate::upstream::{SearchFilters, UpstreamClient};

/// `POST paper/batch` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    pub ids: Vec<String>,

    #[serde(default)]
    pub fields: Option<String>,
}

/// `GET paper/search` query parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchParams {
    pub query: String,

    #[serde(default)]
    pub offset: u64,

    #[serde(default = "default_limit")]
    pub limit: u64,

    #[serde(default)]
    pub fields: Option<String>,

    #[serde(default)]
    pub year: Option<String>,

    #[serde(default)]
    pub venue: Option<String>,

    #[serde(default)]
    pub fields_of_study: Option<String>,

    /// Serve from the graph store's title index when it has enough
    /// matches; best-effort, no ranking guarantee.
    #[serde(default)]
    pub prefer_local: bool,
}

fn default_limit() -> u64 {
    10
}

impl SearchParams {
    fn filters(&self) -> SearchFilters {
        SearchFilters {
            year: self.year.clone(),
            venue: self.venue.clone(),
            fields_of_study: self.fields_of_study.clone(),
        }
    }
}

/// Relation page response (`GET paper/{ref}/citations` and friends).
#[derive(Debug, Clone, Serialize)]
pub struct RelationResponse {
    pub total: u64,
    pub offset: u64,
    pub data: Vec<Value>,
}

/// Search response, carrying both `data` and the compatibility key
/// `papers` with identical content.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub total: u64,
    pub offset: u64,
    pub data: Vec<Value>,
    pub papers: Vec<Value>,
}

/// Result of a cache-management operation.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub success: bool,
    pub message: String,
}

/// Error payload handed to the HTTP edge.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub status: u16,
    pub error: &'static str,
    pub message: String,
}

impl From<&ResolveError> for ErrorBody {
    fn from(e: &ResolveError) -> Self {
        Self {
            status: http_status(e),
            error: error_kind(e),
            message: e.to_string(),
        }
    }
}

/// HTTP status for each caller-visible error kind.
pub fn http_status(e: &ResolveError) -> u16 {
    match e {
        ResolveError::BadRequest(_) => 400,
        ResolveError::Unauthorized => 401,
        ResolveError::NotFound => 404,
        ResolveError::Timeout => 408,
        ResolveError::RateLimited => 429,
        ResolveError::Internal(_) => 500,
        ResolveError::UpstreamUnavailable => 503,
    }
}

fn error_kind(e: &ResolveError) -> &'static str {
    match e {
        ResolveError::BadRequest(_) => "BAD_REQUEST",
        ResolveError::Unauthorized => "UNAUTHORIZED",
        ResolveError::NotFound => "NOT_FOUND",
        ResolveError::Timeout => "TIMEOUT",
        ResolveError::RateLimited => "RATE_LIMITED",
        ResolveError::Internal(_) => "INTERNAL_ERROR",
        ResolveError::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
    }
}

/// Facade over the resolver and search coordinator.
///
/// Every read runs on the background task pool under the configured
/// deadline: when the deadline fires the caller gets `Timeout`, but the
/// underlying fetch keeps running; its tier writes are still valuable.
pub struct ProxyService<U, C, S, A> {
    resolver: Arc<PaperResolver<U, C, S, A>>,
    search: Arc<SearchCoordinator<U, C, S, A>>,
    settings: Arc<Settings>,
}

impl<U, C, S, A> Clone for ProxyService<U, C, S, A> {
    fn clone(&self) -> Self {
        Self {
            resolver: Arc::clone(&self.resolver),
            search: Arc::clone(&self.search),
            settings: Arc::clone(&self.settings),
        }
    }
}

impl<U, C, S, A> ProxyService<U, C, S, A>
where
    U: UpstreamClient + Send + Sync + 'static,
    C: HotCache + Send + Sync + 'static,
    S: GraphStore + Send + Sync + 'static,
    A: AliasIndex + Send + Sync + 'static,
{
    /// Wire the tiers together into one service.
    pub fn new(
        upstream: Arc<U>,
        cache: Arc<C>,
        store: Arc<S>,
        aliases: Arc<A>,
        settings: Arc<Settings>,
    ) -> Self {
        let resolver = Arc::new(PaperResolver::new(
            Arc::clone(&upstream),
            Arc::clone(&cache),
            Arc::clone(&store),
            aliases,
            Arc::clone(&settings),
        ));
        let search = Arc::new(SearchCoordinator::new(
            upstream,
            cache,
            store,
            Arc::clone(&resolver),
            Arc::clone(&settings),
        ));
        Self {
            resolver,
            search,
            settings,
        }
    }

    /// `GET paper/{ref}`
    pub async fn get_paper(&self, raw_ref: String, fields: Option<String>) -> ResolveResult<Value> {
        let resolver = Arc::clone(&self.resolver);
        self.with_deadline(async move { resolver.get_paper(&raw_ref, fields.as_deref()).await })
            .await
    }

    /// `GET paper/{ref}/citations`
    pub async fn get_citations(
        &self,
        raw_ref: String,
        offset: u64,
        limit: u64,
        fields: Option<String>,
    ) -> ResolveResult<RelationResponse> {
        self.relations(raw_ref, RelationKind::Citations, offset, limit, fields)
            .await
    }

    /// `GET paper/{ref}/references`
    pub async fn get_references(
        &self,
        raw_ref: String,
        offset: u64,
        limit: u64,
        fields: Option<String>,
    ) -> ResolveResult<RelationResponse> {
        self.relations(raw_ref, RelationKind::References, offset, limit, fields)
            .await
    }

    async fn relations(
        &self,
        raw_ref: String,
        kind: RelationKind,
        offset: u64,
        limit: u64,
        fields: Option<String>,
    ) -> ResolveResult<RelationResponse> {
        let resolver = Arc::clone(&self.resolver);
        let result = self
            .with_deadline(async move {
                resolver
                    .get_relations(&raw_ref, kind, offset, limit, fields.as_deref())
                    .await
            })
            .await?;
        Ok(RelationResponse {
            total: result.total,
            offset: result.offset,
            data: result.items,
        })
    }

    /// `POST paper/batch`
    pub async fn get_batch(&self, request: BatchRequest) -> ResolveResult<Vec<Value>> {
        let resolver = Arc::clone(&self.resolver);
        self.with_deadline(async move {
            resolver
                .get_batch(&request.ids, request.fields.as_deref())
                .await
        })
        .await
    }

    /// `GET paper/search`
    pub async fn search(&self, params: SearchParams) -> ResolveResult<SearchResponse> {
        let search = Arc::clone(&self.search);
        let result = self
            .with_deadline(async move {
                let filters = params.filters();
                if params.prefer_local {
                    search
                        .search_prefer_local(
                            &params.query,
                            &filters,
                            params.offset,
                            params.limit,
                            params.fields.as_deref(),
                        )
                        .await
                } else {
                    search
                        .search(
                            &params.query,
                            &filters,
                            params.offset,
                            params.limit,
                            params.fields.as_deref(),
                        )
                        .await
                }
            })
            .await?;

        Ok(SearchResponse {
            total: result.total,
            offset: result.offset,
            data: result.items.clone(),
            papers: result.items,
        })
    }

    /// `GET paper/search/match`
    pub async fn title_match(
        &self,
        query: String,
        fields: Option<String>,
    ) -> ResolveResult<Option<Value>> {
        let search = Arc::clone(&self.search);
        self.with_deadline(async move {
            search
                .title_match(&query, &SearchFilters::default(), fields.as_deref())
                .await
        })
        .await
    }

    /// `DELETE paper/{ref}/cache`
    pub async fn clear_cache(&self, raw_ref: String) -> ResolveResult<StatusResponse> {
        let deleted = self.resolver.invalidate(&raw_ref).await?;
        Ok(StatusResponse {
            success: true,
            message: format!("cache cleared ({deleted} keys)"),
        })
    }

    /// `POST paper/{ref}/cache/warm`
    pub async fn warm_cache(&self, raw_ref: String) -> ResolveResult<StatusResponse> {
        let resolver = Arc::clone(&self.resolver);
        let warmed = self
            .with_deadline(async move { resolver.warm(&raw_ref).await })
            .await?;
        Ok(StatusResponse {
            success: warmed,
            message: "cache warmed".to_string(),
        })
    }

    /// Run a read under the configured deadline.
    ///
    /// The work is spawned, not raced: on deadline expiry the caller gets
    /// `Timeout` while the spawned task runs to completion and its cache
    /// and store writes land.
    async fn with_deadline<T, F>(&self, fut: F) -> ResolveResult<T>
    where
        T: Send + 'static,
        F: Future<Output = ResolveResult<T>> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        match tokio::time::timeout(self.settings.request_deadline(), handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(ResolveError::Internal(join_err.to_string())),
            Err(_) => Err(ResolveError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alias::sqlite::SqliteAliasIndex;
    use crate::cache::memory::MemoryCache;
    use crate::cache::keys;
    use crate::models::{RelationPage, SearchPage};
    use crate::store::sqlite::SqliteGraphStore;
    use crate::upstream::{UpstreamError, UpstreamResult};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    const PAPER_ID: &str = "649def34f8be52c8b66281af98ae884c09aef38b";

    #[derive(Default)]
    struct MockUpstream {
        papers: Mutex<HashMap<String, Value>>,
        fetch_delay: Option<Duration>,
    }

    #[async_trait]
    impl UpstreamClient for MockUpstream {
        async fn fetch_paper(&self, paper_ref: &str, _: Option<&str>) -> UpstreamResult<Value> {
            if let Some(delay) = self.fetch_delay {
                tokio::time::sleep(delay).await;
            }
            self.papers
                .lock()
                .unwrap()
                .get(paper_ref)
                .cloned()
                .ok_or(UpstreamError::NotFound)
        }

        async fn fetch_relation_page(
            &self,
            _: &str,
            kind: RelationKind,
            offset: u64,
            limit: u64,
            _: Option<&str>,
        ) -> UpstreamResult<RelationPage> {
            let total = 20;
            let end = (offset + limit).min(total);
            Ok(RelationPage {
                total,
                offset,
                next: if end < total { Some(end) } else { None },
                items: (offset..end)
                    .map(|i| json!({kind.neighbor_key(): {"paperId": format!("{i:040x}"), "title": format!("N{i}")}}))
                    .collect(),
            })
        }

        async fn fetch_batch(
            &self,
            refs: &[String],
            _: Option<&str>,
        ) -> UpstreamResult<Vec<Option<Value>>> {
            let papers = self.papers.lock().unwrap();
            Ok(refs.iter().map(|r| papers.get(r).cloned()).collect())
        }

        async fn search(
            &self,
            _: &str,
            _: &SearchFilters,
            offset: u64,
            _: u64,
            _: Option<&str>,
        ) -> UpstreamResult<SearchPage> {
            Ok(SearchPage {
                total: 1,
                offset,
                next: None,
                items: vec![json!({"paperId": PAPER_ID, "title": "Found"})],
            })
        }

        async fn search_by_title_match(
            &self,
            _: &str,
            _: &SearchFilters,
            _: Option<&str>,
        ) -> UpstreamResult<Option<Value>> {
            Ok(None)
        }
    }

    type TestService =
        ProxyService<MockUpstream, MemoryCache, SqliteGraphStore, SqliteAliasIndex>;

    fn service_with(upstream: MockUpstream, settings: Settings) -> (TestService, Arc<MemoryCache>) {
        let cache = Arc::new(MemoryCache::new());
        let service = ProxyService::new(
            Arc::new(upstream),
            Arc::clone(&cache),
            Arc::new(SqliteGraphStore::open_in_memory().unwrap()),
            Arc::new(SqliteAliasIndex::open_in_memory().unwrap()),
            Arc::new(settings),
        );
        (service, cache)
    }

    fn quiet_settings() -> Settings {
        Settings {
            search_ingest_top_n: 0,
            ..Settings::default()
        }
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(http_status(&ResolveError::BadRequest("x".into())), 400);
        assert_eq!(http_status(&ResolveError::Unauthorized), 401);
        assert_eq!(http_status(&ResolveError::NotFound), 404);
        assert_eq!(http_status(&ResolveError::Timeout), 408);
        assert_eq!(http_status(&ResolveError::RateLimited), 429);
        assert_eq!(http_status(&ResolveError::Internal("x".into())), 500);
        assert_eq!(http_status(&ResolveError::UpstreamUnavailable), 503);
    }

    #[test]
    fn test_error_body_shape() {
        let body = ErrorBody::from(&ResolveError::NotFound);
        assert_eq!(body.status, 404);
        assert_eq!(body.error, "NOT_FOUND");
    }

    #[test]
    fn test_search_params_defaults() {
        let params: SearchParams =
            serde_json::from_value(json!({"query": "graphs"})).unwrap();
        assert_eq!(params.offset, 0);
        assert_eq!(params.limit, 10);
        assert!(params.fields.is_none());
        assert!(!params.prefer_local);
    }

    #[tokio::test]
    async fn test_get_paper_roundtrip() {
        let upstream = MockUpstream::default();
        upstream.papers.lock().unwrap().insert(
            PAPER_ID.to_string(),
            json!({"paperId": PAPER_ID, "title": "T", "year": 2018}),
        );
        let (service, _) = service_with(upstream, quiet_settings());

        let out = service
            .get_paper(PAPER_ID.to_string(), Some("title".to_string()))
            .await
            .unwrap();
        assert_eq!(out["paperId"], json!(PAPER_ID));
        assert_eq!(out["title"], json!("T"));
        assert!(out.get("year").is_none());
    }

    #[tokio::test]
    async fn test_relations_response_shape() {
        let (service, _) = service_with(MockUpstream::default(), quiet_settings());
        let out = service
            .get_citations(PAPER_ID.to_string(), 5, 5, None)
            .await
            .unwrap();
        assert_eq!(out.total, 20);
        assert_eq!(out.offset, 5);
        assert_eq!(out.data.len(), 5);
    }

    #[tokio::test]
    async fn test_search_response_carries_compat_key() {
        let (service, _) = service_with(MockUpstream::default(), quiet_settings());
        let out = service
            .search(SearchParams {
                query: "graphs".to_string(),
                offset: 0,
                limit: 10,
                fields: None,
                year: None,
                venue: None,
                fields_of_study: None,
                prefer_local: false,
            })
            .await
            .unwrap();
        assert_eq!(out.total, 1);
        assert_eq!(out.data, out.papers);

        let encoded = serde_json::to_value(&out).unwrap();
        assert!(encoded.get("data").is_some());
        assert!(encoded.get("papers").is_some());
    }

    #[tokio::test]
    async fn test_deadline_surfaces_timeout_but_fetch_completes() {
        let upstream = MockUpstream {
            fetch_delay: Some(Duration::from_millis(1500)),
            ..MockUpstream::default()
        };
        upstream.papers.lock().unwrap().insert(
            PAPER_ID.to_string(),
            json!({"paperId": PAPER_ID, "title": "Slow"}),
        );
        let settings = Settings {
            request_deadline_secs: 1,
            ..quiet_settings()
        };
        let (service, cache) = service_with(upstream, settings);

        let err = service.get_paper(PAPER_ID.to_string(), None).await;
        assert!(matches!(err, Err(ResolveError::Timeout)));

        // the spawned fetch keeps running and lands in the cache
        for _ in 0..100 {
            if cache.get(&keys::paper_full(PAPER_ID)).await.unwrap().is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("background fetch never landed after the deadline");
    }

    #[tokio::test]
    async fn test_clear_and_warm_cache() {
        let upstream = MockUpstream::default();
        upstream.papers.lock().unwrap().insert(
            PAPER_ID.to_string(),
            json!({"paperId": PAPER_ID, "title": "T"}),
        );
        let (service, cache) = service_with(upstream, quiet_settings());

        let warmed = service.warm_cache(PAPER_ID.to_string()).await.unwrap();
        assert!(warmed.success);
        assert!(cache.get(&keys::paper_full(PAPER_ID)).await.unwrap().is_some());

        let cleared = service.clear_cache(PAPER_ID.to_string()).await.unwrap();
        assert!(cleared.success);
        assert!(cache.get(&keys::paper_full(PAPER_ID)).await.unwrap().is_none());
    }
}
