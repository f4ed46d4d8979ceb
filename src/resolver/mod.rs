//! The read path for paper queries, and the writer that keeps tiers
//! coherent.
//!
//! Resolution order for a single paper: alias index → hot cache →
//! negative cache → graph store (when fresh) → single-flight token →
//! Upstream. After a successful Upstream fetch the hot cache is written
//! synchronously (the response depends on it); persistence into the graph
//! store and alias index, plus any large-relation ingest, fans out onto
//! the background task pool where failures are logged and swallowed.
//!
//! Read-path failures in a tier degrade to the next tier instead of
//! surfacing, so a dead cache or store only costs latency.

use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::alias::{aliases_from_record, parse_paper_ref, AliasError, AliasIndex, PaperRef};
use crate::cache::{keys, CacheError, HotCache};
use crate::config::Settings;
use crate::fields::{FieldExpr, FieldExprError};
use crate::ingest::RelationIngestor;
use crate::models::{item_neighbor_id, PaperRecord, RelationKind, RelationView};
use crate::store::{is_fresh, GraphStore, StoreError};
use crate::upstream::{UpstreamClient, UpstreamError};
use crate::{DEFAULT_FETCH_FIELDS, DEFAULT_RELATION_FIELDS};

/// Response tag marking a stale graph-store fallback.
const OUTDATED_TAG: &str = "data_may_be_outdated";

/// Failure taxonomy surfaced to the proxy's callers.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Malformed reference, field expression, or batch overflow
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Paper confirmed unknown (Upstream 404 or negative cache)
    #[error("paper not found")]
    NotFound,

    /// Upstream throttling survived all internal retries
    #[error("rate limited by upstream")]
    RateLimited,

    /// Read deadline exceeded
    #[error("deadline exceeded")]
    Timeout,

    /// Missing or rejected upstream credential
    #[error("upstream credential rejected")]
    Unauthorized,

    /// Upstream down and no usable stale copy
    #[error("upstream unavailable")]
    UpstreamUnavailable,

    /// No tier could serve
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<UpstreamError> for ResolveError {
    fn from(e: UpstreamError) -> Self {
        match e {
            UpstreamError::NotFound => ResolveError::NotFound,
            UpstreamError::BadRequest(m) => ResolveError::BadRequest(m),
            UpstreamError::Unauthorized => ResolveError::Unauthorized,
            UpstreamError::RateLimited { .. } => ResolveError::RateLimited,
            UpstreamError::Timeout => ResolveError::Timeout,
            UpstreamError::Unavailable(_) | UpstreamError::Transport(_) => {
                ResolveError::UpstreamUnavailable
            }
        }
    }
}

impl From<AliasError> for ResolveError {
    fn from(e: AliasError) -> Self {
        match e {
            AliasError::InvalidRef(_) | AliasError::InvalidValue { .. } => {
                ResolveError::BadRequest(e.to_string())
            }
            AliasError::Database(m) => ResolveError::Internal(m),
        }
    }
}

impl From<FieldExprError> for ResolveError {
    fn from(e: FieldExprError) -> Self {
        ResolveError::BadRequest(e.to_string())
    }
}

impl From<CacheError> for ResolveError {
    fn from(e: CacheError) -> Self {
        ResolveError::Internal(e.to_string())
    }
}

impl From<StoreError> for ResolveError {
    fn from(e: StoreError) -> Self {
        ResolveError::Internal(e.to_string())
    }
}

/// Result type for resolver operations.
pub type ResolveResult<T> = Result<T, ResolveError>;

/// A relation query answer in Upstream page shape.
#[derive(Debug, Clone)]
pub struct RelationQueryResult {
    pub total: u64,
    pub offset: u64,
    pub items: Vec<Value>,
}

/// Orchestrates the tiered read path and the post-fetch write fan-out.
pub struct PaperResolver<U, C, S, A> {
    upstream: Arc<U>,
    cache: Arc<C>,
    store: Arc<S>,
    aliases: Arc<A>,
    ingestor: Arc<RelationIngestor<U, C, S>>,
    settings: Arc<Settings>,
}

impl<U, C, S, A> Clone for PaperResolver<U, C, S, A> {
    fn clone(&self) -> Self {
        Self {
            upstream: Arc::clone(&self.upstream),
            cache: Arc::clone(&self.cache),
            store: Arc::clone(&self.store),
            aliases: Arc::clone(&self.aliases),
            ingestor: Arc::clone(&self.ingestor),
            settings: Arc::clone(&self.settings),
        }
    }
}

impl<U, C, S, A> PaperResolver<U, C, S, A>
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
        aliases: Arc<A>,
        settings: Arc<Settings>,
    ) -> Self {
        let ingestor = Arc::new(RelationIngestor::new(
            Arc::clone(&upstream),
            Arc::clone(&cache),
            Arc::clone(&store),
            Arc::clone(&settings),
        ));
        Self {
            upstream,
            cache,
            store,
            aliases,
            ingestor,
            settings,
        }
    }

    /// Resolve one paper reference to a projected record.
    pub async fn get_paper(&self, raw_ref: &str, fields: Option<&str>) -> ResolveResult<Value> {
        let expr = FieldExpr::parse_opt(fields)?;
        let parsed = parse_paper_ref(raw_ref)?;

        let paper_id = match self.lookup_identity(&parsed).await {
            Some(id) => id,
            None => {
                // canonical id unknown: speculative fetch on the raw ref;
                // the response defines identity
                let record = self.fetch_and_install(&parsed.to_upstream_ref(), None).await?;
                return Ok(expr.project_paper(&record.data));
            }
        };

        self.get_paper_by_id(&paper_id, &expr).await
    }

    /// Read path for a known canonical id.
    async fn get_paper_by_id(&self, paper_id: &str, expr: &FieldExpr) -> ResolveResult<Value> {
        // hot path
        if let Some(record) = self.cached_record(paper_id).await {
            debug!(paper_id, "hot cache hit");
            return Ok(expr.project_paper(&record.data));
        }

        // negative cache
        if self.negative_cached(paper_id).await {
            debug!(paper_id, "negative cache hit");
            return Err(ResolveError::NotFound);
        }

        // warm path
        let mut stale_copy = None;
        match self.store.get_paper(paper_id).await {
            Ok(Some(record)) if record.ingest_status == crate::models::IngestStatus::Full => {
                if is_fresh(&record, self.settings.freshness_window()) {
                    debug!(paper_id, "graph store fresh hit");
                    self.write_through(&record).await;
                    return Ok(expr.project_paper(&record.data));
                }
                stale_copy = Some(record);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, paper_id, "graph store read failed, degrading"),
        }

        // single-flight
        let lock_key = keys::paper_lock(paper_id);
        let owner = format!("fetch-{:016x}", rand::random::<u64>());
        let acquired = match self
            .cache
            .acquire_lock(&lock_key, &owner, self.settings.single_flight_ttl())
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(error = %e, paper_id, "single-flight unavailable, fetching directly");
                true // cache is down; locking is moot, fetch without it
            }
        };

        if !acquired {
            if let Some(result) = self.await_peer_fetch(paper_id, expr).await {
                return result;
            }
            // waiter budget exhausted; a redundant fetch is tolerated
            debug!(paper_id, "single-flight wait timed out, fetching redundantly");
        }

        let fetched = self.fetch_and_install(paper_id, Some(paper_id)).await;
        if acquired {
            if let Err(e) = self.cache.release_lock(&lock_key, &owner).await {
                warn!(error = %e, paper_id, "failed to release single-flight token");
            }
        }

        match fetched {
            Ok(record) => Ok(expr.project_paper(&record.data)),
            Err(ResolveError::NotFound) => {
                let _ = self
                    .cache
                    .set(
                        &keys::negative_paper(paper_id),
                        &Value::Bool(true),
                        self.settings.negative_ttl(),
                    )
                    .await;
                Err(ResolveError::NotFound)
            }
            Err(err) => {
                // transient upstream failure: fall back to a stale copy
                if let Some(record) = stale_copy {
                    if matches!(
                        err,
                        ResolveError::UpstreamUnavailable
                            | ResolveError::RateLimited
                            | ResolveError::Timeout
                    ) {
                        warn!(paper_id, error = %err, "serving stale graph store copy");
                        let mut projected = expr.project_paper(&record.data);
                        if let Value::Object(map) = &mut projected {
                            map.insert(OUTDATED_TAG.to_string(), Value::Bool(true));
                        }
                        return Ok(projected);
                    }
                }
                Err(err)
            }
        }
    }

    /// Poll the result key while a peer's fetch is in flight.
    ///
    /// Returns `None` when the waiter budget runs out.
    async fn await_peer_fetch(
        &self,
        paper_id: &str,
        expr: &FieldExpr,
    ) -> Option<ResolveResult<Value>> {
        let poll = self.settings.single_flight_poll();
        let budget = self.settings.single_flight_wait();
        let started = tokio::time::Instant::now();

        while started.elapsed() < budget {
            sleep(poll.min(budget.saturating_sub(started.elapsed()))).await;
            if let Some(record) = self.cached_record(paper_id).await {
                debug!(paper_id, "peer fetch completed while waiting");
                return Some(Ok(expr.project_paper(&record.data)));
            }
            if self.negative_cached(paper_id).await {
                return Some(Err(ResolveError::NotFound));
            }
        }
        None
    }

    /// Resolve an ordered batch of references.
    ///
    /// The output is position-preserving: entry `i` answers `refs[i]`,
    /// with `Value::Null` for papers Upstream does not know.
    pub async fn get_batch(&self, refs: &[String], fields: Option<&str>) -> ResolveResult<Vec<Value>> {
        if refs.len() > self.settings.batch_size_cap {
            return Err(ResolveError::BadRequest(format!(
                "batch size {} exceeds cap {}",
                refs.len(),
                self.settings.batch_size_cap
            )));
        }
        let expr = FieldExpr::parse_opt(fields)?;

        let mut parsed = Vec::with_capacity(refs.len());
        for raw in refs {
            parsed.push(parse_paper_ref(raw)?);
        }

        // batched hot-path read on the refs whose canonical id is known
        let mut known_ids: Vec<Option<String>> = Vec::with_capacity(parsed.len());
        for r in &parsed {
            known_ids.push(self.lookup_identity(r).await);
        }
        let cache_keys: Vec<String> = known_ids
            .iter()
            .map(|id| id.as_deref().map(keys::paper_full).unwrap_or_default())
            .collect();
        let cached = match self.cache.mget(&cache_keys).await {
            Ok(values) => values,
            Err(e) => {
                warn!(error = %e, "batch cache read failed, degrading");
                vec![None; parsed.len()]
            }
        };

        let mut out: Vec<Option<Value>> = vec![None; parsed.len()];
        let mut miss_positions = Vec::new();
        let mut miss_refs = Vec::new();
        for (i, entry) in cached.into_iter().enumerate() {
            let record = entry
                .filter(|_| !cache_keys[i].is_empty())
                .and_then(|v| serde_json::from_value::<PaperRecord>(v).ok());
            match record {
                Some(record) => out[i] = Some(expr.project_paper(&record.data)),
                None => {
                    miss_positions.push(i);
                    miss_refs.push(parsed[i].to_upstream_ref());
                }
            }
        }

        if !miss_refs.is_empty() {
            debug!(misses = miss_refs.len(), "batch upstream fetch");
            let fetched = self
                .upstream
                .fetch_batch(&miss_refs, Some(DEFAULT_FETCH_FIELDS))
                .await?;
            for (slot, item) in miss_positions.into_iter().zip(fetched) {
                if let Some(data) = item {
                    let record = self.install_fetched(data).await?;
                    out[slot] = Some(expr.project_paper(&record.data));
                }
            }
        }

        Ok(out.into_iter().map(|v| v.unwrap_or(Value::Null)).collect())
    }

    /// Relation query (`citations` / `references`) with offset pagination.
    pub async fn get_relations(
        &self,
        raw_ref: &str,
        kind: RelationKind,
        offset: u64,
        limit: u64,
        fields: Option<&str>,
    ) -> ResolveResult<RelationQueryResult> {
        let expr = FieldExpr::parse_opt(fields)?;
        let paper_id = self.require_identity(raw_ref).await?;

        // 1: merged view in the hot cache
        if let Ok(Some(value)) = self.cache.get(&keys::relation_view(&paper_id, kind)).await {
            if let Ok(view) = serde_json::from_value::<RelationView>(value) {
                if view_covers(&view, offset, limit) {
                    debug!(paper_id, kind = kind.as_str(), "relation view cache hit");
                    return Ok(slice_view(&view, offset, limit, &expr, kind));
                }
            }
        }

        // 2: complete blob in the graph store
        match self.store.get_relation_view(&paper_id, kind).await {
            Ok(Some(view)) if view_covers(&view, offset, limit) => {
                debug!(paper_id, kind = kind.as_str(), "relation blob store hit");
                if let Ok(value) = serde_json::to_value(&view) {
                    let _ = self
                        .cache
                        .set(
                            &keys::relation_view(&paper_id, kind),
                            &value,
                            self.settings.relation_ttl(),
                        )
                        .await;
                }
                return Ok(slice_view(&view, offset, limit, &expr, kind));
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, paper_id, "relation blob read failed, degrading"),
        }

        // 3: direct page from Upstream, folded into the view best-effort
        let page = self
            .upstream
            .fetch_relation_page(&paper_id, kind, offset, limit, Some(DEFAULT_RELATION_FIELDS))
            .await?;
        self.fold_page_into_view(&paper_id, kind, page.offset, &page.items, page.total)
            .await;

        if page.total >= self.settings.large_relation_threshold {
            self.ingestor.spawn(paper_id.clone(), kind);
        }

        Ok(RelationQueryResult {
            total: page.total,
            offset: page.offset,
            items: page
                .items
                .iter()
                .map(|item| expr.project_relation_item(item, kind.neighbor_key()))
                .collect(),
        })
    }

    /// Drop every hot-cache entry for one paper. The graph store is
    /// untouched.
    pub async fn invalidate(&self, raw_ref: &str) -> ResolveResult<u64> {
        let parsed = parse_paper_ref(raw_ref)?;
        let Some(paper_id) = self.lookup_identity(&parsed).await else {
            return Ok(0);
        };
        let deleted = self.cache.delete_prefix(&keys::paper_prefix(&paper_id)).await?;
        info!(paper_id, deleted, "cache invalidated");
        Ok(deleted)
    }

    /// Populate the hot cache for a reference if it is absent.
    pub async fn warm(&self, raw_ref: &str) -> ResolveResult<bool> {
        let parsed = parse_paper_ref(raw_ref)?;
        if let Some(paper_id) = self.lookup_identity(&parsed).await {
            if self.cached_record(&paper_id).await.is_some() {
                return Ok(true);
            }
        }
        self.get_paper(raw_ref, None).await?;
        Ok(true)
    }

    /// Identity resolution: canonical ids pass through, aliases consult
    /// the index. `None` means the canonical id is not yet known.
    async fn lookup_identity(&self, parsed: &PaperRef) -> Option<String> {
        match parsed {
            PaperRef::Canonical(id) => Some(id.clone()),
            PaperRef::Alias { kind, value } => match self.aliases.resolve(*kind, value).await {
                Ok(found) => found,
                Err(e) => {
                    warn!(error = %e, "alias index read failed, treating as unknown");
                    None
                }
            },
        }
    }

    /// Identity resolution that establishes the id via Upstream when the
    /// alias is unknown.
    async fn require_identity(&self, raw_ref: &str) -> ResolveResult<String> {
        let parsed = parse_paper_ref(raw_ref)?;
        if let Some(id) = self.lookup_identity(&parsed).await {
            return Ok(id);
        }
        let record = self.fetch_and_install(&parsed.to_upstream_ref(), None).await?;
        Ok(record.paper_id)
    }

    async fn cached_record(&self, paper_id: &str) -> Option<PaperRecord> {
        match self.cache.get(&keys::paper_full(paper_id)).await {
            Ok(Some(value)) => serde_json::from_value(value).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, paper_id, "hot cache read failed, degrading");
                None
            }
        }
    }

    async fn negative_cached(&self, paper_id: &str) -> bool {
        matches!(
            self.cache.get(&keys::negative_paper(paper_id)).await,
            Ok(Some(_))
        )
    }

    /// Write-through of a record into the hot cache; failures are logged
    /// and swallowed.
    async fn write_through(&self, record: &PaperRecord) {
        let Ok(value) = serde_json::to_value(record) else {
            return;
        };
        if let Err(e) = self
            .cache
            .set(
                &keys::paper_full(&record.paper_id),
                &value,
                self.settings.paper_ttl(),
            )
            .await
        {
            warn!(error = %e, paper_id = record.paper_id, "cache write-through failed");
        }
    }

    /// Fetch a paper from Upstream and install it in the tiers.
    ///
    /// `expected_id` is the canonical id when it is already known; the
    /// response's `paperId` always defines identity.
    async fn fetch_and_install(
        &self,
        upstream_ref: &str,
        expected_id: Option<&str>,
    ) -> ResolveResult<PaperRecord> {
        let data = self
            .upstream
            .fetch_paper(upstream_ref, Some(DEFAULT_FETCH_FIELDS))
            .await?;
        if let Some(expected) = expected_id {
            let got = data.get("paperId").and_then(Value::as_str);
            if got.is_some_and(|g| g != expected) {
                warn!(expected, got, "upstream returned a different canonical id");
            }
        }
        self.install_fetched(data).await
    }

    /// Install an Upstream document: synchronous hot-cache write, then
    /// background persistence fan-out.
    async fn install_fetched(&self, mut data: Value) -> ResolveResult<PaperRecord> {
        let paper_id = data
            .get("paperId")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| ResolveError::Internal("upstream record missing paperId".into()))?;

        bound_inline_relations(&mut data, self.settings.inline_relation_cap);
        let record = PaperRecord::from_upstream(paper_id.as_str(), data);

        self.write_through(&record).await;
        info!(paper_id, "paper fetched from upstream");
        self.spawn_persist(record.clone());
        Ok(record)
    }

    /// Background fan-out: graph store upsert, alias recording, inline
    /// neighbors, and large-relation ingest triggers. Losing any of these
    /// leaves the store stale but never fails the client response.
    fn spawn_persist(&self, record: PaperRecord) {
        let resolver = self.clone();
        tokio::spawn(async move {
            let paper_id = record.paper_id.clone();

            if let Err(e) = resolver.store.upsert_paper(&record).await {
                warn!(error = %e, paper_id, "graph store persist failed");
            }

            // aliases after the paper row, so every alias target exists
            let aliases = aliases_from_record(&record);
            if !aliases.is_empty() {
                match resolver.aliases.record(&paper_id, &aliases).await {
                    Ok(conflicts) => {
                        for c in conflicts {
                            warn!(
                                kind = c.kind.as_str(),
                                value = c.value,
                                existing = c.existing_paper_id,
                                attempted = c.attempted_paper_id,
                                "alias conflict, keeping original target"
                            );
                        }
                    }
                    Err(e) => warn!(error = %e, paper_id, "alias recording failed"),
                }
            }

            resolver.persist_inline_relations(&record).await;

            for kind in [RelationKind::Citations, RelationKind::References] {
                let count = record.relation_count(kind).unwrap_or(0);
                if count >= resolver.settings.large_relation_threshold {
                    debug!(paper_id, kind = kind.as_str(), count, "triggering relation ingest");
                    resolver.ingestor.spawn(paper_id.clone(), kind);
                }
            }
        });
    }

    /// Persist the bounded inline relation lists that rode along on the
    /// paper body: neighbor stubs plus edges.
    async fn persist_inline_relations(&self, record: &PaperRecord) {
        for kind in [RelationKind::Citations, RelationKind::References] {
            let Some(items) = record.data.get(kind.as_str()).and_then(Value::as_array) else {
                continue;
            };

            let mut stubs = Vec::new();
            let mut neighbor_ids = Vec::new();
            for item in items {
                // inline relations nest the neighbor document directly
                if let Some(id) = item.get("paperId").and_then(Value::as_str) {
                    stubs.push((id.to_string(), item.clone()));
                    neighbor_ids.push(id.to_string());
                }
            }
            if stubs.is_empty() {
                continue;
            }

            if let Err(e) = self.store.upsert_neighbor_stubs(&stubs).await {
                warn!(error = %e, paper_id = record.paper_id, "inline stub persist failed");
                continue;
            }
            let merged = match kind {
                RelationKind::Citations => {
                    self.store
                        .merge_edges_reverse(&record.paper_id, &neighbor_ids)
                        .await
                }
                RelationKind::References => {
                    self.store.merge_edges(&record.paper_id, &neighbor_ids).await
                }
            };
            if let Err(e) = merged {
                warn!(error = %e, paper_id = record.paper_id, "inline edge merge failed");
            }
        }
    }

    /// Fold a directly fetched page into the cached view when it extends
    /// the contiguous prefix; pages that would leave a gap are cached only
    /// under their page key and left for the ingestor to backfill.
    async fn fold_page_into_view(
        &self,
        paper_id: &str,
        kind: RelationKind,
        offset: u64,
        items: &[Value],
        total: u64,
    ) {
        if items.is_empty() {
            return;
        }

        let page_index = offset / self.settings.relation_page_size.max(1);
        let _ = self
            .cache
            .set(
                &keys::relation_page(paper_id, kind, page_index),
                &Value::Array(items.to_vec()),
                self.settings.relation_ttl(),
            )
            .await;

        let mut view = match self.cache.get(&keys::relation_view(paper_id, kind)).await {
            Ok(Some(value)) => serde_json::from_value::<RelationView>(value)
                .unwrap_or(RelationView {
                    total,
                    fetched: 0,
                    items: Vec::new(),
                }),
            _ => RelationView {
                total,
                fetched: 0,
                items: Vec::new(),
            },
        };

        if offset > view.fetched {
            return; // would leave a gap
        }

        let mut seen: std::collections::HashSet<String> = view
            .items
            .iter()
            .filter_map(|i| item_neighbor_id(i, kind).map(str::to_owned))
            .collect();
        for item in items {
            let Some(id) = item_neighbor_id(item, kind) else {
                continue;
            };
            if seen.insert(id.to_owned()) {
                view.items.push(item.clone());
            }
        }
        view.total = total;
        view.fetched = view.items.len() as u64;

        if let Ok(value) = serde_json::to_value(&view) {
            let _ = self
                .cache
                .set(
                    &keys::relation_view(paper_id, kind),
                    &value,
                    self.settings.relation_ttl(),
                )
                .await;
        }
    }
}

/// Whether a merged view can answer `[offset, offset+limit)`.
///
/// Views are contiguous prefixes of the relation, so coverage means the
/// slice end falls inside `fetched`, or the view already holds the whole
/// relation.
fn view_covers(view: &RelationView, offset: u64, limit: u64) -> bool {
    view.fetched >= view.total || offset.saturating_add(limit) <= view.fetched
}

fn slice_view(
    view: &RelationView,
    offset: u64,
    limit: u64,
    expr: &FieldExpr,
    kind: RelationKind,
) -> RelationQueryResult {
    let start = (offset as usize).min(view.items.len());
    let end = start
        .saturating_add(limit as usize)
        .min(view.items.len());
    RelationQueryResult {
        total: view.total,
        offset,
        items: view.items[start..end]
            .iter()
            .map(|item| expr.project_relation_item(item, kind.neighbor_key()))
            .collect(),
    }
}

/// Truncate inline citation/reference arrays on a paper body to the cap.
fn bound_inline_relations(data: &mut Value, cap: usize) {
    for key in ["citations", "references"] {
        if let Some(Value::Array(items)) = data.get_mut(key) {
            if items.len() > cap {
                items.truncate(cap);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alias::sqlite::SqliteAliasIndex;
    use crate::alias::AliasKind;
    use crate::cache::memory::MemoryCache;
    use crate::models::{RelationPage, SearchPage};
    use crate::store::sqlite::SqliteGraphStore;
    use crate::upstream::{SearchFilters, UpstreamResult};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    const PAPER_ID: &str = "649def34f8be52c8b66281af98ae884c09aef38b";

    #[derive(Default)]
    struct MockUpstream {
        papers: Mutex<HashMap<String, Value>>,
        fetch_calls: AtomicU64,
        batch_calls: AtomicU64,
        batch_requested: Mutex<Vec<Vec<String>>>,
        fetch_delay: Option<Duration>,
        fail_unavailable: bool,
        relation_total: u64,
    }

    impl MockUpstream {
        fn with_paper(refs: &[&str], doc: Value) -> Self {
            let mock = Self::default();
            for r in refs {
                mock.papers.lock().unwrap().insert(r.to_string(), doc.clone());
            }
            mock
        }

        fn fetches(&self) -> u64 {
            self.fetch_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl UpstreamClient for MockUpstream {
        async fn fetch_paper(&self, paper_ref: &str, _: Option<&str>) -> UpstreamResult<Value> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_unavailable {
                return Err(UpstreamError::Unavailable("injected 503".into()));
            }
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
            _paper_id: &str,
            kind: RelationKind,
            offset: u64,
            limit: u64,
            _: Option<&str>,
        ) -> UpstreamResult<RelationPage> {
            let end = (offset + limit).min(self.relation_total);
            let items = (offset..end)
                .map(|i| json!({kind.neighbor_key(): {"paperId": format!("{i:040x}"), "title": format!("N{i}")}}))
                .collect();
            Ok(RelationPage {
                total: self.relation_total,
                offset,
                next: if end < self.relation_total { Some(end) } else { None },
                items,
            })
        }

        async fn fetch_batch(
            &self,
            refs: &[String],
            _: Option<&str>,
        ) -> UpstreamResult<Vec<Option<Value>>> {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            self.batch_requested.lock().unwrap().push(refs.to_vec());
            let papers = self.papers.lock().unwrap();
            Ok(refs.iter().map(|r| papers.get(r).cloned()).collect())
        }

        async fn search(
            &self,
            _: &str,
            _: &SearchFilters,
            _: u64,
            _: u64,
            _: Option<&str>,
        ) -> UpstreamResult<SearchPage> {
            unreachable!("resolver never searches")
        }

        async fn search_by_title_match(
            &self,
            _: &str,
            _: &SearchFilters,
            _: Option<&str>,
        ) -> UpstreamResult<Option<Value>> {
            unreachable!("resolver never searches")
        }
    }

    type TestResolver = PaperResolver<MockUpstream, MemoryCache, SqliteGraphStore, SqliteAliasIndex>;

    fn resolver(upstream: MockUpstream, settings: Settings) -> TestResolver {
        PaperResolver::new(
            Arc::new(upstream),
            Arc::new(MemoryCache::new()),
            Arc::new(SqliteGraphStore::open_in_memory().unwrap()),
            Arc::new(SqliteAliasIndex::open_in_memory().unwrap()),
            Arc::new(settings),
        )
    }

    fn sample_doc() -> Value {
        json!({
            "paperId": PAPER_ID,
            "title": "Construction of the Literature Graph in Semantic Scholar",
            "year": 2018,
            "citationCount": 40,
            "referenceCount": 2,
            "externalIds": {"DOI": "10.18653/v1/N18-3011", "ArXiv": "1805.02262"},
            "authors": [{"authorId": "1741101", "name": "W. Ammar"}],
            "references": [
                {"paperId": "b".repeat(40), "title": "Ref One"},
                {"paperId": "c".repeat(40), "title": "Ref Two"}
            ]
        })
    }

    /// Poll until the background fan-out lands or the deadline passes.
    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("background persistence did not settle in time");
    }

    #[tokio::test]
    async fn test_cold_fetch_by_doi_records_identity_and_aliases() {
        let upstream = MockUpstream::with_paper(
            &[PAPER_ID, "DOI:10.18653/v1/n18-3011"],
            sample_doc(),
        );
        let resolver = resolver(upstream, Settings::default());

        let out = resolver
            .get_paper("DOI:10.18653/v1/N18-3011", Some("title,year,authors.name"))
            .await
            .unwrap();
        assert_eq!(out["paperId"], json!(PAPER_ID));
        assert_eq!(out["year"], json!(2018));
        assert_eq!(out["authors"][0]["name"], json!("W. Ammar"));
        assert_eq!(out["authors"][0]["authorId"], json!("1741101"));
        assert_eq!(resolver.upstream.fetches(), 1);

        // fan-out: aliases recorded, paper persisted, inline refs stubbed
        let aliases = Arc::clone(&resolver.aliases);
        eventually(|| {
            let aliases = Arc::clone(&aliases);
            async move {
                aliases
                    .resolve(AliasKind::Doi, "10.18653/v1/n18-3011")
                    .await
                    .unwrap()
                    .is_some()
            }
        })
        .await;
        assert_eq!(
            resolver
                .aliases
                .resolve(AliasKind::Arxiv, "1805.02262")
                .await
                .unwrap(),
            Some(PAPER_ID.to_string())
        );

        let store = Arc::clone(&resolver.store);
        eventually(|| {
            let store = Arc::clone(&store);
            async move { store.statistics().await.unwrap().edges == 2 }
        })
        .await;
        assert!(resolver.store.get_paper(&"b".repeat(40)).await.unwrap().is_some());
        assert!(resolver.store.get_paper(&"c".repeat(40)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_second_fetch_by_recorded_alias_hits_cache() {
        let doc = json!({
            "paperId": PAPER_ID,
            "title": "T",
            "externalIds": {"ArXiv": "2106.15928"}
        });
        let upstream = MockUpstream::with_paper(&["ARXIV:2106.15928", PAPER_ID], doc);
        let resolver = resolver(upstream, Settings::default());

        resolver
            .get_paper("ARXIV:2106.15928v2", Some("title"))
            .await
            .unwrap();
        assert_eq!(resolver.upstream.fetches(), 1);

        let aliases = Arc::clone(&resolver.aliases);
        eventually(|| {
            let aliases = Arc::clone(&aliases);
            async move {
                aliases
                    .resolve(AliasKind::Arxiv, "2106.15928")
                    .await
                    .unwrap()
                    .is_some()
            }
        })
        .await;

        let out = resolver
            .get_paper("ARXIV:2106.15928", Some("title"))
            .await
            .unwrap();
        assert_eq!(out["paperId"], json!(PAPER_ID));
        // hot cache answered; no second upstream call
        assert_eq!(resolver.upstream.fetches(), 1);
    }

    #[tokio::test]
    async fn test_repeat_fetch_within_ttl_hits_cache() {
        let upstream = MockUpstream::with_paper(&[PAPER_ID], sample_doc());
        let resolver = resolver(upstream, Settings::default());

        let first = resolver.get_paper(PAPER_ID, Some("title,year")).await.unwrap();
        let second = resolver.get_paper(PAPER_ID, Some("title,year")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(resolver.upstream.fetches(), 1);
    }

    #[tokio::test]
    async fn test_not_found_populates_negative_cache() {
        let upstream = MockUpstream::default();
        let resolver = resolver(upstream, Settings::default());
        let unknown = "d".repeat(40);

        assert!(matches!(
            resolver.get_paper(&unknown, None).await,
            Err(ResolveError::NotFound)
        ));
        assert!(matches!(
            resolver.get_paper(&unknown, None).await,
            Err(ResolveError::NotFound)
        ));
        // second answer came from the negative cache
        assert_eq!(resolver.upstream.fetches(), 1);
    }

    #[tokio::test]
    async fn test_single_flight_coalesces_concurrent_fetches() {
        let mut upstream = MockUpstream::with_paper(&[PAPER_ID], sample_doc());
        upstream.fetch_delay = Some(Duration::from_millis(100));
        let settings = Settings {
            single_flight_poll_ms: 20,
            single_flight_wait_ms: 3000,
            ..Settings::default()
        };
        let resolver = Arc::new(resolver(upstream, settings));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let r = Arc::clone(&resolver);
            handles.push(tokio::spawn(async move {
                r.get_paper(PAPER_ID, Some("title")).await.unwrap()
            }));
        }

        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }
        assert!(results.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(resolver.upstream.fetches(), 1);
    }

    #[tokio::test]
    async fn test_stale_store_copy_served_when_upstream_down() {
        let mut upstream = MockUpstream::default();
        upstream.fail_unavailable = true;
        let resolver = resolver(upstream, Settings::default());

        // stale record: updated well past the freshness window
        let mut record = PaperRecord::from_upstream(PAPER_ID, sample_doc());
        record.metadata_updated_at = Some(crate::models::now_unix() - 48 * 3600);
        record.fetched_at = record.metadata_updated_at;
        resolver.store.upsert_paper(&record).await.unwrap();

        let out = resolver.get_paper(PAPER_ID, Some("title")).await.unwrap();
        assert_eq!(out["title"], sample_doc()["title"]);
        assert_eq!(out["data_may_be_outdated"], json!(true));
    }

    #[tokio::test]
    async fn test_stale_store_copy_refetched_when_upstream_healthy() {
        let mut doc = sample_doc();
        doc["title"] = json!("Fresh Title");
        let upstream = MockUpstream::with_paper(&[PAPER_ID], doc);
        let resolver = resolver(upstream, Settings::default());

        let mut record = PaperRecord::from_upstream(PAPER_ID, json!({"title": "Old Title"}));
        record.metadata_updated_at = Some(crate::models::now_unix() - 48 * 3600);
        record.fetched_at = record.metadata_updated_at;
        resolver.store.upsert_paper(&record).await.unwrap();

        let out = resolver.get_paper(PAPER_ID, Some("title")).await.unwrap();
        assert_eq!(out["title"], json!("Fresh Title"));
        assert!(out.get("data_may_be_outdated").is_none());
        assert_eq!(resolver.upstream.fetches(), 1);
    }

    #[tokio::test]
    async fn test_upstream_down_without_copy_is_unavailable() {
        let mut upstream = MockUpstream::default();
        upstream.fail_unavailable = true;
        let resolver = resolver(upstream, Settings::default());

        assert!(matches!(
            resolver.get_paper(&"e".repeat(40), None).await,
            Err(ResolveError::UpstreamUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_fresh_store_copy_avoids_upstream() {
        let upstream = MockUpstream::default();
        let resolver = resolver(upstream, Settings::default());

        let record = PaperRecord::from_upstream(PAPER_ID, sample_doc());
        resolver.store.upsert_paper(&record).await.unwrap();

        let out = resolver.get_paper(PAPER_ID, Some("title")).await.unwrap();
        assert_eq!(out["title"], sample_doc()["title"]);
        assert_eq!(resolver.upstream.fetches(), 0);

        // write-through happened
        assert!(resolver
            .cache
            .get(&keys::paper_full(PAPER_ID))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_invalidate_then_read_repopulates_from_store() {
        let upstream = MockUpstream::default();
        let resolver = resolver(upstream, Settings::default());
        resolver
            .store
            .upsert_paper(&PaperRecord::from_upstream(PAPER_ID, sample_doc()))
            .await
            .unwrap();

        resolver.get_paper(PAPER_ID, None).await.unwrap();
        let deleted = resolver.invalidate(PAPER_ID).await.unwrap();
        assert!(deleted >= 1);
        assert!(resolver
            .cache
            .get(&keys::paper_full(PAPER_ID))
            .await
            .unwrap()
            .is_none());

        // next read lands on the still-fresh store copy
        let out = resolver.get_paper(PAPER_ID, None).await.unwrap();
        assert_eq!(out["paperId"], json!(PAPER_ID));
        assert_eq!(resolver.upstream.fetches(), 0);
    }

    #[tokio::test]
    async fn test_warm_populates_cache() {
        let upstream = MockUpstream::with_paper(&[PAPER_ID], sample_doc());
        let resolver = resolver(upstream, Settings::default());

        assert!(resolver.warm(PAPER_ID).await.unwrap());
        assert!(resolver
            .cache
            .get(&keys::paper_full(PAPER_ID))
            .await
            .unwrap()
            .is_some());
        // warming again is a cache hit
        assert!(resolver.warm(PAPER_ID).await.unwrap());
        assert_eq!(resolver.upstream.fetches(), 1);
    }

    #[tokio::test]
    async fn test_bad_refs_rejected() {
        let resolver = resolver(MockUpstream::default(), Settings::default());

        assert!(matches!(
            resolver.get_paper("not-an-id", None).await,
            Err(ResolveError::BadRequest(_))
        ));
        assert!(matches!(
            resolver.get_paper(PAPER_ID, Some("authors..name")).await,
            Err(ResolveError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_batch_preserves_order_with_null_for_unknown() {
        let known2 = "f".repeat(40);
        let upstream = MockUpstream::with_paper(&[PAPER_ID], sample_doc());
        upstream.papers.lock().unwrap().insert(
            "ARXIV:2106.15928".to_string(),
            json!({"paperId": known2, "title": "Second"}),
        );
        let resolver = resolver(upstream, Settings::default());

        let out = resolver
            .get_batch(
                &[
                    PAPER_ID.to_string(),
                    "DOI:10.invalid/none".to_string(),
                    "ARXIV:2106.15928".to_string(),
                ],
                Some("title"),
            )
            .await
            .unwrap();

        assert_eq!(out.len(), 3);
        assert_eq!(out[0]["paperId"], json!(PAPER_ID));
        assert_eq!(out[1], Value::Null);
        assert_eq!(out[2]["paperId"], json!(known2));
        assert_eq!(out[2]["title"], json!("Second"));
        assert_eq!(resolver.upstream.batch_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_batch_hot_hits_excluded_from_upstream_call() {
        let upstream = MockUpstream::with_paper(&[PAPER_ID], sample_doc());
        let second = "f".repeat(40);
        upstream
            .papers
            .lock()
            .unwrap()
            .insert(second.clone(), json!({"paperId": second, "title": "Second"}));
        let resolver = resolver(upstream, Settings::default());

        // prime one entry
        resolver.get_paper(PAPER_ID, None).await.unwrap();

        let out = resolver
            .get_batch(&[PAPER_ID.to_string(), second.clone()], Some("title"))
            .await
            .unwrap();
        assert_eq!(out[0]["paperId"], json!(PAPER_ID));
        assert_eq!(out[1]["paperId"], json!(second));

        let requested = resolver.upstream.batch_requested.lock().unwrap().clone();
        assert_eq!(requested, vec![vec![second]]);
    }

    #[tokio::test]
    async fn test_batch_cap_enforced() {
        let resolver = resolver(MockUpstream::default(), Settings::default());
        let refs: Vec<String> = (0..501).map(|i| format!("{i:040x}")).collect();
        assert!(matches!(
            resolver.get_batch(&refs, None).await,
            Err(ResolveError::BadRequest(_))
        ));

        let refs: Vec<String> = (0..500).map(|i| format!("{i:040x}")).collect();
        let out = resolver.get_batch(&refs, None).await.unwrap();
        assert_eq!(out.len(), 500);
        assert!(out.iter().all(|v| v.is_null()));
    }

    #[tokio::test]
    async fn test_relations_served_from_store_blob() {
        let upstream = MockUpstream::default();
        let resolver = resolver(upstream, Settings::default());

        let items: Vec<Value> = (0..30)
            .map(|i| json!({"citingPaper": {"paperId": format!("{i:040x}"), "title": format!("N{i}")}}))
            .collect();
        resolver
            .store
            .store_relation_blob(PAPER_ID, RelationKind::Citations, &items, 30)
            .await
            .unwrap();

        let out = resolver
            .get_relations(PAPER_ID, RelationKind::Citations, 25, 10, Some("title"))
            .await
            .unwrap();
        assert_eq!(out.total, 30);
        assert_eq!(out.offset, 25);
        assert_eq!(out.items.len(), 5);
        assert_eq!(out.items[0]["citingPaper"]["title"], json!("N25"));

        // view published to the cache; a repeat query hits it
        assert!(resolver
            .cache
            .get(&keys::relation_view(PAPER_ID, RelationKind::Citations))
            .await
            .unwrap()
            .is_some());

        // beyond-total slice: empty data, total unchanged
        let past = resolver
            .get_relations(PAPER_ID, RelationKind::Citations, 100, 10, None)
            .await
            .unwrap();
        assert_eq!(past.total, 30);
        assert!(past.items.is_empty());
    }

    #[tokio::test]
    async fn test_relations_fall_through_to_upstream_page() {
        let mut upstream = MockUpstream::default();
        upstream.relation_total = 500;
        let resolver = resolver(upstream, Settings::default());

        let out = resolver
            .get_relations(PAPER_ID, RelationKind::References, 40, 10, Some("title"))
            .await
            .unwrap();
        assert_eq!(out.total, 500);
        assert_eq!(out.offset, 40);
        assert_eq!(out.items.len(), 10);
        assert!(out.items[0]["citedPaper"]["paperId"].is_string());
    }
}
