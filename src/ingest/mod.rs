//! Background ingestion of large citation/reference lists.
//!
//! Papers whose relation counts exceed the configured threshold get their
//! full neighbor lists paginated out of Upstream by this module: each page
//! is cached raw, its neighbors are persisted as stubs with merged edges,
//! and the deduplicated accumulator is finally written to the graph store
//! as the relation blob and published to the hot cache as the merged view.
//!
//! Every write uses upsert/merge semantics and progress is persisted after
//! each page, so an ingest interrupted at any point can be re-run safely;
//! it resumes from the page cursor and re-merges into the existing blob.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cache::{keys, CacheError, HotCache};
use crate::config::Settings;
use crate::models::{
    item_edge, item_neighbor, item_neighbor_id, IngestProgress, IngestState, RelationKind,
    RelationView,
};
use crate::store::{GraphStore, StoreError};
use crate::upstream::{UpstreamClient, UpstreamError};
use crate::DEFAULT_RELATION_FIELDS;

/// Errors that can occur during a relation ingest run.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Upstream pagination failed after internal retries
    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    /// Graph store persistence failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Hot cache failure
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

/// Result type for ingest operations.
pub type IngestResult<T> = Result<T, IngestError>;

/// Outcome of an ingest request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// This run completed the relation (or found it already complete)
    Completed {
        /// Pages fetched by this run
        pages: u64,

        /// Distinct neighbors in the final blob
        neighbors: u64,
    },

    /// Another task holds the ingest token for this `(paper, kind)`
    AlreadyRunning,
}

/// Paginates large relations out of Upstream and persists them.
pub struct RelationIngestor<U, C, S> {
    upstream: Arc<U>,
    cache: Arc<C>,
    store: Arc<S>,
    settings: Arc<Settings>,
}

impl<U, C, S> RelationIngestor<U, C, S>
where
    U: UpstreamClient + 'static,
    C: HotCache + 'static,
    S: GraphStore + 'static,
{
    pub fn new(upstream: Arc<U>, cache: Arc<C>, store: Arc<S>, settings: Arc<Settings>) -> Self {
        Self {
            upstream,
            cache,
            store,
            settings,
        }
    }

    /// Run one ingest for `(paper_id, kind)`, guarded by a single-flight
    /// token so at most one task works per relation at a time.
    ///
    /// # Errors
    /// Returns the underlying failure after marking progress `failed`;
    /// partial pages persisted before the failure are kept.
    pub async fn ingest(&self, paper_id: &str, kind: RelationKind) -> IngestResult<IngestOutcome> {
        let lock_key = keys::ingest_lock(paper_id, kind);
        let owner = format!("ingest-{:016x}", rand::random::<u64>());
        if !self
            .cache
            .acquire_lock(&lock_key, &owner, self.settings.single_flight_ttl())
            .await?
        {
            debug!(paper_id, kind = kind.as_str(), "ingest already running");
            return Ok(IngestOutcome::AlreadyRunning);
        }

        let result = self.run(paper_id, kind).await;
        if result.is_err() {
            self.mark_failed(paper_id, kind).await;
        }
        if let Err(e) = self.cache.release_lock(&lock_key, &owner).await {
            warn!(error = %e, paper_id, "failed to release ingest token");
        }
        result
    }

    /// Spawn an ingest onto the background task pool.
    ///
    /// Failures are logged, never surfaced: the hot cache already serves
    /// whatever triggered the ingest.
    pub fn spawn(self: &Arc<Self>, paper_id: String, kind: RelationKind)
    where
        U: Send + Sync,
        C: Send + Sync,
        S: Send + Sync,
    {
        let ingestor = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = ingestor.ingest(&paper_id, kind).await {
                error!(error = %e, paper_id, kind = kind.as_str(), "relation ingest failed");
            }
        });
    }

    async fn run(&self, paper_id: &str, kind: RelationKind) -> IngestResult<IngestOutcome> {
        let mut progress = self
            .store
            .get_ingest_progress(paper_id, kind)
            .await?
            .unwrap_or_else(|| IngestProgress::new(paper_id, kind, IngestState::Pending));

        // seed the accumulator from any earlier partial blob, so a resumed
        // run re-merges instead of starting over
        let mut accumulator = Accumulator::default();
        if let Some(existing) = self.store.get_relation_view(paper_id, kind).await? {
            if progress.state == IngestState::Complete && existing.fetched >= existing.total {
                return Ok(IngestOutcome::Completed {
                    pages: 0,
                    neighbors: existing.fetched,
                });
            }
            for item in existing.items {
                accumulator.merge(item, kind);
            }
        } else if progress.state != IngestState::Pending {
            // the blob is gone; whatever the cursor says, start over
            progress.pages_fetched = 0;
            progress.last_page_cursor = None;
        }

        progress.state = IngestState::Running;
        self.save_progress(&mut progress).await?;

        let page_size = self.settings.relation_page_size;
        let mut pages_this_run = 0u64;
        let mut total = progress.expected_total.unwrap_or(0);

        loop {
            if progress.pages_fetched >= self.settings.relation_page_cap {
                warn!(
                    paper_id,
                    kind = kind.as_str(),
                    cap = self.settings.relation_page_cap,
                    "ingest page cap reached"
                );
                break;
            }
            let offset = progress.pages_fetched * page_size;
            if progress.expected_total.is_some_and(|t| offset >= t) {
                break;
            }

            let page = self
                .upstream
                .fetch_relation_page(paper_id, kind, offset, page_size, Some(DEFAULT_RELATION_FIELDS))
                .await?;
            total = page.total;
            progress.expected_total = Some(page.total);

            self.persist_page(paper_id, kind, &page.items).await?;
            let page_index = progress.pages_fetched;
            self.cache
                .set(
                    &keys::relation_page(paper_id, kind, page_index),
                    &Value::Array(page.items.clone()),
                    self.settings.relation_ttl(),
                )
                .await?;

            for item in page.items {
                accumulator.merge(item, kind);
            }

            progress.pages_fetched += 1;
            progress.last_page_cursor = page.next;
            self.save_progress(&mut progress).await?;
            pages_this_run += 1;

            if page.next.is_none() {
                break;
            }
        }

        let items = accumulator.into_items();
        let neighbors = items.len() as u64;
        self.store
            .store_relation_blob(paper_id, kind, &items, total)
            .await?;
        self.cache
            .set(
                &keys::relation_view(paper_id, kind),
                &serde_json::to_value(RelationView {
                    total,
                    fetched: neighbors,
                    items,
                })
                .map_err(|e| CacheError::Serialization(e.to_string()))?,
                self.settings.relation_ttl(),
            )
            .await?;

        progress.state = IngestState::Complete;
        self.save_progress(&mut progress).await?;
        info!(
            paper_id,
            kind = kind.as_str(),
            pages = pages_this_run,
            neighbors,
            total,
            "relation ingest complete"
        );

        Ok(IngestOutcome::Completed {
            pages: pages_this_run,
            neighbors,
        })
    }

    /// Persist one page's neighbors as stubs and its edges into the store.
    async fn persist_page(
        &self,
        paper_id: &str,
        kind: RelationKind,
        items: &[Value],
    ) -> IngestResult<()> {
        let mut stubs = Vec::new();
        let mut edges = Vec::new();
        for item in items {
            let Some(neighbor_id) = item_neighbor_id(item, kind) else {
                continue;
            };
            if let Some(neighbor) = item_neighbor(item, kind) {
                stubs.push((neighbor_id.to_string(), neighbor.clone()));
            }
            if let Some(edge) = item_edge(paper_id, item, kind) {
                edges.push(edge);
            }
        }

        self.store.upsert_neighbor_stubs(&stubs).await?;
        self.store.merge_edge_set(&edges).await?;
        Ok(())
    }

    async fn save_progress(&self, progress: &mut IngestProgress) -> IngestResult<()> {
        progress.updated_at = crate::models::now_unix();
        self.store.set_ingest_progress(progress).await?;
        // mirror for cheap reads next to the cached view; best-effort
        if let Ok(value) = serde_json::to_value(&*progress) {
            let key = keys::ingest_progress(&progress.paper_id, progress.kind);
            if let Err(e) = self.cache.set(&key, &value, self.settings.relation_ttl()).await {
                warn!(error = %e, "failed to mirror ingest progress to cache");
            }
        }
        Ok(())
    }

    async fn mark_failed(&self, paper_id: &str, kind: RelationKind) {
        if let Ok(Some(mut progress)) = self.store.get_ingest_progress(paper_id, kind).await {
            progress.state = IngestState::Failed;
            progress.updated_at = crate::models::now_unix();
            if let Err(e) = self.store.set_ingest_progress(&progress).await {
                error!(error = %e, paper_id, "failed to persist failed ingest state");
            }
        }
    }
}

/// Order-preserving accumulator deduplicating relation items by neighbor
/// id, with field-wise last-writer-wins on re-merge.
#[derive(Default)]
struct Accumulator {
    items: Vec<Value>,
    index: HashMap<String, usize>,
}

impl Accumulator {
    fn merge(&mut self, item: Value, kind: RelationKind) {
        let Some(neighbor_id) = item_neighbor_id(&item, kind).map(str::to_owned) else {
            return;
        };
        match self.index.get(&neighbor_id) {
            Some(&pos) => overlay(&mut self.items[pos], &item),
            None => {
                self.index.insert(neighbor_id, self.items.len());
                self.items.push(item);
            }
        }
    }

    fn into_items(self) -> Vec<Value> {
        self.items
    }
}

/// Field-wise overlay: non-null incoming fields win, nested objects merge
/// recursively.
fn overlay(dst: &mut Value, src: &Value) {
    if let (Value::Object(dst_map), Value::Object(src_map)) = (&mut *dst, src) {
        for (key, value) in src_map {
            if value.is_null() {
                continue;
            }
            match dst_map.get_mut(key) {
                Some(existing) if existing.is_object() && value.is_object() => {
                    overlay(existing, value)
                }
                _ => {
                    dst_map.insert(key.clone(), value.clone());
                }
            }
        }
    } else if !src.is_null() {
        *dst = src.clone();
    }
}
