//! Graph store abstraction.
//!
//! The graph store is the durable tier: paper nodes, directed citation
//! edges, merged relation blobs, and ingest progress cursors. It is the
//! source of truth whenever its copy is fresh; the resolver consults it
//! between the hot cache and Upstream.

pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::models::{
    now_unix, CitationEdge, IngestProgress, PaperRecord, RelationKind, RelationSlice,
    RelationView,
};

/// Errors that can occur during graph store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database connection failure
    #[error("store connection failed: {0}")]
    Connection(String),

    /// Query execution failure
    #[error("store query failed: {0}")]
    Query(String),

    /// Stored document could not be encoded or decoded
    #[error("store serialization error: {0}")]
    Serialization(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// True iff the record is recent enough to serve without re-fetching.
///
/// Measured against `metadata_updated_at`; records that never carried a
/// timestamp are never fresh.
pub fn is_fresh(record: &PaperRecord, window: Duration) -> bool {
    match record.metadata_updated_at {
        Some(updated) => now_unix() - updated < window.as_secs() as i64,
        None => false,
    }
}

/// Aggregate statistics over the graph store, for operator tooling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphStats {
    pub papers: u64,
    pub full_papers: u64,
    pub stub_papers: u64,
    pub edges: u64,
    pub relation_blobs: u64,
}

/// Durable store of papers, citation edges, relation blobs, and ingest
/// progress.
///
/// All write operations use upsert/merge semantics so that re-running any
/// ingest step from any point is safe.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Fetch a paper node by canonical id.
    async fn get_paper(&self, paper_id: &str) -> StoreResult<Option<PaperRecord>>;

    /// Insert or merge a paper node.
    ///
    /// Merge semantics follow [`PaperRecord::merge_from`]: provided fields
    /// overlay stored ones, `ingest_status` never downgrades, timestamps
    /// only advance.
    async fn upsert_paper(&self, record: &PaperRecord) -> StoreResult<()>;

    /// Create missing papers as stubs from `(paper_id, summary)` pairs.
    ///
    /// Existing nodes are left untouched. Returns how many stubs were
    /// created.
    async fn upsert_neighbor_stubs(&self, neighbors: &[(String, Value)]) -> StoreResult<u64>;

    /// Merge pre-built directed edges; at most one edge survives per
    /// ordered pair. Returns how many rows were written.
    async fn merge_edge_set(&self, edges: &[CitationEdge]) -> StoreResult<u64>;

    /// Merge edges from one citing paper to many cited papers.
    async fn merge_edges(&self, citing: &str, cited: &[String]) -> StoreResult<u64> {
        let edges: Vec<CitationEdge> = cited
            .iter()
            .map(|c| CitationEdge::new(citing, c.clone()))
            .collect();
        self.merge_edge_set(&edges).await
    }

    /// Merge edges from many citing papers to one cited paper.
    async fn merge_edges_reverse(&self, cited: &str, citing: &[String]) -> StoreResult<u64> {
        let edges: Vec<CitationEdge> = citing
            .iter()
            .map(|c| CitationEdge::new(c.clone(), cited))
            .collect();
        self.merge_edge_set(&edges).await
    }

    /// Atomically replace the merged relation blob for `(paper_id, kind)`.
    async fn store_relation_blob(
        &self,
        paper_id: &str,
        kind: RelationKind,
        items: &[Value],
        total: u64,
    ) -> StoreResult<()>;

    /// The whole merged relation view, when a blob exists.
    async fn get_relation_view(
        &self,
        paper_id: &str,
        kind: RelationKind,
    ) -> StoreResult<Option<RelationView>>;

    /// A bounded slice out of the relation blob, when one exists.
    async fn get_relation_slice(
        &self,
        paper_id: &str,
        kind: RelationKind,
        offset: u64,
        limit: u64,
    ) -> StoreResult<Option<RelationSlice>>;

    /// Current ingest progress for `(paper_id, kind)`.
    async fn get_ingest_progress(
        &self,
        paper_id: &str,
        kind: RelationKind,
    ) -> StoreResult<Option<IngestProgress>>;

    /// Persist an ingest progress record (replace whole).
    async fn set_ingest_progress(&self, progress: &IngestProgress) -> StoreResult<()>;

    /// Papers whose normalized title starts with `prefix`, for the
    /// best-effort local search mode.
    async fn find_by_title_prefix(
        &self,
        prefix: &str,
        limit: u64,
    ) -> StoreResult<Vec<PaperRecord>>;

    /// Aggregate statistics for operator tooling.
    async fn statistics(&self) -> StoreResult<GraphStats>;
}
