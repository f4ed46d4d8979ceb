//! Core data models for the caching proxy.
//!
//! This module contains the fundamental data structures shared across the
//! tiers: the canonical paper record envelope, relation pages and merged
//! views, citation edges, and ingest progress records.
//!
//! Paper documents themselves are schema-free `serde_json::Value` trees in
//! the Upstream JSON shape; the structs here are typed envelopes that carry
//! the metadata the proxy needs (identity, freshness, ingest status) without
//! re-declaring Upstream's full schema.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as unix seconds.
pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// How a paper entered the graph store.
///
/// `Stub` papers are known only as neighbor references discovered during
/// relation ingest; `Full` papers have been fetched in their own right.
/// A paper never moves from `Full` back to `Stub`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    /// Known only as a neighbor reference; minimal fields
    Stub,

    /// Fetched in its own right; full record
    Full,
}

/// The two relation kinds a paper carries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    /// Papers that cite this paper
    Citations,

    /// Papers this paper cites
    References,
}

impl RelationKind {
    /// Lowercase wire/key name (`citations` / `references`).
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::Citations => "citations",
            RelationKind::References => "references",
        }
    }

    /// Key under which a relation item nests its neighbor document,
    /// following Upstream's shape (`citingPaper` for citations,
    /// `citedPaper` for references).
    pub fn neighbor_key(&self) -> &'static str {
        match self {
            RelationKind::Citations => "citingPaper",
            RelationKind::References => "citedPaper",
        }
    }

    /// Count field on the paper body announcing the relation's size.
    pub fn count_field(&self) -> &'static str {
        match self {
            RelationKind::Citations => "citationCount",
            RelationKind::References => "referenceCount",
        }
    }
}

impl std::fmt::Display for RelationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical paper entity: a typed envelope over the Upstream-shaped
/// JSON document.
///
/// `data` holds the full document under Upstream field names (`title`,
/// `abstract`, `authors`, `citationCount`, `externalIds`, ...). The
/// envelope fields are what the proxy itself reasons about: identity,
/// ingest status, and freshness timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperRecord {
    /// Canonical 40-hex paper id assigned by Upstream
    pub paper_id: String,

    /// Stub or full record
    pub ingest_status: IngestStatus,

    /// When the document was last fetched from Upstream (unix seconds)
    pub fetched_at: Option<i64>,

    /// When the stored metadata last changed (unix seconds)
    pub metadata_updated_at: Option<i64>,

    /// Full Upstream-shaped document
    pub data: Value,
}

impl PaperRecord {
    /// Build a full record from a freshly fetched Upstream document.
    ///
    /// Both timestamps are stamped with the current time.
    pub fn from_upstream(paper_id: impl Into<String>, data: Value) -> Self {
        let now = now_unix();
        Self {
            paper_id: paper_id.into(),
            ingest_status: IngestStatus::Full,
            fetched_at: Some(now),
            metadata_updated_at: Some(now),
            data,
        }
    }

    /// Build a stub record from a neighbor summary discovered during
    /// relation ingest.
    pub fn stub(paper_id: impl Into<String>, data: Value) -> Self {
        Self {
            paper_id: paper_id.into(),
            ingest_status: IngestStatus::Stub,
            fetched_at: None,
            metadata_updated_at: Some(now_unix()),
            data,
        }
    }

    /// Merge a newer record into this one.
    ///
    /// Field-wise overlay over the JSON documents: incoming non-null values
    /// win, existing values survive where the incoming document is silent or
    /// null. `ingest_status` never downgrades from `Full` to `Stub`, and
    /// timestamps only move forward.
    pub fn merge_from(&mut self, incoming: &PaperRecord) {
        if let (Value::Object(current), Value::Object(new)) = (&mut self.data, &incoming.data) {
            for (key, value) in new {
                if !value.is_null() {
                    current.insert(key.clone(), value.clone());
                }
            }
        } else if !incoming.data.is_null() {
            self.data = incoming.data.clone();
        }

        if incoming.ingest_status == IngestStatus::Full {
            self.ingest_status = IngestStatus::Full;
        }
        self.fetched_at = max_opt(self.fetched_at, incoming.fetched_at);
        self.metadata_updated_at = max_opt(self.metadata_updated_at, incoming.metadata_updated_at);
    }

    /// Title from the document, if present.
    pub fn title(&self) -> Option<&str> {
        self.data.get("title").and_then(Value::as_str)
    }

    /// The `externalIds` map from the document, if present.
    pub fn external_ids(&self) -> Option<&serde_json::Map<String, Value>> {
        self.data.get("externalIds").and_then(Value::as_object)
    }

    /// Announced relation count for the given kind, if present.
    pub fn relation_count(&self, kind: RelationKind) -> Option<u64> {
        self.data.get(kind.count_field()).and_then(Value::as_u64)
    }
}

fn max_opt(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

/// One page of a paginated relation list as returned by Upstream.
///
/// Items keep Upstream's shape: edge attributes (`contexts`, `intents`,
/// `isInfluential`) alongside the neighbor document nested under
/// `citingPaper` / `citedPaper`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationPage {
    /// Total items in the relation, as announced by Upstream
    pub total: u64,

    /// Offset of this page
    pub offset: u64,

    /// Offset of the next page; absent signals the end
    pub next: Option<u64>,

    /// Relation items in Upstream shape
    pub items: Vec<Value>,
}

/// Merged relation view held in the hot cache.
///
/// `fetched` counts how many distinct neighbors the view currently holds;
/// a view with `fetched < total` is partial and the ingestor backfills it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationView {
    /// Total items in the relation, as announced by Upstream
    pub total: u64,

    /// Distinct neighbors currently present in `items`
    pub fetched: u64,

    /// Relation items in Upstream shape, deduplicated by neighbor id
    pub items: Vec<Value>,
}

/// A bounded slice of a relation blob served from the graph store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationSlice {
    pub total: u64,
    pub offset: u64,
    pub items: Vec<Value>,
}

/// State of a relation ingest run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IngestState {
    Pending,
    Running,
    Complete,
    Failed,
}

/// Persistent cursor describing how far pagination of one relation has
/// advanced. Keyed by `(paper_id, kind)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestProgress {
    pub paper_id: String,
    pub kind: RelationKind,
    pub state: IngestState,

    /// Total the relation is expected to reach, when known
    pub expected_total: Option<u64>,

    /// Pages successfully fetched and persisted so far
    pub pages_fetched: u64,

    /// Offset cursor for the next page, when Upstream provided one
    pub last_page_cursor: Option<u64>,

    /// Last state change (unix seconds)
    pub updated_at: i64,
}

impl IngestProgress {
    /// Fresh progress record in the given state.
    pub fn new(paper_id: impl Into<String>, kind: RelationKind, state: IngestState) -> Self {
        Self {
            paper_id: paper_id.into(),
            kind,
            state,
            expected_total: None,
            pages_fetched: 0,
            last_page_cursor: None,
            updated_at: now_unix(),
        }
    }
}

/// Directed citation edge with optional attributes.
///
/// At most one edge exists per ordered `(citing, cited)` pair; attributes
/// are replaced as a set on re-merge (last writer wins).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CitationEdge {
    pub citing_paper_id: String,
    pub cited_paper_id: String,

    /// Context snippets in which the citation appears
    pub contexts: Option<Vec<String>>,

    /// Citation intents (e.g. "background", "methodology")
    pub intents: Option<Vec<String>>,

    pub is_influential: Option<bool>,
}

impl CitationEdge {
    /// Bare edge with no attributes.
    pub fn new(citing: impl Into<String>, cited: impl Into<String>) -> Self {
        Self {
            citing_paper_id: citing.into(),
            cited_paper_id: cited.into(),
            contexts: None,
            intents: None,
            is_influential: None,
        }
    }

    /// Edge for one relation item: for `Citations` the neighbor cites the
    /// owning paper, for `References` the owning paper cites the neighbor.
    pub fn from_relation(owner: &str, neighbor: &str, kind: RelationKind) -> Self {
        match kind {
            RelationKind::Citations => Self::new(neighbor, owner),
            RelationKind::References => Self::new(owner, neighbor),
        }
    }
}

/// One page of search results in Upstream shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchPage {
    pub total: u64,
    pub offset: u64,
    pub next: Option<u64>,
    pub items: Vec<Value>,
}

/// Neighbor document nested inside a relation item, for the given kind.
pub fn item_neighbor<'a>(item: &'a Value, kind: RelationKind) -> Option<&'a Value> {
    item.get(kind.neighbor_key())
}

/// Canonical id of the neighbor nested inside a relation item.
pub fn item_neighbor_id<'a>(item: &'a Value, kind: RelationKind) -> Option<&'a str> {
    item_neighbor(item, kind)?.get("paperId")?.as_str()
}

/// Extract the citation edge carried by a relation item in Upstream shape.
pub fn item_edge(owner: &str, item: &Value, kind: RelationKind) -> Option<CitationEdge> {
    let neighbor_id = item_neighbor_id(item, kind)?;
    let mut edge = CitationEdge::from_relation(owner, neighbor_id, kind);
    edge.contexts = item.get("contexts").and_then(string_list);
    edge.intents = item.get("intents").and_then(string_list);
    edge.is_influential = item.get("isInfluential").and_then(Value::as_bool);
    Some(edge)
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    let list = value.as_array()?;
    Some(
        list.iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_keeps_existing_fields_when_incoming_silent() {
        let mut base = PaperRecord::from_upstream(
            "a".repeat(40),
            json!({"paperId": "a".repeat(40), "title": "Old Title", "abstract": "Kept"}),
        );
        let incoming = PaperRecord::from_upstream(
            "a".repeat(40),
            json!({"paperId": "a".repeat(40), "title": "New Title", "year": 2021}),
        );
        base.merge_from(&incoming);

        assert_eq!(base.title(), Some("New Title"));
        assert_eq!(base.data["abstract"], json!("Kept"));
        assert_eq!(base.data["year"], json!(2021));
    }

    #[test]
    fn test_merge_ignores_incoming_nulls() {
        let mut base =
            PaperRecord::from_upstream("a".repeat(40), json!({"title": "Title", "year": 2020}));
        let incoming =
            PaperRecord::from_upstream("a".repeat(40), json!({"title": null, "venue": "ACL"}));
        base.merge_from(&incoming);

        assert_eq!(base.title(), Some("Title"));
        assert_eq!(base.data["venue"], json!("ACL"));
    }

    #[test]
    fn test_merge_never_downgrades_ingest_status() {
        let mut full = PaperRecord::from_upstream("a".repeat(40), json!({"title": "t"}));
        let stub = PaperRecord::stub("a".repeat(40), json!({"title": "t2"}));
        full.merge_from(&stub);
        assert_eq!(full.ingest_status, IngestStatus::Full);

        let mut stub = PaperRecord::stub("a".repeat(40), json!({"title": "t"}));
        let full = PaperRecord::from_upstream("a".repeat(40), json!({"title": "t2"}));
        stub.merge_from(&full);
        assert_eq!(stub.ingest_status, IngestStatus::Full);
    }

    #[test]
    fn test_merge_timestamps_monotonic() {
        let mut base = PaperRecord::from_upstream("a".repeat(40), json!({}));
        base.fetched_at = Some(2_000_000_000);
        base.metadata_updated_at = Some(2_000_000_000);

        let incoming = PaperRecord::from_upstream("a".repeat(40), json!({}));
        base.merge_from(&incoming);

        assert_eq!(base.fetched_at, Some(2_000_000_000));
        assert_eq!(base.metadata_updated_at, Some(2_000_000_000));
    }

    #[test]
    fn test_edge_direction_per_relation_kind() {
        let edge = CitationEdge::from_relation("owner", "nbr", RelationKind::Citations);
        assert_eq!(edge.citing_paper_id, "nbr");
        assert_eq!(edge.cited_paper_id, "owner");

        let edge = CitationEdge::from_relation("owner", "nbr", RelationKind::References);
        assert_eq!(edge.citing_paper_id, "owner");
        assert_eq!(edge.cited_paper_id, "nbr");
    }

    #[test]
    fn test_item_helpers_follow_upstream_shape() {
        let item = json!({
            "contexts": ["In [3] the authors..."],
            "intents": ["background"],
            "isInfluential": true,
            "citingPaper": {"paperId": "b".repeat(40), "title": "Neighbor"}
        });

        let nbr_id: String = "b".repeat(40);
        assert_eq!(
            item_neighbor_id(&item, RelationKind::Citations),
            Some(nbr_id.as_str())
        );
        assert_eq!(item_neighbor_id(&item, RelationKind::References), None);

        let edge = item_edge("owner", &item, RelationKind::Citations).unwrap();
        assert_eq!(edge.citing_paper_id, nbr_id);
        assert_eq!(edge.cited_paper_id, "owner");
        assert_eq!(edge.is_influential, Some(true));
        assert_eq!(
            edge.contexts.as_deref(),
            Some(&["In [3] the authors...".to_string()][..])
        );
    }

    #[test]
    fn test_relation_count_reads_announced_counts() {
        let rec = PaperRecord::from_upstream(
            "a".repeat(40),
            json!({"citationCount": 3500, "referenceCount": 42}),
        );
        assert_eq!(rec.relation_count(RelationKind::Citations), Some(3500));
        assert_eq!(rec.relation_count(RelationKind::References), Some(42));
    }
}
