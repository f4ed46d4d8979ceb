//! Caching proxy for the Semantic Scholar academic graph.
//!
//! Clients issue read-only paper queries (details, citations, references,
//! search, batch lookups) in Upstream's JSON shapes; the proxy answers
//! from a tiered local store whenever possible and forwards to Upstream
//! otherwise, opportunistically populating the local tiers.
//!
//! # Architecture
//!
//! The system is organized into several key modules:
//!
//! - **models**: core data structures (paper records, relation pages,
//!   citation edges, ingest progress)
//! - **fields**: field-expression parsing and the pure record projector
//! - **alias**: external-id normalization and the durable alias index
//! - **cache**: the short-TTL hot tier with single-flight tokens
//! - **store**: the durable graph store (papers, edges, relation blobs)
//! - **upstream**: the rate-limited, retrying Upstream client
//! - **resolver**: the tiered read path and the post-fetch write fan-out
//! - **ingest**: background pagination of large relation lists
//! - **search**: fingerprint-keyed search result caching
//! - **server**: inbound DTOs and the deadline-applying service facade
//!
//! # Read path
//!
//! A paper request resolves identity through the alias index, then walks
//! hot cache → negative cache → graph store (when fresh) → single-flight
//! token → Upstream. Concurrent cold requests for one paper coalesce into
//! a single Upstream call; writers fan persistence out to the background
//! so the hot cache alone gates the response.

pub mod alias;
pub mod cache;
pub mod config;
pub mod fields;
pub mod ingest;
pub mod models;
pub mod resolver;
pub mod search;
pub mod server;
pub mod store;
pub mod upstream;

pub use alias::sqlite::SqliteAliasIndex;
pub use alias::{AliasIndex, AliasKind, PaperRef};
pub use cache::memory::MemoryCache;
pub use cache::HotCache;
pub use config::Settings;
pub use fields::FieldExpr;
pub use models::{IngestStatus, PaperRecord, RelationKind};
pub use resolver::{PaperResolver, ResolveError};
pub use search::SearchCoordinator;
pub use server::ProxyService;
pub use store::sqlite::SqliteGraphStore;
pub use store::GraphStore;
pub use upstream::http::HttpUpstreamClient;
pub use upstream::UpstreamClient;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Field set requested when fetching a paper body from Upstream.
///
/// Deliberately wide: the stored record is the superset every later
/// projection narrows. Inline citations/references carry identity and a
/// summary; full lists come from the relation ingestor.
pub const DEFAULT_FETCH_FIELDS: &str = "paperId,corpusId,title,abstract,year,venue,\
publicationDate,publicationTypes,publicationVenue,journal,externalIds,url,\
openAccessPdf,isOpenAccess,fieldsOfStudy,s2FieldsOfStudy,citationCount,\
referenceCount,influentialCitationCount,citationStyles,tldr,\
authors.authorId,authors.name,\
citations.paperId,citations.title,citations.year,\
references.paperId,references.title,references.year";

/// Field set requested for relation pages.
///
/// Edge attributes plus a neighbor summary; paper paths apply to the
/// nested citing/cited paper.
pub const DEFAULT_RELATION_FIELDS: &str = "contexts,intents,isInfluential,\
paperId,title,year,venue,citationCount,externalIds,authors.authorId,authors.name";

/// Field set requested for search results.
pub const DEFAULT_SEARCH_FIELDS: &str = "paperId,title,abstract,year,venue,\
citationCount,referenceCount,influentialCitationCount,fieldsOfStudy,\
externalIds,url,authors.authorId,authors.name";
