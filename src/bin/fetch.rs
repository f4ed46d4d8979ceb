//! Fetch binary entry point.
//!
//! Command-line front end over the full read path: resolves a paper
//! reference through the alias index, hot cache, graph store, and
//! Upstream, and prints the projected record as JSON. Useful for smoke
//! tests and for warming the durable tiers from scripts.
//!
//! # Examples
//!
//! Fetch by canonical id:
//! ```bash
//! fetch 649def34f8be52c8b66281af98ae884c09aef38b --fields title,year
//! ```
//!
//! Fetch by DOI and page its citations:
//! ```bash
//! fetch DOI:10.18653/v1/N18-3011 --relation citations --offset 0 --limit 20
//! ```

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use scholar_proxy::{
    HttpUpstreamClient, MemoryCache, ProxyService, RelationKind, Settings, SqliteAliasIndex,
    SqliteGraphStore,
};

/// Which relation list to page instead of the paper body.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Relation {
    Citations,
    References,
}

impl From<Relation> for RelationKind {
    fn from(r: Relation) -> Self {
        match r {
            Relation::Citations => RelationKind::Citations,
            Relation::References => RelationKind::References,
        }
    }
}

/// Resolve a paper reference through the caching proxy tiers.
#[derive(Parser, Debug)]
#[command(name = "fetch", version, about = "Fetch a paper through the proxy's read path")]
struct Args {
    /// Paper reference: canonical 40-hex id or PREFIX:value
    /// (DOI:, ARXIV:, CORPUS_ID:, MAG:, ACL:, PMID:, PMCID:, URL:, DBLP:)
    #[arg(value_name = "REF")]
    paper_ref: String,

    /// Comma-separated field expression (e.g. "title,year,authors.name")
    #[arg(long, value_name = "FIELDS")]
    fields: Option<String>,

    /// Page a relation list instead of fetching the body
    #[arg(long, value_enum)]
    relation: Option<Relation>,

    /// Relation page offset
    #[arg(long, default_value = "0")]
    offset: u64,

    /// Relation page size
    #[arg(long, default_value = "10")]
    limit: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let settings = Arc::new(Settings::from_env());

    for path in [&settings.alias_db_path, &settings.graph_db_path] {
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }
    }

    let upstream = Arc::new(
        HttpUpstreamClient::new(settings.upstream_config())
            .context("building upstream client")?,
    );
    let cache = Arc::new(MemoryCache::new());
    let store = Arc::new(
        SqliteGraphStore::open(&settings.graph_db_path).context("opening graph database")?,
    );
    let aliases = Arc::new(
        SqliteAliasIndex::open(&settings.alias_db_path).context("opening alias database")?,
    );
    let service = ProxyService::new(upstream, cache, store, aliases, settings);

    let output = match args.relation {
        Some(relation) => {
            let response = match RelationKind::from(relation) {
                RelationKind::Citations => {
                    service
                        .get_citations(args.paper_ref, args.offset, args.limit, args.fields)
                        .await
                }
                RelationKind::References => {
                    service
                        .get_references(args.paper_ref, args.offset, args.limit, args.fields)
                        .await
                }
            };
            serde_json::to_value(response.map_err(|e| anyhow::anyhow!("{e}"))?)?
        }
        None => service
            .get_paper(args.paper_ref, args.fields)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
