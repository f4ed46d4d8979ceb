//! Alias database inspection binary.
//!
//! Operator tooling over the alias index: resolve a reference, list a
//! paper's recorded aliases, print aggregate statistics, or clean up
//! mappings that have not been touched in a while.
//!
//! # Examples
//!
//! ```bash
//! aliases stats
//! aliases resolve DOI:10.18653/v1/N18-3011
//! aliases of 649def34f8be52c8b66281af98ae884c09aef38b
//! aliases cleanup --days 90
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use scholar_proxy::alias::{parse_paper_ref, AliasIndex, PaperRef};
use scholar_proxy::{Settings, SqliteAliasIndex};

/// Inspect and maintain the external-id alias database.
#[derive(Parser, Debug)]
#[command(name = "aliases", version, about = "Inspect the alias database")]
struct Args {
    /// Alias database path (defaults to ALIAS_DB_PATH or data/aliases.db)
    #[arg(long, value_name = "PATH")]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print aggregate mapping statistics
    Stats,

    /// Resolve a prefixed reference to its canonical paper id
    Resolve {
        /// Reference, e.g. DOI:10.1038/nature14539
        raw_ref: String,
    },

    /// List every alias recorded for a canonical paper id
    Of {
        /// Canonical 40-hex paper id
        paper_id: String,
    },

    /// Delete mappings not touched for the given number of days
    Cleanup {
        #[arg(long, default_value = "90")]
        days: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let settings = Settings::from_env();
    let db_path = args.db_path.unwrap_or(settings.alias_db_path);
    let index = SqliteAliasIndex::open(&db_path)
        .with_context(|| format!("opening alias database {db_path}"))?;

    match args.command {
        Command::Stats => {
            let stats = index.statistics().await?;
            println!("total mappings:  {}", stats.total_mappings);
            println!("distinct papers: {}", stats.distinct_papers);
            for (kind, count) in &stats.per_kind {
                println!("  {kind:<12} {count}");
            }
        }
        Command::Resolve { raw_ref } => {
            let (kind, value) = match parse_paper_ref(&raw_ref)? {
                PaperRef::Alias { kind, value } => (kind, value),
                PaperRef::Canonical(id) => {
                    println!("{id}");
                    return Ok(());
                }
            };
            match index.resolve(kind, &value).await? {
                Some(paper_id) => println!("{paper_id}"),
                None => bail!("no mapping for {}:{}", kind, value),
            }
        }
        Command::Of { paper_id } => {
            let aliases = index.aliases_of(&paper_id).await?;
            if aliases.is_empty() {
                bail!("no aliases recorded for {paper_id}");
            }
            for (kind, value) in aliases {
                println!("{kind}: {value}");
            }
        }
        Command::Cleanup { days } => {
            let deleted = index.cleanup_older_than(days).await?;
            println!("deleted {deleted} mappings older than {days} days");
        }
    }

    Ok(())
}
