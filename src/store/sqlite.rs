//! SQLite-backed graph store.
//!
//! Four tables: `papers` (nodes, with the full document as a JSON column
//! and a normalized-title column for local search), `edges` (one row per
//! ordered citing/cited pair), `relation_blobs` (merged neighbor lists,
//! one row per paper and kind), and `ingest_progress`.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use super::{GraphStats, GraphStore, StoreError, StoreResult};
use crate::alias::normalize_title;
use crate::models::{
    now_unix, CitationEdge, IngestProgress, IngestState, IngestStatus, PaperRecord,
    RelationKind, RelationSlice, RelationView,
};

/// SQLite implementation of [`GraphStore`].
pub struct SqliteGraphStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteGraphStore {
    /// Open (and create if needed) the graph database at `path`.
    ///
    /// # Errors
    /// Returns `StoreError::Connection` if the file cannot be opened, or
    /// `StoreError::Query` if the schema cannot be created.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let connection =
            Connection::open(path).map_err(|e| StoreError::Connection(e.to_string()))?;
        let store = Self {
            connection: Arc::new(Mutex::new(connection)),
        };
        store.create_schema()?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let connection =
            Connection::open_in_memory().map_err(|e| StoreError::Connection(e.to_string()))?;
        let store = Self {
            connection: Arc::new(Mutex::new(connection)),
        };
        store.create_schema()?;
        Ok(store)
    }

    fn create_schema(&self) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS papers (
                paper_id            TEXT PRIMARY KEY,
                ingest_status       TEXT NOT NULL,
                fetched_at          INTEGER,
                metadata_updated_at INTEGER,
                title_norm          TEXT,
                data                TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_papers_title_norm ON papers(title_norm);

            CREATE TABLE IF NOT EXISTS edges (
                citing_paper_id TEXT NOT NULL,
                cited_paper_id  TEXT NOT NULL,
                contexts        TEXT,
                intents         TEXT,
                is_influential  INTEGER,
                PRIMARY KEY (citing_paper_id, cited_paper_id)
            );
            CREATE INDEX IF NOT EXISTS idx_edges_cited ON edges(cited_paper_id);

            CREATE TABLE IF NOT EXISTS relation_blobs (
                paper_id   TEXT NOT NULL,
                kind       TEXT NOT NULL,
                total      INTEGER NOT NULL,
                items      TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (paper_id, kind)
            );

            CREATE TABLE IF NOT EXISTS ingest_progress (
                paper_id         TEXT NOT NULL,
                kind             TEXT NOT NULL,
                state            TEXT NOT NULL,
                expected_total   INTEGER,
                pages_fetched    INTEGER NOT NULL,
                last_page_cursor INTEGER,
                updated_at       INTEGER NOT NULL,
                PRIMARY KEY (paper_id, kind)
            );",
        )
        .map_err(query_err)?;
        info!("graph store schema ready");
        Ok(())
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Connection>> {
        self.connection
            .lock()
            .map_err(|e| StoreError::Connection(format!("connection lock poisoned: {e}")))
    }
}

fn query_err(e: rusqlite::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

fn ser_err(e: serde_json::Error) -> StoreError {
    StoreError::Serialization(e.to_string())
}

fn status_str(status: IngestStatus) -> &'static str {
    match status {
        IngestStatus::Stub => "stub",
        IngestStatus::Full => "full",
    }
}

fn status_from(s: &str) -> IngestStatus {
    match s {
        "full" => IngestStatus::Full,
        _ => IngestStatus::Stub,
    }
}

fn state_str(state: IngestState) -> &'static str {
    match state {
        IngestState::Pending => "pending",
        IngestState::Running => "running",
        IngestState::Complete => "complete",
        IngestState::Failed => "failed",
    }
}

fn state_from(s: &str) -> IngestState {
    match s {
        "running" => IngestState::Running,
        "complete" => IngestState::Complete,
        "failed" => IngestState::Failed,
        _ => IngestState::Pending,
    }
}

fn row_to_record(
    paper_id: String,
    status: String,
    fetched_at: Option<i64>,
    metadata_updated_at: Option<i64>,
    data: String,
) -> StoreResult<PaperRecord> {
    Ok(PaperRecord {
        paper_id,
        ingest_status: status_from(&status),
        fetched_at,
        metadata_updated_at,
        data: serde_json::from_str(&data).map_err(ser_err)?,
    })
}

fn get_paper_sync(conn: &Connection, paper_id: &str) -> StoreResult<Option<PaperRecord>> {
    conn.query_row(
        "SELECT paper_id, ingest_status, fetched_at, metadata_updated_at, data
         FROM papers WHERE paper_id = ?1",
        params![paper_id],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<i64>>(2)?,
                row.get::<_, Option<i64>>(3)?,
                row.get::<_, String>(4)?,
            ))
        },
    )
    .optional()
    .map_err(query_err)?
    .map(|(id, status, fetched, updated, data)| row_to_record(id, status, fetched, updated, data))
    .transpose()
}

fn write_paper_sync(conn: &Connection, record: &PaperRecord) -> StoreResult<()> {
    let title_norm = record.title().map(normalize_title);
    let data = serde_json::to_string(&record.data).map_err(ser_err)?;
    conn.execute(
        "INSERT OR REPLACE INTO papers
         (paper_id, ingest_status, fetched_at, metadata_updated_at, title_norm, data)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            record.paper_id,
            status_str(record.ingest_status),
            record.fetched_at,
            record.metadata_updated_at,
            title_norm,
            data
        ],
    )
    .map_err(query_err)?;
    Ok(())
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    async fn get_paper(&self, paper_id: &str) -> StoreResult<Option<PaperRecord>> {
        let conn = self.lock()?;
        get_paper_sync(&conn, paper_id)
    }

    async fn upsert_paper(&self, record: &PaperRecord) -> StoreResult<()> {
        let conn = self.lock()?;
        let merged = match get_paper_sync(&conn, &record.paper_id)? {
            Some(mut existing) => {
                existing.merge_from(record);
                existing
            }
            None => record.clone(),
        };
        write_paper_sync(&conn, &merged)?;
        debug!(paper_id = record.paper_id, "paper upserted");
        Ok(())
    }

    async fn upsert_neighbor_stubs(&self, neighbors: &[(String, Value)]) -> StoreResult<u64> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(query_err)?;
        let mut created = 0u64;

        for (paper_id, summary) in neighbors {
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM papers WHERE paper_id = ?1",
                    params![paper_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(query_err)?;
            if exists.is_some() {
                continue;
            }

            let stub = PaperRecord::stub(paper_id.clone(), summary.clone());
            let title_norm = stub.title().map(normalize_title);
            let data = serde_json::to_string(&stub.data).map_err(ser_err)?;
            tx.execute(
                "INSERT INTO papers
                 (paper_id, ingest_status, fetched_at, metadata_updated_at, title_norm, data)
                 VALUES (?1, 'stub', NULL, ?2, ?3, ?4)",
                params![stub.paper_id, stub.metadata_updated_at, title_norm, data],
            )
            .map_err(query_err)?;
            created += 1;
        }

        tx.commit().map_err(query_err)?;
        Ok(created)
    }

    async fn merge_edge_set(&self, edges: &[CitationEdge]) -> StoreResult<u64> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(query_err)?;
        let mut written = 0u64;

        for edge in edges {
            let has_attrs =
                edge.contexts.is_some() || edge.intents.is_some() || edge.is_influential.is_some();
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM edges WHERE citing_paper_id = ?1 AND cited_paper_id = ?2",
                    params![edge.citing_paper_id, edge.cited_paper_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(query_err)?;

            // attribute set is last-writer-wins, but a bare edge never
            // erases attributes an earlier writer provided
            if exists.is_some() && !has_attrs {
                continue;
            }

            let contexts = edge
                .contexts
                .as_ref()
                .map(|c| serde_json::to_string(c))
                .transpose()
                .map_err(ser_err)?;
            let intents = edge
                .intents
                .as_ref()
                .map(|i| serde_json::to_string(i))
                .transpose()
                .map_err(ser_err)?;

            tx.execute(
                "INSERT OR REPLACE INTO edges
                 (citing_paper_id, cited_paper_id, contexts, intents, is_influential)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    edge.citing_paper_id,
                    edge.cited_paper_id,
                    contexts,
                    intents,
                    edge.is_influential
                ],
            )
            .map_err(query_err)?;
            written += 1;
        }

        tx.commit().map_err(query_err)?;
        Ok(written)
    }

    async fn store_relation_blob(
        &self,
        paper_id: &str,
        kind: RelationKind,
        items: &[Value],
        total: u64,
    ) -> StoreResult<()> {
        let items_json = serde_json::to_string(items).map_err(ser_err)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO relation_blobs (paper_id, kind, total, items, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![paper_id, kind.as_str(), total, items_json, now_unix()],
        )
        .map_err(query_err)?;
        debug!(paper_id, kind = kind.as_str(), total, "relation blob stored");
        Ok(())
    }

    async fn get_relation_view(
        &self,
        paper_id: &str,
        kind: RelationKind,
    ) -> StoreResult<Option<RelationView>> {
        let conn = self.lock()?;
        let row: Option<(u64, String)> = conn
            .query_row(
                "SELECT total, items FROM relation_blobs WHERE paper_id = ?1 AND kind = ?2",
                params![paper_id, kind.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(query_err)?;

        match row {
            Some((total, items_json)) => {
                let items: Vec<Value> = serde_json::from_str(&items_json).map_err(ser_err)?;
                Ok(Some(RelationView {
                    total,
                    fetched: items.len() as u64,
                    items,
                }))
            }
            None => Ok(None),
        }
    }

    async fn get_relation_slice(
        &self,
        paper_id: &str,
        kind: RelationKind,
        offset: u64,
        limit: u64,
    ) -> StoreResult<Option<RelationSlice>> {
        let view = match self.get_relation_view(paper_id, kind).await? {
            Some(view) => view,
            None => return Ok(None),
        };

        let start = (offset as usize).min(view.items.len());
        let end = start.saturating_add(limit as usize).min(view.items.len());
        Ok(Some(RelationSlice {
            total: view.total,
            offset,
            items: view.items[start..end].to_vec(),
        }))
    }

    async fn get_ingest_progress(
        &self,
        paper_id: &str,
        kind: RelationKind,
    ) -> StoreResult<Option<IngestProgress>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT state, expected_total, pages_fetched, last_page_cursor, updated_at
             FROM ingest_progress WHERE paper_id = ?1 AND kind = ?2",
            params![paper_id, kind.as_str()],
            |row| {
                Ok(IngestProgress {
                    paper_id: paper_id.to_string(),
                    kind,
                    state: state_from(&row.get::<_, String>(0)?),
                    expected_total: row.get(1)?,
                    pages_fetched: row.get(2)?,
                    last_page_cursor: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(query_err)
    }

    async fn set_ingest_progress(&self, progress: &IngestProgress) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO ingest_progress
             (paper_id, kind, state, expected_total, pages_fetched, last_page_cursor, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                progress.paper_id,
                progress.kind.as_str(),
                state_str(progress.state),
                progress.expected_total,
                progress.pages_fetched,
                progress.last_page_cursor,
                progress.updated_at
            ],
        )
        .map_err(query_err)?;
        Ok(())
    }

    async fn find_by_title_prefix(
        &self,
        prefix: &str,
        limit: u64,
    ) -> StoreResult<Vec<PaperRecord>> {
        let pattern = format!("{}%", prefix.replace('%', "").replace('_', ""));
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT paper_id, ingest_status, fetched_at, metadata_updated_at, data
                 FROM papers WHERE title_norm LIKE ?1 AND ingest_status = 'full'
                 LIMIT ?2",
            )
            .map_err(query_err)?;
        let rows = stmt
            .query_map(params![pattern, limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(query_err)?;

        let mut out = Vec::new();
        for row in rows {
            let (id, status, fetched, updated, data) = row.map_err(query_err)?;
            out.push(row_to_record(id, status, fetched, updated, data)?);
        }
        Ok(out)
    }

    async fn statistics(&self) -> StoreResult<GraphStats> {
        let conn = self.lock()?;
        let papers: u64 = conn
            .query_row("SELECT COUNT(*) FROM papers", [], |r| r.get(0))
            .map_err(query_err)?;
        let full_papers: u64 = conn
            .query_row(
                "SELECT COUNT(*) FROM papers WHERE ingest_status = 'full'",
                [],
                |r| r.get(0),
            )
            .map_err(query_err)?;
        let edges: u64 = conn
            .query_row("SELECT COUNT(*) FROM edges", [], |r| r.get(0))
            .map_err(query_err)?;
        let relation_blobs: u64 = conn
            .query_row("SELECT COUNT(*) FROM relation_blobs", [], |r| r.get(0))
            .map_err(query_err)?;

        Ok(GraphStats {
            papers,
            full_papers,
            stub_papers: papers - full_papers,
            edges,
            relation_blobs,
        })
    }
}
