//! SQLite-backed alias index.
//!
//! A single table keyed by `(kind, value)` holds every mapping. Two
//! uniqueness rules are enforced: one target per `(kind, value)` key, and
//! one value per `(paper_id, kind)` pair (re-recording a different value
//! for the same paper and kind replaces the old row, keeping its
//! `created_at`).

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use super::{AliasConflict, AliasError, AliasIndex, AliasKind, AliasResult, AliasStats};
use crate::models::now_unix;

/// SQLite implementation of [`AliasIndex`].
///
/// The connection is wrapped in `Arc<Mutex>` for interior mutability;
/// statements are short enough that contention is not a concern at the
/// proxy's write rates.
pub struct SqliteAliasIndex {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteAliasIndex {
    /// Open (and create if needed) the alias database at `path`.
    ///
    /// # Errors
    /// Returns `AliasError::Database` if the file cannot be opened or the
    /// schema cannot be created.
    pub fn open(path: impl AsRef<Path>) -> AliasResult<Self> {
        let connection = Connection::open(path).map_err(db_err)?;
        let index = Self {
            connection: Arc::new(Mutex::new(connection)),
        };
        index.create_schema()?;
        Ok(index)
    }

    /// In-memory index for tests.
    pub fn open_in_memory() -> AliasResult<Self> {
        let connection = Connection::open_in_memory().map_err(db_err)?;
        let index = Self {
            connection: Arc::new(Mutex::new(connection)),
        };
        index.create_schema()?;
        Ok(index)
    }

    fn create_schema(&self) -> AliasResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS aliases (
                kind        TEXT NOT NULL,
                value       TEXT NOT NULL,
                paper_id    TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL,
                PRIMARY KEY (kind, value)
            );
            CREATE INDEX IF NOT EXISTS idx_aliases_paper ON aliases(paper_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_aliases_paper_kind
                ON aliases(paper_id, kind);",
        )
        .map_err(db_err)?;
        info!("alias index schema ready");
        Ok(())
    }

    fn lock(&self) -> AliasResult<std::sync::MutexGuard<'_, Connection>> {
        self.connection
            .lock()
            .map_err(|e| AliasError::Database(format!("connection lock poisoned: {e}")))
    }
}

fn db_err(e: rusqlite::Error) -> AliasError {
    AliasError::Database(e.to_string())
}

#[async_trait]
impl AliasIndex for SqliteAliasIndex {
    async fn resolve(&self, kind: AliasKind, value: &str) -> AliasResult<Option<String>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT paper_id FROM aliases WHERE kind = ?1 AND value = ?2",
            params![kind.as_str(), value],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }

    async fn record(
        &self,
        paper_id: &str,
        aliases: &[(AliasKind, String)],
    ) -> AliasResult<Vec<AliasConflict>> {
        let mut conflicts = Vec::new();
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let now = now_unix();

        for (kind, value) in aliases {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT paper_id FROM aliases WHERE kind = ?1 AND value = ?2",
                    params![kind.as_str(), value],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;

            match existing.as_deref() {
                Some(target) if target == paper_id => {
                    tx.execute(
                        "UPDATE aliases SET updated_at = ?1 WHERE kind = ?2 AND value = ?3",
                        params![now, kind.as_str(), value],
                    )
                    .map_err(db_err)?;
                }
                Some(target) => {
                    // never repoint an alias; report and keep the original
                    conflicts.push(AliasConflict {
                        kind: *kind,
                        value: value.clone(),
                        existing_paper_id: target.to_string(),
                        attempted_paper_id: paper_id.to_string(),
                    });
                }
                None => {
                    // one value per (paper, kind): replace a stale row,
                    // keeping its created_at
                    let prior: Option<i64> = tx
                        .query_row(
                            "SELECT created_at FROM aliases
                             WHERE paper_id = ?1 AND kind = ?2",
                            params![paper_id, kind.as_str()],
                            |row| row.get(0),
                        )
                        .optional()
                        .map_err(db_err)?;
                    if prior.is_some() {
                        tx.execute(
                            "DELETE FROM aliases WHERE paper_id = ?1 AND kind = ?2",
                            params![paper_id, kind.as_str()],
                        )
                        .map_err(db_err)?;
                    }
                    tx.execute(
                        "INSERT INTO aliases (kind, value, paper_id, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![kind.as_str(), value, paper_id, prior.unwrap_or(now), now],
                    )
                    .map_err(db_err)?;
                    debug!(kind = kind.as_str(), value, paper_id, "alias recorded");
                }
            }
        }

        tx.commit().map_err(db_err)?;
        Ok(conflicts)
    }

    async fn aliases_of(&self, paper_id: &str) -> AliasResult<Vec<(AliasKind, String)>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT kind, value FROM aliases WHERE paper_id = ?1 ORDER BY kind")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![paper_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(db_err)?;

        let mut out = Vec::new();
        for row in rows {
            let (kind_name, value) = row.map_err(db_err)?;
            if let Some(kind) = AliasKind::from_str_name(&kind_name) {
                out.push((kind, value));
            }
        }
        Ok(out)
    }

    async fn statistics(&self) -> AliasResult<AliasStats> {
        let conn = self.lock()?;
        let total_mappings: u64 = conn
            .query_row("SELECT COUNT(*) FROM aliases", [], |row| row.get(0))
            .map_err(db_err)?;
        let distinct_papers: u64 = conn
            .query_row("SELECT COUNT(DISTINCT paper_id) FROM aliases", [], |row| {
                row.get(0)
            })
            .map_err(db_err)?;

        let mut stmt = conn
            .prepare(
                "SELECT kind, COUNT(*) FROM aliases
                 GROUP BY kind ORDER BY COUNT(*) DESC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            })
            .map_err(db_err)?;

        let mut per_kind = Vec::new();
        for row in rows {
            per_kind.push(row.map_err(db_err)?);
        }

        Ok(AliasStats {
            total_mappings,
            distinct_papers,
            per_kind,
        })
    }

    async fn cleanup_older_than(&self, days: u32) -> AliasResult<u64> {
        let cutoff = now_unix() - i64::from(days) * 24 * 3600;
        let conn = self.lock()?;
        let deleted = conn
            .execute("DELETE FROM aliases WHERE updated_at < ?1", params![cutoff])
            .map_err(db_err)?;
        info!(deleted, days, "cleaned up stale alias mappings");
        Ok(deleted as u64)
    }
}
