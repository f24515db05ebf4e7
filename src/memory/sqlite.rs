use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{cosine_similarity, rank, MemoryEntry, MemoryQuery, MemoryStore, ScoredEntry};

/// Embedded relational memory backend.
///
/// Every write is committed as it happens (SQLite autocommit), so the store
/// is durable without an explicit snapshot step. Deduplication is enforced
/// by a partial unique index over `(scope, key)` for non-empty keys.
pub struct SqliteMemoryStore {
    conn: Arc<Mutex<Connection>>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS memory_entries (
    id         TEXT PRIMARY KEY,
    scope      TEXT NOT NULL,
    key        TEXT NOT NULL DEFAULT '',
    value      TEXT NOT NULL,
    embedding  BLOB,
    metadata   TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_memory_scope ON memory_entries(scope);
CREATE UNIQUE INDEX IF NOT EXISTS idx_memory_scope_key
    ON memory_entries(scope, key) WHERE key != '';
";

impl SqliteMemoryStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("sqlite connection lock poisoned"))
    }
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<MemoryEntry> {
    let value: String = row.get("value")?;
    let metadata: String = row.get("metadata")?;
    let created_at: String = row.get("created_at")?;
    let embedding: Option<Vec<u8>> = row.get("embedding")?;

    Ok(MemoryEntry {
        id: row.get("id")?,
        scope: row.get("scope")?,
        key: row.get("key")?,
        value: serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value)),
        embedding: embedding.map(|bytes| decode_vector(&bytes)),
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        created_at: created_at
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn add(&self, entry: MemoryEntry) -> anyhow::Result<String> {
        let conn = self.lock()?;
        if !entry.key.is_empty() {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM memory_entries WHERE scope = ?1 AND key = ?2",
                    params![entry.scope, entry.key],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(id) = existing {
                return Ok(id);
            }
        }

        conn.execute(
            "INSERT INTO memory_entries (id, scope, key, value, embedding, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.id,
                entry.scope,
                entry.key,
                serde_json::to_string(&entry.value)?,
                entry.embedding.as_deref().map(encode_vector),
                serde_json::to_string(&entry.metadata)?,
                entry.created_at.to_rfc3339(),
            ],
        )?;
        Ok(entry.id)
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<MemoryEntry>> {
        let conn = self.lock()?;
        let entry = conn
            .query_row(
                "SELECT * FROM memory_entries WHERE id = ?1",
                params![id],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    async fn query(
        &self,
        scope: &str,
        query: MemoryQuery,
        top_k: usize,
        threshold: Option<f32>,
    ) -> anyhow::Result<Vec<ScoredEntry>> {
        let conn = self.lock()?;
        let scored = match query {
            MemoryQuery::Text(text) => {
                let needle = text.to_lowercase();
                let mut stmt = conn.prepare(
                    "SELECT * FROM memory_entries
                     WHERE scope = ?1
                       AND (instr(lower(value), ?2) > 0 OR instr(lower(key), ?2) > 0)",
                )?;
                let rows = stmt.query_map(params![scope, needle], row_to_entry)?;
                rows.map(|row| {
                    row.map(|entry| ScoredEntry { entry, score: 1.0 })
                })
                .collect::<Result<Vec<_>, _>>()?
            }
            MemoryQuery::Embedding(needle) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM memory_entries WHERE scope = ?1 AND embedding IS NOT NULL",
                )?;
                let rows = stmt.query_map(params![scope], row_to_entry)?;
                rows.filter_map(|row| match row {
                    Ok(entry) => entry.embedding.clone().map(|v| {
                        Ok(ScoredEntry {
                            score: cosine_similarity(&needle, &v),
                            entry,
                        })
                    }),
                    Err(e) => Some(Err(e)),
                })
                .collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(rank(scored, top_k, threshold))
    }

    async fn delete(&self, id: &str) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM memory_entries WHERE id = ?1", params![id])?;
        Ok(())
    }

    async fn clear(&self, scope: &str) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM memory_entries WHERE scope = ?1",
            params![scope],
        )?;
        Ok(())
    }
}
