//! Long-lived memory for agents, partitioned by scope.
//!
//! Entries are keyed by `(scope, key)`; a non-empty key is the client's
//! deduplication key, so repeated adds of the same key are at-most-once.
//! Backends: volatile map with file snapshots, embedded SQL, and a vector
//! variant scoring by cosine similarity over stored embeddings.

mod local;
#[cfg(feature = "sqlite")]
mod sqlite;
mod vector;

pub use local::LocalMemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteMemoryStore;
pub use vector::VectorMemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// One persisted memory record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryEntry {
    pub id: String,
    /// The agent (or stack) identity this entry belongs to.
    pub scope: String,
    /// Deduplication key; an empty key disables deduplication.
    #[serde(default)]
    pub key: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn new(scope: impl Into<String>, key: impl Into<String>, value: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            scope: scope.into(),
            key: key.into(),
            value,
            embedding: None,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Text representation used for full-text matching and embedding.
    pub fn text(&self) -> String {
        match &self.value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

/// Query input: free text or a precomputed embedding.
#[derive(Debug, Clone)]
pub enum MemoryQuery {
    Text(String),
    Embedding(Vec<f32>),
}

#[derive(Debug, Clone)]
pub struct ScoredEntry {
    pub entry: MemoryEntry,
    pub score: f32,
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Insert an entry, returning its id. When the entry carries a non-empty
    /// key and the `(scope, key)` pair already exists, the existing id is
    /// returned and nothing is written.
    async fn add(&self, entry: MemoryEntry) -> anyhow::Result<String>;

    async fn get(&self, id: &str) -> anyhow::Result<Option<MemoryEntry>>;

    /// Best-effort search within one scope. Never returns entries from other
    /// scopes and never more than `top_k` results.
    async fn query(
        &self,
        scope: &str,
        query: MemoryQuery,
        top_k: usize,
        threshold: Option<f32>,
    ) -> anyhow::Result<Vec<ScoredEntry>>;

    async fn delete(&self, id: &str) -> anyhow::Result<()>;

    /// Remove every entry in `scope`. Idempotent.
    async fn clear(&self, scope: &str) -> anyhow::Result<()>;

    /// Flush any snapshot state. Backends without snapshots do nothing.
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Capability interface for producing embeddings. The memory layer sits
/// below the model shim in the dependency order, so shims implement this
/// trait rather than memory importing shim types.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Sort by score descending, apply the threshold, and truncate to `top_k`.
pub(crate) fn rank(
    mut scored: Vec<ScoredEntry>,
    top_k: usize,
    threshold: Option<f32>,
) -> Vec<ScoredEntry> {
    if let Some(threshold) = threshold {
        scored.retain(|s| s.score >= threshold);
    }
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.entry.created_at.cmp(&a.entry.created_at))
    });
    scored.truncate(top_k);
    scored
}
