use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::local::{sanitize_scope, write_atomic};
use super::{
    cosine_similarity, rank, Embedder, MemoryEntry, MemoryQuery, MemoryStore, ScoredEntry,
};

/// Memory store scoring queries by cosine similarity over embeddings.
///
/// Entries added without an embedding are embedded at insert time through
/// the configured [`Embedder`]. Snapshots mirror [`LocalMemoryStore`]'s
/// per-scope `.memories` files plus a sibling `.vectors` file holding the
/// raw vectors keyed by entry id.
///
/// [`LocalMemoryStore`]: super::LocalMemoryStore
pub struct VectorMemoryStore {
    embedder: Arc<dyn Embedder>,
    snapshot_dir: Option<PathBuf>,
    entries: Arc<RwLock<HashMap<String, MemoryEntry>>>,
}

impl VectorMemoryStore {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            snapshot_dir: None,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn open(embedder: Arc<dyn Embedder>, dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let mut entries: HashMap<String, MemoryEntry> = HashMap::new();
        let mut listing = tokio::fs::read_dir(&dir).await?;
        while let Some(file) = listing.next_entry().await? {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("memories") {
                continue;
            }
            let contents = tokio::fs::read_to_string(&path).await?;
            let scope_entries: Vec<MemoryEntry> = serde_json::from_str(&contents)?;

            // Vectors live in the sibling file; re-attach them by id.
            let vectors_path = path.with_extension("vectors");
            let vectors: HashMap<String, Vec<f32>> =
                if tokio::fs::try_exists(&vectors_path).await? {
                    serde_json::from_str(&tokio::fs::read_to_string(&vectors_path).await?)?
                } else {
                    HashMap::new()
                };

            for mut entry in scope_entries {
                if entry.embedding.is_none() {
                    entry.embedding = vectors.get(&entry.id).cloned();
                }
                entries.insert(entry.id.clone(), entry);
            }
        }

        Ok(Self {
            embedder,
            snapshot_dir: Some(dir),
            entries: Arc::new(RwLock::new(entries)),
        })
    }

    async fn write_snapshots(&self) -> anyhow::Result<()> {
        let Some(dir) = &self.snapshot_dir else {
            return Ok(());
        };

        let by_scope: HashMap<String, Vec<MemoryEntry>> = {
            let entries = self.entries.read().await;
            let mut by_scope: HashMap<String, Vec<MemoryEntry>> = HashMap::new();
            for entry in entries.values() {
                by_scope.entry(entry.scope.clone()).or_default().push(entry.clone());
            }
            by_scope
        };

        for (scope, mut scope_entries) in by_scope {
            scope_entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));

            let vectors: HashMap<&str, &Vec<f32>> = scope_entries
                .iter()
                .filter_map(|e| e.embedding.as_ref().map(|v| (e.id.as_str(), v)))
                .collect();
            let base = dir.join(format!("{}.memories", sanitize_scope(&scope)));
            write_atomic(&base.with_extension("vectors"), serde_json::to_string(&vectors)?.as_bytes())
                .await?;

            // Entries are snapshotted without their vectors to keep the
            // entry file readable and the layouts of the two backends equal.
            for entry in scope_entries.iter_mut() {
                entry.embedding = None;
            }
            write_atomic(&base, serde_json::to_string(&scope_entries)?.as_bytes()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MemoryStore for VectorMemoryStore {
    async fn add(&self, mut entry: MemoryEntry) -> anyhow::Result<String> {
        {
            let entries = self.entries.read().await;
            if !entry.key.is_empty() {
                if let Some(existing) = entries
                    .values()
                    .find(|e| e.scope == entry.scope && e.key == entry.key)
                {
                    return Ok(existing.id.clone());
                }
            }
        }

        if entry.embedding.is_none() {
            let vectors = self.embedder.embed(&[entry.text()]).await?;
            entry.embedding = vectors.into_iter().next();
        }

        let mut entries = self.entries.write().await;
        // Re-check: another writer may have inserted the same key while the
        // embedding call was in flight.
        if !entry.key.is_empty() {
            if let Some(existing) = entries
                .values()
                .find(|e| e.scope == entry.scope && e.key == entry.key)
            {
                return Ok(existing.id.clone());
            }
        }
        let id = entry.id.clone();
        entries.insert(id.clone(), entry);
        Ok(id)
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<MemoryEntry>> {
        let entries = self.entries.read().await;
        Ok(entries.get(id).cloned())
    }

    async fn query(
        &self,
        scope: &str,
        query: MemoryQuery,
        top_k: usize,
        threshold: Option<f32>,
    ) -> anyhow::Result<Vec<ScoredEntry>> {
        let needle = match query {
            MemoryQuery::Embedding(vector) => vector,
            MemoryQuery::Text(text) => {
                let vectors = self.embedder.embed(&[text]).await?;
                vectors
                    .into_iter()
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("embedder returned no vector"))?
            }
        };

        let entries = self.entries.read().await;
        let scored: Vec<ScoredEntry> = entries
            .values()
            .filter(|e| e.scope == scope)
            .filter_map(|e| {
                e.embedding.as_ref().map(|v| ScoredEntry {
                    entry: e.clone(),
                    score: cosine_similarity(&needle, v),
                })
            })
            .collect();
        Ok(rank(scored, top_k, threshold))
    }

    async fn delete(&self, id: &str) -> anyhow::Result<()> {
        let mut entries = self.entries.write().await;
        entries.remove(id);
        Ok(())
    }

    async fn clear(&self, scope: &str) -> anyhow::Result<()> {
        {
            let mut entries = self.entries.write().await;
            entries.retain(|_, e| e.scope != scope);
        }
        if let Some(dir) = &self.snapshot_dir {
            let base = dir.join(format!("{}.memories", sanitize_scope(scope)));
            for path in [base.clone(), base.with_extension("vectors")] {
                if tokio::fs::try_exists(&path).await? {
                    tokio::fs::remove_file(&path).await?;
                }
            }
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.write_snapshots().await
    }
}
