use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{rank, MemoryEntry, MemoryQuery, MemoryStore, ScoredEntry};

/// Map-backed memory store with optional file snapshots.
///
/// Entries live in memory; `close` writes one `<scope>.memories` file per
/// scope and `open` restores whatever snapshots exist. Text queries match
/// by case-insensitive substring over the entry's key and value.
#[derive(Clone)]
pub struct LocalMemoryStore {
    snapshot_dir: Option<PathBuf>,
    entries: Arc<RwLock<HashMap<String, MemoryEntry>>>,
}

impl Default for LocalMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalMemoryStore {
    /// Purely volatile store, no snapshots.
    pub fn new() -> Self {
        Self {
            snapshot_dir: None,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Open a store rooted at `dir`, restoring any existing snapshots.
    pub async fn open(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let mut entries = HashMap::new();
        let mut listing = tokio::fs::read_dir(&dir).await?;
        while let Some(file) = listing.next_entry().await? {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("memories") {
                continue;
            }
            let contents = tokio::fs::read_to_string(&path).await?;
            let scope_entries: Vec<MemoryEntry> = serde_json::from_str(&contents)?;
            for entry in scope_entries {
                entries.insert(entry.id.clone(), entry);
            }
        }
        tracing::debug!("restored {} memory entries from {:?}", entries.len(), dir);

        Ok(Self {
            snapshot_dir: Some(dir),
            entries: Arc::new(RwLock::new(entries)),
        })
    }

    fn scope_path(dir: &Path, scope: &str) -> PathBuf {
        dir.join(format!("{}.memories", sanitize_scope(scope)))
    }

    /// Write one snapshot file per scope. The write goes to a temp file
    /// first and is renamed into place, so a crash mid-write leaves the
    /// previous snapshot intact.
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
            let serialized = serde_json::to_string(&scope_entries)?;
            let path = Self::scope_path(dir, &scope);
            write_atomic(&path, serialized.as_bytes()).await?;
        }
        Ok(())
    }

    async fn remove_scope_snapshot(&self, scope: &str) -> anyhow::Result<()> {
        if let Some(dir) = &self.snapshot_dir {
            let path = Self::scope_path(dir, scope);
            if tokio::fs::try_exists(&path).await? {
                tokio::fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MemoryStore for LocalMemoryStore {
    async fn add(&self, entry: MemoryEntry) -> anyhow::Result<String> {
        let mut entries = self.entries.write().await;
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
            MemoryQuery::Text(text) => text.to_lowercase(),
            MemoryQuery::Embedding(_) => {
                anyhow::bail!("local memory store does not index embeddings")
            }
        };

        let entries = self.entries.read().await;
        let scored: Vec<ScoredEntry> = entries
            .values()
            .filter(|e| e.scope == scope)
            .filter(|e| {
                e.key.to_lowercase().contains(&needle) || e.text().to_lowercase().contains(&needle)
            })
            .map(|e| ScoredEntry {
                entry: e.clone(),
                score: 1.0,
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
        self.remove_scope_snapshot(scope).await
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.write_snapshots().await
    }
}

pub(crate) fn sanitize_scope(scope: &str) -> String {
    scope
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    // `.tmp` is appended, not substituted, so the `.memories` and
    // `.vectors` files of one scope never share a temp file.
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
