use std::sync::Arc;

use serde_json::json;

use crate::memory::{
    cosine_similarity, Embedder, LocalMemoryStore, MemoryEntry, MemoryQuery, MemoryStore,
    VectorMemoryStore,
};
use crate::shim::{MockShim, ShimEmbedder};

fn entry(scope: &str, key: &str, text: &str) -> MemoryEntry {
    MemoryEntry::new(scope, key, json!(text))
}

#[tokio::test(flavor = "multi_thread")]
async fn query_never_crosses_scopes() -> anyhow::Result<()> {
    let store = LocalMemoryStore::new();
    store.add(entry("a", "k1", "the blue whale")).await?;
    store.add(entry("b", "k1", "the blue sky")).await?;

    let results = store
        .query("a", MemoryQuery::Text("blue".to_string()), 10, None)
        .await?;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].entry.scope, "a");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn add_with_dedup_key_is_at_most_once() -> anyhow::Result<()> {
    let store = LocalMemoryStore::new();
    let first = store.add(entry("a", "fact", "v1")).await?;
    let second = store.add(entry("a", "fact", "v2")).await?;
    assert_eq!(first, second);
    assert_eq!(store.get(&first).await?.unwrap().value, json!("v1"));

    // Empty keys never deduplicate.
    let x = store.add(entry("a", "", "free")).await?;
    let y = store.add(entry("a", "", "free")).await?;
    assert_ne!(x, y);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn clear_is_idempotent() -> anyhow::Result<()> {
    let store = LocalMemoryStore::new();
    store.add(entry("a", "", "one")).await?;
    store.clear("a").await?;
    store.clear("a").await?;
    assert!(store
        .query("a", MemoryQuery::Text("one".to_string()), 10, None)
        .await?
        .is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn top_k_bounds_results() -> anyhow::Result<()> {
    let store = LocalMemoryStore::new();
    for i in 0..5 {
        store.add(entry("a", "", &format!("note {i}"))).await?;
    }
    let results = store
        .query("a", MemoryQuery::Text("note".to_string()), 3, None)
        .await?;
    assert_eq!(results.len(), 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_restores_on_open() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;

    let id = {
        let store = LocalMemoryStore::open(dir.path()).await?;
        let id = store.add(entry("a", "k", "persisted note")).await?;
        store.add(entry("b", "k", "other scope")).await?;
        store.close().await?;
        id
    };

    let reopened = LocalMemoryStore::open(dir.path()).await?;
    let restored = reopened.get(&id).await?.unwrap();
    assert_eq!(restored.value, json!("persisted note"));
    let results = reopened
        .query("b", MemoryQuery::Text("other".to_string()), 10, None)
        .await?;
    assert_eq!(results.len(), 1);
    Ok(())
}

fn mock_embedder() -> Arc<dyn Embedder> {
    Arc::new(ShimEmbedder::new(Arc::new(MockShim::new())))
}

#[tokio::test(flavor = "multi_thread")]
async fn vector_query_ranks_by_similarity() -> anyhow::Result<()> {
    let store = VectorMemoryStore::new(mock_embedder());
    store.add(entry("a", "", "aaaa bbbb")).await?;
    store.add(entry("a", "", "zzzz yyyy")).await?;

    let results = store
        .query("a", MemoryQuery::Text("aaaa".to_string()), 2, None)
        .await?;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].entry.value, json!("aaaa bbbb"));
    assert!(results[0].score > results[1].score);

    // Threshold prunes the dissimilar entry.
    let filtered = store
        .query("a", MemoryQuery::Text("aaaa".to_string()), 2, Some(0.5))
        .await?;
    assert_eq!(filtered.len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn vector_snapshot_carries_embeddings() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    {
        let store = VectorMemoryStore::open(mock_embedder(), dir.path()).await?;
        store.add(entry("a", "", "hello world")).await?;
        store.close().await?;
    }

    let reopened = VectorMemoryStore::open(mock_embedder(), dir.path()).await?;
    let results = reopened
        .query("a", MemoryQuery::Text("hello world".to_string()), 1, None)
        .await?;
    assert_eq!(results.len(), 1);
    assert!(results[0].score > 0.99, "identical text, score {}", results[0].score);
    Ok(())
}

#[test]
fn cosine_similarity_basics() {
    assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    assert_eq!(cosine_similarity(&[], &[]), 0.0);
}

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::*;
    use crate::memory::SqliteMemoryStore;

    #[tokio::test(flavor = "multi_thread")]
    async fn sqlite_backend_honors_the_contract() -> anyhow::Result<()> {
        let store = SqliteMemoryStore::open_in_memory()?;

        let id = store.add(entry("a", "fact", "sqlite note")).await?;
        assert_eq!(store.add(entry("a", "fact", "other")).await?, id);
        store.add(entry("b", "fact", "elsewhere")).await?;

        let results = store
            .query("a", MemoryQuery::Text("note".to_string()), 10, None)
            .await?;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entry.id, id);

        store.clear("a").await?;
        store.clear("a").await?;
        assert!(store.get(&id).await?.is_none());
        // Scope b untouched.
        assert_eq!(
            store
                .query("b", MemoryQuery::Text("elsewhere".to_string()), 10, None)
                .await?
                .len(),
            1
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sqlite_embedding_query_uses_cosine() -> anyhow::Result<()> {
        let store = SqliteMemoryStore::open_in_memory()?;
        store
            .add(entry("a", "", "x").with_embedding(vec![1.0, 0.0]))
            .await?;
        store
            .add(entry("a", "", "y").with_embedding(vec![0.0, 1.0]))
            .await?;

        let results = store
            .query("a", MemoryQuery::Embedding(vec![1.0, 0.1]), 2, Some(0.5))
            .await?;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entry.value, json!("x"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sqlite_is_durable_across_reopen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("memory.db");

        let id = {
            let store = SqliteMemoryStore::open(&path)?;
            store.add(entry("a", "k", "durable")).await?
        };

        let reopened = SqliteMemoryStore::open(&path)?;
        assert_eq!(reopened.get(&id).await?.unwrap().value, json!("durable"));
        Ok(())
    }
}
