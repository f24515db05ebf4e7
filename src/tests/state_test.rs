use std::sync::Arc;

use serde_json::json;

use crate::engine::ExecuteOptions;
use crate::shim::MockShim;
use crate::state::{FileStateStore, InMemoryStateStore, StateStore};
use crate::tests::utils::{agent, harness_with_state, stack};
use crate::types::{ChatMessage, ChatRole};

#[tokio::test(flavor = "multi_thread")]
async fn get_set_and_clear_roundtrip() -> anyhow::Result<()> {
    let store = InMemoryStateStore::new();
    store.set("agent", "count", json!(3)).await?;
    store.set("agent", "mode", json!("fast")).await?;

    assert_eq!(store.get("agent", "count").await?, Some(json!(3)));
    assert_eq!(store.get("agent", "missing").await?, None);
    assert_eq!(store.get_all("agent").await?.len(), 2);

    store.clear("agent").await?;
    assert!(store.get_all("agent").await?.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn state_is_scoped_per_agent() -> anyhow::Result<()> {
    let store = InMemoryStateStore::new();
    store.set("a", "k", json!(1)).await?;
    store.set("b", "k", json!(2)).await?;

    assert_eq!(store.get("a", "k").await?, Some(json!(1)));
    assert_eq!(store.get("b", "k").await?, Some(json!(2)));
    store.clear("a").await?;
    assert_eq!(store.get("b", "k").await?, Some(json!(2)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn file_store_survives_reopen() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;

    {
        let store = FileStateStore::new(dir.path());
        store.set("agent", "count", json!(7)).await?;
        store
            .append_history("session", ChatMessage::user("hi"))
            .await?;
        store
            .append_history("session", ChatMessage::assistant("hello"))
            .await?;
    }

    let reopened = FileStateStore::new(dir.path());
    assert_eq!(reopened.get("agent", "count").await?, Some(json!(7)));
    let history = reopened.get_history("session").await?;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, ChatRole::User);
    assert_eq!(history[1].as_text(), Some("hello"));
    Ok(())
}

// Conversation history persisted by a full run is intact after the state
// manager restarts.
#[tokio::test(flavor = "multi_thread")]
async fn pipeline_history_survives_restart() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let spec = stack(
        "pipeline",
        vec![
            agent("A", "upper", &[]),
            agent("B", "reverse", &["A"]),
            agent("C", "echo", &["B"]),
        ],
    );

    {
        let state: Arc<dyn StateStore> = Arc::new(FileStateStore::new(dir.path()));
        let harness = harness_with_state(MockShim::new(), state.clone()).await;
        let id = harness
            .engine
            .submit(spec, json!("hello"), ExecuteOptions::default())
            .await?;
        harness.engine.execute(&id).await?;

        for session in ["pipeline:A", "pipeline:B", "pipeline:C"] {
            assert_eq!(state.get_history(session).await?.len(), 2, "{session}");
        }
    }

    // Restart: a fresh store over the same directory sees the same history.
    let restarted = FileStateStore::new(dir.path());
    let history = restarted.get_history("pipeline:A").await?;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].as_text(), Some("hello"));
    assert_eq!(history[1].as_text(), Some("HELLO"));
    assert_eq!(
        restarted.get_history("pipeline:B").await?[1].as_text(),
        Some("OLLEH")
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn clear_history_removes_the_session_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = FileStateStore::new(dir.path());
    store.append_history("s", ChatMessage::user("x")).await?;
    store.clear_history("s").await?;
    assert!(store.get_history("s").await?.is_empty());

    let reopened = FileStateStore::new(dir.path());
    assert!(reopened.get_history("s").await?.is_empty());
    Ok(())
}
