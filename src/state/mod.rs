//! Per-agent key-value state and conversation history.
//!
//! Writes are serialized per agent scope; cross-agent operations are not
//! atomic. Conversation history is an ordered message list keyed by
//! session id, persisted separately from the key-value map.

mod file;
mod memory;

pub use file::FileStateStore;
pub use memory::InMemoryStateStore;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use crate::types::ChatMessage;

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, agent_id: &str, key: &str) -> anyhow::Result<Option<Value>>;

    async fn set(&self, agent_id: &str, key: &str, value: Value) -> anyhow::Result<()>;

    async fn get_all(&self, agent_id: &str) -> anyhow::Result<HashMap<String, Value>>;

    async fn clear(&self, agent_id: &str) -> anyhow::Result<()>;

    async fn get_history(&self, session_id: &str) -> anyhow::Result<Vec<ChatMessage>>;

    async fn append_history(&self, session_id: &str, message: ChatMessage) -> anyhow::Result<()>;

    async fn clear_history(&self, session_id: &str) -> anyhow::Result<()>;
}
