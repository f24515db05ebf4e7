use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::StateStore;
use crate::types::ChatMessage;

/// Volatile state store backed by maps.
#[derive(Clone, Default)]
pub struct InMemoryStateStore {
    states: Arc<RwLock<HashMap<String, HashMap<String, Value>>>>,
    sessions: Arc<RwLock<HashMap<String, Vec<ChatMessage>>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, agent_id: &str, key: &str) -> anyhow::Result<Option<Value>> {
        let states = self.states.read().await;
        Ok(states.get(agent_id).and_then(|s| s.get(key)).cloned())
    }

    async fn set(&self, agent_id: &str, key: &str, value: Value) -> anyhow::Result<()> {
        let mut states = self.states.write().await;
        states
            .entry(agent_id.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get_all(&self, agent_id: &str) -> anyhow::Result<HashMap<String, Value>> {
        let states = self.states.read().await;
        Ok(states.get(agent_id).cloned().unwrap_or_default())
    }

    async fn clear(&self, agent_id: &str) -> anyhow::Result<()> {
        let mut states = self.states.write().await;
        states.remove(agent_id);
        Ok(())
    }

    async fn get_history(&self, session_id: &str) -> anyhow::Result<Vec<ChatMessage>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(session_id).cloned().unwrap_or_default())
    }

    async fn append_history(&self, session_id: &str, message: ChatMessage) -> anyhow::Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn clear_history(&self, session_id: &str) -> anyhow::Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(session_id);
        Ok(())
    }
}
