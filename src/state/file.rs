use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::StateStore;
use crate::types::ChatMessage;

/// File-backed state store.
///
/// Layout: one `<scope>.state` file per agent scope holding the key-value
/// map, one `<session>.session` file per conversation session holding the
/// ordered message list. Every write rewrites the owning file, so a scope's
/// state on disk always matches its last completed write.
#[derive(Clone)]
pub struct FileStateStore {
    root: PathBuf,
    states: Arc<RwLock<HashMap<String, HashMap<String, Value>>>>,
    sessions: Arc<RwLock<HashMap<String, Vec<ChatMessage>>>>,
}

impl FileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        std::fs::create_dir_all(&root).unwrap_or_default();
        Self {
            root,
            states: Arc::new(RwLock::new(HashMap::new())),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn state_path(&self, agent_id: &str) -> PathBuf {
        self.root.join(format!("{}.state", sanitize(agent_id)))
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{}.session", sanitize(session_id)))
    }

    async fn load_state(&self, agent_id: &str) -> anyhow::Result<()> {
        {
            let states = self.states.read().await;
            if states.contains_key(agent_id) {
                return Ok(());
            }
        }
        let path = self.state_path(agent_id);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(());
        }
        let contents = tokio::fs::read_to_string(&path).await?;
        let state: HashMap<String, Value> = serde_json::from_str(&contents)?;

        let mut states = self.states.write().await;
        states.entry(agent_id.to_string()).or_insert(state);
        Ok(())
    }

    async fn save_state(&self, agent_id: &str) -> anyhow::Result<()> {
        let states = self.states.read().await;
        if let Some(state) = states.get(agent_id) {
            let serialized = serde_json::to_string(state)?;
            write_atomic(&self.state_path(agent_id), serialized.as_bytes()).await?;
        }
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> anyhow::Result<()> {
        {
            let sessions = self.sessions.read().await;
            if sessions.contains_key(session_id) {
                return Ok(());
            }
        }
        let path = self.session_path(session_id);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(());
        }
        let contents = tokio::fs::read_to_string(&path).await?;
        let messages: Vec<ChatMessage> = serde_json::from_str(&contents)?;

        let mut sessions = self.sessions.write().await;
        sessions.entry(session_id.to_string()).or_insert(messages);
        Ok(())
    }

    async fn save_session(&self, session_id: &str) -> anyhow::Result<()> {
        let sessions = self.sessions.read().await;
        if let Some(messages) = sessions.get(session_id) {
            let serialized = serde_json::to_string(messages)?;
            write_atomic(&self.session_path(session_id), serialized.as_bytes()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get(&self, agent_id: &str, key: &str) -> anyhow::Result<Option<Value>> {
        self.load_state(agent_id).await?;
        let states = self.states.read().await;
        Ok(states.get(agent_id).and_then(|s| s.get(key)).cloned())
    }

    async fn set(&self, agent_id: &str, key: &str, value: Value) -> anyhow::Result<()> {
        self.load_state(agent_id).await?;
        {
            let mut states = self.states.write().await;
            states
                .entry(agent_id.to_string())
                .or_default()
                .insert(key.to_string(), value);
        }
        self.save_state(agent_id).await
    }

    async fn get_all(&self, agent_id: &str) -> anyhow::Result<HashMap<String, Value>> {
        self.load_state(agent_id).await?;
        let states = self.states.read().await;
        Ok(states.get(agent_id).cloned().unwrap_or_default())
    }

    async fn clear(&self, agent_id: &str) -> anyhow::Result<()> {
        {
            let mut states = self.states.write().await;
            states.remove(agent_id);
        }
        let path = self.state_path(agent_id);
        if tokio::fs::try_exists(&path).await? {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn get_history(&self, session_id: &str) -> anyhow::Result<Vec<ChatMessage>> {
        self.load_session(session_id).await?;
        let sessions = self.sessions.read().await;
        Ok(sessions.get(session_id).cloned().unwrap_or_default())
    }

    async fn append_history(&self, session_id: &str, message: ChatMessage) -> anyhow::Result<()> {
        self.load_session(session_id).await?;
        {
            let mut sessions = self.sessions.write().await;
            sessions
                .entry(session_id.to_string())
                .or_default()
                .push(message);
        }
        self.save_session(session_id).await
    }

    async fn clear_history(&self, session_id: &str) -> anyhow::Result<()> {
        {
            let mut sessions = self.sessions.write().await;
            sessions.remove(session_id);
        }
        let path = self.session_path(session_id);
        if tokio::fs::try_exists(&path).await? {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    // `.tmp` is appended, not substituted: `x.state` and `x.session` must
    // not share a temp file.
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
