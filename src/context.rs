use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::types::AgentOutput;

/// Reserved context key holding the caller's initial input.
pub const INPUT_KEY: &str = "input";

/// Execution-scoped bag of published outputs, keyed by agent id (plus
/// `outputKey` aliases and the reserved input key).
///
/// The map grows monotonically: each key is written exactly once, which is
/// what makes concurrent readers safe without coordination beyond the lock.
#[derive(Clone, Default)]
pub struct StackContext {
    outputs: Arc<RwLock<HashMap<String, AgentOutput>>>,
}

impl StackContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `output` under `key`. Double publication of a key is an
    /// engine bug and is rejected.
    pub async fn publish(&self, key: &str, output: AgentOutput) -> anyhow::Result<()> {
        let mut outputs = self.outputs.write().await;
        if outputs.contains_key(key) {
            anyhow::bail!("context key {:?} published twice", key);
        }
        outputs.insert(key.to_string(), output);
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Option<AgentOutput> {
        let outputs = self.outputs.read().await;
        outputs.get(key).cloned()
    }

    pub async fn snapshot(&self) -> HashMap<String, AgentOutput> {
        let outputs = self.outputs.read().await;
        outputs.clone()
    }
}
