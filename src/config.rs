//! Engine configuration and store initialization.

use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::memory::{Embedder, LocalMemoryStore, MemoryStore, VectorMemoryStore};
use crate::state::{FileStateStore, InMemoryStateStore, StateStore};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Default per-node deadline, overridable by `params.timeout`.
    #[serde(default = "default_node_timeout_secs")]
    pub node_timeout_secs: u64,
    /// How long a cancelled stack waits for running nodes to stop.
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
    /// Worker pool bound; defaults to min(cpu_count, node_count).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
    /// When true, the first node failure cancels the whole run.
    #[serde(default)]
    pub fail_fast: bool,
    /// Retry budget for transient shim errors, including the first attempt.
    #[serde(default = "default_shim_attempts")]
    pub shim_attempts: u32,
    #[serde(default)]
    pub stores: StoreSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_timeout_secs: default_node_timeout_secs(),
            cancel_grace_secs: default_cancel_grace_secs(),
            max_workers: None,
            fail_fast: false,
            shim_attempts: default_shim_attempts(),
            stores: StoreSettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }
}

fn default_node_timeout_secs() -> u64 {
    300
}

fn default_cancel_grace_secs() -> u64 {
    5
}

fn default_shim_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct StoreSettings {
    #[serde(default)]
    pub state: StateBackend,
    #[serde(default)]
    pub memory: MemoryBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    #[default]
    InMemory,
    File {
        path: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemoryBackend {
    /// Volatile map, no snapshots.
    #[default]
    Local,
    /// Map with per-scope file snapshots.
    Snapshot {
        path: String,
    },
    /// Embedded relational backend, durable per write.
    Sqlite {
        path: String,
    },
    /// Cosine-similarity store; requires an embedder at initialization.
    Vector {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
}

/// Initialized store collection.
pub struct InitializedStores {
    pub state: Arc<dyn StateStore>,
    pub memory: Arc<dyn MemoryStore>,
}

impl StoreSettings {
    /// Initialize the configured backends. The embedder is only consulted
    /// for the vector backend.
    pub async fn initialize(
        &self,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> anyhow::Result<InitializedStores> {
        let state: Arc<dyn StateStore> = match &self.state {
            StateBackend::InMemory => Arc::new(InMemoryStateStore::new()),
            StateBackend::File { path } => Arc::new(FileStateStore::new(path)),
        };

        let memory: Arc<dyn MemoryStore> = match &self.memory {
            MemoryBackend::Local => Arc::new(LocalMemoryStore::new()),
            MemoryBackend::Snapshot { path } => Arc::new(LocalMemoryStore::open(path).await?),
            #[cfg(feature = "sqlite")]
            MemoryBackend::Sqlite { path } => {
                Arc::new(crate::memory::SqliteMemoryStore::open(path)?)
            }
            #[cfg(not(feature = "sqlite"))]
            MemoryBackend::Sqlite { .. } => {
                return Err(anyhow::anyhow!(
                    "sqlite feature not enabled. Compile with --features sqlite"
                ));
            }
            MemoryBackend::Vector { path } => {
                let embedder = embedder.ok_or_else(|| {
                    anyhow::anyhow!("vector memory backend requires an embedder")
                })?;
                match path {
                    Some(path) => Arc::new(VectorMemoryStore::open(embedder, path).await?),
                    None => Arc::new(VectorMemoryStore::new(embedder)),
                }
            }
        };

        Ok(InitializedStores { state, memory })
    }
}

/// JSON schema of the engine configuration document.
pub fn get_config_schema(pretty: bool) -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(EngineConfig);
    if pretty {
        serde_json::to_string_pretty(&schema)
    } else {
        serde_json::to_string(&schema)
    }
}
