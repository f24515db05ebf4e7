//! DAG orchestration for stacks of AI agents.
//!
//! A stack is a declarative collection of agents with dependencies. The
//! engine compiles it into a DAG, runs independent nodes concurrently,
//! routes outputs along edges, and persists per-agent state, conversation
//! history, and memory behind pluggable backends.

pub mod config;
pub mod context;
pub mod dag;
pub mod engine;
pub mod error;
pub mod image;
pub mod memory;
pub mod runtime;
pub mod shim;
pub mod spec;
pub mod state;
pub mod types;

mod logging;

#[cfg(test)]
mod tests;

pub use config::{EngineConfig, InitializedStores, MemoryBackend, StateBackend, StoreSettings};
pub use context::{StackContext, INPUT_KEY};
pub use dag::Dag;
pub use engine::{ExecuteOptions, RunEvent, StackEngine, StackEngineBuilder, StackInspection};
pub use error::{EngineError, RuntimeError};
pub use image::{ImageInfo, ImageStore};
pub use logging::init_logging;
pub use memory::{
    Embedder, LocalMemoryStore, MemoryEntry, MemoryQuery, MemoryStore, ScoredEntry,
    VectorMemoryStore,
};
#[cfg(feature = "sqlite")]
pub use memory::SqliteMemoryStore;
pub use runtime::{AgentRuntime, InvokeRequest, ModelRuntime, ProcessRuntime};
pub use shim::{
    CompletionRequest, MockShim, ModelShim, MultimodalRequest, OpenAiShim, ShimEmbedder,
    ShimError, StreamEvent,
};
pub use spec::{load_stack_spec, parse_stack_spec, validate_stack_spec, SpecError, SpecIssue};
pub use state::{FileStateStore, InMemoryStateStore, StateStore};
pub use types::{
    AgentDefinition, AgentOutput, AgentSpec, ChatMessage, ChatRole, ContentPart, ImageRef,
    ModelParameters, MultimodalConfig, NodeError, NodeErrorKind, NodeReport, NodeState,
    StackResult, StackSpec, StackStatus, StateVarSchema,
};
