use thiserror::Error;

use crate::spec::SpecError;

/// Errors surfaced by the engine's public operations.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid stack spec: {0}")]
    Validation(#[from] SpecError),
    #[error("agent image not found: {0}")]
    Resolution(String),
    #[error("cycle detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),
    #[error("stack has no entry point")]
    NoEntryPoint,
    #[error("stack not found: {0}")]
    NotFound(String),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("execution cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors produced by one agent step. The engine folds these into the
/// per-node report instead of failing the whole stack.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("model shim error: {0}")]
    Shim(#[from] crate::shim::ShimError),
    #[error("state error: {0}")]
    State(String),
    #[error("invalid params: {0}")]
    Params(String),
    #[error("subprocess error: {0}")]
    Process(String),
    #[error("step cancelled")]
    Cancelled,
}
