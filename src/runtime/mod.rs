//! The contract the engine uses to run one agent step.
//!
//! A runtime receives the resolved definition, the assembled input, the
//! node's params, and a cancellation handle; it returns the node's output.
//! Runtimes never see the StackContext — the engine passes exactly what the
//! node's data edges entitle it to. State and memory are theirs to use.

mod model;
mod process;

pub use model::ModelRuntime;
pub use process::ProcessRuntime;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::RuntimeError;
use crate::shim::ShimError;
use crate::types::{AgentDefinition, AgentOutput};

/// Everything one agent step needs.
#[derive(Clone)]
pub struct InvokeRequest {
    pub agent_id: String,
    /// Conversation session the step appends to; stable across executions
    /// of the same stack so history accumulates.
    pub session_id: String,
    pub definition: Arc<AgentDefinition>,
    /// Input assembled by the engine from upstream outputs.
    pub input: Value,
    pub params: HashMap<String, Value>,
    pub deadline: Duration,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn invoke(&self, request: InvokeRequest) -> Result<AgentOutput, RuntimeError>;

    /// JSON schema of the params keys this runtime recognizes. Validated
    /// before every invoke; unknown keys pass through untouched.
    fn params_schema(&self) -> Value;
}

pub(crate) fn validate_params(
    schema: &Value,
    params: &HashMap<String, Value>,
) -> Result<(), RuntimeError> {
    let validator =
        jsonschema::validator_for(schema).map_err(|e| RuntimeError::Params(e.to_string()))?;
    let instance = Value::Object(params.clone().into_iter().collect());
    validator
        .validate(&instance)
        .map_err(|e| RuntimeError::Params(e.to_string()))?;
    Ok(())
}

/// Render the assembled input as prompt text. A lone string input (the
/// common single-predecessor case) is used verbatim; a single-entry object
/// unwraps to its value; anything else renders as pretty JSON.
pub(crate) fn input_text(input: &Value) -> String {
    match input {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        Value::Object(map) if map.is_empty() => String::new(),
        Value::Object(map) if map.len() == 1 => {
            let value = map.values().next().expect("len checked");
            match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            }
        }
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

const RETRY_BASE_MILLIS: u64 = 200;
const RETRY_JITTER_MILLIS: u64 = 100;

const BACKEND_READ_RETRY_MILLIS: u64 = 100;

/// Retry an idempotent State/Memory Store read once with backoff. Writes
/// are never routed through here; they fail fast.
pub(crate) async fn read_with_retry<T, F, Fut>(what: &str, mut read: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    match read().await {
        Ok(value) => Ok(value),
        Err(e) => {
            let backoff = Duration::from_millis(
                BACKEND_READ_RETRY_MILLIS + rand::thread_rng().gen_range(0..RETRY_JITTER_MILLIS),
            );
            tracing::warn!("{} read failed: {}; retrying once in {:?}", what, e, backoff);
            tokio::time::sleep(backoff).await;
            read().await
        }
    }
}

/// Call the shim, retrying transient failures with exponential backoff and
/// jitter. The retry budget is the caller's; the shim itself never retries.
pub(crate) async fn call_with_retry<T, F, Fut>(
    max_attempts: u32,
    cancel: &CancellationToken,
    mut call: F,
) -> Result<T, ShimError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ShimError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts && !cancel.is_cancelled() => {
                let backoff = Duration::from_millis(
                    RETRY_BASE_MILLIS * 2u64.pow(attempt - 1)
                        + rand::thread_rng().gen_range(0..RETRY_JITTER_MILLIS),
                );
                tracing::warn!(
                    attempt,
                    max_attempts,
                    "transient shim error: {}; retrying in {:?}",
                    e,
                    backoff
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Map a shim failure, distinguishing cancellation observed mid-call.
pub(crate) fn map_shim_error(error: ShimError, cancel: &CancellationToken) -> RuntimeError {
    if cancel.is_cancelled() {
        RuntimeError::Cancelled
    } else {
        RuntimeError::Shim(error)
    }
}
