use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{input_text, validate_params, AgentRuntime, InvokeRequest};
use crate::error::RuntimeError;
use crate::state::StateStore;
use crate::types::{AgentOutput, ChatMessage};

/// Sub-process runtime for agents backed by an opaque external executable.
///
/// The child receives one JSON payload on stdin:
/// `{ "agent": <name>, "input": <assembled input>, "params": <params> }`
/// and answers with JSON (parsed into an [`AgentOutput`]) or plain text on
/// stdout. Cancellation kills the child.
///
/// Recognized params: `command` (required), `args`, `env`, `timeout`
/// (seconds, read by the engine).
pub struct ProcessRuntime {
    state: Arc<dyn StateStore>,
}

impl ProcessRuntime {
    pub fn new(state: Arc<dyn StateStore>) -> Self {
        Self { state }
    }

    fn command_line(params: &HashMap<String, Value>) -> Result<(String, Vec<String>), RuntimeError> {
        let command = params
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RuntimeError::Params("params.command is required".to_string()))?
            .to_string();
        let args = params
            .get("args")
            .and_then(|v| v.as_array())
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok((command, args))
    }
}

#[async_trait]
impl AgentRuntime for ProcessRuntime {
    async fn invoke(&self, request: InvokeRequest) -> Result<AgentOutput, RuntimeError> {
        if request.cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        validate_params(&self.params_schema(), &request.params)?;
        let (command, args) = Self::command_line(&request.params)?;

        let mut builder = Command::new(&command);
        builder
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(env) = request.params.get("env").and_then(|v| v.as_object()) {
            for (key, value) in env {
                if let Some(value) = value.as_str() {
                    builder.env(key, value);
                }
            }
        }

        let mut child = builder
            .spawn()
            .map_err(|e| RuntimeError::Process(format!("failed to spawn {:?}: {}", command, e)))?;

        let payload = serde_json::to_vec(&json!({
            "agent": request.definition.name,
            "input": request.input,
            "params": request.params,
        }))
        .map_err(|e| RuntimeError::Process(e.to_string()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| RuntimeError::Process("child stdin unavailable".to_string()))?;
        stdin
            .write_all(&payload)
            .await
            .map_err(|e| RuntimeError::Process(e.to_string()))?;
        drop(stdin);

        let output = tokio::select! {
            output = child.wait_with_output() => {
                output.map_err(|e| RuntimeError::Process(e.to_string()))?
            }
            _ = request.cancel.cancelled() => {
                // kill_on_drop reaps the child when the future above drops.
                return Err(RuntimeError::Cancelled);
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::Process(format!(
                "{:?} exited with {}: {}",
                command,
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let agent_output = match serde_json::from_str::<Value>(stdout.trim()) {
            Ok(value) => AgentOutput::from_value(value),
            Err(_) => AgentOutput::text(stdout.trim()),
        };

        let state_err = |e: anyhow::Error| RuntimeError::State(e.to_string());
        self.state
            .append_history(
                &request.session_id,
                ChatMessage::user(input_text(&request.input)),
            )
            .await
            .map_err(state_err)?;
        self.state
            .append_history(
                &request.session_id,
                ChatMessage::assistant(stdout.trim().to_string()),
            )
            .await
            .map_err(state_err)?;

        Ok(agent_output)
    }

    fn params_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "minLength": 1 },
                "args": { "type": "array", "items": { "type": "string" } },
                "env": { "type": "object", "additionalProperties": { "type": "string" } },
                "timeout": { "type": "number", "exclusiveMinimum": 0 }
            },
            "required": ["command"]
        })
    }
}
