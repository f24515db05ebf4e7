use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{
    call_with_retry, input_text, map_shim_error, read_with_retry, validate_params, AgentRuntime,
    InvokeRequest,
};
use crate::error::RuntimeError;
use crate::memory::{MemoryEntry, MemoryQuery, MemoryStore};
use crate::shim::{CompletionRequest, ModelShim, MultimodalRequest};
use crate::state::StateStore;
use crate::types::{AgentOutput, ChatMessage, ChatRole, ContentPart};

/// Number of history messages folded into the prompt.
const HISTORY_WINDOW: usize = 10;

const RECALL_TOP_K: usize = 3;

/// In-process runtime: synthesizes a prompt from the agent's templates,
/// its conversation history, and the assembled input, then invokes the
/// model shim directly.
///
/// Recognized params: `timeout` (seconds, read by the engine),
/// `temperature` and `maxTokens` (override the definition's sampling
/// parameters), `recall` (inject matching memory entries into the prompt),
/// `remember` (store the exchange in memory after the step).
pub struct ModelRuntime {
    shim: Arc<dyn ModelShim>,
    state: Arc<dyn StateStore>,
    memory: Arc<dyn MemoryStore>,
    max_attempts: u32,
}

impl ModelRuntime {
    pub fn new(
        shim: Arc<dyn ModelShim>,
        state: Arc<dyn StateStore>,
        memory: Arc<dyn MemoryStore>,
        max_attempts: u32,
    ) -> Self {
        Self {
            shim,
            state,
            memory,
            max_attempts: max_attempts.max(1),
        }
    }

    async fn synthesize_prompt(&self, request: &InvokeRequest) -> Result<String, RuntimeError> {
        let rendered = request
            .definition
            .prompt_template
            .replace("{input}", &input_text(&request.input));

        let mut prompt = String::new();

        if param_flag(&request.params, "recall") {
            let recalled = read_with_retry("memory", || {
                self.memory.query(
                    &request.agent_id,
                    MemoryQuery::Text(rendered.clone()),
                    RECALL_TOP_K,
                    None,
                )
            })
            .await
            .map_err(|e| RuntimeError::State(e.to_string()))?;
            if !recalled.is_empty() {
                prompt.push_str("Relevant memory:\n");
                for scored in &recalled {
                    prompt.push_str(&format!("- {}\n", scored.entry.text()));
                }
                prompt.push('\n');
            }
        }

        let history = read_with_retry("history", || self.state.get_history(&request.session_id))
            .await
            .map_err(|e| RuntimeError::State(e.to_string()))?;
        let start = history.len().saturating_sub(HISTORY_WINDOW);
        for message in &history[start..] {
            if let Some(text) = message.as_text() {
                let role = match message.role {
                    ChatRole::User => "user",
                    ChatRole::Assistant => "assistant",
                    ChatRole::System => "system",
                };
                prompt.push_str(&format!("{}: {}\n", role, text));
            }
        }
        if !history.is_empty() {
            prompt.push('\n');
        }

        prompt.push_str(&rendered);
        Ok(prompt)
    }

    /// Images carried in the assembled input under an `images` array.
    fn input_images(input: &Value) -> Vec<ContentPart> {
        let Some(images) = input.get("images").and_then(|v| v.as_array()) else {
            return Vec::new();
        };
        images
            .iter()
            .filter_map(|image| {
                serde_json::from_value::<ContentPart>(image.clone())
                    .ok()
                    .filter(|p| matches!(p, ContentPart::Image { .. }))
            })
            .collect()
    }

    async fn complete(
        &self,
        request: &InvokeRequest,
        prompt: String,
    ) -> Result<String, RuntimeError> {
        let definition = &request.definition;
        let system_prompt = if definition.system_prompt.is_empty() {
            None
        } else {
            Some(definition.system_prompt.clone())
        };
        let temperature = param_f32(&request.params, "temperature")
            .unwrap_or(definition.parameters.temperature);
        let max_tokens =
            param_u32(&request.params, "maxTokens").unwrap_or(definition.parameters.max_tokens);

        let images = Self::input_images(&request.input);
        let use_multimodal =
            definition.multimodal.enabled && !images.is_empty() && self.shim.supports_multimodal();

        let response = if use_multimodal {
            let mut parts = vec![ContentPart::Text {
                text: prompt.clone(),
            }];
            parts.extend(images);
            let multimodal = MultimodalRequest {
                model: definition.base_model.clone(),
                parts,
                system_prompt,
                max_tokens,
                temperature,
                deadline: request.deadline,
            };
            call_with_retry(self.max_attempts, &request.cancel, || {
                self.shim
                    .complete_multimodal(multimodal.clone(), request.cancel.clone())
            })
            .await
        } else {
            let completion = CompletionRequest {
                model: definition.base_model.clone(),
                prompt,
                system_prompt,
                max_tokens,
                temperature,
                deadline: request.deadline,
            };
            call_with_retry(self.max_attempts, &request.cancel, || {
                self.shim.complete(completion.clone(), request.cancel.clone())
            })
            .await
        };
        response.map_err(|e| map_shim_error(e, &request.cancel))
    }

    /// Persist the exchange and maintain declared state variables.
    async fn post_process(
        &self,
        request: &InvokeRequest,
        user_text: &str,
        response: &str,
    ) -> Result<(), RuntimeError> {
        let state_err = |e: anyhow::Error| RuntimeError::State(e.to_string());

        self.state
            .append_history(&request.session_id, ChatMessage::user(user_text))
            .await
            .map_err(state_err)?;
        self.state
            .append_history(&request.session_id, ChatMessage::assistant(response))
            .await
            .map_err(state_err)?;

        for (name, schema) in &request.definition.state_schema {
            match (name.as_str(), schema.var_type.as_str()) {
                ("last_response", _) => {
                    self.state
                        .set(&request.agent_id, name, json!(response))
                        .await
                        .map_err(state_err)?;
                }
                (_, "counter") => {
                    let current = read_with_retry("state", || self.state.get(&request.agent_id, name))
                        .await
                        .map_err(state_err)?
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0);
                    self.state
                        .set(&request.agent_id, name, json!(current + 1))
                        .await
                        .map_err(state_err)?;
                }
                _ => {
                    if let Some(default) = &schema.default {
                        let existing =
                            read_with_retry("state", || self.state.get(&request.agent_id, name))
                                .await
                                .map_err(state_err)?;
                        if existing.is_none() {
                            self.state
                                .set(&request.agent_id, name, default.clone())
                                .await
                                .map_err(state_err)?;
                        }
                    }
                }
            }
        }

        if param_flag(&request.params, "remember") {
            let entry = MemoryEntry::new(
                request.agent_id.clone(),
                String::new(),
                json!(format!("{} => {}", user_text, response)),
            )
            .with_metadata("session", json!(request.session_id));
            self.memory
                .add(entry)
                .await
                .map_err(|e| RuntimeError::State(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl AgentRuntime for ModelRuntime {
    async fn invoke(&self, request: InvokeRequest) -> Result<AgentOutput, RuntimeError> {
        if request.cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        validate_params(&self.params_schema(), &request.params)?;

        let prompt = self.synthesize_prompt(&request).await?;
        tracing::debug!(
            agent = %request.agent_id,
            model = %request.definition.base_model,
            "invoking model shim"
        );
        let response = self.complete(&request, prompt).await?;

        let user_text = input_text(&request.input);
        self.post_process(&request, &user_text, &response).await?;

        Ok(AgentOutput::text(response))
    }

    fn params_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "timeout": { "type": "number", "exclusiveMinimum": 0 },
                "temperature": { "type": "number" },
                "maxTokens": { "type": "integer", "minimum": 1 },
                "recall": { "type": "boolean" },
                "remember": { "type": "boolean" }
            }
        })
    }
}

fn param_flag(params: &std::collections::HashMap<String, Value>, key: &str) -> bool {
    params.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn param_f32(params: &std::collections::HashMap<String, Value>, key: &str) -> Option<f32> {
    params.get(key).and_then(|v| v.as_f64()).map(|v| v as f32)
}

fn param_u32(params: &std::collections::HashMap<String, Value>, key: &str) -> Option<u32> {
    params.get(key).and_then(|v| v.as_u64()).map(|v| v as u32)
}
