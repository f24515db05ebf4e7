use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// A declarative collection of agents executed as one unit.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct StackSpec {
    /// The name of the stack.
    pub name: String,
    /// A brief description of what the stack does.
    #[serde(default)]
    pub description: String,
    /// Stack version, `major.minor.patch`.
    #[serde(default = "default_stack_version")]
    pub version: String,
    /// The agents in this stack, in declaration order.
    pub agents: Vec<AgentSpec>,
}

pub fn default_stack_version() -> String {
    "0.1.0".to_string()
}

/// One node's declaration inside a stack.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct AgentSpec {
    /// Unique id of this agent within the stack.
    pub id: String,
    /// Reference to an agent image in the form `name[:tag]`.
    pub uses: String,
    /// Peer ids whose outputs feed this agent.
    #[serde(default)]
    pub input_from: Vec<String>,
    /// Optional selector into the upstream output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_key: Option<String>,
    /// Optional key under which to publish this agent's output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,
    /// Opaque parameters handed through to the agent runtime.
    #[serde(default)]
    pub params: HashMap<String, Value>,
    /// Peer ids establishing ordering without data flow.
    #[serde(default)]
    pub depends: Vec<String>,
}

impl AgentSpec {
    /// All predecessor ids, data-flow and ordering-only alike.
    pub fn predecessors(&self) -> impl Iterator<Item = &String> {
        self.input_from.iter().chain(self.depends.iter())
    }
}

/// A parsed `name[:tag]` image reference. The tag defaults to `latest`.
///
/// Tags may not contain `_`: the store lays images out as
/// `<name>_<tag>.yaml`, and the underscore is what separates the two.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub name: String,
    pub tag: String,
}

pub const DEFAULT_TAG: &str = "latest";

impl ImageRef {
    pub fn parse(reference: &str) -> anyhow::Result<Self> {
        let (name, tag) = match reference.split_once(':') {
            Some((name, tag)) => (name, tag),
            None => (reference, DEFAULT_TAG),
        };
        if name.is_empty() {
            anyhow::bail!("image reference has an empty name: {:?}", reference);
        }
        if tag.is_empty() || tag.contains(':') || tag.contains('_') {
            anyhow::bail!("image reference has an invalid tag: {:?}", reference);
        }
        Ok(Self {
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

/// A stored agent definition, resolved from an image reference.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct AgentDefinition {
    /// The name of the agent.
    pub name: String,
    /// A brief description of the agent's purpose.
    #[serde(default)]
    pub description: String,
    /// Base model identifier handed to the model shim.
    #[serde(default = "default_base_model")]
    pub base_model: String,
    /// Free-form capability labels.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Sampling parameters for the model.
    #[serde(default)]
    pub parameters: ModelParameters,
    /// The system prompt for the agent, if any.
    #[serde(default)]
    pub system_prompt: String,
    /// Template rendered with the assembled input; `{input}` is replaced.
    #[serde(default = "default_prompt_template")]
    pub prompt_template: String,
    /// Names of tools available to the agent.
    #[serde(default)]
    pub tools: Vec<String>,
    /// State variables the runtime maintains for this agent.
    #[serde(default)]
    pub state_schema: HashMap<String, StateVarSchema>,
    /// Multimodal input configuration.
    #[serde(default)]
    pub multimodal: MultimodalConfig,
}

pub fn default_base_model() -> String {
    "gpt-4o-mini".to_string()
}

pub fn default_prompt_template() -> String {
    "{input}".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ModelParameters {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
}

impl Default for ModelParameters {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: default_top_p(),
        }
    }
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_top_p() -> f32 {
    1.0
}

/// Declared schema for one persisted state variable.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct StateVarSchema {
    #[serde(default, rename = "type")]
    pub var_type: String,
    /// Initial value written when the variable is first seen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct MultimodalConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub supported_media_types: Vec<String>,
}

/// What one node publishes: named values plus an optional primary value.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AgentOutput {
    pub values: HashMap<String, Value>,
    pub primary: Option<Value>,
}

impl AgentOutput {
    pub fn text(text: impl Into<String>) -> Self {
        let text = text.into();
        let mut values = HashMap::new();
        values.insert("text".to_string(), Value::String(text.clone()));
        Self {
            values,
            primary: Some(Value::String(text)),
        }
    }

    pub fn from_value(value: Value) -> Self {
        let values = match &value {
            Value::Object(map) => map.clone().into_iter().collect(),
            other => {
                let mut values = HashMap::new();
                values.insert("value".to_string(), other.clone());
                values
            }
        };
        Self {
            values,
            primary: Some(value),
        }
    }

    /// Sub-value under `key`, falling back to the primary value for the
    /// conventional `text` key.
    pub fn select(&self, key: &str) -> Option<Value> {
        self.values
            .get(key)
            .cloned()
            .or_else(|| match (key, &self.primary) {
                ("text", Some(primary)) => Some(primary.clone()),
                _ => None,
            })
    }

    /// The primary value if set, otherwise the full value map.
    pub fn resolved(&self) -> Value {
        match &self.primary {
            Some(primary) => primary.clone(),
            None => Value::Object(self.values.clone().into_iter().collect()),
        }
    }

    pub fn as_text(&self) -> Option<String> {
        match self.resolved() {
            Value::String(text) => Some(text),
            _ => None,
        }
    }
}

/// Lifecycle of one DAG node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum NodeState {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeState::Completed | NodeState::Failed | NodeState::Skipped | NodeState::Cancelled
        )
    }

    /// A successor may start once every predecessor satisfies this.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, NodeState::Completed | NodeState::Skipped)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NodeState::Pending => "pending",
            NodeState::Ready => "ready",
            NodeState::Running => "running",
            NodeState::Completed => "completed",
            NodeState::Failed => "failed",
            NodeState::Skipped => "skipped",
            NodeState::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Error kind attached to a failed or cancelled node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeErrorKind {
    AgentFailure,
    Timeout,
    Cancelled,
    UnresponsiveCancel,
    Shim,
    Backend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeError {
    pub kind: NodeErrorKind,
    pub message: String,
}

impl NodeError {
    pub fn new(kind: NodeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Per-node outcome included in the final result and in Inspect snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReport {
    pub id: String,
    pub state: NodeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
}

/// Terminal status of one stack execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackStatus {
    AllCompleted,
    PartialFailure,
    AllCancelled,
    SystemError,
}

/// Aggregate result of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackResult {
    pub stack_id: String,
    pub status: StackStatus,
    pub nodes: Vec<NodeReport>,
    /// Published outputs keyed by agent id (and `outputKey` aliases).
    pub outputs: HashMap<String, AgentOutput>,
}

impl StackResult {
    fn ids_in_state(&self, state: NodeState) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.state == state)
            .map(|n| n.id.as_str())
            .collect()
    }

    pub fn completed(&self) -> Vec<&str> {
        self.ids_in_state(NodeState::Completed)
    }

    pub fn failed(&self) -> Vec<&str> {
        self.ids_in_state(NodeState::Failed)
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.ids_in_state(NodeState::Skipped)
    }

    pub fn cancelled(&self) -> Vec<&str> {
        self.ids_in_state(NodeState::Cancelled)
    }

    pub fn output(&self, agent_id: &str) -> Option<&AgentOutput> {
        self.outputs.get(agent_id)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    Assistant,
    User,
}

#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema, PartialEq)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum ContentPart {
    Text {
        text: String,
    },
    // bytes are base64 encoded
    Image {
        bytes: String,
        mime_type: String,
    },
}

/// One message in an agent's conversation history.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub parts: Vec<ContentPart>,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    fn with_text(role: ChatRole, text: String) -> Self {
        Self {
            role,
            parts: vec![ContentPart::Text { text }],
            timestamp: Utc::now(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::with_text(ChatRole::System, text.into())
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::with_text(ChatRole::User, text.into())
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::with_text(ChatRole::Assistant, text.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self.parts.first() {
            Some(ContentPart::Text { text }) => Some(text),
            _ => None,
        }
    }
}
