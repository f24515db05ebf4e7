//! Provider-neutral model shim.
//!
//! Everything above this layer talks to language models through
//! [`ModelShim`]: plain and streaming completion, multimodal variants,
//! and embeddings. The shim surfaces transient/fatal/timeout failures and
//! honors a deadline plus a cancellation token on every call, but it never
//! retries; retry policy belongs to the agent runtime, which keeps shims
//! stateless and trivially mockable.

mod mock;
mod openai;

pub use mock::MockShim;
pub use openai::OpenAiShim;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::memory::Embedder;
use crate::types::ContentPart;

#[derive(Error, Debug, Clone)]
pub enum ShimError {
    /// Network or rate-limit failure; the caller may retry.
    #[error("transient shim error: {0}")]
    Transient(String),
    /// Auth or malformed-request failure; retrying cannot help.
    #[error("fatal shim error: {0}")]
    Fatal(String),
    #[error("shim deadline exceeded")]
    Timeout,
}

impl ShimError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ShimError::Transient(_) | ShimError::Timeout)
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub deadline: Duration,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            system_prompt: None,
            max_tokens: 1000,
            temperature: 0.7,
            deadline: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MultimodalRequest {
    pub model: String,
    pub parts: Vec<ContentPart>,
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub deadline: Duration,
}

/// One element of a streaming completion. Streams are bounded: after zero
/// or more `Chunk`s, exactly one `Final` carries the assembled text and
/// closes the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Chunk(String),
    Final { text: String },
}

/// Capacity of streaming channels; producers block (back-pressure) rather
/// than buffer unboundedly.
pub const STREAM_CHANNEL_CAPACITY: usize = 32;

#[async_trait]
pub trait ModelShim: Send + Sync {
    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<String, ShimError>;

    async fn complete_stream(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>, ShimError>;

    async fn complete_multimodal(
        &self,
        _request: MultimodalRequest,
        _cancel: CancellationToken,
    ) -> Result<String, ShimError> {
        Err(ShimError::Fatal(
            "this shim does not support multimodal input".to_string(),
        ))
    }

    async fn complete_multimodal_stream(
        &self,
        _request: MultimodalRequest,
        _cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>, ShimError> {
        Err(ShimError::Fatal(
            "this shim does not support multimodal input".to_string(),
        ))
    }

    async fn embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ShimError>;

    fn supports_multimodal(&self) -> bool {
        false
    }
}

/// Adapter exposing a shim's embeddings through the memory layer's
/// [`Embedder`] capability trait.
pub struct ShimEmbedder {
    shim: Arc<dyn ModelShim>,
}

impl ShimEmbedder {
    pub fn new(shim: Arc<dyn ModelShim>) -> Self {
        Self { shim }
    }
}

#[async_trait]
impl Embedder for ShimEmbedder {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.shim
            .embeddings(texts)
            .await
            .map_err(|e| anyhow::anyhow!(e))
    }
}
