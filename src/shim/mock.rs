use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Barrier, Mutex};
use tokio_util::sync::CancellationToken;

use super::{
    CompletionRequest, ModelShim, MultimodalRequest, ShimError, StreamEvent,
    STREAM_CHANNEL_CAPACITY,
};
use crate::types::ContentPart;

/// Scripted shim for tests and examples.
///
/// Behavior is selected by model name: `mock/upper` uppercases the prompt,
/// `mock/reverse` reverses it, `mock/echo` returns it unchanged,
/// `mock/fail` always fails fatally. Anything else echoes. The builders
/// add latency, scripted transient failures, and a rendezvous barrier used
/// to prove that independent nodes really overlap.
#[derive(Clone, Default)]
pub struct MockShim {
    delay: Option<Duration>,
    barrier: Option<(Arc<Barrier>, Vec<String>)>,
    transient_failures: Arc<AtomicU32>,
    invocations: Arc<Mutex<Vec<String>>>,
}

impl MockShim {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long before every completion.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Completions for the listed models rendezvous on `barrier` before
    /// answering; an empty list applies to every model.
    pub fn with_barrier(mut self, barrier: Arc<Barrier>, models: &[&str]) -> Self {
        self.barrier = Some((barrier, models.iter().map(|m| m.to_string()).collect()));
        self
    }

    /// Fail the next `count` completions with a transient error.
    pub fn with_transient_failures(self, count: u32) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Models handed to `complete`, in call order.
    pub async fn invocations(&self) -> Vec<String> {
        self.invocations.lock().await.clone()
    }

    async fn respond(
        &self,
        model: &str,
        prompt: &str,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, ShimError> {
        self.invocations.lock().await.push(model.to_string());

        if let Some((barrier, models)) = &self.barrier {
            if models.is_empty() || models.iter().any(|m| m == model) {
                barrier.wait().await;
            }
        }
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = tokio::time::sleep(deadline) => return Err(ShimError::Timeout),
                _ = cancel.cancelled() => {
                    return Err(ShimError::Transient("request cancelled".to_string()));
                }
            }
        }

        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ShimError::Transient("scripted transient failure".to_string()));
        }

        let behavior = model.strip_prefix("mock/").unwrap_or(model);
        match behavior {
            "upper" => Ok(prompt.to_uppercase()),
            "reverse" => Ok(prompt.chars().rev().collect()),
            "fail" => Err(ShimError::Fatal("scripted failure".to_string())),
            _ => Ok(prompt.to_string()),
        }
    }
}

#[async_trait]
impl ModelShim for MockShim {
    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<String, ShimError> {
        self.respond(&request.model, &request.prompt, request.deadline, &cancel)
            .await
    }

    async fn complete_stream(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>, ShimError> {
        let text = self
            .respond(&request.model, &request.prompt, request.deadline, &cancel)
            .await?;

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            for word in text.split_inclusive(' ') {
                if tx.send(StreamEvent::Chunk(word.to_string())).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(StreamEvent::Final { text }).await;
        });
        Ok(rx)
    }

    async fn complete_multimodal(
        &self,
        request: MultimodalRequest,
        cancel: CancellationToken,
    ) -> Result<String, ShimError> {
        let mut text_parts = Vec::new();
        let mut images = 0usize;
        for part in &request.parts {
            match part {
                ContentPart::Text { text } => text_parts.push(text.clone()),
                ContentPart::Image { .. } => images += 1,
            }
        }
        let mut prompt = text_parts.join(" ");
        if images > 0 {
            prompt.push_str(&format!(" [{} image(s)]", images));
        }
        self.respond(&request.model, &prompt, request.deadline, &cancel)
            .await
    }

    async fn complete_multimodal_stream(
        &self,
        request: MultimodalRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>, ShimError> {
        let text = self.complete_multimodal(request, cancel).await?;
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let _ = tx.send(StreamEvent::Chunk(text.clone())).await;
            let _ = tx.send(StreamEvent::Final { text }).await;
        });
        Ok(rx)
    }

    async fn embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ShimError> {
        Ok(texts.iter().map(|t| letter_frequency(t)).collect())
    }

    fn supports_multimodal(&self) -> bool {
        true
    }
}

/// Deterministic 26-dimensional letter-frequency embedding, normalized so
/// cosine scores are meaningful in tests.
fn letter_frequency(text: &str) -> Vec<f32> {
    let mut counts = [0.0f32; 26];
    for c in text.to_lowercase().chars() {
        if c.is_ascii_lowercase() {
            counts[(c as u8 - b'a') as usize] += 1.0;
        }
    }
    let norm = counts.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        counts.iter_mut().for_each(|v| *v /= norm);
    }
    counts.to_vec()
}
