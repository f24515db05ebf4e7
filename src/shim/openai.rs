use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImageArgs,
        ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContentPart,
        CreateChatCompletionRequest, CreateEmbeddingRequestArgs, ImageUrlArgs,
    },
    Client,
};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    CompletionRequest, ModelShim, MultimodalRequest, ShimError, StreamEvent,
    STREAM_CHANNEL_CAPACITY,
};
use crate::types::ContentPart;

/// Shim for OpenAI-compatible chat completion endpoints.
///
/// This is the one place provider wire details live; the rest of the crate
/// sees only the [`ModelShim`] contract.
#[derive(Clone, Default)]
pub struct OpenAiShim {
    config: OpenAIConfig,
    embedding_model: String,
}

impl OpenAiShim {
    pub fn new() -> Self {
        Self {
            config: OpenAIConfig::default(),
            embedding_model: default_embedding_model(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.config = self.config.with_api_base(api_base);
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.config = self.config.with_api_key(api_key.into());
        self
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    fn client(&self) -> Client<OpenAIConfig> {
        Client::with_config(self.config.clone())
    }

    fn build_request(
        &self,
        model: String,
        system_prompt: Option<String>,
        user_message: ChatCompletionRequestMessage,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<CreateChatCompletionRequest, ShimError> {
        let mut messages = Vec::new();
        if let Some(system_prompt) = system_prompt {
            let system = ChatCompletionRequestSystemMessageArgs::default()
                .content(system_prompt)
                .build()
                .map_err(map_error)?;
            messages.push(ChatCompletionRequestMessage::System(system));
        }
        messages.push(user_message);

        Ok(CreateChatCompletionRequest {
            model,
            messages,
            max_tokens: Some(max_tokens),
            temperature: Some(temperature),
            ..Default::default()
        })
    }

    fn user_text_message(prompt: String) -> Result<ChatCompletionRequestMessage, ShimError> {
        let message = ChatCompletionRequestUserMessageArgs::default()
            .content(prompt)
            .build()
            .map_err(map_error)?;
        Ok(ChatCompletionRequestMessage::User(message))
    }

    fn user_multimodal_message(
        parts: &[ContentPart],
    ) -> Result<ChatCompletionRequestMessage, ShimError> {
        let mut content: Vec<ChatCompletionRequestUserMessageContentPart> = Vec::new();
        for part in parts {
            match part {
                ContentPart::Text { text } => {
                    let text_part = ChatCompletionRequestMessageContentPartTextArgs::default()
                        .text(text.clone())
                        .build()
                        .map_err(map_error)?;
                    content.push(text_part.into());
                }
                ContentPart::Image { bytes, mime_type } => {
                    let image_url = ImageUrlArgs::default()
                        .url(format!("data:{};base64,{}", mime_type, bytes))
                        .build()
                        .map_err(map_error)?;
                    let image_part = ChatCompletionRequestMessageContentPartImageArgs::default()
                        .image_url(image_url)
                        .build()
                        .map_err(map_error)?;
                    content.push(image_part.into());
                }
            }
        }
        let message = ChatCompletionRequestUserMessageArgs::default()
            .content(content)
            .build()
            .map_err(map_error)?;
        Ok(ChatCompletionRequestMessage::User(message))
    }

    async fn run_completion(
        &self,
        request: CreateChatCompletionRequest,
        deadline: std::time::Duration,
        cancel: CancellationToken,
    ) -> Result<String, ShimError> {
        let client = self.client();
        let chat = client.chat();
        let call = chat.create(request);

        let response = tokio::select! {
            result = tokio::time::timeout(deadline, call) => {
                result.map_err(|_| ShimError::Timeout)?.map_err(map_error)?
            }
            _ = cancel.cancelled() => {
                return Err(ShimError::Transient("request cancelled".to_string()));
            }
        };

        let choice = response
            .choices
            .first()
            .ok_or_else(|| ShimError::Fatal("completion returned no choices".to_string()))?;
        Ok(choice.message.content.clone().unwrap_or_default())
    }

    async fn run_stream(
        &self,
        mut request: CreateChatCompletionRequest,
        deadline: std::time::Duration,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>, ShimError> {
        request.stream = Some(true);
        let client = self.client();
        let chat = client.chat();
        let stream = tokio::select! {
            result = tokio::time::timeout(deadline, chat.create_stream(request)) => {
                result.map_err(|_| ShimError::Timeout)?.map_err(map_error)?
            }
            _ = cancel.cancelled() => {
                return Err(ShimError::Transient("request cancelled".to_string()));
            }
        };

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let stream_deadline = tokio::time::Instant::now() + deadline;
        tokio::spawn(async move {
            tokio::pin!(stream);
            let mut assembled = String::new();
            loop {
                let chunk = tokio::select! {
                    chunk = stream.next() => chunk,
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep_until(stream_deadline) => return,
                };
                match chunk {
                    Some(Ok(chunk)) => {
                        if let Some(delta) = chunk
                            .choices
                            .first()
                            .and_then(|c| c.delta.content.as_ref())
                        {
                            assembled.push_str(delta);
                            if tx.send(StreamEvent::Chunk(delta.clone())).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!("completion stream error: {}", e);
                        return;
                    }
                    None => break,
                }
            }
            let _ = tx.send(StreamEvent::Final { text: assembled }).await;
        });
        Ok(rx)
    }
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn map_error(error: OpenAIError) -> ShimError {
    match error {
        OpenAIError::Reqwest(e) => ShimError::Transient(e.to_string()),
        OpenAIError::ApiError(api) => {
            let kind = api.r#type.clone().unwrap_or_default();
            if kind.contains("rate_limit")
                || kind.contains("overloaded")
                || kind.contains("server_error")
            {
                ShimError::Transient(api.message)
            } else {
                ShimError::Fatal(api.message)
            }
        }
        other => ShimError::Fatal(other.to_string()),
    }
}

#[async_trait]
impl ModelShim for OpenAiShim {
    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<String, ShimError> {
        let user = Self::user_text_message(request.prompt)?;
        let chat = self.build_request(
            request.model,
            request.system_prompt,
            user,
            request.max_tokens,
            request.temperature,
        )?;
        self.run_completion(chat, request.deadline, cancel).await
    }

    async fn complete_stream(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>, ShimError> {
        let user = Self::user_text_message(request.prompt)?;
        let chat = self.build_request(
            request.model,
            request.system_prompt,
            user,
            request.max_tokens,
            request.temperature,
        )?;
        self.run_stream(chat, request.deadline, cancel).await
    }

    async fn complete_multimodal(
        &self,
        request: MultimodalRequest,
        cancel: CancellationToken,
    ) -> Result<String, ShimError> {
        let user = Self::user_multimodal_message(&request.parts)?;
        let chat = self.build_request(
            request.model,
            request.system_prompt,
            user,
            request.max_tokens,
            request.temperature,
        )?;
        self.run_completion(chat, request.deadline, cancel).await
    }

    async fn complete_multimodal_stream(
        &self,
        request: MultimodalRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>, ShimError> {
        let user = Self::user_multimodal_message(&request.parts)?;
        let chat = self.build_request(
            request.model,
            request.system_prompt,
            user,
            request.max_tokens,
            request.temperature,
        )?;
        self.run_stream(chat, request.deadline, cancel).await
    }

    async fn embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ShimError> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(self.embedding_model.clone())
            .input(texts.to_vec())
            .build()
            .map_err(map_error)?;
        let response = self
            .client()
            .embeddings()
            .create(request)
            .await
            .map_err(map_error)?;
        Ok(response.data.into_iter().map(|d| d.embedding).collect())
    }

    fn supports_multimodal(&self) -> bool {
        true
    }
}
