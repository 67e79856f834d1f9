pub mod openai;

use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub stream: bool,
}

/// Text deltas of one streamed completion. Dropping the stream aborts the
/// upstream request.
pub type DeltaStream = BoxStream<'static, Result<String, LlmError>>;

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn chat_stream(&self, request: &ChatRequest) -> Result<DeltaStream, LlmError>;
}

/// Completion backends; both speak the OpenAI chat-completions protocol.
#[derive(Debug, Clone)]
pub enum Provider {
    OpenAi(openai::OpenAiConfig),
    Ollama(openai::OpenAiConfig),
}

impl Provider {
    pub fn openai(api_key: String, base_url: String) -> Self {
        Provider::OpenAi(openai::OpenAiConfig { api_key, base_url })
    }

    pub fn ollama(host: String) -> Self {
        Provider::Ollama(openai::OpenAiConfig {
            api_key: String::new(),
            base_url: format!("{}/v1", host.trim_end_matches('/')),
        })
    }

    pub fn config(&self) -> &openai::OpenAiConfig {
        match self {
            Provider::OpenAi(config) | Provider::Ollama(config) => config,
        }
    }
}

/// A provider plus the shared HTTP client used for every call to it.
#[derive(Debug, Clone)]
pub struct LlmClient {
    provider: Provider,
    http: Client,
}

impl LlmClient {
    pub fn new(provider: Provider, timeout: Duration) -> Result<Self, LlmError> {
        let http = Client::builder().read_timeout(timeout).build()?;
        Ok(Self { provider, http })
    }
}

#[async_trait]
impl CompletionProvider for LlmClient {
    async fn chat_stream(&self, request: &ChatRequest) -> Result<DeltaStream, LlmError> {
        match &self.provider {
            Provider::OpenAi(config) | Provider::Ollama(config) => {
                openai::chat_stream(&self.http, config, request).await
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
}

impl Serialize for LlmError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
