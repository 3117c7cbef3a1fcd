pub mod openai;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::db::models::Usage;

/// A message as sent to the model. `images` holds local file paths that are
/// inlined for vision-capable models.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl PromptMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            images: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<PromptMessage>,
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub seed: Option<i64>,
    pub max_tokens: Option<u32>,
    pub max_completion_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamChunk {
    pub delta: String,
    pub usage: Option<Usage>,
    pub done: bool,
}

impl StreamChunk {
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            delta: text.into(),
            ..Self::default()
        }
    }

    pub fn usage(usage: Usage) -> Self {
        Self {
            usage: Some(usage),
            ..Self::default()
        }
    }

    pub fn done() -> Self {
        Self {
            done: true,
            ..Self::default()
        }
    }
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, LlmError>> + Send>>;

/// A model that can stream a chat completion.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChunkStream, LlmError>;
}

/// OpenAI-compatible endpoints: the hosted API or a local model server.
#[derive(Debug, Clone)]
pub enum Provider {
    OpenAi(openai::OpenAiConfig),
    Local(openai::OpenAiConfig),
}

impl Provider {
    /// A keyed endpoint is treated as hosted, an unkeyed one as a local
    /// model server.
    pub fn from_endpoint(base_url: &str, api_key: &str) -> Self {
        let config = openai::OpenAiConfig {
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        };
        if api_key.is_empty() {
            Provider::Local(config)
        } else {
            Provider::OpenAi(config)
        }
    }

    pub fn config(&self) -> &openai::OpenAiConfig {
        match self {
            Provider::OpenAi(config) | Provider::Local(config) => config,
        }
    }
}

#[async_trait]
impl ChatModel for Provider {
    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChunkStream, LlmError> {
        openai::chat_stream(self.config(), request).await
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
    #[error("Could not read attachment {path}: {source}")]
    Attachment {
        path: String,
        source: std::io::Error,
    },
}

impl Serialize for LlmError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
