use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::db::models::{AttachmentRef, ChatMessage, ChatSession, NewMessage};
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::ingest::Ingestor;
use crate::llm::{ChatModel, ChatRequest};
use crate::retrieval::{RetrievalScope, Retriever};
use crate::tools::{ToolInvoker, ToolSpec};

use super::context::{build_messages, TurnContext};
use super::generation::Generation;
use super::registry::{ActiveStreams, TEMP_STREAM_ID};
use super::stream::StreamEvent;

/// Parameters of one streamed turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamRequest {
    pub session_id: Option<String>,
    pub message: String,
    pub model_name: String,
    pub include_history: bool,
    pub system_prompt: Option<String>,
    pub temperature: f32,
    pub top_p: f32,
    pub seed: Option<i64>,
    pub max_tokens: Option<u32>,
    pub max_completion_tokens: Option<u32>,
    pub use_rag: bool,
    pub rag_limit: Option<usize>,
    pub attachments: Vec<AttachmentRef>,
}

impl StreamRequest {
    pub fn from_config(config: &AppConfig, session_id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            session_id,
            message: message.into(),
            model_name: config.model_name.clone(),
            include_history: config.include_conversation_history,
            system_prompt: (!config.system_prompt.trim().is_empty())
                .then(|| config.system_prompt.clone()),
            temperature: config.temperature,
            top_p: config.top_p,
            seed: config.seed,
            max_tokens: config.max_tokens,
            max_completion_tokens: config.max_completion_tokens,
            use_rag: config.use_rag,
            rag_limit: Some(config.rag_limit),
            attachments: Vec::new(),
        }
    }

    pub fn stream_key(&self) -> &str {
        self.session_id.as_deref().unwrap_or(TEMP_STREAM_ID)
    }
}

impl Default for StreamRequest {
    fn default() -> Self {
        Self::from_config(&AppConfig::default(), None, String::new())
    }
}

/// The command surface a chat front end drives.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn create_chat_session(&self, title: &str, model_id: Option<&str>) -> Result<ChatSession>;

    async fn get_session(&self, session_id: &str) -> Result<Option<ChatSession>>;

    async fn add_message_to_session(&self, session_id: &str, message: NewMessage) -> Result<ChatMessage>;

    async fn get_session_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>>;

    async fn delete_chat_session(&self, session_id: &str) -> Result<()>;

    async fn delete_message(&self, session_id: &str, message_id: &str) -> Result<()>;

    /// Start generating. Events arrive on the returned channel and end with
    /// exactly one terminal event (`finished` token or `chat-error`).
    async fn stream_chat_completion(
        &self,
        request: StreamRequest,
    ) -> Result<mpsc::UnboundedReceiver<StreamEvent>>;

    async fn stop_chat_streaming(&self, stream_id: &str) -> Result<()>;
}

/// In-process backend over the local database and model server.
pub struct LocalBackend {
    db: Arc<Database>,
    model: Arc<dyn ChatModel>,
    streams: Arc<ActiveStreams>,
    ingestor: Option<Arc<Ingestor>>,
    retriever: Option<Arc<Retriever>>,
    tools: Option<Arc<dyn ToolInvoker>>,
    idle_timeout: Duration,
}

impl LocalBackend {
    pub fn new(db: Arc<Database>, model: Arc<dyn ChatModel>) -> Self {
        Self {
            db,
            model,
            streams: Arc::new(ActiveStreams::new()),
            ingestor: None,
            retriever: None,
            tools: None,
            idle_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_ingestor(mut self, ingestor: Arc<Ingestor>) -> Self {
        self.ingestor = Some(ingestor);
        self
    }

    pub fn with_retriever(mut self, retriever: Arc<Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolInvoker>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Share an existing registry so streams survive a backend rebuild.
    pub fn with_streams(mut self, streams: Arc<ActiveStreams>) -> Self {
        self.streams = streams;
        self
    }

    pub fn streams(&self) -> &Arc<ActiveStreams> {
        &self.streams
    }

    async fn prepare(&self, request: &StreamRequest) -> Result<ChatRequest> {
        if request.message.trim().is_empty() && request.attachments.is_empty() {
            return Err(AppError::InvalidInput("message is empty".into()));
        }

        let history = match (&request.session_id, request.include_history) {
            (Some(id), true) => self.db.get_messages(id)?,
            _ => Vec::new(),
        };

        if let Some(ingestor) = &self.ingestor {
            let report = ingestor.prepare_attachments(&request.attachments).await;
            for failed in &report.failed {
                tracing::warn!(file = %failed.file_name, error = %failed.error, "Attachment could not be ingested");
            }
        }

        let retrieved = match (
            &self.retriever,
            RetrievalScope::for_turn(
                request.use_rag,
                request.rag_limit.unwrap_or(5),
                &request.attachments,
            ),
        ) {
            (Some(retriever), Some(scope)) => retriever.retrieve_or_empty(&request.message, &scope).await,
            _ => Vec::new(),
        };

        let tools: Vec<ToolSpec> = match &self.tools {
            Some(tools) => tools.list_tools().await.unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Could not list tools, continuing without them");
                Vec::new()
            }),
            None => Vec::new(),
        };

        let images = request
            .attachments
            .iter()
            .filter(|a| a.is_image)
            .map(|a| a.file_path.clone())
            .collect();

        let messages = build_messages(TurnContext {
            system_prompt: request.system_prompt.as_deref(),
            retrieved: &retrieved,
            tools: &tools,
            history: &history,
            message: &request.message,
            images,
        });

        tracing::debug!(
            stream = %request.stream_key(),
            messages = messages.len(),
            context_chunks = retrieved.len(),
            tools = tools.len(),
            "Prepared chat request"
        );

        Ok(ChatRequest {
            messages,
            model: request.model_name.clone(),
            temperature: request.temperature,
            top_p: request.top_p,
            seed: request.seed,
            max_tokens: request.max_tokens,
            max_completion_tokens: request.max_completion_tokens,
        })
    }
}

#[async_trait]
impl ChatBackend for LocalBackend {
    async fn create_chat_session(&self, title: &str, model_id: Option<&str>) -> Result<ChatSession> {
        self.db.create_session(title, model_id)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<ChatSession>> {
        self.db.get_session(session_id)
    }

    async fn add_message_to_session(&self, session_id: &str, message: NewMessage) -> Result<ChatMessage> {
        self.db.add_message(session_id, &message)
    }

    async fn get_session_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        self.db.get_messages(session_id)
    }

    async fn delete_chat_session(&self, session_id: &str) -> Result<()> {
        self.db.delete_session(session_id)
    }

    async fn delete_message(&self, session_id: &str, message_id: &str) -> Result<()> {
        self.db.delete_message(session_id, message_id)
    }

    async fn stream_chat_completion(
        &self,
        request: StreamRequest,
    ) -> Result<mpsc::UnboundedReceiver<StreamEvent>> {
        let key = request.stream_key().to_string();
        let cancel = self.streams.register(&key)?;

        let chat_request = match self.prepare(&request).await {
            Ok(chat_request) => chat_request,
            Err(e) => {
                self.streams.finish(&key);
                return Err(e);
            }
        };

        let (events, receiver) = mpsc::unbounded_channel();
        let generation = Generation {
            model: self.model.clone(),
            request: chat_request,
            tools: self.tools.clone(),
            idle_timeout: self.idle_timeout,
            cancel,
            streams: self.streams.clone(),
            stream_key: key.clone(),
            events,
        };
        tracing::info!(stream = %key, model = %request.model_name, "Starting generation");
        tokio::spawn(generation.run());
        Ok(receiver)
    }

    async fn stop_chat_streaming(&self, stream_id: &str) -> Result<()> {
        self.streams.cancel(stream_id)
    }
}
