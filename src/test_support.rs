//! Deterministic stand-ins for the model server, shared by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::chat::backend::{ChatBackend, LocalBackend, StreamRequest};
use crate::chat::stream::StreamEvent;
use crate::db::models::{ChatMessage, ChatSession, Document, NewMessage, Usage};
use crate::embedding::Embedder;
use crate::error::{AppError, Result};
use crate::llm::{ChatModel, ChatRequest, ChunkStream, LlmError, StreamChunk};
use crate::tools::{ToolInvoker, ToolSpec};

/// Bag-of-words embedder: each lowercase word is hashed into one of `dim`
/// buckets. Identical texts produce identical vectors.
pub(crate) struct HashEmbedder {
    dim: usize,
    name: String,
    poison: Option<String>,
}

impl HashEmbedder {
    pub(crate) fn new(dim: usize) -> Self {
        Self {
            dim,
            name: "hash-embedder".into(),
            poison: None,
        }
    }

    /// Same vectors, reported under another model name.
    pub(crate) fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Fail any call whose input contains `word`.
    pub(crate) fn failing_on(mut self, word: &str) -> Self {
        self.poison = Some(word.to_string());
        self
    }

    fn vector(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0; self.dim];
        for word in text.split_whitespace() {
            let hash = word
                .to_lowercase()
                .bytes()
                .fold(2166136261u32, |h, b| (h ^ b as u32).wrapping_mul(16777619));
            v[hash as usize % self.dim] += 1.0;
        }
        // Keep empty text away from the zero vector.
        v[0] += 0.01;
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.name
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if let Some(poison) = &self.poison {
            if texts.iter().any(|t| t.contains(poison.as_str())) {
                return Err(AppError::Embedding(format!("refusing to embed {poison}")));
            }
        }
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }
}

pub(crate) fn chunk_doc(path: &str, index: usize, content: &str) -> Document {
    Document::new(
        format!("doc - Part {}", index + 1),
        content.to_string(),
        "txt".into(),
        path.to_string(),
        Some(index),
    )
}

/// One step of a scripted completion stream.
#[derive(Clone)]
pub(crate) enum Step {
    Token(&'static str),
    Usage(u32, u32),
    Fail(&'static str),
    /// Never yield again.
    Hang,
}

/// Chat model that replays one script per request, in order, and records
/// every request it receives.
pub(crate) struct ScriptedModel {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    delay: Duration,
    pub(crate) requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedModel {
    pub(crate) fn new(scripts: Vec<Vec<Step>>) -> Arc<Self> {
        Self::with_delay(scripts, Duration::ZERO)
    }

    pub(crate) fn with_delay(scripts: Vec<Vec<Step>>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            delay,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn replying(tokens: &[&'static str]) -> Arc<Self> {
        let mut script: Vec<Step> = tokens.iter().copied().map(Step::Token).collect();
        script.push(Step::Usage(5, tokens.len() as u32));
        Self::new(vec![script])
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn chat_stream(&self, request: &ChatRequest) -> std::result::Result<ChunkStream, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::Api {
                status: 503,
                message: "no scripted reply left".into(),
            })?;
        let delay = self.delay;

        let stream = futures::stream::unfold(VecDeque::from(script), move |mut steps| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let item = match steps.pop_front()? {
                Step::Token(t) => Ok(StreamChunk::delta(t)),
                Step::Usage(prompt, completion) => Ok(StreamChunk::usage(Usage {
                    prompt_tokens: prompt,
                    completion_tokens: completion,
                    total_tokens: prompt + completion,
                })),
                Step::Fail(message) => Err(LlmError::Api {
                    status: 500,
                    message: message.to_string(),
                }),
                Step::Hang => futures::future::pending().await,
            };
            Some((item, steps))
        });
        Ok(Box::pin(stream))
    }
}

/// Tool host with a fixed catalogue; `clock` answers, anything else fails.
#[derive(Default)]
pub(crate) struct RecordingTools {
    pub(crate) calls: Mutex<Vec<(String, Map<String, Value>)>>,
}

#[async_trait]
impl ToolInvoker for RecordingTools {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>> {
        Ok(vec![ToolSpec {
            name: "clock".into(),
            description: "Current time in a timezone".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "tz": { "type": "string" } }
            }),
        }])
    }

    async fn call_tool(&self, name: &str, arguments: Map<String, Value>) -> Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), arguments.clone()));
        match name {
            "clock" => Ok("12:00".into()),
            other => Err(AppError::InvalidInput(format!("unknown tool {other}"))),
        }
    }
}

/// Wraps a [`LocalBackend`] and records the name of every call. Faults can
/// be switched on to make individual calls fail.
pub(crate) struct RecordingBackend {
    pub(crate) inner: LocalBackend,
    calls: Mutex<Vec<String>>,
    failing_adds: AtomicUsize,
    refuse_streams: AtomicBool,
    yield_before_stream: AtomicBool,
}

impl RecordingBackend {
    pub(crate) fn new(inner: LocalBackend) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: Mutex::new(Vec::new()),
            failing_adds: AtomicUsize::new(0),
            refuse_streams: AtomicBool::new(false),
            yield_before_stream: AtomicBool::new(false),
        })
    }

    /// Fail the next `count` message writes.
    pub(crate) fn fail_adds(&self, count: usize) {
        self.failing_adds.store(count, Ordering::SeqCst);
    }

    /// Reject every stream before it is registered.
    pub(crate) fn refuse_streams(&self) {
        self.refuse_streams.store(true, Ordering::SeqCst);
    }

    /// Let other tasks run between the request and the stream registering.
    pub(crate) fn yield_before_stream(&self) {
        self.yield_before_stream.store(true, Ordering::SeqCst);
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls that change state or start a stream, in order.
    pub(crate) fn writes(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.starts_with("get_"))
            .collect()
    }
}

#[async_trait]
impl ChatBackend for RecordingBackend {
    async fn create_chat_session(&self, title: &str, model_id: Option<&str>) -> Result<ChatSession> {
        self.record("create_chat_session");
        self.inner.create_chat_session(title, model_id).await
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<ChatSession>> {
        self.record("get_session");
        self.inner.get_session(session_id).await
    }

    async fn add_message_to_session(&self, session_id: &str, message: NewMessage) -> Result<ChatMessage> {
        self.record(format!("add_message_to_session:{}", message.role));
        let failing = self
            .failing_adds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AppError::InvalidInput("disk full".into()));
        }
        self.inner.add_message_to_session(session_id, message).await
    }

    async fn get_session_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        self.record("get_session_messages");
        self.inner.get_session_messages(session_id).await
    }

    async fn delete_chat_session(&self, session_id: &str) -> Result<()> {
        self.record("delete_chat_session");
        self.inner.delete_chat_session(session_id).await
    }

    async fn delete_message(&self, session_id: &str, message_id: &str) -> Result<()> {
        self.record("delete_message");
        self.inner.delete_message(session_id, message_id).await
    }

    async fn stream_chat_completion(
        &self,
        request: StreamRequest,
    ) -> Result<mpsc::UnboundedReceiver<StreamEvent>> {
        self.record("stream_chat_completion");
        if self.yield_before_stream.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        if self.refuse_streams.load(Ordering::SeqCst) {
            return Err(AppError::InvalidInput("model server offline".into()));
        }
        self.inner.stream_chat_completion(request).await
    }

    async fn stop_chat_streaming(&self, stream_id: &str) -> Result<()> {
        self.record("stop_chat_streaming");
        self.inner.stop_chat_streaming(stream_id).await
    }
}
