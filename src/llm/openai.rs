use std::collections::VecDeque;

use base64::Engine as _;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{ChatRequest, ChunkStream, LlmError, PromptMessage, StreamChunk};
use crate::db::models::Usage;

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
}

#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    stream: bool,
    stream_options: StreamOptions,
    temperature: f32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
struct OpenAiMessage {
    role: String,
    content: Value,
}

#[derive(Deserialize)]
struct OpenAiStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiDelta {
    content: Option<String>,
}

fn image_mime(path: &str) -> &'static str {
    let ext = std::path::Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    match ext.as_str() {
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        _ => "image/jpeg",
    }
}

fn to_openai_message(message: &PromptMessage) -> Result<OpenAiMessage, LlmError> {
    if message.images.is_empty() {
        return Ok(OpenAiMessage {
            role: message.role.clone(),
            content: Value::String(message.content.clone()),
        });
    }

    let mut parts = vec![json!({ "type": "text", "text": message.content })];
    for path in &message.images {
        let bytes = std::fs::read(path).map_err(|source| LlmError::Attachment {
            path: path.clone(),
            source,
        })?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        parts.push(json!({
            "type": "image_url",
            "image_url": { "url": format!("data:{};base64,{}", image_mime(path), encoded) }
        }));
    }
    Ok(OpenAiMessage {
        role: message.role.clone(),
        content: Value::Array(parts),
    })
}

fn build_body(request: &ChatRequest) -> Result<OpenAiRequest, LlmError> {
    let messages = request
        .messages
        .iter()
        .map(to_openai_message)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(OpenAiRequest {
        model: request.model.clone(),
        messages,
        stream: true,
        stream_options: StreamOptions {
            include_usage: true,
        },
        temperature: request.temperature,
        top_p: request.top_p,
        seed: request.seed,
        max_tokens: request.max_tokens,
        max_completion_tokens: request.max_completion_tokens,
    })
}

/// Incremental decoder for `data:` lines of a server-sent event stream.
#[derive(Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
    finished: bool,
}

impl SseDecoder {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<Result<StreamChunk, LlmError>> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if self.finished {
                continue;
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(item) = self.decode_line(line.trim()) {
                out.push(item);
            }
        }
        out
    }

    /// Flush at end of body. Emits a terminal chunk if `[DONE]` never came.
    pub(crate) fn finish(&mut self) -> Vec<Result<StreamChunk, LlmError>> {
        let rest = std::mem::take(&mut self.buffer);
        let mut out = Vec::new();
        if !self.finished {
            let line = String::from_utf8_lossy(&rest);
            if let Some(item) = self.decode_line(line.trim()) {
                out.push(item);
            }
        }
        if !self.finished {
            self.finished = true;
            out.push(Ok(StreamChunk::done()));
        }
        out
    }

    fn decode_line(&mut self, line: &str) -> Option<Result<StreamChunk, LlmError>> {
        let data = line.strip_prefix("data:")?.trim_start();
        if data == "[DONE]" {
            self.finished = true;
            return Some(Ok(StreamChunk::done()));
        }

        let value: Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unparsable stream frame");
                return None;
            }
        };
        if let Some(message) = value.pointer("/error/message").and_then(Value::as_str) {
            return Some(Err(LlmError::Api {
                status: 200,
                message: message.to_string(),
            }));
        }
        let parsed: OpenAiStreamResponse = match serde_json::from_value(value) {
            Ok(parsed) => parsed,
            Err(e) => return Some(Err(LlmError::Parse(e.to_string()))),
        };

        let mut chunk = StreamChunk {
            usage: parsed.usage,
            ..StreamChunk::default()
        };
        for choice in parsed.choices {
            if let Some(content) = choice.delta.content {
                chunk.delta.push_str(&content);
            }
            if let Some(reason) = choice.finish_reason {
                tracing::debug!(reason = %reason, "Model finished generating");
            }
        }
        (!chunk.delta.is_empty() || chunk.usage.is_some()).then_some(Ok(chunk))
    }
}

pub async fn chat_stream(
    config: &OpenAiConfig,
    request: &ChatRequest,
) -> Result<ChunkStream, LlmError> {
    let client = Client::new();
    let body = build_body(request)?;

    let mut req = client
        .post(format!("{}/chat/completions", config.base_url))
        .header("Content-Type", "application/json")
        .json(&body);

    if !config.api_key.is_empty() {
        req = req.header("Authorization", format!("Bearer {}", config.api_key));
    }

    let resp = req.send().await?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        return Err(LlmError::Api {
            status,
            message: text,
        });
    }

    let bytes = Box::pin(resp.bytes_stream());
    let stream = futures::stream::unfold(
        (bytes, SseDecoder::default(), VecDeque::new(), false),
        |(mut bytes, mut decoder, mut pending, mut ended)| async move {
            loop {
                if let Some(item) = pending.pop_front() {
                    return Some((item, (bytes, decoder, pending, ended)));
                }
                if ended || decoder.finished {
                    return None;
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => pending.extend(decoder.push(&chunk)),
                    Some(Err(e)) => {
                        ended = true;
                        pending.push_back(Err(LlmError::Http(e)));
                    }
                    None => {
                        ended = true;
                        pending.extend(decoder.finish());
                    }
                }
            }
        },
    );

    Ok(Box::pin(stream))
}
