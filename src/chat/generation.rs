use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::db::models::{Role, Usage};
use crate::error::{AppError, Result};
use crate::llm::{ChatModel, ChatRequest, PromptMessage};
use crate::tools::{extract_tool_calls, invoke_all, tool_results_prompt, ToolInvoker};

use super::registry::ActiveStreams;
use super::stream::StreamEvent;

enum Completion {
    Done,
    Cancelled,
}

/// One generation task: streams the model's reply to `events`, runs any
/// requested tools, and always ends with exactly one terminal event.
pub(crate) struct Generation {
    pub model: Arc<dyn ChatModel>,
    pub request: ChatRequest,
    pub tools: Option<Arc<dyn ToolInvoker>>,
    pub idle_timeout: Duration,
    pub cancel: CancellationToken,
    pub streams: Arc<ActiveStreams>,
    pub stream_key: String,
    pub events: UnboundedSender<StreamEvent>,
}

impl Generation {
    pub(crate) async fn run(self) {
        let mut usage: Option<Usage> = None;
        let outcome = self.generate(&mut usage).await;

        // Free the slot first; the listener may start the next turn as soon
        // as it sees the terminal event.
        self.streams.finish(&self.stream_key);

        let terminal = match outcome {
            Ok(completion) => {
                if let Some(usage) = usage {
                    let _ = self.events.send(StreamEvent::ChatUsage(usage));
                }
                let cancelled = matches!(completion, Completion::Cancelled);
                tracing::info!(stream = %self.stream_key, cancelled, "Generation finished");
                StreamEvent::finished(cancelled, usage)
            }
            Err(e) => {
                tracing::error!(stream = %self.stream_key, error = %e, "Generation failed");
                StreamEvent::error(e.to_string())
            }
        };
        let _ = self.events.send(terminal);
    }

    async fn generate(&self, usage: &mut Option<Usage>) -> Result<Completion> {
        let mut text = String::new();
        let completion = self.pump(&self.request, &mut text, usage).await?;
        if matches!(completion, Completion::Cancelled) {
            return Ok(completion);
        }

        let Some(tools) = &self.tools else {
            return Ok(completion);
        };
        let calls = extract_tool_calls(&text);
        if calls.is_empty() {
            return Ok(completion);
        }

        tracing::info!(stream = %self.stream_key, calls = calls.len(), "Running tool calls");
        let results = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(Completion::Cancelled),
            results = invoke_all(tools.as_ref(), calls) => results,
        };
        for call in &results {
            let _ = self.events.send(StreamEvent::ToolCall(call.clone()));
        }

        // One continuation so the model can answer from the tool results.
        let mut continuation = self.request.clone();
        continuation
            .messages
            .push(PromptMessage::new(Role::Assistant.as_str(), text));
        continuation.messages.push(PromptMessage::new(
            Role::User.as_str(),
            tool_results_prompt(&results),
        ));
        let mut follow_up = String::new();
        self.pump(&continuation, &mut follow_up, usage).await
    }

    /// Forward one completion stream. Usage reported by this request is
    /// added to `usage`.
    async fn pump(
        &self,
        request: &ChatRequest,
        text: &mut String,
        usage: &mut Option<Usage>,
    ) -> Result<Completion> {
        let mut stream = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(Completion::Cancelled),
            stream = self.model.chat_stream(request) => stream?,
        };

        let mut request_usage: Option<Usage> = None;
        let completion = loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Completion::Cancelled,
                next = tokio::time::timeout(self.idle_timeout, stream.next()) => next,
            };
            let chunk = match next {
                Err(_) => return Err(AppError::StreamTimeout(self.idle_timeout.as_secs())),
                Ok(None) => break Completion::Done,
                Ok(Some(chunk)) => chunk?,
            };
            if !chunk.delta.is_empty() {
                text.push_str(&chunk.delta);
                let _ = self.events.send(StreamEvent::token(chunk.delta));
            }
            if chunk.usage.is_some() {
                request_usage = chunk.usage;
            }
            if chunk.done {
                break Completion::Done;
            }
        };

        if let Some(u) = request_usage {
            *usage = Some(usage.map_or(u, |total| total.add(u)));
        }
        Ok(completion)
    }
}
