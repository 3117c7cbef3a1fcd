use std::time::Instant;

use serde::Serialize;

use crate::db::models::{NewMessage, ToolCall, Usage};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TokenEvent {
    pub token: String,
    pub finished: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorEvent {
    pub error: String,
}

/// Everything a generation task tells its listener, in emission order.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum StreamEvent {
    ChatToken(TokenEvent),
    ChatUsage(Usage),
    ChatError(ErrorEvent),
    ToolCall(ToolCall),
}

impl StreamEvent {
    pub fn token(token: impl Into<String>) -> Self {
        StreamEvent::ChatToken(TokenEvent {
            token: token.into(),
            finished: false,
            cancelled: None,
            usage: None,
        })
    }

    pub fn finished(cancelled: bool, usage: Option<Usage>) -> Self {
        StreamEvent::ChatToken(TokenEvent {
            token: String::new(),
            finished: true,
            cancelled: cancelled.then_some(true),
            usage,
        })
    }

    pub fn error(error: impl Into<String>) -> Self {
        StreamEvent::ChatError(ErrorEvent {
            error: error.into(),
        })
    }

    /// Name the desktop shell emits this event under.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::ChatToken(_) => "chat-token",
            StreamEvent::ChatUsage(_) => "chat-usage",
            StreamEvent::ChatError(_) => "chat-error",
            StreamEvent::ToolCall(_) => "tool-call",
        }
    }

    /// True for the events after which nothing else is sent for the turn.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::ChatToken(TokenEvent { finished: true, .. }) | StreamEvent::ChatError(_)
        )
    }
}

/// Builds the assistant message of one turn from its stream. Owned by the
/// single task that consumes the stream; nothing is persisted from here.
#[derive(Debug, Default)]
pub struct TurnAccumulator {
    text: String,
    first_token_at: Option<Instant>,
    usage: Option<Usage>,
    tool_calls: Vec<ToolCall>,
}

impl TurnAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn push_token(&mut self, token: &str) {
        self.push_token_at(token, Instant::now());
    }

    pub fn push_token_at(&mut self, token: &str, at: Instant) {
        if token.is_empty() {
            return;
        }
        self.first_token_at.get_or_insert(at);
        self.text.push_str(token);
    }

    pub fn set_usage(&mut self, usage: Usage) {
        self.usage = Some(usage);
    }

    pub fn buffer_tool_call(&mut self, call: ToolCall) {
        self.tool_calls.push(call);
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn finalize(self, cancelled: bool) -> NewMessage {
        self.finalize_at(cancelled, Instant::now())
    }

    /// Throughput is measured from the first token, not from dispatch, and
    /// is left out for cancelled turns.
    pub fn finalize_at(self, cancelled: bool, now: Instant) -> NewMessage {
        let tokens_per_second = match (cancelled, self.usage, self.first_token_at) {
            (false, Some(usage), Some(first)) if usage.completion_tokens > 0 => {
                let elapsed = now.saturating_duration_since(first).as_secs_f64();
                (elapsed > 0.0).then(|| usage.completion_tokens as f64 / elapsed)
            }
            _ => None,
        };

        NewMessage {
            tokens_per_second,
            usage: self.usage,
            tool_calls: self.tool_calls,
            ..NewMessage::assistant(self.text)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn usage(completion: u32) -> Usage {
        Usage {
            prompt_tokens: 10,
            completion_tokens: completion,
            total_tokens: 10 + completion,
        }
    }

    #[test]
    fn text_is_tokens_in_arrival_order() {
        let mut acc = TurnAccumulator::new();
        for t in ["The", " quick", "", " fox"] {
            acc.push_token(t);
        }
        assert_eq!(acc.finalize(false).content, "The quick fox");
    }

    #[test]
    fn throughput_counts_from_first_token() {
        let start = Instant::now();
        let mut acc = TurnAccumulator::new();
        acc.push_token_at("a", start + Duration::from_secs(5));
        acc.push_token_at("b", start + Duration::from_secs(6));
        acc.set_usage(usage(20));
        let msg = acc.finalize_at(false, start + Duration::from_secs(7));
        let tps = msg.tokens_per_second.unwrap();
        assert!((tps - 10.0).abs() < 1e-9);
        assert_eq!(msg.usage.unwrap().total_tokens, 30);
    }

    #[test]
    fn cancelled_turn_keeps_text_without_throughput() {
        let mut acc = TurnAccumulator::new();
        acc.push_token("partial");
        acc.set_usage(usage(3));
        let msg = acc.finalize(true);
        assert_eq!(msg.content, "partial");
        assert!(msg.tokens_per_second.is_none());
        assert!(!msg.is_error);
    }

    #[test]
    fn tool_calls_attach_at_finalize() {
        let mut acc = TurnAccumulator::new();
        acc.buffer_tool_call(ToolCall {
            tool_name: "clock".into(),
            arguments: "{}".into(),
            result: "12:00".into(),
        });
        acc.push_token("It is noon");
        let msg = acc.finalize(false);
        assert_eq!(msg.tool_calls.len(), 1);
        assert!(msg.tokens_per_second.is_none());
    }

    #[test]
    fn events_serialize_under_their_names() {
        let json = serde_json::to_value(StreamEvent::finished(true, None)).unwrap();
        assert_eq!(json["event"], "chat-token");
        assert_eq!(json["payload"]["finished"], true);
        assert_eq!(json["payload"]["cancelled"], true);
        assert!(json["payload"].get("usage").is_none());

        let plain = serde_json::to_value(StreamEvent::token("x")).unwrap();
        assert!(plain["payload"].get("cancelled").is_none());
        assert_eq!(StreamEvent::error("boom").name(), "chat-error");
        assert!(StreamEvent::error("boom").is_terminal());
        assert!(!StreamEvent::token("x").is_terminal());
    }
}
