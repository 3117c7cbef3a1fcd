use crate::db::models::{ChatMessage, Role, SearchResult};
use crate::llm::PromptMessage;
use crate::retrieval::format_context;
use crate::tools::{strip_tool_markup, tool_catalogue, ToolSpec};

/// Inputs for one model request, gathered before generation starts.
#[derive(Debug, Default)]
pub struct TurnContext<'a> {
    pub system_prompt: Option<&'a str>,
    pub retrieved: &'a [SearchResult],
    pub tools: &'a [ToolSpec],
    pub history: &'a [ChatMessage],
    pub message: &'a str,
    pub images: Vec<String>,
}

/// Prior user/assistant turns as prompt messages. Error messages are left
/// out, tool markup is stripped, and a trailing user message equal to the
/// one being sent is dropped since it is appended separately.
pub fn history_messages(history: &[ChatMessage], current: &str) -> Vec<PromptMessage> {
    let mut messages: Vec<PromptMessage> = history
        .iter()
        .filter(|m| !m.is_error && m.role != Role::System)
        .filter_map(|m| {
            let content = match m.role {
                Role::Assistant => strip_tool_markup(&m.content),
                _ => m.content.clone(),
            };
            (!content.trim().is_empty()).then(|| PromptMessage::new(m.role.as_str(), content))
        })
        .collect();

    if messages
        .last()
        .is_some_and(|m| m.role == Role::User.as_str() && m.content.trim() == current.trim())
    {
        messages.pop();
    }
    messages
}

pub fn build_messages(ctx: TurnContext<'_>) -> Vec<PromptMessage> {
    let mut system = ctx.system_prompt.unwrap_or_default().trim().to_string();
    if !ctx.tools.is_empty() {
        if !system.is_empty() {
            system.push_str("\n\n");
        }
        system.push_str(&tool_catalogue(ctx.tools));
    }
    if !ctx.retrieved.is_empty() {
        if !system.is_empty() {
            system.push_str("\n\n");
        }
        system.push_str(&format_context(ctx.retrieved));
    }

    let mut messages = Vec::with_capacity(ctx.history.len() + 2);
    if !system.is_empty() {
        messages.push(PromptMessage::new(Role::System.as_str(), system));
    }
    messages.extend(history_messages(ctx.history, ctx.message));

    let mut user = PromptMessage::new(Role::User.as_str(), ctx.message);
    user.images = ctx.images;
    messages.push(user);
    messages
}
