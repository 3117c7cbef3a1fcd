use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::db::models::ToolCall;
use crate::error::Result;

const TOOL_CALL_OPEN: &str = "<tool_call>";
const TOOL_CALL_CLOSE: &str = "</tool_call>";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: Value,
}

/// Something that can run tools on the model's behalf, e.g. an MCP host.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>>;
    async fn call_tool(&self, name: &str, arguments: Map<String, Value>) -> Result<String>;
}

/// A tool call as written by the model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RequestedCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

/// Describe the available tools and the call markup for the system prompt.
pub fn tool_catalogue(tools: &[ToolSpec]) -> String {
    let mut out = String::from(
        "You can call tools. To call one, reply with\n\
         <tool_call>{\"name\": \"<tool name>\", \"arguments\": {<arguments>}}</tool_call>\n\
         and wait for the result. Available tools:\n",
    );
    for tool in tools {
        out.push_str(&format!(
            "- {}: {}\n  parameters: {}\n",
            tool.name, tool.description, tool.parameters
        ));
    }
    out
}

/// Find every well-formed `<tool_call>` block. Duplicate calls (same name
/// and arguments) are returned once; null arguments are dropped.
pub fn extract_tool_calls(text: &str) -> Vec<RequestedCall> {
    let mut calls = Vec::new();
    let mut seen = HashSet::new();
    let mut rest = text;

    while let Some(start) = rest.find(TOOL_CALL_OPEN) {
        let body_start = start + TOOL_CALL_OPEN.len();
        let Some(len) = rest[body_start..].find(TOOL_CALL_CLOSE) else {
            break;
        };
        let body = rest[body_start..body_start + len].trim();
        rest = &rest[body_start + len + TOOL_CALL_CLOSE.len()..];

        let mut call: RequestedCall = match serde_json::from_str(body) {
            Ok(call) => call,
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring malformed tool call");
                continue;
            }
        };
        call.arguments.retain(|_, v| !v.is_null());

        let key = format!("{}:{}", call.name, Value::Object(call.arguments.clone()));
        if seen.insert(key) {
            calls.push(call);
        }
    }
    calls
}

/// Remove tool-call markup from model text. An unterminated block runs to
/// the end of the text.
pub fn strip_tool_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(TOOL_CALL_OPEN) {
        out.push_str(&rest[..start]);
        match rest[start..].find(TOOL_CALL_CLOSE) {
            Some(end) => rest = &rest[start + end + TOOL_CALL_CLOSE.len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

/// Run each call once. A failing tool yields an `Error: ...` result rather
/// than failing the turn.
pub async fn invoke_all(invoker: &dyn ToolInvoker, calls: Vec<RequestedCall>) -> Vec<ToolCall> {
    let mut done = Vec::with_capacity(calls.len());
    for call in calls {
        let arguments = Value::Object(call.arguments.clone()).to_string();
        let result = match invoker.call_tool(&call.name, call.arguments).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(tool = %call.name, error = %e, "Tool call failed");
                format!("Error: {}", e)
            }
        };
        done.push(ToolCall {
            tool_name: call.name,
            arguments,
            result,
        });
    }
    done
}

/// Message handed back to the model after its tools ran.
pub fn tool_results_prompt(calls: &[ToolCall]) -> String {
    let mut out = String::from("Tool results:\n");
    for call in calls {
        out.push_str(&format!(
            "<tool_response name=\"{}\">{}</tool_response>\n",
            call.tool_name, call.result
        ));
    }
    out.push_str("Answer the user's question using these results.");
    out
}
