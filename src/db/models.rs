use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatSession {
    pub id: String,
    pub title: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub model_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(AppError::InvalidInput(format!("unknown role: {}", other))),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    /// Sum of two reports. Counts stop at `u32::MAX`.
    pub fn add(self, other: Usage) -> Usage {
        Usage {
            prompt_tokens: self.prompt_tokens.saturating_add(other.prompt_tokens),
            completion_tokens: self.completion_tokens.saturating_add(other.completion_tokens),
            total_tokens: self.total_tokens.saturating_add(other.total_tokens),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AttachmentRef {
    pub file_path: String,
    pub file_name: String,
    pub file_type: String,
    pub is_image: bool,
}

impl AttachmentRef {
    pub fn from_path(file_path: &str) -> Self {
        let path = std::path::Path::new(file_path);
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        let file_type = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        Self {
            file_path: file_path.to_string(),
            file_name,
            is_image: crate::doc_processor::is_image_extension(&file_type),
            file_type,
        }
    }
}

/// One tool invocation performed during a turn. Arguments and result are
/// kept whole.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ToolCall {
    pub tool_name: String,
    pub arguments: String,
    pub result: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: i64,
    pub tokens_per_second: Option<f64>,
    #[serde(default)]
    pub is_error: bool,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

/// Fields of a message that the caller supplies; id and timestamp are
/// assigned on insert.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub tokens_per_second: Option<f64>,
    #[serde(default)]
    pub is_error: bool,
    pub usage: Option<Usage>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl NewMessage {
    pub fn user(content: impl Into<String>, attachments: Vec<AttachmentRef>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tokens_per_second: None,
            is_error: false,
            usage: None,
            attachments,
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tokens_per_second: None,
            is_error: false,
            usage: None,
            attachments: Vec::new(),
            tool_calls: Vec::new(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::assistant(content)
        }
    }
}

/// A stored chunk of a source file.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub content: String,
    pub file_type: String,
    pub file_path: String,
    pub chunk_index: Option<usize>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub embedding: Option<Vec<f32>>,
    pub created_at: i64,
}

impl Document {
    pub fn new(
        title: String,
        content: String,
        file_type: String,
        file_path: String,
        chunk_index: Option<usize>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title,
            content,
            file_type,
            file_path,
            chunk_index,
            metadata: HashMap::new(),
            embedding: None,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FileInfo {
    pub file_path: String,
    pub file_name: String,
    pub file_type: String,
    pub chunk_count: usize,
    pub created_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SearchResult {
    pub document: Document,
    pub score: f32,
    pub rerank_score: Option<f32>,
}
