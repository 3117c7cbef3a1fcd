use serde::Serialize;

use crate::llm::LlmError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("Chat session not found: {0}")]
    SessionNotFound(String),
    #[error("A response is already streaming for session {0}")]
    Busy(String),
    #[error("No active stream for session {0}")]
    NoActiveStream(String),
    #[error("Embedding failed: {0}")]
    Embedding(String),
    #[error("Chunk {chunk_id} of {file_path} has no embedding")]
    MissingEmbedding { chunk_id: String, file_path: String },
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Document processing failed for {file}: {message}")]
    Document { file: String, message: String },
    #[error("Unsupported file type: .{0}")]
    UnsupportedFileType(String),
    #[error("Document is empty: {0}")]
    EmptyDocument(String),
    #[error("No tokens received for {0} seconds")]
    StreamTimeout(u64),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_display_string() {
        let err = AppError::Busy("abc".into());
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, "\"A response is already streaming for session abc\"");
    }

    #[test]
    fn llm_errors_are_transparent() {
        let err: AppError = LlmError::Parse("bad frame".into()).into();
        assert_eq!(err.to_string(), "Parse error: bad frame");
    }
}
