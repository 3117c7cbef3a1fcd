use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::doc_processor::{DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
use crate::error::{AppError, Result};

const CONFIG_KEY: &str = "app_config";

/// User-facing settings. Persisted as a single JSON document; everything
/// that must not survive a restart lives in [`crate::state::RuntimeState`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    // Chat
    pub include_conversation_history: bool,
    pub system_prompt: String,
    pub temperature: f32,
    pub top_p: f32,
    pub seed: Option<i64>,
    pub max_tokens: Option<u32>,
    pub max_completion_tokens: Option<u32>,
    pub use_rag: bool,
    pub rag_limit: usize,

    // Model server
    pub llm_base_url: String,
    pub api_key: String,
    pub model_name: String,
    pub embedding_model: String,
    pub reranker_model: Option<String>,

    // Documents
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub normalize_embeddings: bool,

    pub stream_idle_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            include_conversation_history: true,
            system_prompt: "You're an AI assistant that provides helpful responses.".to_string(),
            temperature: 0.7,
            top_p: 1.0,
            seed: None,
            max_tokens: Some(2048),
            max_completion_tokens: None,
            use_rag: false,
            rag_limit: 5,
            llm_base_url: "http://localhost:1114/v3".to_string(),
            api_key: String::new(),
            model_name: String::new(),
            embedding_model: "bge-base-en-v1.5-int8-ov".to_string(),
            reranker_model: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            normalize_embeddings: true,
            stream_idle_timeout_secs: 120,
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_overlap >= self.chunk_size {
            return Err(AppError::InvalidInput(format!(
                "chunk overlap ({}) must be smaller than chunk size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(AppError::InvalidInput(format!(
                "temperature must be within 0..=2, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(AppError::InvalidInput(format!(
                "top_p must be within (0, 1], got {}",
                self.top_p
            )));
        }
        if self.rag_limit == 0 {
            return Err(AppError::InvalidInput("rag_limit must be at least 1".into()));
        }
        Ok(())
    }

    /// Load from the settings table, falling back to defaults when nothing
    /// has been saved yet.
    pub fn load(db: &Database) -> Result<Self> {
        match db.get_setting(CONFIG_KEY)? {
            Some(raw) => {
                let config: AppConfig = serde_json::from_str(&raw)?;
                tracing::info!("Loaded app config");
                Ok(config)
            }
            None => {
                tracing::info!("No app config found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, db: &Database) -> Result<()> {
        self.validate()?;
        db.set_setting(CONFIG_KEY, &serde_json::to_string(self)?)?;
        tracing::info!("Saved app config");
        Ok(())
    }

    /// Copy for display, with the API key masked.
    pub fn masked(&self) -> Self {
        Self {
            api_key: mask_api_key(&self.api_key),
            ..self.clone()
        }
    }

    /// A key sent back exactly as [`AppConfig::masked`] showed it means
    /// "unchanged": keep the stored one.
    pub fn keep_unchanged_key(&mut self, current: &AppConfig) {
        if !current.api_key.is_empty() && self.api_key == mask_api_key(&current.api_key) {
            self.api_key = current.api_key.clone();
        }
    }
}

/// Long keys keep four characters at each end; shorter keys are hidden
/// entirely.
fn mask_api_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    match chars.len() {
        0 => String::new(),
        1..=8 => "*".repeat(8),
        n => {
            let head: String = chars[..4].iter().collect();
            let tail: String = chars[n - 4..].iter().collect();
            format!("{head}...{tail}")
        }
    }
}
