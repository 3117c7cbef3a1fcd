use crate::db::models::{ChatSession, NewMessage};
use crate::db::sessions::DEFAULT_CHAT_TITLE;
use crate::error::Result;

use super::backend::ChatBackend;
use super::registry::TEMP_STREAM_ID;

/// A conversation that only exists on this side so far.
#[derive(Debug, Clone, PartialEq)]
pub struct DraftSession {
    pub title: String,
    pub model_id: Option<String>,
    pub created_at: i64,
    /// Messages recorded before the session was persisted, oldest first.
    pub messages: Vec<NewMessage>,
    /// Set once the backend session exists but not every message has been
    /// flushed to it yet.
    backing: Option<ChatSession>,
}

impl DraftSession {
    pub fn new(model_id: Option<String>) -> Self {
        Self {
            title: DEFAULT_CHAT_TITLE.to_string(),
            model_id,
            created_at: chrono::Utc::now().timestamp_millis(),
            messages: Vec::new(),
            backing: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Session {
    Draft(DraftSession),
    Persisted(ChatSession),
}

/// What [`promote`] had to do to obtain a durable session.
#[derive(Debug, Clone, PartialEq)]
pub enum Promotion {
    /// The session already existed.
    Existing,
    /// A draft was turned into a new session; `flushed` of its messages
    /// were written to it.
    Created { flushed: usize },
    /// The persisted session had disappeared; a new one replaces it.
    Replaced { previous_id: String },
}

impl Session {
    pub fn draft(model_id: Option<String>) -> Self {
        Session::Draft(DraftSession::new(model_id))
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Session::Draft(_) => None,
            Session::Persisted(s) => Some(&s.id),
        }
    }

    /// Key under which this session's stream is registered.
    pub fn stream_key(&self) -> &str {
        self.id().unwrap_or(TEMP_STREAM_ID)
    }

    pub fn model_id(&self) -> Option<&str> {
        match self {
            Session::Draft(d) => d.model_id.as_deref(),
            Session::Persisted(s) => s.model_id.as_deref(),
        }
    }
}

/// The only way a caller obtains a durable session id. Drafts are created
/// on the backend and their messages flushed in order; a persisted session
/// that no longer exists is replaced by a fresh one.
pub async fn promote<B>(session: &mut Session, backend: &B) -> Result<(ChatSession, Promotion)>
where
    B: ChatBackend + ?Sized,
{
    match session {
        Session::Persisted(current) => match backend.get_session(&current.id).await? {
            Some(fresh) => {
                *current = fresh.clone();
                Ok((fresh, Promotion::Existing))
            }
            None => {
                let previous_id = current.id.clone();
                tracing::warn!(session_id = %previous_id, "Session vanished, creating a replacement");
                let replacement = backend
                    .create_chat_session(DEFAULT_CHAT_TITLE, current.model_id.as_deref())
                    .await?;
                *session = Session::Persisted(replacement.clone());
                Ok((replacement, Promotion::Replaced { previous_id }))
            }
        },
        Session::Draft(draft) => {
            let created = match draft.backing.take() {
                Some(existing) => existing,
                None => {
                    backend
                        .create_chat_session(&draft.title, draft.model_id.as_deref())
                        .await?
                }
            };
            let mut flushed = 0;
            while let Some(message) = draft.messages.first().cloned() {
                if let Err(e) = backend.add_message_to_session(&created.id, message).await {
                    // Keep the rest; the next attempt reuses the same session.
                    draft.backing = Some(created);
                    return Err(e);
                }
                draft.messages.remove(0);
                flushed += 1;
            }
            tracing::info!(session_id = %created.id, "Promoted draft session");
            *session = Session::Persisted(created.clone());
            Ok((created, Promotion::Created { flushed }))
        }
    }
}
