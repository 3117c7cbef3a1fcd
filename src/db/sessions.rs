use rusqlite::{params, OptionalExtension, Row};

use super::models::{ChatMessage, ChatSession, NewMessage, Role};
use super::Database;
use crate::error::{AppError, Result};

pub const DEFAULT_CHAT_TITLE: &str = "New Chat";
const MAX_TITLE_CHARS: usize = 60;
const MIN_TITLE_BREAK: usize = 40;

const SESSION_COLUMNS: &str = "id, title, model_id, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, session_id, role, content, created_at, tokens_per_second, \
     is_error, prompt_tokens, completion_tokens, total_tokens, attachments, tool_calls";

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<ChatSession> {
    Ok(ChatSession {
        id: row.get(0)?,
        title: row.get(1)?,
        model_id: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<ChatMessage> {
    let role: String = row.get(2)?;
    let attachments: String = row.get(10)?;
    let tool_calls: String = row.get(11)?;
    let json_err = |idx: usize, e: serde_json::Error| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    };
    Ok(ChatMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: role.parse().map_err(|e: AppError| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?,
        content: row.get(3)?,
        timestamp: row.get(4)?,
        tokens_per_second: row.get(5)?,
        is_error: row.get(6)?,
        prompt_tokens: row.get(7)?,
        completion_tokens: row.get(8)?,
        total_tokens: row.get(9)?,
        attachments: serde_json::from_str(&attachments).map_err(|e| json_err(10, e))?,
        tool_calls: serde_json::from_str(&tool_calls).map_err(|e| json_err(11, e))?,
    })
}

/// Derive a session title from the first user message.
pub fn generate_title(content: &str) -> String {
    let cleaned = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        return DEFAULT_CHAT_TITLE.to_string();
    }

    let chars: Vec<char> = cleaned.chars().collect();
    let mut title = if chars.len() <= MAX_TITLE_CHARS {
        cleaned.clone()
    } else {
        let head = &chars[..MAX_TITLE_CHARS];
        let cut = head
            .iter()
            .rposition(|c| *c == ' ')
            .filter(|pos| *pos > MIN_TITLE_BREAK)
            .unwrap_or(MAX_TITLE_CHARS);
        let kept: String = head[..cut].iter().collect();
        let kept = kept.trim_end_matches(['.', ',', '!', '?', ';', ':', ' ']);
        format!("{}...", kept)
    };

    if let Some(first) = title.chars().next() {
        let upper: String = first.to_uppercase().collect();
        title.replace_range(..first.len_utf8(), &upper);
    }
    title
}

impl Database {
    // ── Sessions ──

    pub fn create_session(&self, title: &str, model_id: Option<&str>) -> Result<ChatSession> {
        let conn = self.conn()?;
        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "INSERT INTO sessions (id, title, model_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
            params![id, title, model_id, now],
        )?;
        tracing::debug!(session_id = %id, title = %title, "Chat session created");
        Ok(ChatSession {
            id,
            title: title.to_string(),
            created_at: now,
            updated_at: now,
            model_id: model_id.map(str::to_string),
        })
    }

    pub fn get_session(&self, id: &str) -> Result<Option<ChatSession>> {
        let conn = self.conn()?;
        let session = conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![id],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    pub fn list_sessions(&self) -> Result<Vec<ChatSession>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY updated_at DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map([], session_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn update_session(
        &self,
        id: &str,
        title: Option<&str>,
        model_id: Option<&str>,
    ) -> Result<ChatSession> {
        {
            let conn = self.conn()?;
            let now = chrono::Utc::now().timestamp_millis();
            let changed = conn.execute(
                "UPDATE sessions SET title = COALESCE(?1, title), model_id = COALESCE(?2, model_id), \
                 updated_at = ?3 WHERE id = ?4",
                params![title, model_id, now, id],
            )?;
            if changed == 0 {
                return Err(AppError::SessionNotFound(id.to_string()));
            }
        }
        self.get_session(id)?
            .ok_or_else(|| AppError::SessionNotFound(id.to_string()))
    }

    pub fn delete_session(&self, id: &str) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(AppError::SessionNotFound(id.to_string()));
        }
        tracing::info!(session_id = %id, "Chat session deleted");
        Ok(())
    }

    // ── Messages ──

    pub fn add_message(&self, session_id: &str, message: &NewMessage) -> Result<ChatMessage> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let title: String = tx
            .query_row(
                "SELECT title FROM sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| AppError::SessionNotFound(session_id.to_string()))?;

        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp_millis();
        let usage = message.usage;
        tx.execute(
            &format!("INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"),
            params![
                id,
                session_id,
                message.role.as_str(),
                message.content,
                now,
                message.tokens_per_second,
                message.is_error,
                usage.map(|u| u.prompt_tokens),
                usage.map(|u| u.completion_tokens),
                usage.map(|u| u.total_tokens),
                serde_json::to_string(&message.attachments)?,
                serde_json::to_string(&message.tool_calls)?,
            ],
        )?;

        let new_title = (title == DEFAULT_CHAT_TITLE && message.role == Role::User)
            .then(|| generate_title(&message.content));
        tx.execute(
            "UPDATE sessions SET updated_at = ?1, title = COALESCE(?2, title) WHERE id = ?3",
            params![now, new_title, session_id],
        )?;

        let stored = tx.query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            params![id],
            message_from_row,
        )?;
        tx.commit()?;

        tracing::debug!(
            session_id = %session_id,
            message_id = %stored.id,
            role = %stored.role,
            content_length = stored.content.len(),
            auto_title = ?new_title,
            "Message added to session"
        );
        Ok(stored)
    }

    /// Remove one message. Session titles are left as they are.
    pub fn delete_message(&self, session_id: &str, message_id: &str) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM messages WHERE id = ?1 AND session_id = ?2",
            params![message_id, session_id],
        )?;
        if changed == 0 {
            return Err(AppError::InvalidInput(format!(
                "message {message_id} not found in session {session_id}"
            )));
        }
        tracing::debug!(session_id = %session_id, message_id = %message_id, "Message deleted");
        Ok(())
    }

    pub fn get_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE session_id = ?1 ORDER BY created_at ASC, rowid ASC"
        ))?;
        let rows = stmt.query_map(params![session_id], message_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{AttachmentRef, ToolCall, Usage};

    #[test]
    fn title_is_kept_when_short() {
        assert_eq!(generate_title("  what is   rust?  "), "What is rust?");
    }

    #[test]
    fn long_title_breaks_on_word_boundary() {
        let text = "explain the difference between borrowing and ownership in the rust language please";
        let title = generate_title(text);
        assert!(title.ends_with("..."));
        assert!(title.chars().count() <= MAX_TITLE_CHARS + 3);
        assert!(title.starts_with("Explain the difference"));
        assert!(!title.contains("  "));
    }

    #[test]
    fn long_title_without_spaces_is_hard_cut() {
        let text = "é".repeat(80);
        let title = generate_title(&text);
        assert_eq!(title.chars().count(), MAX_TITLE_CHARS + 3);
    }

    #[test]
    fn first_user_message_renames_default_session() {
        let db = Database::open_in_memory().unwrap();
        let session = db.create_session(DEFAULT_CHAT_TITLE, None).unwrap();
        db.add_message(&session.id, &NewMessage::user("hello there", vec![]))
            .unwrap();
        db.add_message(&session.id, &NewMessage::user("second", vec![]))
            .unwrap();
        let stored = db.get_session(&session.id).unwrap().unwrap();
        assert_eq!(stored.title, "Hello there");
    }

    #[test]
    fn messages_keep_insertion_order_and_fields() {
        let db = Database::open_in_memory().unwrap();
        let session = db.create_session("Custom", Some("qwen")).unwrap();
        db.add_message(
            &session.id,
            &NewMessage::user("q", vec![AttachmentRef::from_path("/tmp/a.png")]),
        )
        .unwrap();
        let mut answer = NewMessage::assistant("a");
        answer.tokens_per_second = Some(12.5);
        answer.usage = Some(Usage {
            prompt_tokens: 3,
            completion_tokens: 5,
            total_tokens: 8,
        });
        answer.tool_calls.push(ToolCall {
            tool_name: "clock".into(),
            arguments: "{}".into(),
            result: "noon".into(),
        });
        db.add_message(&session.id, &answer).unwrap();

        let messages = db.get_messages(&session.id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert!(messages[0].attachments[0].is_image);
        assert_eq!(messages[1].completion_tokens, Some(5));
        assert_eq!(messages[1].tool_calls[0].result, "noon");
        assert_eq!(db.get_session(&session.id).unwrap().unwrap().title, "Custom");
    }

    #[test]
    fn add_message_to_missing_session_fails() {
        let db = Database::open_in_memory().unwrap();
        let err = db
            .add_message("nope", &NewMessage::user("x", vec![]))
            .unwrap_err();
        assert!(matches!(err, AppError::SessionNotFound(_)));
    }

    #[test]
    fn delete_session_cascades_messages() {
        let db = Database::open_in_memory().unwrap();
        let session = db.create_session("t", None).unwrap();
        db.add_message(&session.id, &NewMessage::user("x", vec![]))
            .unwrap();
        db.delete_session(&session.id).unwrap();
        assert!(db.get_session(&session.id).unwrap().is_none());
        assert!(db.get_messages(&session.id).unwrap().is_empty());
        assert!(db.delete_session(&session.id).is_err());
    }

    #[test]
    fn delete_message_removes_only_that_message() {
        let db = Database::open_in_memory().unwrap();
        let session = db.create_session("t", None).unwrap();
        let first = db
            .add_message(&session.id, &NewMessage::user("keep", vec![]))
            .unwrap();
        let second = db
            .add_message(&session.id, &NewMessage::user("drop", vec![]))
            .unwrap();
        db.delete_message(&session.id, &second.id).unwrap();

        let left = db.get_messages(&session.id).unwrap();
        assert_eq!(left, vec![first.clone()]);
        assert!(db.delete_message(&session.id, &second.id).is_err());
        assert!(db.delete_message("other", &first.id).is_err());
    }

    #[test]
    fn update_session_changes_only_given_fields() {
        let db = Database::open_in_memory().unwrap();
        let session = db.create_session("t", Some("m1")).unwrap();
        let updated = db.update_session(&session.id, None, Some("m2")).unwrap();
        assert_eq!(updated.title, "t");
        assert_eq!(updated.model_id.as_deref(), Some("m2"));
        assert_eq!(db.list_sessions().unwrap().len(), 1);
    }
}
