use tauri::{AppHandle, Emitter, State};

use crate::chat::{ChatBackend, StreamEvent, StreamRequest, TEMP_STREAM_ID};
use crate::db::models::{ChatMessage, ChatSession, NewMessage};
use crate::db::sessions::DEFAULT_CHAT_TITLE;
use crate::error::AppError;
use crate::state::AppState;

fn emit(app: &AppHandle, event: &StreamEvent) {
    let name = event.name();
    let result = match event {
        StreamEvent::ChatToken(payload) => app.emit(name, payload),
        StreamEvent::ChatUsage(payload) => app.emit(name, payload),
        StreamEvent::ChatError(payload) => app.emit(name, payload),
        StreamEvent::ToolCall(payload) => app.emit(name, payload),
    };
    if let Err(e) = result {
        tracing::warn!(event = name, error = %e, "Failed to emit stream event");
    }
}

#[tauri::command]
pub fn create_chat_session(
    state: State<'_, AppState>,
    title: Option<String>,
    model_id: Option<String>,
) -> Result<ChatSession, AppError> {
    state.db.create_session(
        title.as_deref().unwrap_or(DEFAULT_CHAT_TITLE),
        model_id.as_deref(),
    )
}

#[tauri::command]
pub fn list_chat_sessions(state: State<'_, AppState>) -> Result<Vec<ChatSession>, AppError> {
    state.db.list_sessions()
}

#[tauri::command]
pub fn update_chat_session(
    state: State<'_, AppState>,
    id: String,
    title: Option<String>,
    model_id: Option<String>,
) -> Result<ChatSession, AppError> {
    state
        .db
        .update_session(&id, title.as_deref(), model_id.as_deref())
}

#[tauri::command]
pub fn delete_chat_session(state: State<'_, AppState>, id: String) -> Result<(), AppError> {
    state.db.delete_session(&id)
}

#[tauri::command]
pub fn get_session_messages(
    state: State<'_, AppState>,
    session_id: String,
) -> Result<Vec<ChatMessage>, AppError> {
    state.db.get_messages(&session_id)
}

#[tauri::command]
pub fn add_message_to_session(
    state: State<'_, AppState>,
    session_id: String,
    message: NewMessage,
) -> Result<ChatMessage, AppError> {
    state.db.add_message(&session_id, &message)
}

/// Start a reply. Tokens are delivered as `chat-token` events; the command
/// returns once generation has started.
#[tauri::command]
pub async fn stream_chat_completion(
    app: AppHandle,
    state: State<'_, AppState>,
    request: StreamRequest,
) -> Result<(), AppError> {
    let backend = state.backend()?;
    let mut events = backend.stream_chat_completion(request).await?;
    tauri::async_runtime::spawn(async move {
        while let Some(event) = events.recv().await {
            emit(&app, &event);
        }
    });
    Ok(())
}

#[tauri::command]
pub async fn stop_chat_streaming(
    state: State<'_, AppState>,
    session_id: Option<String>,
) -> Result<(), AppError> {
    let backend = state.backend()?;
    backend
        .stop_chat_streaming(session_id.as_deref().unwrap_or(TEMP_STREAM_ID))
        .await
}
