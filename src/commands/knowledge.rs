use tauri::State;

use crate::db::models::{Document, FileInfo, SearchResult};
use crate::error::AppError;
use crate::ingest::BatchReport;
use crate::retrieval::RetrievalScope;
use crate::state::AppState;

/// Parse and chunk a file. The chunks are not embedded yet.
#[tauri::command]
pub fn process_document(
    state: State<'_, AppState>,
    file_path: String,
) -> Result<Vec<Document>, AppError> {
    state.ingestor()?.process_document(&file_path)
}

/// Embed chunks. Chunks that fail are left out and logged; an error is
/// returned only when none could be embedded.
#[tauri::command]
pub async fn create_document_embeddings(
    state: State<'_, AppState>,
    documents: Vec<Document>,
) -> Result<Vec<Document>, AppError> {
    let requested = documents.len();
    let outcome = state.ingestor()?.create_document_embeddings(documents).await;
    if outcome.embedded.is_empty() && requested > 0 {
        let reason = outcome
            .failed
            .first()
            .map(|f| f.error.clone())
            .unwrap_or_default();
        return Err(AppError::Embedding(reason));
    }
    for failed in &outcome.failed {
        tracing::warn!(chunk_index = ?failed.chunk_index, error = %failed.error, "Chunk left out");
    }
    Ok(outcome.embedded)
}

#[tauri::command]
pub fn store_documents(
    state: State<'_, AppState>,
    documents: Vec<Document>,
) -> Result<usize, AppError> {
    state.ingestor()?.store_documents(&documents)
}

/// Chunk, embed and store files one by one.
#[tauri::command]
pub async fn upload_documents(
    state: State<'_, AppState>,
    file_paths: Vec<String>,
) -> Result<BatchReport, AppError> {
    Ok(state.ingestor()?.ingest_files(&file_paths).await)
}

#[tauri::command]
pub fn get_all_files(state: State<'_, AppState>) -> Result<Vec<FileInfo>, AppError> {
    state.db.list_files()
}

#[tauri::command]
pub fn get_file_chunks(
    state: State<'_, AppState>,
    file_path: String,
) -> Result<Vec<Document>, AppError> {
    state.db.get_file_chunks(&file_path)
}

#[tauri::command]
pub fn delete_file_by_path(
    state: State<'_, AppState>,
    file_path: String,
) -> Result<usize, AppError> {
    state.db.delete_file_by_path(&file_path)
}

#[tauri::command]
pub async fn search_documents(
    state: State<'_, AppState>,
    query: String,
    limit: Option<usize>,
) -> Result<Vec<SearchResult>, AppError> {
    let top_k = match limit {
        Some(limit) => limit,
        None => state.config()?.rag_limit,
    };
    state
        .retriever()?
        .retrieve(&query, &RetrievalScope::Global { top_k: top_k.max(1) })
        .await
}

#[tauri::command]
pub fn count_documents(state: State<'_, AppState>) -> Result<usize, AppError> {
    state.db.count_documents()
}

#[tauri::command]
pub fn clear_documents(state: State<'_, AppState>) -> Result<usize, AppError> {
    state.db.clear_documents()
}
