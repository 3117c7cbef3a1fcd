pub mod chat;
pub mod config;
pub mod db;
pub mod doc_processor;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod logging;
pub mod retrieval;
pub mod state;
pub mod tools;

#[cfg(feature = "desktop")]
mod commands;

#[cfg(test)]
mod test_support;

#[cfg(feature = "desktop")]
#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    use std::sync::Arc;

    use tauri::Manager;

    use db::Database;
    use state::AppState;

    logging::init();

    let result = tauri::Builder::default()
        .plugin(tauri_plugin_opener::init())
        .plugin(tauri_plugin_dialog::init())
        .setup(|app| {
            let app_dir = app.path().app_data_dir()?;
            let database = Database::new(&app_dir)?;
            app.manage(AppState::new(Arc::new(database))?);
            tracing::info!(dir = %app_dir.display(), "Application state ready");
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            commands::chat::create_chat_session,
            commands::chat::list_chat_sessions,
            commands::chat::update_chat_session,
            commands::chat::delete_chat_session,
            commands::chat::get_session_messages,
            commands::chat::add_message_to_session,
            commands::chat::stream_chat_completion,
            commands::chat::stop_chat_streaming,
            commands::knowledge::process_document,
            commands::knowledge::create_document_embeddings,
            commands::knowledge::store_documents,
            commands::knowledge::upload_documents,
            commands::knowledge::get_all_files,
            commands::knowledge::get_file_chunks,
            commands::knowledge::delete_file_by_path,
            commands::knowledge::search_documents,
            commands::knowledge::count_documents,
            commands::knowledge::clear_documents,
            commands::settings::get_app_config,
            commands::settings::save_app_config,
        ])
        .run(tauri::generate_context!());

    if let Err(e) = result {
        tracing::error!(error = %e, "Tauri application exited with an error");
    }
}
