use tauri::State;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::state::AppState;

#[tauri::command]
pub fn get_app_config(state: State<'_, AppState>) -> Result<AppConfig, AppError> {
    Ok(state.config()?.masked())
}

/// Save settings. A masked key sent back unchanged keeps the stored key.
#[tauri::command]
pub fn save_app_config(state: State<'_, AppState>, mut config: AppConfig) -> Result<(), AppError> {
    let current = state.config()?;
    config.keep_unchanged_key(&current);
    state.save_config(config)
}
