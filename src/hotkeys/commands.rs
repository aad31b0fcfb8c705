use serde::Serialize;
use tauri::{AppHandle, State};

use crate::models::TaskRecord;
use crate::AppState;

use super::{LegendEntry, PanelCommand};

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PanelSnapshot {
    pub listening: bool,
    pub legend: Vec<LegendEntry>,
    pub instruction: Option<String>,
    pub latest: Option<TaskRecord>,
    pub assistant_active: bool,
}

#[tauri::command]
pub async fn get_panel_snapshot(state: State<'_, AppState>) -> Result<PanelSnapshot, String> {
    let context = &state.context;
    Ok(PanelSnapshot {
        listening: state.dispatcher.is_listening(),
        legend: state.shortcuts.legend(),
        instruction: context.instructions.current(),
        latest: context.pipeline.latest_record().await,
        assistant_active: context.bridge.is_active().await,
    })
}

/// Manual buttons on the panel; no double press needed. Returns whether the
/// command started.
#[tauri::command]
pub fn trigger_command(
    state: State<'_, AppState>,
    command: PanelCommand,
    confirmed: Option<bool>,
) -> Result<bool, String> {
    Ok(state
        .dispatcher
        .trigger(command, confirmed.unwrap_or(false))
        .is_some())
}

/// Pausing also releases the global keys so other applications get them back.
#[tauri::command]
pub fn set_listening(app: AppHandle, state: State<'_, AppState>, listening: bool) -> Result<bool, String> {
    if listening != state.dispatcher.is_listening() {
        if listening {
            state.shortcuts.register(&app, &state.dispatcher);
        } else {
            state.shortcuts.unregister(&app);
        }
    }
    state.dispatcher.set_listening(listening);
    Ok(state.dispatcher.is_listening())
}

#[tauri::command]
pub async fn list_task_records(state: State<'_, AppState>) -> Result<Vec<TaskRecord>, String> {
    Ok(state.context.pipeline.records().await)
}

#[tauri::command]
pub async fn restart_assistant_session(state: State<'_, AppState>) -> Result<(), String> {
    state
        .context
        .bridge
        .restart()
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn close_assistant_session(state: State<'_, AppState>) -> Result<bool, String> {
    Ok(state.context.bridge.close().await)
}
