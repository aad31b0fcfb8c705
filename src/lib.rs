mod bridge;
mod context;
mod driver;
mod executor;
mod hotkeys;
mod models;
mod pipeline;
mod poller;
mod settings;
mod status;
mod storage;
mod utils;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use anyhow::anyhow;
use bridge::{AssistantFactory, AutomationBridge};
use context::SessionContext;
use driver::{LazySession, PageDriver};
use executor::ActionExecutor;
use hotkeys::{
    commands::{
        close_assistant_session, get_panel_snapshot, list_task_records, restart_assistant_session,
        set_listening, trigger_command,
    },
    HotkeyDispatcher, ShortcutBindings,
};
use log::{info, warn};
use pipeline::ExtractionPipeline;
use poller::{PollerConfig, PollerController};
use settings::{PanelSettings, SettingsStore, ENV_DEBUG};
use status::{InstructionBuffer, StatusSink, TauriSink};
use storage::{ArtifactFetcher, HttpFetcher, TaskStore};
use tauri::{Manager, RunEvent};

pub(crate) struct AppState {
    pub(crate) context: Arc<SessionContext>,
    pub(crate) dispatcher: HotkeyDispatcher,
    pub(crate) shortcuts: ShortcutBindings,
    pub(crate) poller: tokio::sync::Mutex<PollerController>,
    pub(crate) settings: SettingsStore,
}

#[tauri::command]
fn get_settings(state: tauri::State<AppState>) -> Result<PanelSettings, String> {
    Ok(state.settings.get())
}

/// Saved settings apply on the next launch.
#[tauri::command]
fn save_settings(settings: PanelSettings, state: tauri::State<AppState>) -> Result<(), String> {
    state.settings.update(settings).map_err(|e| e.to_string())
}

fn build_context(
    settings: &PanelSettings,
    data_dir: &std::path::Path,
    sink: Arc<dyn StatusSink>,
) -> anyhow::Result<Arc<SessionContext>> {
    let driver: Arc<dyn PageDriver> = Arc::new(LazySession::new(
        settings.webdriver.url.clone(),
        settings.webdriver.session_id.clone(),
        settings.webdriver.browser.clone(),
        settings.webdriver.start_url.clone(),
    ));
    let mut executor = ActionExecutor::new(driver, settings.timing.attempt_timeout());
    if settings.debug {
        executor = executor.with_snapshot_dir(data_dir.join("snapshots"));
    }
    let executor = Arc::new(executor);

    let fetcher: Arc<dyn ArtifactFetcher> = Arc::new(HttpFetcher::new(settings.timing.fetch_timeout())?);
    let pipeline = ExtractionPipeline::open(
        executor.clone(),
        fetcher.clone(),
        TaskStore::new(data_dir.to_path_buf()),
        settings.page.extraction(),
        settings.slots.preallocate_next_slot,
        sink.clone(),
    )?;

    // The assistant keeps its login in a profile of its own.
    let mut assistant = settings.assistant.clone();
    if assistant.browser.user_data_dir.is_none() {
        assistant.browser.user_data_dir =
            Some(data_dir.join("assistant_profile").to_string_lossy().into_owned());
    }
    let bridge = AutomationBridge::new(Arc::new(AssistantFactory::new(
        settings.webdriver.url.clone(),
        assistant,
        fetcher,
        settings.timing.attempt_timeout(),
    )));

    Ok(Arc::new(SessionContext {
        executor,
        pipeline: Arc::new(pipeline),
        bridge: Arc::new(bridge),
        instructions: Arc::new(InstructionBuffer::new(sink.clone())),
        sink,
        controls: settings.page.controls.clone(),
    }))
}

#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    let debug_mode = std::env::var(ENV_DEBUG)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(if debug_mode {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    info!("Annotation panel starting up...");

    let app = tauri::Builder::default()
        .plugin(tauri_plugin_global_shortcut::Builder::new().build())
        .setup(|app| {
            let result = (|| -> anyhow::Result<()> {
                let app_data_dir = app
                    .path()
                    .app_data_dir()
                    .map_err(|err| anyhow!(err))?;
                std::fs::create_dir_all(&app_data_dir)?;

                let settings_store = SettingsStore::new(app_data_dir.join("settings.json"))?;
                info!("Settings loaded from {}", settings_store.path().display());
                let settings = settings_store.effective();
                let data_dir = settings.data_dir_or(&app_data_dir);
                std::fs::create_dir_all(&data_dir)?;
                info!("Task data under {}", data_dir.display());

                let sink: Arc<dyn StatusSink> = Arc::new(TauriSink::new(app.handle().clone()));
                let context = build_context(&settings, &data_dir, sink)?;

                // Shortcut callbacks run outside the runtime; spawn through its handle.
                let runtime = tauri::async_runtime::block_on(async { tokio::runtime::Handle::current() });
                let dispatcher =
                    HotkeyDispatcher::new(context.clone(), settings.timing.debounce_window(), runtime);
                let shortcuts = ShortcutBindings::new(&settings.hotkeys.modifiers);
                shortcuts.register(app.handle(), &dispatcher);

                let mut poller = PollerController::new();
                let poller_config = PollerConfig {
                    interval: settings.timing.poll_interval(),
                    max_backoff_steps: settings.timing.max_backoff_steps,
                    image: settings.page.image.clone(),
                };
                tauri::async_runtime::block_on(poller.start(context.clone(), poller_config))?;

                app.manage(AppState {
                    context,
                    dispatcher,
                    shortcuts,
                    poller: tokio::sync::Mutex::new(poller),
                    settings: settings_store,
                });

                Ok(())
            })();

            result.map_err(|err| err.into())
        })
        .invoke_handler(tauri::generate_handler![
            get_panel_snapshot,
            trigger_command,
            set_listening,
            list_task_records,
            restart_assistant_session,
            close_assistant_session,
            get_settings,
            save_settings,
        ])
        .build(tauri::generate_context!())
        .expect("error while building tauri application");

    app.run(|app_handle, event| {
        // The assistant browser is left open on purpose; only the poller stops.
        if let RunEvent::ExitRequested { .. } = event {
            if let Some(state) = app_handle.try_state::<AppState>() {
                tauri::async_runtime::block_on(async {
                    if let Err(err) = state.poller.lock().await.stop().await {
                        warn!("Page poller did not stop cleanly: {err:#}");
                    }
                });
            }
        }
    });
}
