use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
    time::Duration,
};

use crate::bridge::AssistantSettings;
use crate::context::PageControls;
use crate::driver::BrowserLaunch;
use crate::models::{Locator, LocatorSet};
use crate::pipeline::ExtractionSelectors;

pub const ENV_DATA_DIR: &str = "ANNOTATION_PANEL_DATA_DIR";
pub const ENV_WEBDRIVER_URL: &str = "ANNOTATION_PANEL_WEBDRIVER_URL";
pub const ENV_SESSION_ID: &str = "ANNOTATION_PANEL_SESSION_ID";
pub const ENV_DEBUG: &str = "ANNOTATION_PANEL_DEBUG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct WebDriverSettings {
    pub url: String,
    /// Attach to this existing session instead of launching a browser.
    pub session_id: Option<String>,
    pub browser: BrowserLaunch,
    /// Opened once after launching a fresh browser.
    pub start_url: Option<String>,
}

impl Default for WebDriverSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:9515".into(),
            session_id: None,
            browser: BrowserLaunch::default(),
            start_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PageSelectors {
    pub image: LocatorSet,
    pub instruction: LocatorSet,
    pub size: Option<LocatorSet>,
    pub controls: PageControls,
}

impl Default for PageSelectors {
    fn default() -> Self {
        Self {
            image: LocatorSet::new(
                Locator::xpath("//img[@class='task-image']"),
                vec![
                    Locator::css("img.task-image"),
                    Locator::xpath("//div[contains(@class, 'image')]//img"),
                ],
            ),
            instruction: LocatorSet::new(
                Locator::xpath("//textarea[@class='annotation-text']"),
                vec![
                    Locator::xpath("//*[contains(@class, 'instruction')]"),
                    Locator::xpath("//*[contains(@class, 'description')]"),
                ],
            ),
            size: Some(LocatorSet::new(
                Locator::xpath("//*[contains(text(), '尺寸')]"),
                vec![Locator::xpath("//*[contains(text(), '×')]")],
            )),
            controls: PageControls::default(),
        }
    }
}

impl PageSelectors {
    pub fn extraction(&self) -> ExtractionSelectors {
        ExtractionSelectors {
            image: self.image.clone(),
            instruction: self.instruction.clone(),
            size: self.size.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TimingSettings {
    pub debounce_window_ms: u64,
    pub poll_interval_ms: u64,
    pub attempt_timeout_ms: u64,
    pub max_backoff_steps: u32,
    pub fetch_timeout_secs: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            debounce_window_ms: 1000,
            poll_interval_ms: 1500,
            attempt_timeout_ms: 2000,
            max_backoff_steps: 5,
            fetch_timeout_secs: 30,
        }
    }
}

impl TimingSettings {
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms.max(1))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SlotSettings {
    /// Create the next slot folder right after each save, as older
    /// tooling expects.
    pub preallocate_next_slot: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct HotkeySettings {
    /// Held together with every panel key, e.g. `["ctrl", "alt"]`. Empty
    /// binds the bare keys.
    pub modifiers: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PanelSettings {
    /// Defaults to the app data directory.
    pub data_dir: Option<PathBuf>,
    /// Saves page snapshots on fallback and logs every attempt.
    pub debug: bool,
    pub webdriver: WebDriverSettings,
    pub page: PageSelectors,
    pub assistant: AssistantSettings,
    pub timing: TimingSettings,
    pub slots: SlotSettings,
    pub hotkeys: HotkeySettings,
}

impl PanelSettings {
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|value| !value.is_empty()) {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(url) = lookup(ENV_WEBDRIVER_URL).filter(|value| !value.is_empty()) {
            self.webdriver.url = url;
        }
        if let Some(id) = lookup(ENV_SESSION_ID).filter(|value| !value.is_empty()) {
            self.webdriver.session_id = Some(id);
        }
        if let Some(flag) = lookup(ENV_DEBUG) {
            self.debug = flag == "1" || flag.eq_ignore_ascii_case("true");
        }
    }

    pub fn data_dir_or(&self, fallback: &Path) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| fallback.to_path_buf())
    }
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<PanelSettings>,
}

impl SettingsStore {
    /// Missing or unreadable JSON falls back to defaults. A missing file is
    /// written out so the operator has something to edit.
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                log::warn!("Ignoring unparseable settings {}: {}", path.display(), err);
                PanelSettings::default()
            })
        } else {
            PanelSettings::default()
        };

        let store = Self {
            path,
            data: RwLock::new(data),
        };
        if !store.path.exists() {
            if let Err(err) = store.persist(&store.get()) {
                log::warn!("Could not write default settings: {err:#}");
            }
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored settings, without environment overrides.
    pub fn get(&self) -> PanelSettings {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stored settings with environment overrides applied.
    pub fn effective(&self) -> PanelSettings {
        let mut settings = self.get();
        settings.apply_env_overrides(|key| std::env::var(key).ok());
        settings
    }

    pub fn update(&self, settings: PanelSettings) -> Result<()> {
        let mut guard = self.data.write().unwrap_or_else(PoisonError::into_inner);
        self.persist(&settings)?;
        *guard = settings;
        Ok(())
    }

    fn persist(&self, data: &PanelSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}
