//! Global key bindings for the panel commands.
//!
//! A registered shortcut takes its key away from every other application.
//! The bindings are released while the panel is paused, and an optional
//! modifier set moves them off the plain keys.

use tauri::AppHandle;
use tauri_plugin_global_shortcut::{GlobalShortcutExt, Modifiers, Shortcut, ShortcutState};

use super::{HotkeyDispatcher, LegendEntry, PanelCommand};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const MODIFIER_LABELS: [(Modifiers, &str); 4] = [
    (Modifiers::CONTROL, "Ctrl"),
    (Modifiers::ALT, "Alt"),
    (Modifiers::SHIFT, "Shift"),
    (Modifiers::SUPER, "Super"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortcutBindings {
    modifiers: Modifiers,
}

impl ShortcutBindings {
    /// Unknown modifier names are skipped with a warning.
    pub fn new(names: &[String]) -> Self {
        let mut modifiers = Modifiers::empty();
        for name in names {
            match name.trim().to_lowercase().as_str() {
                "ctrl" | "control" => modifiers |= Modifiers::CONTROL,
                "alt" | "option" => modifiers |= Modifiers::ALT,
                "shift" => modifiers |= Modifiers::SHIFT,
                "super" | "meta" | "cmd" | "command" => modifiers |= Modifiers::SUPER,
                "" => {}
                other => log_warn!("Ignoring unknown hotkey modifier {:?}", other),
            }
        }
        Self { modifiers }
    }

    pub fn shortcut(&self, command: PanelCommand) -> Shortcut {
        let modifiers = (!self.modifiers.is_empty()).then_some(self.modifiers);
        Shortcut::new(modifiers, command.code())
    }

    /// What the operator presses, e.g. `Ctrl+Alt+ArrowLeft`.
    pub fn key_label(&self, command: PanelCommand) -> String {
        let mut parts: Vec<&str> = MODIFIER_LABELS
            .iter()
            .filter(|(flag, _)| self.modifiers.contains(*flag))
            .map(|(_, label)| *label)
            .collect();
        parts.push(command.key_name());
        parts.join("+")
    }

    pub fn legend(&self) -> Vec<LegendEntry> {
        PanelCommand::ALL
            .into_iter()
            .map(|command| LegendEntry {
                key: self.key_label(command),
                command,
                label: command.label(),
                confirm: command.needs_confirmation(),
            })
            .collect()
    }

    /// One key held by another application only costs its own command.
    pub fn register(&self, app: &AppHandle, dispatcher: &HotkeyDispatcher) -> usize {
        let mut registered = 0;
        for command in PanelCommand::ALL {
            let dispatcher = dispatcher.clone();
            let result = app
                .global_shortcut()
                .on_shortcut(self.shortcut(command), move |_app, _shortcut, event| {
                    if event.state == ShortcutState::Pressed {
                        dispatcher.on_press(command);
                    }
                });
            match result {
                Ok(()) => registered += 1,
                Err(err) => log_warn!(
                    "Could not register {} for {:?}: {}",
                    self.key_label(command),
                    command,
                    err
                ),
            }
        }
        log_info!("Registered {}/{} hotkeys", registered, PanelCommand::ALL.len());
        registered
    }

    /// Hands the keys back to the focused application.
    pub fn unregister(&self, app: &AppHandle) {
        let global = app.global_shortcut();
        for command in PanelCommand::ALL {
            let shortcut = self.shortcut(command);
            if !global.is_registered(shortcut) {
                continue;
            }
            if let Err(err) = global.unregister(shortcut) {
                log_warn!("Could not release {}: {}", self.key_label(command), err);
            }
        }
        log_info!("Hotkeys released");
    }
}
