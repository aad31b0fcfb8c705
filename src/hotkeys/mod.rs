pub mod commands;
pub mod dispatcher;
pub mod shortcuts;
pub mod state;

use serde::{Deserialize, Serialize};
use tauri_plugin_global_shortcut::Code;

pub use dispatcher::HotkeyDispatcher;
pub use shortcuts::ShortcutBindings;
pub use state::{Debouncer, KeyState, PressOutcome};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum PanelCommand {
    Select,
    Skip,
    Upload,
    Extract,
    Submit,
    DeleteSlot,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LegendEntry {
    pub key: String,
    pub command: PanelCommand,
    pub label: &'static str,
    /// The panel asks before running it from a button.
    pub confirm: bool,
}

impl PanelCommand {
    pub const ALL: [PanelCommand; 6] = [
        PanelCommand::Select,
        PanelCommand::Skip,
        PanelCommand::Upload,
        PanelCommand::Extract,
        PanelCommand::Submit,
        PanelCommand::DeleteSlot,
    ];

    pub fn code(self) -> Code {
        match self {
            PanelCommand::Select => Code::ArrowLeft,
            PanelCommand::Skip => Code::ArrowRight,
            PanelCommand::Upload => Code::ArrowUp,
            PanelCommand::Extract => Code::ArrowDown,
            PanelCommand::Submit => Code::Space,
            PanelCommand::DeleteSlot => Code::Delete,
        }
    }

    pub fn from_code(code: Code) -> Option<Self> {
        Self::ALL.into_iter().find(|command| command.code() == code)
    }

    pub fn key_name(self) -> &'static str {
        match self {
            PanelCommand::Select => "ArrowLeft",
            PanelCommand::Skip => "ArrowRight",
            PanelCommand::Upload => "ArrowUp",
            PanelCommand::Extract => "ArrowDown",
            PanelCommand::Submit => "Space",
            PanelCommand::DeleteSlot => "Delete",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PanelCommand::Select => "select",
            PanelCommand::Skip => "skip",
            PanelCommand::Upload => "upload",
            PanelCommand::Extract => "extract",
            PanelCommand::Submit => "submit",
            PanelCommand::DeleteSlot => "delete slot",
        }
    }

    /// Cannot be undone from the panel.
    pub fn needs_confirmation(self) -> bool {
        matches!(self, PanelCommand::DeleteSlot)
    }
}
