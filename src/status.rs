//! Everything the presentation surface gets to see goes through a
//! [`StatusSink`]. Workers never touch the window themselves.

use std::sync::{Arc, RwLock};

use serde::Serialize;
use tauri::{AppHandle, Emitter};

use crate::hotkeys::PanelCommand;

pub const STATUS_EVENT: &str = "panel-status";
pub const INSTRUCTION_EVENT: &str = "instruction-buffer";
pub const RECORDS_EVENT: &str = "task-records-changed";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StatusLevel {
    Idle,
    Pending,
    Running,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub level: StatusLevel,
    pub message: String,
    pub command: Option<PanelCommand>,
}

impl StatusUpdate {
    pub fn new(level: StatusLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            command: None,
        }
    }

    pub fn for_command(command: PanelCommand, level: StatusLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            command: Some(command),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PanelEvent {
    Status(StatusUpdate),
    Instruction(String),
    RecordsChanged,
}

pub trait StatusSink: Send + Sync {
    fn publish(&self, event: PanelEvent);
}

/// Emits panel events to the webview; Tauri queues them onto its event loop.
pub struct TauriSink {
    app_handle: AppHandle,
}

impl TauriSink {
    pub fn new(app_handle: AppHandle) -> Self {
        Self { app_handle }
    }
}

#[derive(Serialize, Clone)]
struct InstructionPayload<'a> {
    text: &'a str,
}

impl StatusSink for TauriSink {
    fn publish(&self, event: PanelEvent) {
        let result = match &event {
            PanelEvent::Status(update) => self.app_handle.emit(STATUS_EVENT, update),
            PanelEvent::Instruction(text) => self
                .app_handle
                .emit(INSTRUCTION_EVENT, InstructionPayload { text }),
            PanelEvent::RecordsChanged => self.app_handle.emit(RECORDS_EVENT, ()),
        };
        if let Err(err) = result {
            log::warn!("Failed to emit panel event {:?}: {}", event, err);
        }
    }
}

/// Instruction text shown on the panel, ready to paste into the page.
pub struct InstructionBuffer {
    current: RwLock<Option<String>>,
    sink: Arc<dyn StatusSink>,
}

impl InstructionBuffer {
    pub fn new(sink: Arc<dyn StatusSink>) -> Self {
        Self {
            current: RwLock::new(None),
            sink,
        }
    }

    /// Returns false when the buffer already holds `text`.
    pub fn publish(&self, text: &str) -> bool {
        {
            let mut guard = match self.current.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if guard.as_deref() == Some(text) {
                return false;
            }
            *guard = Some(text.to_string());
        }
        self.sink.publish(PanelEvent::Instruction(text.to_string()));
        true
    }

    pub fn current(&self) -> Option<String> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
