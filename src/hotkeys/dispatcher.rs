use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::bridge::BridgeOutcome;
use crate::context::SessionContext;
use crate::executor::ActionFailure;
use crate::models::{LocatorSet, TaskRecord, TaskStatus};
use crate::pipeline::ExtractOutcome;
use crate::status::{PanelEvent, StatusLevel, StatusUpdate};

use super::{Debouncer, PanelCommand, PressOutcome};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// URL fragments seen on the annotation workbench.
const ANNOTATION_MARKERS: [&str; 4] = ["pack_key", "annotation", "label", "/workbench/"];

/// Turns key presses into commands running on the async runtime.
///
/// Key callbacks arrive on the shortcut thread, outside any runtime, so
/// the dispatcher keeps a [`Handle`] and spawns through it.
#[derive(Clone)]
pub struct HotkeyDispatcher {
    context: Arc<SessionContext>,
    debouncer: Arc<Mutex<Debouncer>>,
    listening: Arc<AtomicBool>,
    runtime: Handle,
}

impl HotkeyDispatcher {
    pub fn new(context: Arc<SessionContext>, window: Duration, runtime: Handle) -> Self {
        Self {
            context,
            debouncer: Arc::new(Mutex::new(Debouncer::new(window))),
            listening: Arc::new(AtomicBool::new(true)),
            runtime,
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    pub fn set_listening(&self, listening: bool) {
        self.listening.store(listening, Ordering::SeqCst);
        if !listening {
            self.debouncer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
        let update = if listening {
            StatusUpdate::new(StatusLevel::Idle, "Listening for hotkeys")
        } else {
            StatusUpdate::new(StatusLevel::Idle, "Hotkeys paused")
        };
        self.publish(update);
    }

    pub fn on_press(&self, command: PanelCommand) -> Option<JoinHandle<()>> {
        self.press_at(command, Instant::now())
    }

    pub(crate) fn press_at(&self, command: PanelCommand, now: Instant) -> Option<JoinHandle<()>> {
        if !self.is_listening() {
            return None;
        }

        let outcome = self
            .debouncer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .press(command, now);
        match outcome {
            PressOutcome::Armed => {
                self.publish(StatusUpdate::for_command(
                    command,
                    StatusLevel::Pending,
                    format!("Press {} again to {}", command.key_name(), command.label()),
                ));
                None
            }
            PressOutcome::Fire => Some(self.fire(command)),
        }
    }

    /// A button press on the panel. Commands that need confirmation only run
    /// with `confirmed` set; otherwise a warning is published instead.
    pub fn trigger(&self, command: PanelCommand, confirmed: bool) -> Option<JoinHandle<()>> {
        if command.needs_confirmation() && !confirmed {
            log_info!("{:?} not confirmed, ignoring", command);
            self.publish(StatusUpdate::for_command(
                command,
                StatusLevel::Warning,
                format!("Confirm before running {}", command.label()),
            ));
            return None;
        }
        Some(self.fire(command))
    }

    /// Runs `command` on a worker task, skipping the debounce.
    pub fn fire(&self, command: PanelCommand) -> JoinHandle<()> {
        log_info!("Firing {:?}", command);
        self.publish(StatusUpdate::for_command(
            command,
            StatusLevel::Running,
            format!("Running {}...", command.label()),
        ));

        let context = self.context.clone();
        self.runtime.spawn(async move {
            let update = run_command(&context, command).await;
            context.sink.publish(PanelEvent::Status(update));
        })
    }

    fn publish(&self, update: StatusUpdate) {
        self.context.sink.publish(PanelEvent::Status(update));
    }
}

pub(crate) async fn run_command(context: &SessionContext, command: PanelCommand) -> StatusUpdate {
    match command {
        PanelCommand::Select => click(context, command, &context.controls.select).await,
        PanelCommand::Skip => click(context, command, &context.controls.skip).await,
        PanelCommand::Submit => click(context, command, &context.controls.submit).await,
        PanelCommand::Extract => extract(context).await,
        PanelCommand::Upload => upload(context).await,
        PanelCommand::DeleteSlot => delete_slot(context).await,
    }
}

async fn click(context: &SessionContext, command: PanelCommand, target: &LocatorSet) -> StatusUpdate {
    match context.executor.execute(&target.click()).await {
        Ok(_) => StatusUpdate::for_command(command, StatusLevel::Success, format!("Clicked {}", command.label())),
        Err(ActionFailure::NotFound) => {
            let location = context.executor.read_location().await.unwrap_or_default();
            if looks_like_annotation_page(&location) {
                StatusUpdate::for_command(
                    command,
                    StatusLevel::Error,
                    format!("{} button not found", command.label()),
                )
            } else {
                StatusUpdate::for_command(
                    command,
                    StatusLevel::Warning,
                    "Not on an annotation page; open the task view first",
                )
            }
        }
        Err(ActionFailure::Blocked) => StatusUpdate::for_command(
            command,
            StatusLevel::Error,
            format!("{} button could not be clicked", command.label()),
        ),
        Err(ActionFailure::Stale) => StatusUpdate::for_command(
            command,
            StatusLevel::Error,
            format!("Page changed while clicking {}", command.label()),
        ),
    }
}

pub fn looks_like_annotation_page(location: &str) -> bool {
    ANNOTATION_MARKERS
        .iter()
        .any(|marker| location.contains(marker))
}

async fn extract(context: &SessionContext) -> StatusUpdate {
    let command = PanelCommand::Extract;
    match context.pipeline.extract_current().await {
        ExtractOutcome::Created(record) => {
            context.instructions.publish(&record.instruction_text);
            StatusUpdate::for_command(
                command,
                StatusLevel::Success,
                format!(
                    "Saved task {} #{} ({})",
                    record.date_bucket, record.sequence_number, record.original_dimensions
                ),
            )
        }
        ExtractOutcome::DuplicateSkipped { existing, .. } => {
            let message = match existing {
                Some(record) => format!(
                    "Already saved as {} #{}",
                    record.date_bucket, record.sequence_number
                ),
                None => "Already saved".to_string(),
            };
            StatusUpdate::for_command(command, StatusLevel::Warning, message)
        }
        ExtractOutcome::Failed(err) => {
            StatusUpdate::for_command(command, StatusLevel::Error, format!("Extraction failed: {err}"))
        }
    }
}

async fn upload(context: &SessionContext) -> StatusUpdate {
    let command = PanelCommand::Upload;
    let record = match context.pipeline.extract_current().await {
        ExtractOutcome::Created(record) => record,
        ExtractOutcome::DuplicateSkipped {
            existing: Some(record),
            ..
        } => record,
        ExtractOutcome::DuplicateSkipped { existing: None, image_reference } => {
            return StatusUpdate::for_command(
                command,
                StatusLevel::Error,
                format!("No saved task for {image_reference}"),
            );
        }
        ExtractOutcome::Failed(err) => {
            return StatusUpdate::for_command(command, StatusLevel::Error, format!("Extraction failed: {err}"));
        }
    };
    context.instructions.publish(&record.instruction_text);

    set_status(context, &record, TaskStatus::Submitted).await;
    match context
        .bridge
        .submit(&record.local_artifact_path, &record.instruction_text)
        .await
    {
        Ok(BridgeOutcome::Delivered(produced)) => {
            set_status(context, &record, TaskStatus::Completed).await;
            StatusUpdate::for_command(
                command,
                StatusLevel::Success,
                format!("Assistant result saved to {}", produced.display()),
            )
        }
        Ok(BridgeOutcome::Failed(reason)) => {
            set_status(context, &record, TaskStatus::Failed).await;
            StatusUpdate::for_command(command, StatusLevel::Error, format!("Assistant failed: {reason}"))
        }
        Err(err) => {
            set_status(context, &record, record.status).await;
            StatusUpdate::for_command(command, StatusLevel::Error, err.to_string())
        }
    }
}

async fn set_status(context: &SessionContext, record: &TaskRecord, status: TaskStatus) {
    if let Err(err) = context
        .pipeline
        .update_status(&record.date_bucket, record.sequence_number, status)
        .await
    {
        log_warn!(
            "Could not mark {} #{} as {}: {}",
            record.date_bucket,
            record.sequence_number,
            status.as_str(),
            err
        );
    }
}

async fn delete_slot(context: &SessionContext) -> StatusUpdate {
    let command = PanelCommand::DeleteSlot;
    match context.pipeline.delete_latest_slot().await {
        Ok(Some(record)) => StatusUpdate::for_command(
            command,
            StatusLevel::Success,
            format!("Deleted {} #{}", record.date_bucket, record.sequence_number),
        ),
        Ok(None) => StatusUpdate::for_command(command, StatusLevel::Warning, "No task saved today"),
        Err(err) => StatusUpdate::for_command(command, StatusLevel::Error, format!("Delete failed: {err}")),
    }
}
