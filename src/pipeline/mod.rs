//! Turns what is currently on the annotation page into a persisted task.
//!
//! The whole read → dedup → persist → index sequence runs under one async
//! mutex. Extraction can be fired from two hotkeys at once (extract and the
//! composite upload), and both would otherwise race for the same slot number
//! and the same index file.

use std::collections::HashSet;
use std::io::Cursor;
use std::sync::Arc;

use chrono::{Local, Utc};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::executor::{ActionExecutor, ActionFailure};
use crate::models::{Dimensions, LocatorSet, TaskIndex, TaskRecord, TaskStatus};
use crate::status::{PanelEvent, StatusSink};
use crate::storage::{artifact_extension, ArtifactFetcher, PersistenceError, TaskStore};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

#[derive(Debug, Clone)]
pub struct ExtractionSelectors {
    pub image: LocatorSet,
    pub instruction: LocatorSet,
    pub size: Option<LocatorSet>,
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("could not read {field} from the page: {failure}")]
    Page {
        field: &'static str,
        failure: ActionFailure,
    },
    #[error("failed to fetch {reference}: {reason}")]
    Fetch { reference: String, reason: String },
    #[error("image size unknown for {reference}")]
    Dimensions { reference: String },
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug)]
pub enum ExtractOutcome {
    Created(TaskRecord),
    /// The reference is already recorded in this bucket; nothing was written.
    DuplicateSkipped {
        image_reference: String,
        existing: Option<TaskRecord>,
    },
    Failed(ExtractionError),
}

struct PipelineState {
    index: TaskIndex,
    known: HashSet<(String, String)>,
}

impl PipelineState {
    fn new(index: TaskIndex) -> Self {
        let known = index
            .tasks
            .iter()
            .map(|task| (task.date_bucket.clone(), task.image_reference.clone()))
            .collect();
        Self { index, known }
    }
}

pub struct ExtractionPipeline {
    executor: Arc<ActionExecutor>,
    fetcher: Arc<dyn ArtifactFetcher>,
    store: TaskStore,
    selectors: ExtractionSelectors,
    preallocate_next_slot: bool,
    sink: Arc<dyn StatusSink>,
    state: Mutex<PipelineState>,
}

pub fn today_bucket() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

impl ExtractionPipeline {
    pub fn open(
        executor: Arc<ActionExecutor>,
        fetcher: Arc<dyn ArtifactFetcher>,
        store: TaskStore,
        selectors: ExtractionSelectors,
        preallocate_next_slot: bool,
        sink: Arc<dyn StatusSink>,
    ) -> Result<Self, PersistenceError> {
        let index = store.load_index()?;
        log_info!(
            "Loaded task index from {} ({} tasks)",
            store.index_path().display(),
            index.total_tasks
        );

        Ok(Self {
            executor,
            fetcher,
            store,
            selectors,
            preallocate_next_slot,
            sink,
            state: Mutex::new(PipelineState::new(index)),
        })
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub async fn extract_current(&self) -> ExtractOutcome {
        self.extract_into(&today_bucket()).await
    }

    pub async fn extract_into(&self, bucket: &str) -> ExtractOutcome {
        let mut state = self.state.lock().await;
        let outcome = match self.extract_locked(&mut state, bucket).await {
            Ok(outcome) => outcome,
            Err(err) => {
                log_warn!("Extraction into {} failed: {}", bucket, err);
                ExtractOutcome::Failed(err)
            }
        };
        drop(state);

        if matches!(outcome, ExtractOutcome::Created(_)) {
            self.sink.publish(PanelEvent::RecordsChanged);
        }
        outcome
    }

    async fn extract_locked(
        &self,
        state: &mut PipelineState,
        bucket: &str,
    ) -> Result<ExtractOutcome, ExtractionError> {
        let image_reference = self
            .executor
            .read(&self.selectors.image.read_attribute("src"))
            .await
            .map_err(|failure| ExtractionError::Page {
                field: "image",
                failure,
            })?;

        if state
            .known
            .contains(&(bucket.to_string(), image_reference.clone()))
        {
            log_info!("Skipping {} (already recorded in {})", image_reference, bucket);
            let existing = state
                .index
                .find_by_reference(bucket, &image_reference)
                .cloned();
            return Ok(ExtractOutcome::DuplicateSkipped {
                image_reference,
                existing,
            });
        }

        let instruction_text = self
            .executor
            .read(&self.selectors.instruction.read_text())
            .await
            .map_err(|failure| ExtractionError::Page {
                field: "instruction",
                failure,
            })?;

        let size_descriptor = match &self.selectors.size {
            Some(size) => match self.executor.read(&size.read_text()).await {
                Ok(text) => Some(text),
                Err(failure) => {
                    log_warn!("Size descriptor unavailable ({}); decoding image instead", failure);
                    None
                }
            },
            None => None,
        };

        let artifact = self
            .fetcher
            .fetch(&image_reference)
            .await
            .map_err(|err| ExtractionError::Fetch {
                reference: image_reference.clone(),
                reason: format!("{err:#}"),
            })?;

        let original_dimensions = size_descriptor
            .as_deref()
            .and_then(Dimensions::parse_descriptor)
            .or_else(|| decode_dimensions(&artifact.bytes))
            .ok_or_else(|| ExtractionError::Dimensions {
                reference: image_reference.clone(),
            })?;

        let target = self.store.next_slot(bucket)?;
        let extension = artifact_extension(
            &image_reference,
            artifact.content_type.as_deref(),
            &artifact.bytes,
        );
        let now = Utc::now();
        let record = TaskRecord {
            sequence_number: target.number,
            date_bucket: bucket.to_string(),
            image_reference: image_reference.clone(),
            local_artifact_path: self
                .store
                .slot_dir(bucket, target.number)
                .join(format!("image.{extension}")),
            instruction_text,
            original_dimensions,
            status: TaskStatus::Extracted,
            created_at: now,
            updated_at: now,
        };

        self.store
            .persist_new(target, &record, &artifact.bytes, &mut state.index)?;
        state
            .known
            .insert((bucket.to_string(), image_reference));

        log_info!(
            "Recorded task {}/{} ({}, {} bytes)",
            bucket,
            record.sequence_number,
            record.original_dimensions,
            artifact.bytes.len()
        );

        if self.preallocate_next_slot {
            if let Err(err) = self
                .store
                .create_placeholder(bucket, record.sequence_number + 1)
            {
                log_warn!("Could not pre-create next slot: {}", err);
            }
        }

        Ok(ExtractOutcome::Created(record))
    }

    pub async fn latest_record(&self) -> Option<TaskRecord> {
        self.state.lock().await.index.latest().cloned()
    }

    pub async fn records(&self) -> Vec<TaskRecord> {
        self.state.lock().await.index.tasks.clone()
    }

    pub async fn total_tasks(&self) -> u64 {
        self.state.lock().await.index.total_tasks
    }

    pub async fn update_status(
        &self,
        bucket: &str,
        sequence: u32,
        status: TaskStatus,
    ) -> Result<TaskRecord, PersistenceError> {
        let mut state = self.state.lock().await;
        let mut updated = state.index.clone();
        let now = Utc::now();
        let record = {
            let record = updated.find_mut(bucket, sequence).ok_or_else(|| {
                PersistenceError::UnknownSlot {
                    bucket: bucket.to_string(),
                    sequence,
                }
            })?;
            record.status = status;
            record.updated_at = now;
            record.clone()
        };
        updated.last_updated = now;

        self.store.save_record(&record, &updated)?;
        state.index = updated;
        drop(state);

        self.sink.publish(PanelEvent::RecordsChanged);
        Ok(record)
    }

    pub async fn delete_latest_slot(&self) -> Result<Option<TaskRecord>, PersistenceError> {
        self.delete_latest_in(&today_bucket()).await
    }

    /// Removes the highest-numbered slot of `bucket`, its index entry and its
    /// dedup entry. Only the tail can go, so numbering stays contiguous.
    pub async fn delete_latest_in(&self, bucket: &str) -> Result<Option<TaskRecord>, PersistenceError> {
        let mut state = self.state.lock().await;
        let Some(sequence) = state.index.highest_sequence(bucket) else {
            return Ok(None);
        };

        let mut updated = state.index.clone();
        let Some(removed) = updated.remove(bucket, sequence, Utc::now()) else {
            return Ok(None);
        };

        self.store.save_index(&updated)?;
        if let Err(err) = self.store.remove_slot(bucket, sequence) {
            if let Err(restore_err) = self.store.save_index(&state.index) {
                log_warn!("Failed to restore index after aborted delete: {}", restore_err);
            }
            return Err(err);
        }

        state
            .known
            .remove(&(bucket.to_string(), removed.image_reference.clone()));
        state.index = updated;
        drop(state);

        log_info!("Deleted task {}/{}", bucket, sequence);
        self.sink.publish(PanelEvent::RecordsChanged);
        Ok(Some(removed))
    }
}

fn decode_dimensions(bytes: &[u8]) -> Option<Dimensions> {
    let reader = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?;
    let (width, height) = reader.into_dimensions().ok()?;
    Some(Dimensions::new(width, height))
}
