//! On-disk layout for extracted tasks.
//!
//! ```text
//! <root>/task_index.json
//! <root>/tasks/<YYYY-MM-DD>/<N>/image.<ext>
//! <root>/tasks/<YYYY-MM-DD>/<N>/task.json
//! ```
//!
//! JSON documents are written to a temp file in the target directory and
//! renamed over the old file, so readers never see a half-written index.

pub mod fetch;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{Local, Utc};
use log::{info, warn};
use serde::Serialize;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::models::{TaskIndex, TaskRecord};

pub use fetch::{ArtifactFetcher, FetchedArtifact, HttpFetcher};

pub const INDEX_FILE: &str = "task_index.json";
pub const METADATA_FILE: &str = "task.json";
pub const RESULTS_DIR: &str = "results";
const TASKS_DIR: &str = "tasks";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("slot {bucket}/{sequence} has no index entry")]
    UnknownSlot { bucket: String, sequence: u32 },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> PersistenceError + '_ {
    move |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Where the next record goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotTarget {
    pub number: u32,
    /// The folder already exists as an empty placeholder.
    pub placeholder: bool,
}

#[derive(Debug, Clone)]
pub struct TaskStore {
    root: PathBuf,
}

impl TaskStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    pub fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(TASKS_DIR).join(bucket)
    }

    pub fn slot_dir(&self, bucket: &str, sequence: u32) -> PathBuf {
        self.bucket_dir(bucket).join(sequence.to_string())
    }

    /// Loads the index, creating an empty one on first run. An index that no
    /// longer parses is moved aside and rebuilt from the per-slot metadata.
    pub fn load_index(&self) -> Result<TaskIndex, PersistenceError> {
        let path = self.index_path();
        if !path.exists() {
            fs::create_dir_all(&self.root).map_err(io_error(&self.root))?;
            let index = TaskIndex::new(Utc::now());
            write_json_atomic(&path, &index)?;
            info!("Created task index at {}", path.display());
            return Ok(index);
        }

        let contents = fs::read_to_string(&path).map_err(io_error(&path))?;
        match serde_json::from_str::<TaskIndex>(&contents) {
            Ok(mut index) => {
                if !index.is_consistent() {
                    warn!(
                        "Task index counter {} disagrees with {} records; repairing",
                        index.total_tasks,
                        index.tasks.len()
                    );
                    index.total_tasks = index.tasks.len() as u64;
                    write_json_atomic(&path, &index)?;
                }
                Ok(index)
            }
            Err(err) => {
                let aside = path.with_file_name(format!(
                    "{INDEX_FILE}.corrupt-{}",
                    Local::now().format("%Y%m%d_%H%M%S")
                ));
                warn!(
                    "Task index {} is unreadable ({err}); moving it to {} and rebuilding",
                    path.display(),
                    aside.display()
                );
                fs::rename(&path, &aside).map_err(io_error(&path))?;
                let index = self.rebuild_index()?;
                write_json_atomic(&path, &index)?;
                Ok(index)
            }
        }
    }

    pub fn save_index(&self, index: &TaskIndex) -> Result<(), PersistenceError> {
        write_json_atomic(&self.index_path(), index)
    }

    fn rebuild_index(&self) -> Result<TaskIndex, PersistenceError> {
        let mut records = Vec::new();
        let tasks_dir = self.root.join(TASKS_DIR);
        if tasks_dir.is_dir() {
            for bucket in fs::read_dir(&tasks_dir).map_err(io_error(&tasks_dir))? {
                let bucket = bucket.map_err(io_error(&tasks_dir))?;
                let Some(name) = bucket.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                for sequence in self.slot_numbers(&name)? {
                    let metadata = self.slot_dir(&name, sequence).join(METADATA_FILE);
                    let Ok(contents) = fs::read_to_string(&metadata) else {
                        continue;
                    };
                    match serde_json::from_str::<TaskRecord>(&contents) {
                        Ok(record) => records.push(record),
                        Err(err) => warn!("Skipping unreadable {}: {err}", metadata.display()),
                    }
                }
            }
        }

        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.sequence_number.cmp(&b.sequence_number))
        });
        let now = Utc::now();
        let mut index = TaskIndex::new(records.first().map(|r| r.created_at).unwrap_or(now));
        for record in records {
            index.push(record, now);
        }
        info!("Rebuilt task index with {} records", index.total_tasks);
        Ok(index)
    }

    /// Numeric slot folders in a bucket, ascending.
    pub fn slot_numbers(&self, bucket: &str) -> Result<Vec<u32>, PersistenceError> {
        let dir = self.bucket_dir(bucket);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut numbers: Vec<u32> = fs::read_dir(&dir)
            .map_err(io_error(&dir))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .filter(|number| *number > 0)
            .collect();
        numbers.sort_unstable();
        Ok(numbers)
    }

    /// The current slot is the highest-numbered folder when it is still an
    /// empty placeholder; otherwise the one after it.
    pub fn next_slot(&self, bucket: &str) -> Result<SlotTarget, PersistenceError> {
        let Some(highest) = self.slot_numbers(bucket)?.last().copied() else {
            return Ok(SlotTarget {
                number: 1,
                placeholder: false,
            });
        };

        let dir = self.slot_dir(bucket, highest);
        let empty = fs::read_dir(&dir)
            .map_err(io_error(&dir))?
            .next()
            .is_none();
        Ok(if empty {
            SlotTarget {
                number: highest,
                placeholder: true,
            }
        } else {
            SlotTarget {
                number: highest + 1,
                placeholder: false,
            }
        })
    }

    pub fn create_placeholder(&self, bucket: &str, sequence: u32) -> Result<PathBuf, PersistenceError> {
        let dir = self.slot_dir(bucket, sequence);
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        Ok(dir)
    }

    /// Writes artifact and metadata into the record's slot, then the index.
    /// On failure everything this call wrote is removed again and `index` is
    /// left as it was.
    pub fn persist_new(
        &self,
        target: SlotTarget,
        record: &TaskRecord,
        artifact: &[u8],
        index: &mut TaskIndex,
    ) -> Result<(), PersistenceError> {
        let dir = self.slot_dir(&record.date_bucket, record.sequence_number);
        let result = self.write_slot(&dir, record, artifact).and_then(|()| {
            let mut updated = index.clone();
            updated.push(record.clone(), record.updated_at);
            self.save_index(&updated)?;
            *index = updated;
            Ok(())
        });

        if let Err(err) = &result {
            warn!("Rolling back slot {}: {err}", dir.display());
            let cleanup = if target.placeholder {
                remove_slot_files(&dir, record)
            } else {
                fs::remove_dir_all(&dir)
            };
            if let Err(cleanup_err) = cleanup {
                if cleanup_err.kind() != std::io::ErrorKind::NotFound {
                    warn!("Rollback of {} incomplete: {cleanup_err}", dir.display());
                }
            }
        }
        result
    }

    fn write_slot(&self, dir: &Path, record: &TaskRecord, artifact: &[u8]) -> Result<(), PersistenceError> {
        fs::create_dir_all(dir).map_err(io_error(dir))?;
        let artifact_path = &record.local_artifact_path;
        let mut file = fs::File::create(artifact_path).map_err(io_error(artifact_path))?;
        file.write_all(artifact).map_err(io_error(artifact_path))?;
        file.sync_all().map_err(io_error(artifact_path))?;
        write_json_atomic(&dir.join(METADATA_FILE), record)
    }

    /// Rewrites one slot's metadata and the index after a status change.
    pub fn save_record(&self, record: &TaskRecord, index: &TaskIndex) -> Result<(), PersistenceError> {
        let dir = self.slot_dir(&record.date_bucket, record.sequence_number);
        write_json_atomic(&dir.join(METADATA_FILE), record)?;
        self.save_index(index)
    }

    /// Removes a slot folder together with any empty placeholders above it.
    pub fn remove_slot(&self, bucket: &str, sequence: u32) -> Result<(), PersistenceError> {
        for number in self.slot_numbers(bucket)? {
            if number < sequence {
                continue;
            }
            let dir = self.slot_dir(bucket, number);
            let removable = number == sequence
                || fs::read_dir(&dir).map_err(io_error(&dir))?.next().is_none();
            if removable {
                fs::remove_dir_all(&dir).map_err(io_error(&dir))?;
            }
        }
        Ok(())
    }
}

fn remove_slot_files(dir: &Path, record: &TaskRecord) -> std::io::Result<()> {
    for path in [record.local_artifact_path.clone(), dir.join(METADATA_FILE)] {
        match fs::remove_file(&path) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => return Err(err),
            _ => {}
        }
    }
    Ok(())
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).map_err(io_error(path))?;
    serde_json::to_writer_pretty(&mut tmp, value).map_err(|source| PersistenceError::Encode {
        path: path.to_path_buf(),
        source,
    })?;
    tmp.as_file().sync_all().map_err(io_error(path))?;
    tmp.persist(path)
        .map_err(|err| PersistenceError::Io {
            path: path.to_path_buf(),
            source: err.error,
        })?;
    Ok(())
}

/// File extension for an artifact: from the URL when it names an image type,
/// otherwise sniffed from the bytes.
pub fn artifact_extension(reference: &str, content_type: Option<&str>, bytes: &[u8]) -> String {
    const KNOWN: [&str; 6] = ["jpg", "jpeg", "png", "webp", "gif", "bmp"];

    let path = reference.split(['?', '#']).next().unwrap_or_default();
    if let Some((_, ext)) = path.rsplit_once('.') {
        let ext = ext.to_ascii_lowercase();
        if KNOWN.contains(&ext.as_str()) {
            return ext;
        }
    }

    if let Some(subtype) = content_type.and_then(|ct| ct.strip_prefix("image/")) {
        let subtype = subtype.split(';').next().unwrap_or_default().trim();
        if KNOWN.contains(&subtype) {
            return subtype.to_string();
        }
    }

    image::guess_format(bytes)
        .ok()
        .and_then(|format| format.extensions_str().first().map(|ext| ext.to_string()))
        .unwrap_or_else(|| "jpg".to_string())
}
