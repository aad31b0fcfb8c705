use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static SIZE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([0-9]+)\s*[xX×*]\s*([0-9]+)").expect("size pattern compiles"));

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    Extracted,
    Submitted,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Extracted => "Extracted",
            TaskStatus::Submitted => "Submitted",
            TaskStatus::Completed => "Completed",
            TaskStatus::Failed => "Failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Finds the first `W x H` pair in free text. Accepts `x`, `X`, `×` and `*`
    /// as separators with optional whitespace around them, so labels such as
    /// "原图尺寸: 1024 × 768" parse as well.
    pub fn parse_descriptor(text: &str) -> Option<Self> {
        SIZE_PATTERN.captures_iter(text).find_map(|caps| {
            let width = caps[1].parse::<u32>().ok()?;
            let height = caps[2].parse::<u32>().ok()?;
            (width > 0 && height > 0).then_some(Self { width, height })
        })
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub sequence_number: u32,
    pub date_bucket: String,
    pub image_reference: String,
    pub local_artifact_path: PathBuf,
    pub instruction_text: String,
    pub original_dimensions: Dimensions,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn slot_key(&self) -> (&str, u32) {
        (&self.date_bucket, self.sequence_number)
    }
}

/// Global append-only index of every persisted task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskIndex {
    pub created_at: DateTime<Utc>,
    pub total_tasks: u64,
    pub last_updated: DateTime<Utc>,
    pub tasks: Vec<TaskRecord>,
}

impl TaskIndex {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            total_tasks: 0,
            last_updated: now,
            tasks: Vec::new(),
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.total_tasks == self.tasks.len() as u64
    }

    pub fn push(&mut self, record: TaskRecord, now: DateTime<Utc>) {
        self.tasks.push(record);
        self.total_tasks = self.tasks.len() as u64;
        self.last_updated = now;
    }

    pub fn remove(&mut self, bucket: &str, sequence: u32, now: DateTime<Utc>) -> Option<TaskRecord> {
        let position = self
            .tasks
            .iter()
            .position(|task| task.slot_key() == (bucket, sequence))?;
        let removed = self.tasks.remove(position);
        self.total_tasks = self.tasks.len() as u64;
        self.last_updated = now;
        Some(removed)
    }

    pub fn find_mut(&mut self, bucket: &str, sequence: u32) -> Option<&mut TaskRecord> {
        self.tasks
            .iter_mut()
            .find(|task| task.slot_key() == (bucket, sequence))
    }

    pub fn find_by_reference(&self, bucket: &str, reference: &str) -> Option<&TaskRecord> {
        self.tasks
            .iter()
            .find(|task| task.date_bucket == bucket && task.image_reference == reference)
    }

    pub fn latest(&self) -> Option<&TaskRecord> {
        self.tasks.iter().max_by_key(|task| task.created_at)
    }

    pub fn highest_sequence(&self, bucket: &str) -> Option<u32> {
        self.tasks
            .iter()
            .filter(|task| task.date_bucket == bucket)
            .map(|task| task.sequence_number)
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_size_descriptors() {
        assert_eq!(
            Dimensions::parse_descriptor("1024x768"),
            Some(Dimensions::new(1024, 768))
        );
        assert_eq!(
            Dimensions::parse_descriptor("原图尺寸: 800 × 600 px"),
            Some(Dimensions::new(800, 600))
        );
        assert_eq!(
            Dimensions::parse_descriptor("v2 size 640*480"),
            Some(Dimensions::new(640, 480))
        );
        assert_eq!(Dimensions::parse_descriptor("no size here"), None);
        assert_eq!(Dimensions::parse_descriptor("0x0"), None);
        assert_eq!(
            Dimensions::parse_descriptor("thumb 0x0, source 800 X 600"),
            Some(Dimensions::new(800, 600))
        );
        assert_eq!(Dimensions::parse_descriptor("99999999999x2"), None);
    }

    #[test]
    fn index_counters_follow_tasks() {
        let now = Utc::now();
        let mut index = TaskIndex::new(now);
        let record = TaskRecord {
            sequence_number: 1,
            date_bucket: "2024-06-15".into(),
            image_reference: "https://x/img123.jpg".into(),
            local_artifact_path: PathBuf::from("tasks/2024-06-15/1/image.jpg"),
            instruction_text: "remove background".into(),
            original_dimensions: Dimensions::new(10, 10),
            status: TaskStatus::Extracted,
            created_at: now,
            updated_at: now,
        };

        index.push(record, now);
        assert_eq!(index.total_tasks, 1);
        assert!(index.is_consistent());
        assert_eq!(index.highest_sequence("2024-06-15"), Some(1));
        assert!(index.find_by_reference("2024-06-15", "https://x/img123.jpg").is_some());
        assert!(index.find_by_reference("2024-06-16", "https://x/img123.jpg").is_none());

        assert!(index.remove("2024-06-15", 1, now).is_some());
        assert_eq!(index.total_tasks, 0);
        assert!(index.is_consistent());
    }
}
