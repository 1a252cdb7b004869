//! Quarantine targets for records that exhausted their retry budget
//!
//! Two targets are provided:
//! - [`MemoryQuarantine`]: in-process, for tests and dry runs
//! - [`DirectoryQuarantine`]: a dead-letter directory with one RON file per record

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{MessageRecord, QuarantineError};

/// A record as re-deposited into a quarantine target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantinedRecord {
    pub record: MessageRecord,
    /// Display form of the last error the handler returned
    pub reason: String,
    pub attempts: u32,
    pub quarantined_at: DateTime<Utc>,
}

impl QuarantinedRecord {
    #[must_use]
    pub fn new(record: MessageRecord, reason: impl Into<String>, attempts: u32) -> Self {
        Self {
            record,
            reason: reason.into(),
            attempts,
            quarantined_at: Utc::now(),
        }
    }
}

/// Destination for records whose retry budget is exhausted.
#[async_trait]
pub trait QuarantineSink: Send + Sync {
    /// Human readable name of the destination, used in logs.
    fn target(&self) -> &str;

    /// Re-deposit a record for out-of-band inspection or reprocessing.
    ///
    /// # Errors
    ///
    /// Returns a [`QuarantineError`] if the record could not be stored.
    async fn quarantine(&self, entry: &QuarantinedRecord) -> Result<(), QuarantineError>;
}

/// In-memory quarantine target
///
/// Holds entries in a `Vec` behind a lock. A capacity can be set to make
/// writes fail once the target is full.
#[derive(Debug, Clone, Default)]
pub struct MemoryQuarantine {
    entries: Arc<RwLock<Vec<QuarantinedRecord>>>,
    capacity: Option<usize>,
}

impl MemoryQuarantine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Arc::default(),
            capacity: Some(capacity),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of everything quarantined so far, in arrival order.
    #[must_use]
    pub fn entries(&self) -> Vec<QuarantinedRecord> {
        self.entries.read().clone()
    }

    /// Ids of everything quarantined so far, in arrival order.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .map(|entry| entry.record.id().to_string())
            .collect()
    }
}

#[async_trait]
impl QuarantineSink for MemoryQuarantine {
    fn target(&self) -> &str {
        "memory"
    }

    async fn quarantine(&self, entry: &QuarantinedRecord) -> Result<(), QuarantineError> {
        let mut entries = self.entries.write();

        if let Some(capacity) = self.capacity
            && entries.len() >= capacity
        {
            return Err(QuarantineError::CapacityExceeded {
                len: entries.len(),
                capacity,
            });
        }

        entries.push(entry.clone());
        Ok(())
    }
}

/// Dead-letter directory
///
/// Every entry lands in its own `<record id>.<ulid>.ron` file. Files are
/// written under a temporary name and renamed, so a reader never sees a
/// partially written entry.
#[derive(Debug, Clone)]
pub struct DirectoryQuarantine {
    path: PathBuf,
    name: String,
}

impl DirectoryQuarantine {
    /// Open (and create if needed) a dead-letter directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, QuarantineError> {
        let path = path.into();
        tokio::fs::create_dir_all(&path).await?;

        Ok(Self {
            name: path.display().to_string(),
            path,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every entry in the directory, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or an entry cannot be read or decoded.
    pub async fn entries(&self) -> Result<Vec<QuarantinedRecord>, QuarantineError> {
        let mut files = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.path).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "ron") {
                files.push(path);
            }
        }
        files.sort();

        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            let content = tokio::fs::read_to_string(&file).await?;
            let entry = ron::from_str(&content).map_err(|e| {
                QuarantineError::Serialization(format!("{}: {e}", file.display()))
            })?;
            entries.push(entry);
        }

        entries.sort_by_key(|entry: &QuarantinedRecord| entry.quarantined_at);
        Ok(entries)
    }
}

/// Keep ids usable as file names.
fn file_stem(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl QuarantineSink for DirectoryQuarantine {
    fn target(&self) -> &str {
        &self.name
    }

    async fn quarantine(&self, entry: &QuarantinedRecord) -> Result<(), QuarantineError> {
        let content = ron::ser::to_string_pretty(entry, ron::ser::PrettyConfig::default())
            .map_err(|e| QuarantineError::Serialization(e.to_string()))?;

        let name = format!(
            "{}.{}",
            file_stem(entry.record.id().as_str()),
            ulid::Ulid::new()
        );
        let staging = self.path.join(format!(".{name}.tmp"));
        let destination = self.path.join(format!("{name}.ron"));

        tokio::fs::write(&staging, content).await?;
        if let Err(e) = tokio::fs::rename(&staging, &destination).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> QuarantinedRecord {
        QuarantinedRecord::new(MessageRecord::new(id, "{}"), "boom", 3)
    }

    #[tokio::test]
    async fn test_memory_quarantine_keeps_order() {
        let sink = MemoryQuarantine::new();
        assert!(sink.is_empty());

        sink.quarantine(&entry("a")).await.expect("quarantine a");
        sink.quarantine(&entry("b")).await.expect("quarantine b");

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.ids(), vec!["a", "b"]);
        assert_eq!(sink.entries()[0].reason, "boom");
    }

    #[tokio::test]
    async fn test_memory_quarantine_capacity() {
        let sink = MemoryQuarantine::with_capacity(1);
        sink.quarantine(&entry("a")).await.expect("first fits");

        let err = sink
            .quarantine(&entry("b"))
            .await
            .expect_err("second exceeds capacity");
        assert!(matches!(
            err,
            QuarantineError::CapacityExceeded {
                len: 1,
                capacity: 1
            }
        ));
        assert_eq!(sink.ids(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_directory_quarantine_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = DirectoryQuarantine::open(dir.path().join("dead-letter"))
            .await
            .expect("open quarantine");

        let original = QuarantinedRecord::new(
            MessageRecord::new("queue/msg 1", "{\"template\":\"t\"}").with_attribute("k", "v"),
            "Template fetch failed",
            3,
        );
        sink.quarantine(&original).await.expect("quarantine");

        let entries = sink.entries().await.expect("read back");
        assert_eq!(entries, vec![original]);

        let names: Vec<_> = std::fs::read_dir(sink.path())
            .expect("list")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("queue_msg_1."));
        assert!(names[0].ends_with(".ron"));
    }

    #[tokio::test]
    async fn test_directory_quarantine_reports_missing_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = DirectoryQuarantine::open(dir.path().join("gone"))
            .await
            .expect("open quarantine");
        std::fs::remove_dir(sink.path()).expect("remove");

        let err = sink.quarantine(&entry("a")).await.expect_err("no directory");
        assert!(matches!(err, QuarantineError::Io(_)));
    }

    #[test]
    fn test_file_stem() {
        assert_eq!(file_stem("abc-123_x"), "abc-123_x");
        assert_eq!(file_stem("../etc/passwd"), "___etc_passwd");
    }
}
