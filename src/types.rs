//! Core data types used throughout the backupper library
//!
//! This module contains the data structures shared between the resolver,
//! archive builder, restore engine and manager.
//!
//! ## Overview
//!
//! - **Selection**: `BackupItem`, `BackupSelection`, `ItemKind` - what a run will archive
//! - **Results**: `FileOutcome`, `BuildReport`, `RestoreResult`, `OperationOutcome`
//! - **Listings**: `ArchiveRecord`
//! - **Progress**: `ProgressInfo`, `ProgressCallback`
//!
//! ## Examples
//!
//! ```rust
//! use backupper::types::OperationOutcome;
//!
//! let outcome = OperationOutcome::failure("No items selected for backup");
//! assert!(!outcome.success);
//! ```

use crate::manifest::Manifest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Whether a selected item is a single file or a directory tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    /// A single regular file
    File,
    /// A directory walked recursively
    Directory,
}

/// One logical item selected for backup
///
/// `source` is the path the item lives at and the path recorded in the
/// manifest. `read_from` is where the archive builder actually reads it,
/// which differs only when the item was staged to a writable copy first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupItem {
    /// Short logical name (`config`, `addons`, `repository.xbmc.org`, ...)
    pub name: String,
    /// Original absolute path
    pub source: PathBuf,
    /// Path the content is read from
    pub read_from: PathBuf,
    /// File or directory
    pub kind: ItemKind,
    /// Selected directory whose walk already archives this item's files
    pub covered_by: Option<String>,
}

impl BackupItem {
    /// Create an item read directly from its source path
    pub fn new(name: impl Into<String>, source: PathBuf, kind: ItemKind) -> Self {
        Self {
            name: name.into(),
            read_from: source.clone(),
            source,
            kind,
            covered_by: None,
        }
    }
}

/// Ordered set of items for one backup run
///
/// Regenerated for every run from the current settings and never persisted.
#[derive(Debug, Clone, Default)]
pub struct BackupSelection {
    items: Vec<BackupItem>,
}

impl BackupSelection {
    /// Create an empty selection
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item, ignoring a second item with the same name
    pub fn push(&mut self, item: BackupItem) {
        if !self.items.iter().any(|existing| existing.name == item.name) {
            self.items.push(item);
        }
    }

    /// Items in insertion order
    pub fn items(&self) -> &[BackupItem] {
        &self.items
    }

    /// Logical item names in insertion order
    pub fn names(&self) -> Vec<String> {
        self.items.iter().map(|item| item.name.clone()).collect()
    }

    /// Look up an item by name
    pub fn get(&self, name: &str) -> Option<&BackupItem> {
        self.items.iter().find(|item| item.name == name)
    }

    /// Number of items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing was selected
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Result of archiving a single file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    /// File was written to the archive
    Archived {
        /// Archive-relative name
        archive_name: String,
        /// Bytes copied
        bytes: u64,
    },
    /// File was left out; the run continued
    Skipped {
        /// Archive-relative name (or source path when no name was derived)
        archive_name: String,
        /// Why it was skipped
        reason: String,
    },
}

impl FileOutcome {
    /// Whether the file made it into the archive
    pub fn is_archived(&self) -> bool {
        matches!(self, FileOutcome::Archived { .. })
    }
}

/// Result of a completed archive build
#[derive(Debug, Clone)]
pub struct BuildReport {
    /// Final path of the archive
    pub archive_path: PathBuf,
    /// Manifest embedded in the archive
    pub manifest: Manifest,
    /// Per-file outcomes in processing order
    pub outcomes: Vec<FileOutcome>,
    /// Time taken in milliseconds
    pub duration_ms: u64,
}

impl BuildReport {
    /// Number of files written
    pub fn files_archived(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_archived()).count()
    }

    /// Outcomes for files that were skipped
    pub fn skipped(&self) -> impl Iterator<Item = &FileOutcome> {
        self.outcomes.iter().filter(|o| !o.is_archived())
    }
}

/// Result of a restore operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreResult {
    /// Archive that was restored
    pub archive: PathBuf,
    /// Number of files restored
    pub files_restored: usize,
    /// Total bytes written
    pub bytes_written: u64,
    /// Time taken for restoration in milliseconds
    pub duration_ms: u64,
    /// Non-fatal problems, such as a failed remount back to read-only
    pub warnings: Vec<String>,
}

/// Success flag plus human-readable message returned by every public
/// manager operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationOutcome {
    /// Whether the operation succeeded
    pub success: bool,
    /// Message suitable for a dialog or notification
    pub message: String,
}

impl OperationOutcome {
    /// Successful outcome
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    /// Failed outcome
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

impl From<crate::error::BackupError> for OperationOutcome {
    fn from(err: crate::error::BackupError) -> Self {
        OperationOutcome::failure(err.user_message())
    }
}

/// An existing archive, local or remote, as seen by rotation and listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    /// File name (no directory)
    pub name: String,
    /// Last modification time
    pub modified: DateTime<Utc>,
    /// Size in bytes, when the backend reports it
    pub size: Option<u64>,
}

impl ArchiveRecord {
    /// Create a record without size information
    pub fn new(name: impl Into<String>, modified: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            modified,
            size: None,
        }
    }
}

/// Progress information for long-running operations
#[derive(Debug, Clone, Default)]
pub struct ProgressInfo {
    /// Operation being performed
    pub operation: String,
    /// Current item being processed
    pub current_item: Option<String>,
    /// Items processed so far
    pub processed: usize,
    /// Total items to process (if known)
    pub total: Option<usize>,
    /// Bytes processed so far
    pub bytes_processed: u64,
    /// Total bytes to process (if known)
    pub total_bytes: Option<u64>,
}

impl ProgressInfo {
    /// Get progress as a percentage (0-100), by bytes when known
    pub fn percentage(&self) -> Option<f32> {
        match (self.total_bytes, self.total) {
            (Some(total), _) if total > 0 => {
                Some((self.bytes_processed as f32 / total as f32) * 100.0)
            }
            (_, Some(total)) if total > 0 => Some((self.processed as f32 / total as f32) * 100.0),
            _ => None,
        }
    }

    /// Whether this update describes a finished operation
    pub fn is_complete(&self) -> bool {
        match (self.total_bytes, self.total) {
            (Some(total), _) => self.bytes_processed >= total,
            (_, Some(total)) => self.processed >= total,
            _ => false,
        }
    }
}

/// Progress callback type
pub type ProgressCallback = Arc<dyn Fn(&ProgressInfo) + Send + Sync>;
