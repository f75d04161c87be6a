//! Rotation of old archives
//!
//! Given the existing archives and a retention count, rotation picks which
//! ones to delete. Archives are ordered by modification time; equal times
//! are ordered by file name, which embeds the creation timestamp.
//!
//! | strategy | setting | keeps |
//! |---|---|---|
//! | `KeepNewest` | 0 | the `keep` most recent |
//! | `KeepOldest` | 1 | the `keep` oldest |
//! | `KeepBothEnds` | 2 | `ceil(keep/2)` newest and `floor(keep/2)` oldest |
//!
//! `keep` is clamped to at least one so rotation can never delete every
//! archive.

use crate::error::Result;
use crate::manifest;
use crate::types::ArchiveRecord;
use chrono::{DateTime, Utc};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{debug, info, instrument, warn};

/// Which archives rotation retains
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RotationStrategy {
    /// Keep the most recent archives
    #[default]
    KeepNewest,
    /// Keep the oldest archives
    KeepOldest,
    /// Keep the newest and oldest, delete the middle
    KeepBothEnds,
}

impl RotationStrategy {
    /// Map the numeric setting value (0-2) to a strategy
    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(RotationStrategy::KeepNewest),
            1 => Some(RotationStrategy::KeepOldest),
            2 => Some(RotationStrategy::KeepBothEnds),
            _ => None,
        }
    }

    /// Numeric setting value
    pub fn index(self) -> i64 {
        match self {
            RotationStrategy::KeepNewest => 0,
            RotationStrategy::KeepOldest => 1,
            RotationStrategy::KeepBothEnds => 2,
        }
    }
}

impl fmt::Display for RotationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RotationStrategy::KeepNewest => "keep newest",
            RotationStrategy::KeepOldest => "keep oldest",
            RotationStrategy::KeepBothEnds => "keep both ends",
        };
        f.write_str(name)
    }
}

/// Select the archives to delete, oldest first
pub fn select_for_deletion(
    records: &[ArchiveRecord],
    keep: usize,
    strategy: RotationStrategy,
) -> Vec<ArchiveRecord> {
    let keep = keep.max(1);
    if records.len() <= keep {
        return Vec::new();
    }

    let mut ordered: Vec<&ArchiveRecord> = records.iter().collect();
    ordered.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.name.cmp(&b.name)));

    let total = ordered.len();
    let range = match strategy {
        RotationStrategy::KeepNewest => 0..total - keep,
        RotationStrategy::KeepOldest => keep..total,
        RotationStrategy::KeepBothEnds => {
            let newest = keep.div_ceil(2);
            let oldest = keep / 2;
            oldest..total - newest
        }
    };

    ordered[range].iter().map(|record| (*record).clone()).collect()
}

/// Archives found in a local backup directory
///
/// Only files matching `backup_*.zip` are returned. A missing directory
/// yields an empty list.
pub fn list_local_archives(dir: &Path) -> Result<Vec<ArchiveRecord>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !manifest::is_archive_name(&name) {
            continue;
        }
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        let modified: DateTime<Utc> = metadata.modified()?.into();
        records.push(ArchiveRecord {
            name,
            modified,
            size: Some(metadata.len()),
        });
    }
    records.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.name.cmp(&a.name)));
    Ok(records)
}

/// What a rotation pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationReport {
    /// Archives deleted
    pub deleted: Vec<String>,
    /// Archives that could not be deleted, with the reason
    pub failed: Vec<(String, String)>,
    /// Archives considered
    pub examined: usize,
}

impl RotationReport {
    /// Whether every selected archive was deleted
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Apply rotation to a local backup directory
#[instrument]
pub fn rotate_local(dir: &Path, keep: usize, strategy: RotationStrategy) -> Result<RotationReport> {
    let records = list_local_archives(dir)?;
    let mut report = RotationReport {
        examined: records.len(),
        ..Default::default()
    };

    for record in select_for_deletion(&records, keep, strategy) {
        let path = dir.join(&record.name);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("Removed old backup: {}", record.name);
                report.deleted.push(record.name);
            }
            Err(e) => {
                warn!("Failed to remove old backup {}: {}", record.name, e);
                report.failed.push((record.name, e.to_string()));
            }
        }
    }

    debug!(
        "Rotation ({}, keep {}) examined {} archives, deleted {}",
        strategy,
        keep,
        report.examined,
        report.deleted.len()
    );
    Ok(report)
}
