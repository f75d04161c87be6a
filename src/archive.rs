//! Archive builder
//!
//! Packages a [`BackupSelection`] into a single zip archive with an embedded
//! [`Manifest`]. The build runs in three phases:
//!
//! 1. **Collect**: walk every item and record `(read_from, entry name, size)`
//!    for each regular file. Symbolic links are never followed or archived.
//! 2. **Check**: the destination must be writable and have free space for
//!    the total source size plus a 10% margin.
//! 3. **Write**: stream each file into the archive in 1 MiB chunks, then
//!    write the manifest as the final entry.
//!
//! A file that cannot be read is skipped and reported in the
//! [`BuildReport`]; it does not fail the run. The archive is staged under a
//! temporary name in the destination directory and only renamed to its final
//! name once complete, so a failed build never leaves a partial archive.
//!
//! ## Example
//!
//! ```rust,no_run
//! use backupper::archive::ArchiveBuilder;
//! use backupper::compression::CompressionLevel;
//! use backupper::paths::{PathResolver, Scratch, SystemPaths};
//! use backupper::settings::BackupToggles;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let paths = SystemPaths::libreelec();
//! let mut scratch = Scratch::new();
//! let toggles = BackupToggles { config: true, addons: true, ..BackupToggles::none() };
//! let selection = PathResolver::new(paths.clone()).resolve(&toggles, &mut scratch)?;
//!
//! let report = ArchiveBuilder::new(paths)
//!     .compression(CompressionLevel::Maximum)
//!     .build(&selection, Path::new("/storage/backup"))?;
//! println!("{} files in {:?}", report.files_archived(), report.archive_path);
//! # Ok(())
//! # }
//! ```

use crate::compression::CompressionLevel;
use crate::error::{BackupError, Result};
use crate::manifest::{self, Manifest, MANIFEST_NAME};
use crate::paths::SystemPaths;
use crate::types::{
    BackupItem, BackupSelection, BuildReport, FileOutcome, ItemKind, ProgressCallback,
    ProgressInfo,
};
use crate::utils::{self, SpaceProbe, StatvfsProbe};
use chrono::{DateTime, Local};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, trace, warn};
use walkdir::WalkDir;
use zip::ZipWriter;

/// Chunk size for streaming file content into the archive
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Extra free space required on top of the total source size, in percent
pub const SPACE_MARGIN_PERCENT: u64 = 10;

/// Free space needed to archive `total` bytes
pub fn required_space(total: u64) -> u64 {
    total.saturating_add(total.saturating_mul(SPACE_MARGIN_PERCENT).div_ceil(100))
}

/// A file scheduled for archiving
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFile {
    /// Path the content is read from
    pub read_from: PathBuf,
    /// Entry name inside the archive
    pub archive_name: String,
    /// Size at collection time
    pub size: u64,
}

/// Result of the collection phase
#[derive(Debug, Clone, Default)]
pub struct CollectedFiles {
    /// Files to write, in walk order
    pub files: Vec<PendingFile>,
    /// Files dropped while collecting
    pub skipped: Vec<FileOutcome>,
    /// Sum of `files[].size`
    pub total_size: u64,
}

/// Builds zip archives from a backup selection
#[derive(Clone)]
pub struct ArchiveBuilder {
    paths: SystemPaths,
    compression: CompressionLevel,
    space: Arc<dyn SpaceProbe>,
    progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for ArchiveBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveBuilder")
            .field("paths", &self.paths)
            .field("compression", &self.compression)
            .field("has_progress", &self.progress.is_some())
            .finish()
    }
}

impl ArchiveBuilder {
    /// Create a builder with normal compression and `statvfs` space checks
    pub fn new(paths: SystemPaths) -> Self {
        Self {
            paths,
            compression: CompressionLevel::default(),
            space: Arc::new(StatvfsProbe),
            progress: None,
        }
    }

    /// Set the compression level
    pub fn compression(mut self, level: CompressionLevel) -> Self {
        self.compression = level;
        self
    }

    /// Replace the free-space probe
    pub fn space_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.space = probe;
        self
    }

    /// Receive a progress update after every chunk
    pub fn progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Collect every regular file of the selection
    pub fn collect(&self, selection: &BackupSelection) -> CollectedFiles {
        let mut collected = CollectedFiles::default();
        let mut seen: HashSet<String> = HashSet::new();

        for item in selection.items() {
            if let Some(parent) = &item.covered_by {
                trace!("{} is archived as part of {}", item.name, parent);
                continue;
            }
            match item.kind {
                ItemKind::File => {
                    self.collect_one(item, &item.read_from, &item.source, &mut seen, &mut collected)
                }
                ItemKind::Directory => {
                    let walker = WalkDir::new(&item.read_from)
                        .follow_links(false)
                        .sort_by_file_name();
                    for entry in walker {
                        let entry = match entry {
                            Ok(entry) => entry,
                            Err(e) => {
                                let location = e
                                    .path()
                                    .map(|p| p.display().to_string())
                                    .unwrap_or_else(|| item.read_from.display().to_string());
                                warn!("Cannot read {}: {}", location, e);
                                collected.skipped.push(FileOutcome::Skipped {
                                    archive_name: location,
                                    reason: e.to_string(),
                                });
                                continue;
                            }
                        };

                        let file_type = entry.file_type();
                        if file_type.is_symlink() {
                            debug!("Skipping symbolic link {:?}", entry.path());
                            continue;
                        }
                        if !file_type.is_file() {
                            continue;
                        }

                        let source = match entry.path().strip_prefix(&item.read_from) {
                            Ok(rel) => item.source.join(rel),
                            Err(_) => entry.path().to_path_buf(),
                        };
                        self.collect_one(item, entry.path(), &source, &mut seen, &mut collected);
                    }
                }
            }
        }

        debug!(
            "Collected {} files ({}), {} skipped",
            collected.files.len(),
            utils::format_bytes(collected.total_size),
            collected.skipped.len()
        );
        collected
    }

    fn collect_one(
        &self,
        item: &BackupItem,
        read_from: &Path,
        source: &Path,
        seen: &mut HashSet<String>,
        collected: &mut CollectedFiles,
    ) {
        let Some(archive_name) = manifest::entry_name_for(item, source, &self.paths) else {
            warn!("Cannot derive an archive name for {:?}", source);
            collected.skipped.push(FileOutcome::Skipped {
                archive_name: source.display().to_string(),
                reason: "no archive name for path".to_string(),
            });
            return;
        };

        if !seen.insert(archive_name.clone()) {
            debug!("Skipping duplicate entry {}", archive_name);
            collected.skipped.push(FileOutcome::Skipped {
                archive_name,
                reason: "duplicate entry name".to_string(),
            });
            return;
        }

        match fs::symlink_metadata(read_from) {
            Ok(metadata) if metadata.is_file() => {
                collected.total_size += metadata.len();
                collected.files.push(PendingFile {
                    read_from: read_from.to_path_buf(),
                    archive_name,
                    size: metadata.len(),
                });
            }
            Ok(_) => debug!("Skipping {:?}: not a regular file", read_from),
            Err(e) => {
                warn!("Cannot stat {:?}: {}", read_from, e);
                collected.skipped.push(FileOutcome::Skipped {
                    archive_name,
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Build an archive in `dest_dir` named after the current time
    pub fn build(&self, selection: &BackupSelection, dest_dir: &Path) -> Result<BuildReport> {
        self.build_at(selection, dest_dir, Local::now())
    }

    /// Build an archive in `dest_dir` stamped with `created`
    ///
    /// # Errors
    ///
    /// - [`BackupError::NoItemsSelected`] for an empty selection
    /// - [`BackupError::DestinationNotWritable`] if `dest_dir` cannot be written
    /// - [`BackupError::InsufficientSpace`] if free space is below the margin
    /// - [`BackupError::Io`] / [`BackupError::Zip`] if writing the archive fails
    #[instrument(skip(self, selection), fields(items = selection.len()))]
    pub fn build_at(
        &self,
        selection: &BackupSelection,
        dest_dir: &Path,
        created: DateTime<Local>,
    ) -> Result<BuildReport> {
        let start = Instant::now();

        if selection.is_empty() {
            return Err(BackupError::NoItemsSelected);
        }

        let collected = self.collect(selection);

        utils::ensure_writable_dir(dest_dir)?;
        let required = required_space(collected.total_size);
        let available = self.space.available_bytes(dest_dir)?;
        if available < required {
            warn!(
                "Insufficient space in {:?}: need {}, have {}",
                dest_dir,
                utils::format_bytes(required),
                utils::format_bytes(available)
            );
            return Err(BackupError::InsufficientSpace {
                required,
                available,
            });
        }

        let mut manifest = Manifest::new(selection, &created);
        manifest.total_size = collected.total_size;

        let archive_name = manifest::archive_file_name(&manifest.items, &created);
        let archive_path = dest_dir.join(&archive_name);
        info!(
            "Creating {} with {} files ({}, {} compression)",
            archive_name,
            collected.files.len(),
            utils::format_bytes(collected.total_size),
            self.compression
        );

        let staging = NamedTempFile::new_in(dest_dir)?;
        let writer = BufWriter::new(staging.as_file().try_clone()?);
        let mut zip = ZipWriter::new(writer);

        let mut outcomes = collected.skipped.clone();
        let mut progress = ProgressInfo {
            operation: "backup".to_string(),
            total: Some(collected.files.len()),
            total_bytes: Some(collected.total_size),
            ..Default::default()
        };

        for pending in &collected.files {
            progress.current_item = Some(pending.archive_name.clone());
            let bytes_before = progress.bytes_processed;

            match self.write_entry(&mut zip, pending, &mut progress)? {
                Ok((bytes, checksum)) => {
                    trace!("Archived {} ({} bytes)", pending.archive_name, bytes);
                    manifest.record_file(&pending.archive_name, checksum);
                    outcomes.push(FileOutcome::Archived {
                        archive_name: pending.archive_name.clone(),
                        bytes,
                    });
                }
                Err(reason) => {
                    warn!("Skipping {}: {}", pending.archive_name, reason);
                    outcomes.push(FileOutcome::Skipped {
                        archive_name: pending.archive_name.clone(),
                        reason,
                    });
                }
            }

            progress.processed += 1;
            progress.bytes_processed = progress
                .bytes_processed
                .max(bytes_before + pending.size)
                .min(collected.total_size);
            self.report(&progress);
        }

        zip.start_file(MANIFEST_NAME, self.compression.manifest_options())?;
        zip.write_all(&manifest.to_json()?)?;

        let writer = zip.finish()?;
        let file = writer.into_inner().map_err(|e| BackupError::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);

        if archive_path.exists() {
            warn!("Replacing existing archive {:?}", archive_path);
        }
        staging
            .persist(&archive_path)
            .map_err(|e| BackupError::Io(e.error))?;

        progress.current_item = None;
        progress.bytes_processed = collected.total_size;
        progress.processed = collected.files.len();
        self.report(&progress);

        let report = BuildReport {
            archive_path,
            manifest,
            outcomes,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            "Backup archive {:?} complete: {} files archived, {} skipped in {}ms",
            report.archive_path,
            report.files_archived(),
            report.skipped().count(),
            report.duration_ms
        );
        Ok(report)
    }

    /// Stream one file into the archive
    ///
    /// The outer `Result` carries archive write failures, which end the
    /// build. The inner one carries source read failures, which only skip
    /// this file.
    fn write_entry<W: Write + Seek>(
        &self,
        zip: &mut ZipWriter<W>,
        pending: &PendingFile,
        progress: &mut ProgressInfo,
    ) -> Result<std::result::Result<(u64, String), String>> {
        let mut source = match File::open(&pending.read_from) {
            Ok(file) => file,
            Err(e) => return Ok(Err(e.to_string())),
        };

        zip.start_file(
            pending.archive_name.as_str(),
            self.compression.file_options(pending.size),
        )?;

        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut copied = 0u64;

        loop {
            let read = match source.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    zip.abort_file()?;
                    return Ok(Err(e.to_string()));
                }
            };
            zip.write_all(&buffer[..read])?;
            hasher.update(&buffer[..read]);
            copied += read as u64;
            progress.bytes_processed += read as u64;
            self.report(progress);
        }

        Ok(Ok((copied, hex::encode(hasher.finalize()))))
    }

    fn report(&self, info: &ProgressInfo) {
        if let Some(callback) = &self.progress {
            callback(info);
        }
    }
}
