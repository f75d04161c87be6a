//! Archive verification and integrity checking
//!
//! Re-opens a finished archive and confirms it can be restored:
//!
//! 1. **CRC pass**: every entry is read in full, which makes the zip reader
//!    check its CRC-32. The first corrupt entry fails verification.
//! 2. **Manifest**: `manifest.json` must exist and parse.
//! 3. **File list**: every name in `backed_up_files` must be an entry.
//!    Entries not listed in the manifest are only logged.
//! 4. **Checksums**: when the manifest records SHA-256 digests they must
//!    match the entry content.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use backupper::verification::ArchiveVerifier;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let report = ArchiveVerifier::verify(Path::new("/storage/backup/backup_conf_20240101_120000.zip"))?;
//! if report.is_valid() {
//!     println!("{}", report.summary());
//! } else {
//!     println!("Issues found: {}", report.summary());
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::{BackupError, Result};
use crate::manifest::{Manifest, MANIFEST_NAME};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};
use zip::ZipArchive;

/// Maximum number of missing names quoted in a failure message
pub const MAX_REPORTED_MISSING: usize = 5;

/// Verifies finished archives
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveVerifier;

impl ArchiveVerifier {
    /// Verify the archive at `path`
    ///
    /// Problems with the archive's content are described by the returned
    /// report; only a missing or unreadable file is an error.
    ///
    /// # Errors
    ///
    /// - [`BackupError::BackupNotFound`] if `path` does not exist
    /// - [`BackupError::Io`] if it cannot be opened
    #[instrument]
    pub fn verify(path: &Path) -> Result<VerificationReport> {
        if !path.exists() {
            return Err(BackupError::BackupNotFound(path.to_path_buf()));
        }
        let start = Instant::now();
        let file = File::open(path)?;
        let mut report = VerificationReport::new(path.to_path_buf());

        let mut archive = match ZipArchive::new(file) {
            Ok(archive) => archive,
            Err(e) => {
                warn!("{:?} is not a readable zip archive: {}", path, e);
                report.corrupt_entry = Some(display_name(path));
                report.corruption_detail = Some(e.to_string());
                return Ok(report);
            }
        };

        let mut digests: BTreeMap<String, String> = BTreeMap::new();
        let mut manifest_bytes: Option<Vec<u8>> = None;

        for index in 0..archive.len() {
            let mut entry = match archive.by_index(index) {
                Ok(entry) => entry,
                Err(e) => {
                    report.corrupt_entry = Some(format!("entry #{}", index));
                    report.corruption_detail = Some(e.to_string());
                    break;
                }
            };
            let name = entry.name().to_string();
            if entry.is_dir() {
                continue;
            }

            let mut hasher = Sha256::new();
            let mut content = Vec::new();
            let keep = name == MANIFEST_NAME;
            let mut buffer = [0u8; 64 * 1024];
            let read_result = loop {
                match entry.read(&mut buffer) {
                    Ok(0) => break Ok(()),
                    Ok(n) => {
                        hasher.update(&buffer[..n]);
                        if keep {
                            content.extend_from_slice(&buffer[..n]);
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => break Err(e),
                }
            };

            if let Err(e) = read_result {
                warn!("Corrupt entry {} in {:?}: {}", name, path, e);
                report.corrupt_entry = Some(name);
                report.corruption_detail = Some(e.to_string());
                break;
            }

            report.entries_checked += 1;
            if keep {
                manifest_bytes = Some(content);
            } else {
                digests.insert(name, hex::encode(hasher.finalize()));
            }
        }

        if report.corrupt_entry.is_some() {
            return Ok(report);
        }

        let manifest = match manifest_bytes {
            None => {
                report.manifest_error = Some(format!("{} not found", MANIFEST_NAME));
                return Ok(report);
            }
            Some(bytes) => match Manifest::from_slice(&bytes) {
                Ok(manifest) => manifest,
                Err(e) => {
                    report.manifest_error = Some(e.to_string());
                    return Ok(report);
                }
            },
        };

        report.apply_manifest(&manifest, &digests);

        for name in &report.unlisted_entries {
            info!("Entry {} is not listed in the manifest", name);
        }
        debug!(
            "Verified {:?} in {}ms: {}",
            path,
            start.elapsed().as_millis(),
            report.summary()
        );
        Ok(report)
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Outcome of verifying one archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    /// Archive that was verified
    pub archive: PathBuf,
    /// Entries read successfully (manifest included)
    pub entries_checked: usize,
    /// First entry that failed its CRC check
    pub corrupt_entry: Option<String>,
    /// Reader error for the corrupt entry
    pub corruption_detail: Option<String>,
    /// Why the manifest could not be used
    pub manifest_error: Option<String>,
    /// Files listed in the manifest but absent from the archive
    pub missing_files: Vec<String>,
    /// Entries absent from the manifest (tolerated)
    pub unlisted_entries: Vec<String>,
    /// Entries whose SHA-256 differs from the manifest
    pub checksum_mismatches: Vec<String>,
    /// Number of files the manifest lists
    pub files_listed: usize,
}

impl VerificationReport {
    fn new(archive: PathBuf) -> Self {
        Self {
            archive,
            entries_checked: 0,
            corrupt_entry: None,
            corruption_detail: None,
            manifest_error: None,
            missing_files: Vec::new(),
            unlisted_entries: Vec::new(),
            checksum_mismatches: Vec::new(),
            files_listed: 0,
        }
    }

    fn apply_manifest(&mut self, manifest: &Manifest, digests: &BTreeMap<String, String>) {
        let listed: BTreeSet<&str> = manifest.backed_up_files.iter().map(String::as_str).collect();
        self.files_listed = listed.len();

        let mut reported = BTreeSet::new();
        for name in &manifest.backed_up_files {
            if !digests.contains_key(name) && reported.insert(name.as_str()) {
                self.missing_files.push(name.clone());
            }
        }

        self.unlisted_entries = digests
            .keys()
            .filter(|name| !listed.contains(name.as_str()))
            .cloned()
            .collect();

        for (name, expected) in &manifest.checksums {
            if let Some(actual) = digests.get(name) {
                if !actual.eq_ignore_ascii_case(expected) {
                    self.checksum_mismatches.push(name.clone());
                }
            }
        }
    }

    /// Check if the archive passed every hard check
    pub fn is_valid(&self) -> bool {
        self.corrupt_entry.is_none()
            && self.manifest_error.is_none()
            && self.missing_files.is_empty()
            && self.checksum_mismatches.is_empty()
    }

    /// Human-readable reason for failure, `None` when valid
    pub fn failure_message(&self) -> Option<String> {
        if let Some(entry) = &self.corrupt_entry {
            return Some(match &self.corruption_detail {
                Some(detail) => format!("Corrupt archive entry {}: {}", entry, detail),
                None => format!("Corrupt archive entry {}", entry),
            });
        }
        if let Some(error) = &self.manifest_error {
            return Some(format!("Invalid manifest: {}", error));
        }
        if !self.missing_files.is_empty() {
            let shown = self
                .missing_files
                .iter()
                .take(MAX_REPORTED_MISSING)
                .cloned()
                .collect::<Vec<_>>()
                .join(", ");
            let more = self.missing_files.len().saturating_sub(MAX_REPORTED_MISSING);
            return Some(if more > 0 {
                format!(
                    "Archive is missing {} files listed in the manifest: {} (and {} more)",
                    self.missing_files.len(),
                    shown,
                    more
                )
            } else {
                format!(
                    "Archive is missing {} files listed in the manifest: {}",
                    self.missing_files.len(),
                    shown
                )
            });
        }
        if !self.checksum_mismatches.is_empty() {
            return Some(format!(
                "Checksum mismatch for {} files: {}",
                self.checksum_mismatches.len(),
                self.checksum_mismatches
                    .iter()
                    .take(MAX_REPORTED_MISSING)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        None
    }

    /// One-line summary
    pub fn summary(&self) -> String {
        match self.failure_message() {
            None => format!(
                "Archive {} is valid ({} entries checked, {} unlisted)",
                display_name(&self.archive),
                self.entries_checked,
                self.unlisted_entries.len()
            ),
            Some(message) => format!("Archive {} is invalid: {}", display_name(&self.archive), message),
        }
    }

    /// Turn a failed report into the matching error
    pub fn into_result(self) -> Result<Self> {
        if let Some(entry) = &self.corrupt_entry {
            return Err(BackupError::CorruptEntry(entry.clone()));
        }
        if let Some(error) = &self.manifest_error {
            return Err(BackupError::InvalidManifest(error.clone()));
        }
        match self.failure_message() {
            Some(message) => Err(BackupError::VerificationFailed(message)),
            None => Ok(self),
        }
    }
}
