//! Utility functions for backupper
//!
//! File hashing, atomic writes, permission handling, free-space probing and
//! byte formatting used throughout the library.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use crate::utils::{format_bytes, hash_data};
//!
//! let digest = hash_data(b"<sources/>");
//! println!("{} ({})", digest, format_bytes(1536)); // "... (1.50 KB)"
//! ```
//!
//! ## Error Handling
//!
//! All fallible functions return `Result<T, BackupError>`.

use crate::error::{BackupError, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{trace, warn};

/// Hash arbitrary data using SHA-256
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Set Unix permissions
#[cfg(unix)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let permissions = fs::Permissions::from_mode(mode);
    fs::set_permissions(path, permissions)?;
    Ok(())
}

/// Set permissions (Windows implementation)
///
/// Only the read-only attribute can be expressed; it is set when the owner
/// write bit is missing from `mode`.
#[cfg(windows)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    let is_readonly = (mode & 0o200) == 0;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(is_readonly);
    fs::set_permissions(path, perms)?;
    Ok(())
}

/// Create `path` and every missing parent, returning the directories that
/// were actually created, outermost first
///
/// The restore engine uses the returned list to give newly created
/// directories explicit permissions without touching pre-existing ones.
pub fn create_dir_all_tracked(path: &Path) -> Result<Vec<PathBuf>> {
    let mut missing = Vec::new();
    let mut current = Some(path);
    while let Some(dir) = current {
        if dir.as_os_str().is_empty() || dir.exists() {
            break;
        }
        missing.push(dir.to_path_buf());
        current = dir.parent();
    }
    missing.reverse();

    for dir in &missing {
        match fs::create_dir(dir) {
            Ok(()) => trace!("Created directory {:?}", dir),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(missing)
}

/// Format bytes in human-readable form
///
/// Uses binary units (1024-based). Values below 1 KB are printed as whole
/// numbers, larger values with two decimals.
///
/// ```rust,ignore
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Atomic file write (write to a temp file in the same directory, then rename)
///
/// The target is never observed partially written. The temporary file is
/// removed automatically if any step fails.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;

    let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| BackupError::Io(e.error))?;
    Ok(())
}

/// Check that a directory can be created and written to
///
/// Creates the directory when missing and probes it with a short-lived
/// temporary file.
pub fn ensure_writable_dir(dir: &Path) -> Result<()> {
    let not_writable = || BackupError::DestinationNotWritable {
        path: dir.to_path_buf(),
    };

    fs::create_dir_all(dir).map_err(|_| not_writable())?;
    tempfile::tempfile_in(dir).map_err(|_| not_writable())?;
    Ok(())
}

/// Source of free-space information for a destination directory
///
/// The archive builder consults this before writing any archive bytes.
pub trait SpaceProbe: Send + Sync {
    /// Bytes available to an unprivileged writer at `path`
    fn available_bytes(&self, path: &Path) -> Result<u64>;
}

/// Free-space probe backed by `statvfs(3)`
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

impl SpaceProbe for StatvfsProbe {
    #[cfg(unix)]
    fn available_bytes(&self, path: &Path) -> Result<u64> {
        let stats = nix::sys::statvfs::statvfs(path).map_err(std::io::Error::from)?;
        #[allow(clippy::unnecessary_cast)]
        let available = stats.blocks_available() as u64 * stats.fragment_size() as u64;
        trace!("statvfs({:?}): {} bytes available", path, available);
        Ok(available)
    }

    #[cfg(not(unix))]
    fn available_bytes(&self, path: &Path) -> Result<u64> {
        warn!("Free-space probing unsupported on this platform, assuming enough for {:?}", path);
        Ok(u64::MAX)
    }
}

/// Probe returning a fixed amount of free space
#[derive(Debug, Clone, Copy)]
pub struct FixedSpace(pub u64);

impl SpaceProbe for FixedSpace {
    fn available_bytes(&self, _path: &Path) -> Result<u64> {
        Ok(self.0)
    }
}

/// Remove a file, logging instead of failing when it cannot be removed
pub fn remove_file_quietly(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!("Could not remove {:?}: {}", path, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_hash_data() {
        let digest = hash_data(b"Hello, World!");
        assert_eq!(digest.len(), 64);
        assert_eq!(
            digest,
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1_048_576), "1.00 MB");
        assert_eq!(format_bytes(1_073_741_824), "1.00 GB");
    }

    #[test]
    fn test_atomic_write_replaces_content() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("settings.json");

        atomic_write(&file_path, b"first").unwrap();
        atomic_write(&file_path, b"second").unwrap();

        assert_eq!(fs::read(&file_path).unwrap(), b"second");
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_create_dir_all_tracked_reports_new_dirs_only() {
        let temp_dir = TempDir::new().unwrap();
        let existing = temp_dir.path().join("a");
        fs::create_dir(&existing).unwrap();

        let target = existing.join("b").join("c");
        let created = create_dir_all_tracked(&target).unwrap();

        assert_eq!(created, vec![existing.join("b"), target.clone()]);
        assert!(target.is_dir());
        assert!(create_dir_all_tracked(&target).unwrap().is_empty());
    }

    #[test]
    fn test_ensure_writable_dir_creates_missing() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("backups").join("nested");
        ensure_writable_dir(&dest).unwrap();
        assert!(dest.is_dir());
        assert_eq!(fs::read_dir(&dest).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_statvfs_probe_reports_space() {
        let temp_dir = TempDir::new().unwrap();
        let available = StatvfsProbe.available_bytes(temp_dir.path()).unwrap();
        assert!(available > 0);
    }
}
