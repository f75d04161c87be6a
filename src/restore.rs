//! Restore archives back onto the system
//!
//! Entries are routed by their prefix:
//!
//! - `flash/<rel>` to `<flash>/<rel>`
//! - `userdata/<rel>` to `<userdata>/<rel>`
//! - `<item>/<rel>` to the item's recorded source path (a directory item
//!   gets `<rel>` appended, a file item is written to the path itself)
//!
//! Every entry is mapped before anything is written, so an archive with an
//! unknown item or a `..` component is refused without side effects.
//! Destinations inside a protected region are written while that region is
//! held read-write by a [`PrivilegedSession`]; restored files there get mode
//! `0644` and newly created directories `0755`.
//!
//! There is no rollback: when a write fails the restore stops and reports
//! that entry, leaving earlier files in place.

use crate::error::{BackupError, Result};
use crate::manifest::{Manifest, FLASH_PREFIX, MANIFEST_NAME, USERDATA_PREFIX};
use crate::mount::MountTool;
use crate::paths::{ProtectedRegion, SystemPaths};
use crate::privileged::PrivilegedSession;
use crate::types::{ItemKind, ProgressCallback, ProgressInfo, RestoreResult};
use crate::utils;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, trace, warn};
use zip::ZipArchive;

const FILE_MODE: u32 = 0o644;
const DIR_MODE: u32 = 0o755;
const CHUNK_SIZE: usize = 1024 * 1024;

/// Options for a restore run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    relocate_to: Option<PathBuf>,
}

impl RestoreOptions {
    /// Restore to the original locations
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-root every destination under `root`
    ///
    /// `/flash/config.txt` becomes `<root>/flash/config.txt`. Relocated
    /// restores never remount anything.
    pub fn relocate_to(mut self, root: impl Into<PathBuf>) -> Self {
        self.relocate_to = Some(root.into());
        self
    }

    /// Relocation root, if any
    pub fn relocation(&self) -> Option<&Path> {
        self.relocate_to.as_deref()
    }
}

/// One archive entry and where it goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedEntry {
    /// Position in the zip central directory
    pub index: usize,
    /// Entry name
    pub name: String,
    /// Final destination
    pub destination: PathBuf,
    /// Mount point to hold read-write while writing, if protected
    pub mount_point: Option<PathBuf>,
    /// Expected SHA-256, when the manifest records one
    pub checksum: Option<String>,
}

/// Restores archives produced by the archive builder
pub struct RestoreEngine {
    paths: SystemPaths,
    mount_tool: Arc<dyn MountTool>,
    options: RestoreOptions,
    progress: Option<ProgressCallback>,
}

impl RestoreEngine {
    /// Create an engine for a system layout
    pub fn new(paths: SystemPaths, mount_tool: Arc<dyn MountTool>) -> Self {
        Self {
            paths,
            mount_tool,
            options: RestoreOptions::default(),
            progress: None,
        }
    }

    /// Set the restore options
    pub fn options(mut self, options: RestoreOptions) -> Self {
        self.options = options;
        self
    }

    /// Set a progress callback
    pub fn progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Destination of an entry before relocation
    ///
    /// # Errors
    ///
    /// [`BackupError::RestoreFailed`] naming the entry when it contains `.`
    /// or `..` components, has no path below its prefix, or belongs to an
    /// item the manifest does not know.
    pub fn destination_for(&self, manifest: &Manifest, entry: &str) -> Result<PathBuf> {
        let parts: Vec<&str> = entry.split('/').filter(|part| !part.is_empty()).collect();
        if parts.iter().any(|part| *part == ".." || *part == "." || part.contains('\\')) {
            return Err(BackupError::restore_failed(entry, "entry path escapes its root"));
        }
        let Some((prefix, rest)) = parts.split_first() else {
            return Err(BackupError::restore_failed(entry, "empty entry name"));
        };
        if rest.is_empty() {
            return Err(BackupError::restore_failed(entry, "entry has no file name"));
        }

        let base = match *prefix {
            FLASH_PREFIX => self.paths.flash.clone(),
            USERDATA_PREFIX => self.paths.userdata.clone(),
            item => {
                let source = manifest.paths.get(item).ok_or_else(|| {
                    BackupError::restore_failed(entry, format!("unknown item '{}'", item))
                })?;
                let source = PathBuf::from(source);
                let kind = manifest.item_kinds.get(item).copied().unwrap_or_else(|| {
                    // older manifests: a single file named like its source is a file item
                    let same_name = source
                        .file_name()
                        .is_some_and(|name| rest.len() == 1 && name == rest[0]);
                    if same_name {
                        ItemKind::File
                    } else {
                        ItemKind::Directory
                    }
                });
                if kind == ItemKind::File {
                    if rest.len() != 1 {
                        return Err(BackupError::restore_failed(
                            entry,
                            format!("'{}' is a single file", item),
                        ));
                    }
                    return Ok(source);
                }
                source
            }
        };

        Ok(rest.iter().fold(base, |acc, part| acc.join(part)))
    }

    fn relocate(&self, destination: PathBuf) -> PathBuf {
        match self.options.relocation() {
            Some(root) => destination
                .components()
                .filter_map(|component| match component {
                    Component::Normal(part) => Some(part),
                    _ => None,
                })
                .fold(root.to_path_buf(), |acc, part| acc.join(part)),
            None => destination,
        }
    }

    fn protected_mount_for(&self, regions: &[ProtectedRegion], destination: &Path) -> Option<PathBuf> {
        if self.options.relocation().is_some() {
            return None;
        }
        regions
            .iter()
            .find(|region| region.contains(destination))
            .map(|region| region.mount_point.clone())
    }

    /// Read the manifest and map every entry of an open archive
    pub fn plan<R: Read + std::io::Seek>(
        &self,
        zip: &mut ZipArchive<R>,
    ) -> Result<(Manifest, Vec<PlannedEntry>)> {
        let manifest = {
            let mut entry = zip
                .by_name(MANIFEST_NAME)
                .map_err(|_| BackupError::InvalidManifest(format!("{} not found", MANIFEST_NAME)))?;
            let mut bytes = Vec::new();
            entry
                .read_to_end(&mut bytes)
                .map_err(|e| BackupError::InvalidManifest(e.to_string()))?;
            Manifest::from_slice(&bytes)?
        };

        let regions = self.paths.protected_regions();
        let mut planned = Vec::new();
        for index in 0..zip.len() {
            let entry = zip.by_index(index)?;
            let name = entry.name().to_string();
            if name == MANIFEST_NAME || entry.is_dir() {
                continue;
            }
            drop(entry);

            let destination = self.relocate(self.destination_for(&manifest, &name)?);
            let mount_point = self.protected_mount_for(&regions, &destination);
            debug!("{} -> {:?}", name, destination);
            planned.push(PlannedEntry {
                index,
                checksum: manifest.checksums.get(&name).cloned(),
                name,
                destination,
                mount_point,
            });
        }
        Ok((manifest, planned))
    }

    /// Restore every entry of `archive`
    ///
    /// # Errors
    ///
    /// - [`BackupError::BackupNotFound`] if the archive does not exist
    /// - [`BackupError::InvalidManifest`] if the manifest is missing or broken
    /// - [`BackupError::Remount`] if a protected region cannot be made writable
    /// - [`BackupError::RestoreFailed`] for the first entry that cannot be
    ///   mapped or written
    #[instrument(skip(self))]
    pub fn restore(&self, archive: &Path) -> Result<RestoreResult> {
        let start = Instant::now();
        if !archive.is_file() {
            return Err(BackupError::BackupNotFound(archive.to_path_buf()));
        }

        let mut zip = ZipArchive::new(BufReader::new(File::open(archive)?))?;
        let (manifest, planned) = self.plan(&mut zip)?;
        info!(
            "Restoring {} entries from {:?} (created {})",
            planned.len(),
            archive,
            manifest.timestamp
        );

        let mut result = RestoreResult {
            archive: archive.to_path_buf(),
            ..Default::default()
        };
        let mut progress = ProgressInfo {
            operation: "restore".to_string(),
            total: Some(planned.len()),
            ..Default::default()
        };
        let mut sessions: BTreeMap<PathBuf, PrivilegedSession> = BTreeMap::new();

        for entry in &planned {
            progress.current_item = Some(entry.name.clone());

            if let Some(mount_point) = &entry.mount_point {
                if !sessions.contains_key(mount_point) {
                    let session =
                        PrivilegedSession::acquire(self.mount_tool.clone(), mount_point.clone())?;
                    sessions.insert(mount_point.clone(), session);
                }
            }

            let bytes = self
                .write_entry(&mut zip, entry)
                .map_err(|e| match e {
                    BackupError::RestoreFailed { .. } => e,
                    other => BackupError::restore_failed(&entry.name, other),
                })?;
            trace!("Restored {} ({} bytes)", entry.name, bytes);

            result.files_restored += 1;
            result.bytes_written += bytes;
            progress.processed += 1;
            progress.bytes_processed = result.bytes_written;
            if let Some(callback) = &self.progress {
                callback(&progress);
            }
        }

        for (_, session) in sessions {
            if let Some(warning) = session.release() {
                warn!("{}", warning);
                result.warnings.push(warning);
            }
        }

        result.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Restored {} files ({}) in {}ms",
            result.files_restored,
            utils::format_bytes(result.bytes_written),
            result.duration_ms
        );
        Ok(result)
    }

    /// Write one entry through a temporary file next to its destination
    fn write_entry<R: Read + std::io::Seek>(
        &self,
        zip: &mut ZipArchive<R>,
        entry: &PlannedEntry,
    ) -> Result<u64> {
        let protected = entry.mount_point.is_some();
        let parent = entry
            .destination
            .parent()
            .ok_or_else(|| BackupError::restore_failed(&entry.name, "destination has no parent"))?;

        let created = utils::create_dir_all_tracked(parent)?;
        if protected {
            for dir in &created {
                utils::set_permissions(dir, DIR_MODE)?;
            }
        }

        let mut source = zip.by_index(entry.index)?;
        let mut staging = NamedTempFile::new_in(parent)?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut written = 0u64;
        loop {
            let read = source.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            staging.write_all(&buffer[..read])?;
            hasher.update(&buffer[..read]);
            written += read as u64;
        }
        staging.as_file().sync_all()?;

        if let Some(expected) = &entry.checksum {
            let actual = hex::encode(hasher.finalize());
            if &actual != expected {
                return Err(BackupError::restore_failed(
                    &entry.name,
                    format!("checksum mismatch (expected {}, got {})", expected, actual),
                ));
            }
        }

        if entry.destination.is_dir() {
            return Err(BackupError::restore_failed(
                &entry.name,
                format!("{:?} is a directory", entry.destination),
            ));
        }
        staging
            .persist(&entry.destination)
            .map_err(|e| BackupError::Io(e.error))?;
        if protected {
            utils::set_permissions(&entry.destination, FILE_MODE)?;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::{MountCall, MountMode, RecordingMountTool};
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn write_archive(path: &Path, manifest: &Manifest, entries: &[(&str, &str)]) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        for (name, content) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
        zip.start_file(MANIFEST_NAME, SimpleFileOptions::default()).unwrap();
        zip.write_all(&manifest.to_json().unwrap()).unwrap();
        zip.finish().unwrap();
    }

    fn manifest_with(items: &[(&str, &str, ItemKind)]) -> Manifest {
        let mut manifest = Manifest {
            timestamp: "20240101_120000".to_string(),
            ..Default::default()
        };
        for (name, path, kind) in items {
            manifest.items.push(name.to_string());
            manifest.paths.insert(name.to_string(), path.to_string());
            manifest.item_kinds.insert(name.to_string(), *kind);
        }
        manifest
    }

    fn engine(root: &Path, tool: Arc<RecordingMountTool>) -> RestoreEngine {
        RestoreEngine::new(SystemPaths::rooted_at(root), tool)
    }

    #[test]
    fn test_destination_mapping() {
        let engine = engine(Path::new("/r"), Arc::new(RecordingMountTool::new()));
        let manifest = manifest_with(&[
            ("addons", "/r/storage/.kodi/addons", ItemKind::Directory),
            ("hosts", "/r/etc/hosts", ItemKind::File),
        ]);

        assert_eq!(
            engine.destination_for(&manifest, "flash/config.txt").unwrap(),
            PathBuf::from("/r/flash/config.txt")
        );
        assert_eq!(
            engine
                .destination_for(&manifest, "userdata/addon_data/a/settings.xml")
                .unwrap(),
            PathBuf::from("/r/storage/.kodi/userdata/addon_data/a/settings.xml")
        );
        assert_eq!(
            engine
                .destination_for(&manifest, "addons/plugin.x/addon.xml")
                .unwrap(),
            PathBuf::from("/r/storage/.kodi/addons/plugin.x/addon.xml")
        );
        assert_eq!(
            engine.destination_for(&manifest, "hosts/hosts").unwrap(),
            PathBuf::from("/r/etc/hosts")
        );
    }

    #[test]
    fn test_refuses_parent_components_and_unknown_items() {
        let engine = engine(Path::new("/r"), Arc::new(RecordingMountTool::new()));
        let manifest = manifest_with(&[]);

        let err = engine
            .destination_for(&manifest, "userdata/../../etc/passwd")
            .unwrap_err();
        assert!(matches!(err, BackupError::RestoreFailed { ref entry, .. }
            if entry == "userdata/../../etc/passwd"));
        assert!(engine.destination_for(&manifest, "mystery/file").is_err());
        assert!(engine.destination_for(&manifest, "flash").is_err());
    }

    #[test]
    fn test_kind_inferred_for_older_manifests() {
        let engine = engine(Path::new("/r"), Arc::new(RecordingMountTool::new()));
        let mut manifest = Manifest::default();
        manifest
            .paths
            .insert("sources".to_string(), "/elsewhere/sources.xml".to_string());
        assert_eq!(
            engine.destination_for(&manifest, "sources/sources.xml").unwrap(),
            PathBuf::from("/elsewhere/sources.xml")
        );
    }

    #[test]
    fn test_restore_remounts_flash_and_sets_modes() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("system");
        let archive = temp_dir.path().join("backup_conf_20240101_120000.zip");
        write_archive(
            &archive,
            &manifest_with(&[]),
            &[
                ("flash/config.txt", "arm_freq=2000\n"),
                ("userdata/keymaps/remote.xml", "<keymap/>"),
            ],
        );

        let tool = Arc::new(RecordingMountTool::new());
        let result = engine(&root, tool.clone()).restore(&archive).unwrap();

        assert_eq!(result.files_restored, 2);
        assert!(result.warnings.is_empty());
        assert_eq!(
            fs::read_to_string(root.join("flash/config.txt")).unwrap(),
            "arm_freq=2000\n"
        );
        assert!(root.join("storage/.kodi/userdata/keymaps/remote.xml").exists());

        let calls = tool.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(
            calls[0],
            MountCall::Remount(root.join("flash"), MountMode::ReadWrite)
        );
        assert!(calls.contains(&MountCall::Remount(root.join("flash"), MountMode::ReadOnly)));
        assert!(calls.contains(&MountCall::Remount(root.join("storage"), MountMode::ReadOnly)));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(root.join("flash/config.txt"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o644);
            let dir_mode = fs::metadata(root.join("storage/.kodi/userdata/keymaps"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(dir_mode & 0o777, 0o755);
        }
    }

    #[test]
    fn test_failed_remount_back_is_a_warning() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("system");
        let archive = temp_dir.path().join("backup_conf_20240101_120000.zip");
        write_archive(&archive, &manifest_with(&[]), &[("flash/config.txt", "x")]);

        let tool = Arc::new(RecordingMountTool::failing_remount(MountMode::ReadOnly));
        let result = engine(&root, tool).restore(&archive).unwrap();
        assert_eq!(result.files_restored, 1);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_bad_entry_aborts_before_writing() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("system");
        let archive = temp_dir.path().join("backup_conf_20240101_120000.zip");
        write_archive(
            &archive,
            &manifest_with(&[]),
            &[("flash/config.txt", "x"), ("flash/../../evil", "y")],
        );

        let tool = Arc::new(RecordingMountTool::new());
        let err = engine(&root, tool.clone()).restore(&archive).unwrap_err();
        assert!(matches!(err, BackupError::RestoreFailed { .. }));
        assert!(!root.join("flash/config.txt").exists());
        assert!(tool.calls().is_empty());
    }

    #[test]
    fn test_checksum_mismatch_fails_entry() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("system");
        let archive = temp_dir.path().join("backup_conf_20240101_120000.zip");
        let mut manifest = manifest_with(&[]);
        manifest.checksums = BTreeMap::from([(
            "userdata/sources.xml".to_string(),
            utils::hash_data(b"original"),
        )]);
        write_archive(&archive, &manifest, &[("userdata/sources.xml", "tampered")]);

        let tool = Arc::new(RecordingMountTool::new());
        let err = engine(&root, tool.clone()).restore(&archive).unwrap_err();
        assert!(matches!(err, BackupError::RestoreFailed { ref entry, .. }
            if entry == "userdata/sources.xml"));
        assert!(!root.join("storage/.kodi/userdata/sources.xml").exists());
        // the session was still closed
        assert_eq!(
            tool.calls().last(),
            Some(&MountCall::Remount(root.join("storage"), MountMode::ReadOnly))
        );
    }

    #[test]
    fn test_relocated_restore_skips_remounts() {
        let temp_dir = TempDir::new().unwrap();
        let archive = temp_dir.path().join("backup_conf_20240101_120000.zip");
        write_archive(&archive, &manifest_with(&[]), &[("flash/config.txt", "x")]);
        let target = temp_dir.path().join("elsewhere");

        let tool = Arc::new(RecordingMountTool::new());
        let result = RestoreEngine::new(SystemPaths::libreelec(), tool.clone())
            .options(RestoreOptions::new().relocate_to(&target))
            .restore(&archive)
            .unwrap();

        assert_eq!(result.files_restored, 1);
        assert!(target.join("flash/config.txt").exists());
        assert!(tool.calls().is_empty());
    }

    #[test]
    fn test_missing_manifest() {
        let temp_dir = TempDir::new().unwrap();
        let archive = temp_dir.path().join("backup_x_20240101_120000.zip");
        let mut zip = ZipWriter::new(File::create(&archive).unwrap());
        zip.start_file("flash/config.txt", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"x").unwrap();
        zip.finish().unwrap();

        let tool = Arc::new(RecordingMountTool::new());
        let err = engine(temp_dir.path(), tool).restore(&archive).unwrap_err();
        assert!(matches!(err, BackupError::InvalidManifest(_)));
    }
}
