//! Path resolution for backup runs
//!
//! [`SystemPaths`] holds the handful of well-known roots of a LibreELEC
//! system (Kodi home, userdata, the flash partition) and translates the
//! host's `special://` virtual paths. [`PathResolver`] turns the category
//! toggles into an ordered [`BackupSelection`] containing only paths that
//! exist right now.
//!
//! The flash partition is mounted read-only, so `config.txt` is copied into a
//! [`Scratch`] directory first and the archive builder reads the copy.

use crate::error::{BackupError, Result};
use crate::settings::{BackupToggles, SettingsStore};
use crate::types::{BackupItem, BackupSelection, ItemKind};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, instrument, trace, warn};

/// A filesystem region that is normally mounted read-only
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedRegion {
    /// Paths at or below this root belong to the region
    pub root: PathBuf,
    /// Mount point to remount when writing into the region
    pub mount_point: PathBuf,
}

impl ProtectedRegion {
    /// Whether `path` lies inside this region
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }
}

/// Well-known system locations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemPaths {
    /// Kodi home (`special://home`)
    pub home: PathBuf,
    /// Kodi userdata (`special://userdata`)
    pub userdata: PathBuf,
    /// Boot/flash partition holding `config.txt`
    pub flash: PathBuf,
    /// Mount point of the partition userdata lives on
    pub storage: PathBuf,
}

impl SystemPaths {
    /// Standard LibreELEC layout
    pub fn libreelec() -> Self {
        Self {
            home: PathBuf::from("/storage/.kodi"),
            userdata: PathBuf::from("/storage/.kodi/userdata"),
            flash: PathBuf::from("/flash"),
            storage: PathBuf::from("/storage"),
        }
    }

    /// Layout rooted somewhere else, mirroring the LibreELEC tree
    pub fn rooted_at(root: &Path) -> Self {
        let storage = root.join("storage");
        let home = storage.join(".kodi");
        Self {
            userdata: home.join("userdata"),
            home,
            flash: root.join("flash"),
            storage,
        }
    }

    /// Read the `kodi_home`, `kodi_userdata`, `flash_path` and
    /// `storage_path` settings
    pub fn from_settings(store: &dyn SettingsStore) -> Self {
        Self {
            home: PathBuf::from(store.get_string("kodi_home")),
            userdata: PathBuf::from(store.get_string("kodi_userdata")),
            flash: PathBuf::from(store.get_string("flash_path")),
            storage: PathBuf::from(store.get_string("storage_path")),
        }
    }

    /// Resolve a `special://` path to an absolute path
    ///
    /// Plain paths are returned unchanged.
    ///
    /// # Errors
    ///
    /// - [`BackupError::InvalidConfiguration`] for an unknown special root
    pub fn translate(&self, path: &str) -> Result<PathBuf> {
        let Some(rest) = path.strip_prefix("special://") else {
            return Ok(PathBuf::from(path));
        };

        let (root, tail) = match rest.split_once('/') {
            Some((root, tail)) => (root, tail),
            None => (rest, ""),
        };

        let base = match root {
            "home" => self.home.clone(),
            "userdata" | "profile" | "masterprofile" => self.userdata.clone(),
            "temp" => self.home.join("temp"),
            other => {
                return Err(BackupError::config(format!(
                    "Unknown special path root: special://{}",
                    other
                )))
            }
        };

        Ok(tail
            .split('/')
            .filter(|segment| !segment.is_empty())
            .fold(base, |acc, segment| acc.join(segment)))
    }

    /// Regions restore has to remount read-write before writing
    pub fn protected_regions(&self) -> Vec<ProtectedRegion> {
        vec![
            ProtectedRegion {
                root: self.flash.clone(),
                mount_point: self.flash.clone(),
            },
            ProtectedRegion {
                root: self.userdata.clone(),
                mount_point: self.storage.clone(),
            },
        ]
    }

    /// Directory the addon keeps its own data in
    pub fn addon_profile(&self) -> PathBuf {
        self.userdata
            .join("addon_data")
            .join("service.libreelec.backupper")
    }
}

impl Default for SystemPaths {
    fn default() -> Self {
        Self::libreelec()
    }
}

/// Owner of per-run temporary files
///
/// Everything created through a `Scratch` lives in one temporary directory
/// that is removed when the value is dropped or [`cleanup`](Self::cleanup)
/// is called.
#[derive(Debug, Default)]
pub struct Scratch {
    base: Option<PathBuf>,
    dir: Option<TempDir>,
}

impl Scratch {
    /// Scratch space under the system temporary directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Scratch space under a specific directory
    pub fn in_dir(base: impl Into<PathBuf>) -> Self {
        Self {
            base: Some(base.into()),
            dir: None,
        }
    }

    /// Temporary directory, created on first use
    pub fn dir(&mut self) -> Result<&Path> {
        if self.dir.is_none() {
            let dir = match &self.base {
                Some(base) => {
                    fs::create_dir_all(base)?;
                    tempfile::Builder::new().prefix("backupper-").tempdir_in(base)?
                }
                None => tempfile::Builder::new().prefix("backupper-").tempdir()?,
            };
            trace!("Created scratch directory {:?}", dir.path());
            self.dir = Some(dir);
        }
        match &self.dir {
            Some(dir) => Ok(dir.path()),
            None => Err(BackupError::internal("scratch directory unavailable")),
        }
    }

    /// Path for a new temporary file named `name`
    pub fn path_for(&mut self, name: &str) -> Result<PathBuf> {
        Ok(self.dir()?.join(name))
    }

    /// Copy `source` into scratch space, returning the copy's path
    pub fn stage_copy(&mut self, source: &Path) -> Result<PathBuf> {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "staged".to_string());
        let target = self.path_for(&name)?;
        fs::copy(source, &target)?;
        debug!("Staged {:?} to {:?}", source, target);
        Ok(target)
    }

    /// Remove all temporaries now
    pub fn cleanup(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!("Failed to remove scratch directory {:?}: {}", path, e);
            }
        }
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Turns category toggles into a backup selection
#[derive(Debug, Clone)]
pub struct PathResolver {
    paths: SystemPaths,
}

impl PathResolver {
    /// Create a resolver for the given system layout
    pub fn new(paths: SystemPaths) -> Self {
        Self { paths }
    }

    /// System layout in use
    pub fn paths(&self) -> &SystemPaths {
        &self.paths
    }

    /// Every candidate item for the toggles, existing or not, in order
    fn candidates(&self, toggles: &BackupToggles) -> Result<Vec<(String, PathBuf)>> {
        let home = &self.paths.home;
        let userdata = &self.paths.userdata;
        let addons = home.join("addons");
        let addon_data = userdata.join("addon_data");
        let mut out: Vec<(String, PathBuf)> = Vec::new();

        if toggles.config {
            out.push(("config".into(), self.paths.flash.join("config.txt")));
        }
        if toggles.addons {
            out.push(("addons".into(), addons.clone()));
        }
        if toggles.repositories {
            for dir in matching_dirs(&addons, "repository.*")? {
                out.push((dir_name(&dir), dir));
            }
        }
        if toggles.userdata {
            out.push(("addon_data".into(), addon_data.clone()));
        }
        if toggles.sources {
            out.push(("sources".into(), userdata.join("sources.xml")));
        }
        if toggles.profiles {
            out.push(("profiles".into(), userdata.join("profiles.xml")));
            out.push(("profiles_dir".into(), userdata.join("profiles")));
        }
        if toggles.configs {
            out.push(("guisettings".into(), userdata.join("guisettings.xml")));
            out.push(("advancedsettings".into(), userdata.join("advancedsettings.xml")));
            out.push(("keyboard".into(), userdata.join("keyboard.xml")));
            out.push(("keymaps".into(), userdata.join("keymaps")));
        }
        if toggles.gamesaves {
            out.push(("gamesaves".into(), addon_data.join("game.saves")));
        }
        if toggles.playlists {
            out.push(("playlists".into(), userdata.join("playlists")));
        }
        if toggles.thumbnails {
            out.push(("thumbnails".into(), userdata.join("Thumbnails")));
            out.push(("fanart".into(), addons.join("fanart")));
        }
        if toggles.skins {
            for dir in matching_dirs(&addons, "skin.*")? {
                out.push((dir_name(&dir), dir));
            }
            for dir in matching_dirs(&addon_data, "skin.*")? {
                out.push((format!("skin_settings.{}", dir_name(&dir)), dir));
            }
        }

        Ok(out)
    }

    /// Build the selection for one run
    ///
    /// Only paths that exist are included. An item nested inside an already
    /// selected directory keeps its name but is marked as covered, so its
    /// files are archived once through the parent. `config.txt` is staged
    /// into `scratch`.
    #[instrument(skip(self, scratch))]
    pub fn resolve(&self, toggles: &BackupToggles, scratch: &mut Scratch) -> Result<BackupSelection> {
        let mut selection = BackupSelection::new();

        for (name, path) in self.candidates(toggles)? {
            let metadata = match fs::symlink_metadata(&path) {
                Ok(metadata) => metadata,
                Err(_) => {
                    info!("Skipping {}: {:?} does not exist", name, path);
                    continue;
                }
            };
            if metadata.file_type().is_symlink() {
                debug!("Skipping {}: {:?} is a symbolic link", name, path);
                continue;
            }

            let kind = if metadata.is_dir() {
                ItemKind::Directory
            } else {
                ItemKind::File
            };
            let mut item = BackupItem::new(name.clone(), path.clone(), kind);

            let parent = selection.items().iter().find(|selected| {
                selected.covered_by.is_none()
                    && selected.kind == ItemKind::Directory
                    && path.starts_with(&selected.source)
            });
            if let Some(parent) = parent {
                debug!("{} is covered by the selected {} directory", name, parent.name);
                item.covered_by = Some(parent.name.clone());
                selection.push(item);
                continue;
            }

            if kind == ItemKind::File && path.starts_with(&self.paths.flash) {
                match scratch.stage_copy(&path) {
                    Ok(copy) => item.read_from = copy,
                    Err(e) => {
                        warn!("Skipping {}: could not copy {:?}: {}", name, path, e);
                        continue;
                    }
                }
            }

            debug!("Selected {} -> {:?}", name, path);
            selection.push(item);
        }

        info!("Resolved {} backup items", selection.len());
        Ok(selection)
    }
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Directories directly under `parent` whose names match `pattern`, sorted
fn matching_dirs(parent: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    if !parent.is_dir() {
        return Ok(Vec::new());
    }

    let glob = Glob::new(pattern).map_err(|e| BackupError::internal(e.to_string()))?;
    let set: GlobSet = GlobSetBuilder::new()
        .add(glob)
        .build()
        .map_err(|e| BackupError::internal(e.to_string()))?;

    let mut dirs: Vec<PathBuf> = fs::read_dir(parent)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter(|entry| set.is_match(entry.file_name()))
        .map(|entry| entry.path())
        .collect();
    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> (TempDir, SystemPaths) {
        let temp_dir = TempDir::new().unwrap();
        let paths = SystemPaths::rooted_at(temp_dir.path());
        fs::create_dir_all(&paths.flash).unwrap();
        fs::create_dir_all(paths.home.join("addons")).unwrap();
        fs::create_dir_all(paths.userdata.join("addon_data")).unwrap();
        (temp_dir, paths)
    }

    #[test]
    fn test_translate_special_paths() {
        let paths = SystemPaths::libreelec();
        assert_eq!(
            paths.translate("special://home/addons").unwrap(),
            PathBuf::from("/storage/.kodi/addons")
        );
        assert_eq!(
            paths.translate("special://profile/addon_data/x/").unwrap(),
            PathBuf::from("/storage/.kodi/userdata/addon_data/x")
        );
        assert_eq!(paths.translate("/tmp/a").unwrap(), PathBuf::from("/tmp/a"));
        assert!(paths.translate("special://nowhere/a").is_err());
    }

    #[test]
    fn test_resolve_only_includes_existing_paths() {
        let (_temp, paths) = layout();
        fs::write(paths.flash.join("config.txt"), b"gpu_mem=256").unwrap();
        fs::write(paths.userdata.join("sources.xml"), b"<sources/>").unwrap();

        let toggles = BackupToggles {
            config: true,
            sources: true,
            profiles: true,
            ..BackupToggles::none()
        };
        let mut scratch = Scratch::new();
        let selection = PathResolver::new(paths.clone()).resolve(&toggles, &mut scratch).unwrap();

        assert_eq!(selection.names(), vec!["config", "sources"]);
        for item in selection.items() {
            assert!(item.source.exists(), "{:?} should exist", item.source);
        }

        let config = selection.get("config").unwrap();
        assert_eq!(config.source, paths.flash.join("config.txt"));
        assert_ne!(config.read_from, config.source);
        assert_eq!(fs::read(&config.read_from).unwrap(), b"gpu_mem=256");

        let staged = config.read_from.clone();
        scratch.cleanup();
        assert!(!staged.exists());
    }

    #[test]
    fn test_resolve_discovers_repositories_and_skins() {
        let (_temp, paths) = layout();
        let addons = paths.home.join("addons");
        fs::create_dir_all(addons.join("repository.b")).unwrap();
        fs::create_dir_all(addons.join("repository.a")).unwrap();
        fs::create_dir_all(addons.join("skin.estuary")).unwrap();
        fs::create_dir_all(addons.join("plugin.video.x")).unwrap();
        fs::create_dir_all(paths.userdata.join("addon_data").join("skin.estuary")).unwrap();

        let toggles = BackupToggles {
            repositories: true,
            skins: true,
            ..BackupToggles::none()
        };
        let selection = PathResolver::new(paths)
            .resolve(&toggles, &mut Scratch::new())
            .unwrap();

        assert_eq!(
            selection.names(),
            vec![
                "repository.a",
                "repository.b",
                "skin.estuary",
                "skin_settings.skin.estuary"
            ]
        );
    }

    #[test]
    fn test_nested_items_are_not_selected_twice() {
        let (_temp, paths) = layout();
        fs::create_dir_all(paths.userdata.join("addon_data").join("game.saves")).unwrap();
        fs::create_dir_all(paths.home.join("addons").join("repository.a")).unwrap();

        let toggles = BackupToggles {
            addons: true,
            repositories: true,
            userdata: true,
            gamesaves: true,
            ..BackupToggles::none()
        };
        let selection = PathResolver::new(paths)
            .resolve(&toggles, &mut Scratch::new())
            .unwrap();

        assert_eq!(
            selection.names(),
            vec!["addons", "repository.a", "addon_data", "gamesaves"]
        );
        let covered: Vec<_> = selection
            .items()
            .iter()
            .map(|item| item.covered_by.as_deref())
            .collect();
        assert_eq!(covered, vec![None, Some("addons"), None, Some("addon_data")]);
    }

    #[test]
    fn test_protected_regions() {
        let paths = SystemPaths::libreelec();
        let regions = paths.protected_regions();
        assert!(regions[0].contains(Path::new("/flash/config.txt")));
        assert!(regions[1].contains(Path::new("/storage/.kodi/userdata/sources.xml")));
        assert_eq!(regions[1].mount_point, PathBuf::from("/storage"));
        assert!(!regions.iter().any(|r| r.contains(Path::new("/storage/.kodi/addons/a"))));
    }
}
