//! Archive manifest and naming conventions
//!
//! Every archive carries a `manifest.json` entry, written last, describing
//! what the archive contains:
//!
//! ```json
//! {
//!   "timestamp": "20240101_120000",
//!   "items": ["config", "addons"],
//!   "paths": { "addons": "/storage/.kodi/addons", "config": "/flash/config.txt" },
//!   "backed_up_files": ["flash/config.txt", "addons/plugin.x/addon.xml"],
//!   "total_size": 1234
//! }
//! ```
//!
//! `item_kinds`, `checksums` and `version` are newer optional fields. They
//! are omitted when empty and default when absent, so manifests written by
//! older releases still parse.
//!
//! Entry names follow a prefix convention so restore can route them back:
//! files under the flash partition live under `flash/`, files under Kodi
//! userdata under `userdata/`, everything else under the item's own name.

use crate::error::{BackupError, Result};
use crate::paths::SystemPaths;
use crate::types::{BackupItem, BackupSelection, ItemKind};
use chrono::{DateTime, Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path};

/// Name of the manifest entry inside every archive
pub const MANIFEST_NAME: &str = "manifest.json";

/// `strftime` format of manifest timestamps and archive names
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Prefix for entries from the flash partition
pub const FLASH_PREFIX: &str = "flash";

/// Prefix for entries from Kodi userdata
pub const USERDATA_PREFIX: &str = "userdata";

const ARCHIVE_PREFIX: &str = "backup_";
const ARCHIVE_EXTENSION: &str = ".zip";

/// Metadata record embedded in every archive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Creation time, `%Y%m%d_%H%M%S`
    #[serde(default)]
    pub timestamp: String,
    /// Selected item names in selection order
    #[serde(default)]
    pub items: Vec<String>,
    /// Item name to original absolute source path
    #[serde(default)]
    pub paths: BTreeMap<String, String>,
    /// Archive-relative names actually written
    #[serde(default)]
    pub backed_up_files: Vec<String>,
    /// Sum of the source sizes of every collected file
    #[serde(default)]
    pub total_size: u64,
    /// Whether each item was a file or a directory
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub item_kinds: BTreeMap<String, ItemKind>,
    /// SHA-256 (hex) of each written entry's content
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub checksums: BTreeMap<String, String>,
    /// Version of the software that wrote the archive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Manifest {
    /// Start a manifest for a selection
    pub fn new(selection: &BackupSelection, created: &DateTime<Local>) -> Self {
        let mut manifest = Manifest {
            timestamp: created.format(TIMESTAMP_FORMAT).to_string(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            ..Default::default()
        };
        for item in selection.items() {
            manifest.items.push(item.name.clone());
            manifest
                .paths
                .insert(item.name.clone(), item.source.to_string_lossy().into_owned());
            manifest.item_kinds.insert(item.name.clone(), item.kind);
        }
        manifest
    }

    /// Record a successfully written entry
    pub fn record_file(&mut self, archive_name: &str, sha256: String) {
        self.backed_up_files.push(archive_name.to_string());
        self.checksums.insert(archive_name.to_string(), sha256);
    }

    /// Parse a manifest from raw bytes
    ///
    /// # Errors
    ///
    /// - [`BackupError::InvalidManifest`] if the bytes are not a manifest
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| BackupError::InvalidManifest(e.to_string()))
    }

    /// Pretty-printed JSON form
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Creation time parsed from the timestamp
    pub fn created(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(&self.timestamp, TIMESTAMP_FORMAT).ok()
    }
}

/// Short form of an item name used in archive file names
pub fn abbreviate(item: &str) -> String {
    let short = match item {
        "config" => "conf",
        "addon_data" => "data",
        "sources" => "src",
        "profiles" | "profiles_dir" => "prof",
        "guisettings" => "gui",
        "advancedsettings" => "adv",
        "keyboard" => "kbd",
        "keymaps" => "keys",
        "gamesaves" => "saves",
        "thumbnails" => "thumbs",
        "repositories" => "repo",
        name if name.starts_with("repository.") => "repo",
        name if name.starts_with("skin.") || name.starts_with("skin_settings.") => "skin",
        name => name,
    };
    short
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// File name for a new archive
///
/// The summary is the distinct abbreviations of the first three items joined
/// with `-`, followed by `-more` when further items were selected.
///
/// ```rust
/// use backupper::manifest::archive_file_name;
/// use chrono::{Local, TimeZone};
///
/// let created = Local.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
/// let items = vec!["config".to_string(), "addons".to_string()];
/// assert_eq!(archive_file_name(&items, &created), "backup_conf-addons_20240101_120000.zip");
/// ```
pub fn archive_file_name(items: &[String], created: &DateTime<Local>) -> String {
    let mut abbreviations: Vec<String> = Vec::new();
    for item in items {
        let short = abbreviate(item);
        if !abbreviations.contains(&short) {
            abbreviations.push(short);
        }
    }

    let mut summary = abbreviations
        .iter()
        .take(3)
        .cloned()
        .collect::<Vec<_>>()
        .join("-");
    if abbreviations.len() > 3 {
        summary.push_str("-more");
    }
    if summary.is_empty() {
        summary.push_str("empty");
    }

    format!(
        "{}{}_{}{}",
        ARCHIVE_PREFIX,
        summary,
        created.format(TIMESTAMP_FORMAT),
        ARCHIVE_EXTENSION
    )
}

/// Whether a file name follows the archive naming pattern
pub fn is_archive_name(name: &str) -> bool {
    name.starts_with(ARCHIVE_PREFIX)
        && name.ends_with(ARCHIVE_EXTENSION)
        && name.len() > ARCHIVE_PREFIX.len() + ARCHIVE_EXTENSION.len()
}

/// Creation time embedded in an archive file name
pub fn archive_timestamp(name: &str) -> Option<NaiveDateTime> {
    let stem = name.strip_suffix(ARCHIVE_EXTENSION)?;
    // timestamp is the last 15 characters: YYYYmmdd_HHMMSS
    let start = stem.len().checked_sub(15)?;
    let candidate = stem.get(start..)?;
    NaiveDateTime::parse_from_str(candidate, TIMESTAMP_FORMAT).ok()
}

/// Make an archive entry name ASCII-only with `/` separators
pub fn sanitize_entry_name(name: &str) -> String {
    name.replace('\\', "/")
        .chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_start_matches('/')
        .to_string()
}

/// Join the normal components of a relative path with `/`
fn join_components(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Archive entry name for a file of `item` originally located at `source`
///
/// Returns `None` when `source` cannot be expressed relative to its root.
pub fn entry_name_for(item: &BackupItem, source: &Path, paths: &SystemPaths) -> Option<String> {
    let raw = if let Ok(rel) = source.strip_prefix(&paths.flash) {
        format!("{}/{}", FLASH_PREFIX, join_components(rel)?)
    } else if let Ok(rel) = source.strip_prefix(&paths.userdata) {
        format!("{}/{}", USERDATA_PREFIX, join_components(rel)?)
    } else {
        let rel = match item.kind {
            ItemKind::File => source.file_name().map(Path::new)?.to_path_buf(),
            ItemKind::Directory => source.strip_prefix(&item.source).ok()?.to_path_buf(),
        };
        format!("{}/{}", item.name, join_components(&rel)?)
    };
    Some(sanitize_entry_name(&raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::path::PathBuf;

    fn created() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_archive_file_name_summary() {
        let items: Vec<String> = ["config", "addons", "repository.a", "repository.b", "sources"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            archive_file_name(&items, &created()),
            "backup_conf-addons-repo-more_20240101_120000.zip"
        );
        assert_eq!(
            archive_file_name(&["config".to_string()], &created()),
            "backup_conf_20240101_120000.zip"
        );
    }

    #[test]
    fn test_archive_name_parsing() {
        let name = "backup_conf-addons_20240101_120000.zip";
        assert!(is_archive_name(name));
        assert!(!is_archive_name("kodi_backup_20240101_120000.zip"));
        assert!(!is_archive_name("backup_x.zip.remote.json"));

        let ts = archive_timestamp(name).unwrap();
        assert_eq!(ts.format("%Y-%m-%d %H:%M:%S").to_string(), "2024-01-01 12:00:00");
        assert!(archive_timestamp("backup_conf.zip").is_none());
    }

    #[test]
    fn test_minimal_manifest_parses() {
        let manifest = Manifest::from_slice(
            br#"{"items": ["config"], "backed_up_files": ["flash/config.txt"]}"#,
        )
        .unwrap();
        assert_eq!(manifest.items, vec!["config"]);
        assert_eq!(manifest.backed_up_files, vec!["flash/config.txt"]);
        assert!(manifest.checksums.is_empty());
        assert!(Manifest::from_slice(b"not json").is_err());
    }

    #[test]
    fn test_optional_fields_omitted_when_empty() {
        let manifest = Manifest {
            timestamp: "20240101_120000".into(),
            ..Default::default()
        };
        let json = String::from_utf8(manifest.to_json().unwrap()).unwrap();
        assert!(!json.contains("checksums"));
        assert!(!json.contains("item_kinds"));
        assert!(json.contains("\"total_size\": 0"));
    }

    #[test]
    fn test_entry_names_follow_prefix_convention() {
        let paths = SystemPaths::libreelec();
        let config = BackupItem::new("config", PathBuf::from("/flash/config.txt"), ItemKind::File);
        let addons = BackupItem::new(
            "addons",
            PathBuf::from("/storage/.kodi/addons"),
            ItemKind::Directory,
        );
        let sources = BackupItem::new(
            "sources",
            PathBuf::from("/storage/.kodi/userdata/sources.xml"),
            ItemKind::File,
        );
        let outside = BackupItem::new("notes", PathBuf::from("/opt/notes.txt"), ItemKind::File);

        assert_eq!(
            entry_name_for(&config, &config.source, &paths).unwrap(),
            "flash/config.txt"
        );
        assert_eq!(
            entry_name_for(&addons, Path::new("/storage/.kodi/addons/skin.x/addon.xml"), &paths)
                .unwrap(),
            "addons/skin.x/addon.xml"
        );
        assert_eq!(
            entry_name_for(&sources, &sources.source, &paths).unwrap(),
            "userdata/sources.xml"
        );
        assert_eq!(
            entry_name_for(&outside, &outside.source, &paths).unwrap(),
            "notes/notes.txt"
        );
    }

    #[test]
    fn test_sanitize_entry_name() {
        assert_eq!(sanitize_entry_name("addons/caf\u{e9}.xml"), "addons/caf_.xml");
        assert_eq!(sanitize_entry_name("/a\\b"), "a/b");
    }
}
