//! Settings store and typed configuration
//!
//! The backup core never reads process-wide state. Everything it needs comes
//! through a [`SettingsStore`], a flat string key/value store modelled on the
//! host media center's addon settings. Values are stored as strings and read
//! back through typed getters that fall back to the built-in defaults.
//!
//! Two stores are provided:
//!
//! - [`MemorySettings`] for tests and embedding
//! - [`JsonSettings`], a JSON object on disk rewritten atomically on every `set`
//!
//! [`BackupConfig`] is the typed view of the keys the backup run consumes.
//!
//! ## Example
//!
//! ```rust
//! use backupper::settings::{MemorySettings, SettingsStore, BackupConfig};
//!
//! let settings = MemorySettings::new();
//! settings.set("max_backups", "3").unwrap();
//! settings.set("backup_skins", "true").unwrap();
//!
//! let config = BackupConfig::load(&settings).unwrap();
//! assert_eq!(config.max_backups, 3);
//! assert!(config.toggles.skins);
//! ```

use crate::compression::CompressionLevel;
use crate::error::{BackupError, Result};
use crate::rotation::RotationStrategy;
use crate::utils;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

/// Built-in defaults for every known key
pub const DEFAULTS: &[(&str, &str)] = &[
    ("backup_location", "/storage/backup"),
    ("backup_config", "true"),
    ("backup_addons", "true"),
    ("backup_repositories", "false"),
    ("backup_userdata", "true"),
    ("backup_sources", "true"),
    ("backup_profiles", "false"),
    ("backup_configs", "false"),
    ("backup_gamesaves", "false"),
    ("backup_playlists", "false"),
    ("backup_thumbnails", "false"),
    ("backup_skins", "false"),
    ("max_backups", "10"),
    ("enable_rotation", "false"),
    ("rotation_strategy", "0"),
    ("rotation_confirmed", "false"),
    ("compression_level", "2"),
    ("verify_backups", "true"),
    ("backup_location_type", "0"),
    ("remote_location_type", "0"),
    ("remote_path", ""),
    ("remote_username", ""),
    ("remote_password", ""),
    ("remote_port", ""),
    ("enable_schedule", "false"),
    ("backup_interval", "2"),
    ("backup_time", "03:00"),
    ("backup_day", "0"),
    ("last_backup", ""),
    ("next_backup", ""),
    ("show_notifications", "true"),
    ("detailed_notifications", "false"),
    ("kodi_home", "/storage/.kodi"),
    ("kodi_userdata", "/storage/.kodi/userdata"),
    ("flash_path", "/flash"),
    ("storage_path", "/storage"),
];

/// Look up the built-in default for a key
pub fn default_value(key: &str) -> Option<&'static str> {
    DEFAULTS.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

/// Key/value settings provider
///
/// Implementors only supply raw string access; the typed getters are
/// provided on top of it.
pub trait SettingsStore: Send + Sync {
    /// Raw stored value, `None` when the key was never set
    fn get_raw(&self, key: &str) -> Option<String>;

    /// Store a value
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Stored value, falling back to the built-in default, then to ""
    fn get_string(&self, key: &str) -> String {
        self.get_raw(key)
            .or_else(|| default_value(key).map(str::to_string))
            .unwrap_or_default()
    }

    /// Boolean value; accepts `true`/`false`/`1`/`0` in any case
    fn get_bool(&self, key: &str) -> bool {
        let raw = self.get_string(key);
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" | "" => false,
            other => {
                warn!("Setting {} has non-boolean value {:?}, treating as false", key, other);
                false
            }
        }
    }

    /// Integer value
    ///
    /// An unparseable stored value falls back to the built-in default.
    fn get_int(&self, key: &str) -> i64 {
        let raw = self.get_string(key);
        match raw.trim().parse::<i64>() {
            Ok(value) => value,
            Err(_) => {
                let fallback = default_value(key)
                    .and_then(|d| d.parse::<i64>().ok())
                    .unwrap_or(0);
                if !raw.trim().is_empty() {
                    warn!("Setting {} has non-integer value {:?}, using {}", key, raw, fallback);
                }
                fallback
            }
        }
    }

    /// Store a boolean value
    fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        self.set(key, if value { "true" } else { "false" })
    }
}

/// In-memory settings store
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: RwLock<BTreeMap<String, String>>,
}

impl MemorySettings {
    /// Create an empty store (all reads return defaults)
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with the given pairs
    pub fn with_values<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map = values
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            values: RwLock::new(map),
        }
    }

    /// Snapshot of every explicitly set value
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.values.read().clone()
    }
}

impl SettingsStore for MemorySettings {
    fn get_raw(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        trace!("Setting {} = {:?}", key, value);
        self.values.write().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Settings persisted as a flat JSON object
///
/// Non-string JSON values (`true`, `10`) are accepted on load and kept in
/// their textual form. Every `set` rewrites the file atomically.
#[derive(Debug)]
pub struct JsonSettings {
    path: PathBuf,
    values: RwLock<BTreeMap<String, String>>,
}

impl JsonSettings {
    /// Open a settings file, starting empty when it does not exist yet
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = if path.exists() {
            let content = fs::read(&path)?;
            let object: serde_json::Map<String, serde_json::Value> =
                serde_json::from_slice(&content)?;
            object
                .into_iter()
                .map(|(key, value)| {
                    let text = match value {
                        serde_json::Value::String(s) => s,
                        serde_json::Value::Null => String::new(),
                        other => other.to_string(),
                    };
                    (key, text)
                })
                .collect()
        } else {
            debug!("Settings file {:?} does not exist yet, using defaults", path);
            BTreeMap::new()
        };

        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &BTreeMap<String, String>) -> Result<()> {
        let json = serde_json::to_vec_pretty(values)?;
        utils::atomic_write(&self.path, &json)
    }
}

impl SettingsStore for JsonSettings {
    fn get_raw(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.write();
        values.insert(key.to_string(), value.to_string());
        self.persist(&values)
    }
}

/// Which categories the path resolver includes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackupToggles {
    /// `config.txt` on the flash partition
    pub config: bool,
    /// Installed addons
    pub addons: bool,
    /// `repository.*` addons, one item each
    pub repositories: bool,
    /// Addon data
    pub userdata: bool,
    /// `sources.xml`
    pub sources: bool,
    /// `profiles.xml` and the profiles directory
    pub profiles: bool,
    /// GUI, advanced and keyboard settings plus keymaps
    pub configs: bool,
    /// Game saves
    pub gamesaves: bool,
    /// Playlists
    pub playlists: bool,
    /// Thumbnails and fanart
    pub thumbnails: bool,
    /// Skins and skin settings
    pub skins: bool,
}

impl BackupToggles {
    /// Read every `backup_*` toggle from the store
    pub fn from_settings(store: &dyn SettingsStore) -> Self {
        Self {
            config: store.get_bool("backup_config"),
            addons: store.get_bool("backup_addons"),
            repositories: store.get_bool("backup_repositories"),
            userdata: store.get_bool("backup_userdata"),
            sources: store.get_bool("backup_sources"),
            profiles: store.get_bool("backup_profiles"),
            configs: store.get_bool("backup_configs"),
            gamesaves: store.get_bool("backup_gamesaves"),
            playlists: store.get_bool("backup_playlists"),
            thumbnails: store.get_bool("backup_thumbnails"),
            skins: store.get_bool("backup_skins"),
        }
    }

    /// Toggles with every category switched off
    pub fn none() -> Self {
        Self::default()
    }
}

/// Typed configuration for a backup run
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Local backup directory (also the staging directory in remote mode)
    pub backup_location: PathBuf,
    /// Category toggles
    pub toggles: BackupToggles,
    /// Retention count used by rotation
    pub max_backups: usize,
    /// Whether rotation runs at all
    pub enable_rotation: bool,
    /// Whether the destructive-rotation warning has been accepted
    pub rotation_confirmed: bool,
    /// Which archives rotation keeps
    pub rotation_strategy: RotationStrategy,
    /// Zip compression level
    pub compression: CompressionLevel,
    /// Verify the archive after creating it
    pub verify_backups: bool,
    /// Upload to a remote location instead of keeping the archive locally
    pub remote_enabled: bool,
    /// Show toast notifications
    pub show_notifications: bool,
    /// Append details to notifications
    pub detailed_notifications: bool,
}

impl BackupConfig {
    /// Build the typed configuration from a settings store
    ///
    /// # Errors
    ///
    /// - [`BackupError::InvalidConfiguration`] for out-of-range enum values
    pub fn load(store: &dyn SettingsStore) -> Result<Self> {
        let strategy_index = store.get_int("rotation_strategy");
        let rotation_strategy = RotationStrategy::from_index(strategy_index).ok_or_else(|| {
            BackupError::config(format!("rotation_strategy must be 0-2, got {}", strategy_index))
        })?;

        let level_index = store.get_int("compression_level");
        let compression = CompressionLevel::from_index(level_index).ok_or_else(|| {
            BackupError::config(format!("compression_level must be 0-3, got {}", level_index))
        })?;

        let location = store.get_string("backup_location");
        let backup_location = if location.trim().is_empty() {
            PathBuf::from(default_value("backup_location").unwrap_or("/storage/backup"))
        } else {
            PathBuf::from(location.trim())
        };

        Ok(Self {
            backup_location,
            toggles: BackupToggles::from_settings(store),
            max_backups: store.get_int("max_backups").max(1) as usize,
            enable_rotation: store.get_bool("enable_rotation"),
            rotation_confirmed: store.get_bool("rotation_confirmed"),
            rotation_strategy,
            compression,
            verify_backups: store.get_bool("verify_backups"),
            remote_enabled: store.get_int("backup_location_type") != 0,
            show_notifications: store.get_bool("show_notifications"),
            detailed_notifications: store.get_bool("detailed_notifications"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_apply_when_unset() {
        let settings = MemorySettings::new();
        assert_eq!(settings.get_string("backup_location"), "/storage/backup");
        assert_eq!(settings.get_int("max_backups"), 10);
        assert!(settings.get_bool("backup_config"));
        assert!(!settings.get_bool("backup_skins"));
        assert_eq!(settings.get_string("unknown_key"), "");
    }

    #[test]
    fn test_typed_getters_parse_values() {
        let settings = MemorySettings::with_values([
            ("enable_rotation", "TRUE"),
            ("backup_addons", "0"),
            ("max_backups", "not a number"),
        ]);
        assert!(settings.get_bool("enable_rotation"));
        assert!(!settings.get_bool("backup_addons"));
        assert_eq!(settings.get_int("max_backups"), 10);
    }

    #[test]
    fn test_json_settings_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.json");

        {
            let settings = JsonSettings::open(&path).unwrap();
            settings.set("max_backups", "4").unwrap();
            settings.set_bool("enable_rotation", true).unwrap();
        }

        let reopened = JsonSettings::open(&path).unwrap();
        assert_eq!(reopened.get_int("max_backups"), 4);
        assert!(reopened.get_bool("enable_rotation"));
    }

    #[test]
    fn test_json_settings_accepts_native_json_types() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.json");
        fs::write(&path, r#"{"max_backups": 7, "backup_skins": true, "remote_port": null}"#).unwrap();

        let settings = JsonSettings::open(&path).unwrap();
        assert_eq!(settings.get_int("max_backups"), 7);
        assert!(settings.get_bool("backup_skins"));
        assert_eq!(settings.get_string("remote_port"), "");
    }

    #[test]
    fn test_backup_config_rejects_bad_strategy() {
        let settings = MemorySettings::with_values([("rotation_strategy", "5")]);
        let err = BackupConfig::load(&settings).unwrap_err();
        assert!(matches!(err, BackupError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_backup_config_clamps_retention() {
        let settings = MemorySettings::with_values([
            ("max_backups", "0"),
            ("backup_location", "  "),
            ("backup_location_type", "1"),
        ]);
        let config = BackupConfig::load(&settings).unwrap();
        assert_eq!(config.max_backups, 1);
        assert_eq!(config.backup_location, PathBuf::from("/storage/backup"));
        assert!(config.remote_enabled);
    }
}
