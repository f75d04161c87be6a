//! End-to-end integration tests for backupper
//!
//! Builds realistic Kodi trees with every category populated and drives
//! full backup, verification and restore cycles through the public API.

use ::backupper::mount::RecordingMountTool;
use ::backupper::utils::FixedSpace;
use ::backupper::*;
use backupper::host::{FixedDialog, RecordingNotifier};
use chrono::{Local, TimeZone};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::info;
use walkdir::WalkDir;

/// Test harness holding a fake LibreELEC root and its manager collaborators
pub struct BackupTestHarness {
    pub temp_dir: TempDir,
    pub paths: SystemPaths,
    pub settings: Arc<MemorySettings>,
    pub notifier: Arc<RecordingNotifier>,
    pub mounts: Arc<RecordingMountTool>,
    pub generator: ContentGenerator,
}

impl BackupTestHarness {
    /// Create a harness with an empty tree and default settings
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let paths = SystemPaths::rooted_at(temp_dir.path());
        let settings = Arc::new(MemorySettings::with_values([(
            "backup_location".to_string(),
            temp_dir.path().join("backups").to_string_lossy().into_owned(),
        )]));

        Self {
            temp_dir,
            paths,
            settings,
            notifier: Arc::new(RecordingNotifier::new()),
            mounts: Arc::new(RecordingMountTool::new()),
            generator: ContentGenerator::new(7),
        }
    }

    /// Switch on every backup category
    pub fn enable_all_categories(&self) {
        for key in [
            "backup_config",
            "backup_addons",
            "backup_repositories",
            "backup_userdata",
            "backup_sources",
            "backup_profiles",
            "backup_configs",
            "backup_gamesaves",
            "backup_playlists",
            "backup_thumbnails",
            "backup_skins",
        ] {
            self.settings.set(key, "true").unwrap();
        }
    }

    fn write(&mut self, path: PathBuf, size: usize) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = self.generator.text(size);
        fs::write(path, content)?;
        Ok(())
    }

    /// Populate a tree touching every category
    pub fn generate_kodi_tree(&mut self, addons: usize) -> anyhow::Result<()> {
        let home = self.paths.home.clone();
        let userdata = self.paths.userdata.clone();

        self.write(self.paths.flash.join("config.txt"), 200)?;

        for i in 0..addons {
            let addon = home.join("addons").join(format!("plugin.video.sample{}", i));
            self.write(addon.join("addon.xml"), 300)?;
            self.write(addon.join("resources/lib/main.py"), 2_000)?;
            self.write(
                userdata.join("addon_data").join(format!("plugin.video.sample{}", i)).join("settings.xml"),
                400,
            )?;
        }
        self.write(home.join("addons/repository.sample/addon.xml"), 250)?;
        self.write(home.join("addons/skin.sample/addon.xml"), 250)?;
        self.write(userdata.join("addon_data/skin.sample/settings.xml"), 150)?;
        self.write(userdata.join("addon_data/game.saves/slot1.sav"), 1_024)?;

        self.write(userdata.join("sources.xml"), 500)?;
        self.write(userdata.join("profiles.xml"), 300)?;
        self.write(userdata.join("profiles/kids/guisettings.xml"), 300)?;
        self.write(userdata.join("guisettings.xml"), 4_000)?;
        self.write(userdata.join("advancedsettings.xml"), 200)?;
        self.write(userdata.join("keyboard.xml"), 100)?;
        self.write(userdata.join("keymaps/remote.xml"), 600)?;
        self.write(userdata.join("playlists/music/party.m3u"), 120)?;
        self.write(userdata.join("Thumbnails/0/0a1b2c3d.jpg"), 3_000)?;
        Ok(())
    }

    /// Manager wired to the harness collaborators
    pub fn manager(&self, minute: u32) -> BackupManager {
        let when = Local.with_ymd_and_hms(2024, 6, 1, 3, minute, 0).unwrap();
        BackupManager::builder(self.settings.clone())
            .paths(self.paths.clone())
            .notifier(self.notifier.clone())
            .dialog(Arc::new(FixedDialog::accept()))
            .mount_tool(self.mounts.clone())
            .space_probe(Arc::new(FixedSpace(u64::MAX)))
            .scratch_dir(self.temp_dir.path().join("scratch"))
            .clock(Arc::new(move || when))
            .build()
    }

    /// SHA-256 of every file below the system roots, keyed by relative path
    pub fn snapshot(&self) -> anyhow::Result<BTreeMap<PathBuf, String>> {
        let mut hashes = BTreeMap::new();
        for root in [&self.paths.flash, &self.paths.storage] {
            if !root.exists() {
                continue;
            }
            for entry in WalkDir::new(root).sort_by_file_name() {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry.path().strip_prefix(self.temp_dir.path())?.to_path_buf();
                let digest = Sha256::digest(fs::read(entry.path())?);
                hashes.insert(relative, hex::encode(digest));
            }
        }
        Ok(hashes)
    }

    /// Remove both system roots
    pub fn wipe(&self) -> anyhow::Result<()> {
        fs::remove_dir_all(&self.paths.flash)?;
        fs::remove_dir_all(&self.paths.storage)?;
        Ok(())
    }
}

impl Default for BackupTestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic text content for test files
pub struct ContentGenerator {
    state: u64,
}

impl ContentGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            state: seed.wrapping_mul(6364136223846793005).wrapping_add(1),
        }
    }

    fn next(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.state >> 33
    }

    /// Generate `size` bytes of word-like text
    pub fn text(&mut self, size: usize) -> Vec<u8> {
        let words = ["kodi", "addon", "setting", "value", "true", "false", "video", "music"];
        let mut content = Vec::with_capacity(size);
        while content.len() < size {
            let word = words[(self.next() as usize) % words.len()];
            content.extend_from_slice(word.as_bytes());
            content.push(b' ');
        }
        content.truncate(size);
        content
    }
}

/// Archive with a manifest and arbitrary raw entries
fn write_crafted_archive(path: &Path, manifest: &serde_json::Value, entries: &[(&str, &[u8])]) {
    let file = fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    for (name, content) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(content).unwrap();
    }
    zip.start_file("manifest.json", options).unwrap();
    zip.write_all(manifest.to_string().as_bytes()).unwrap();
    zip.finish().unwrap();
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_full_cycle_every_category() {
        let mut harness = BackupTestHarness::new();
        harness.enable_all_categories();
        harness.generate_kodi_tree(5).unwrap();
        let before = harness.snapshot().unwrap();

        let manager = harness.manager(0);
        let summary = manager.run_backup().unwrap();
        info!("{}", summary.message());
        assert!(summary.archive_name.ends_with("-more_20240601_030000.zip"));
        assert_eq!(summary.files_skipped, 0);
        assert!(summary.verification.unwrap().is_valid());

        let archive = summary.local_path.unwrap();
        let manifest = manager.backup_info(&archive).unwrap();
        assert!(manifest.items.contains(&"config".to_string()));
        assert!(manifest.items.contains(&"thumbnails".to_string()));
        assert_eq!(manifest.backed_up_files.len(), manifest.checksums.len());

        harness.wipe().unwrap();
        let outcome = manager.restore_backup(&archive);
        assert!(outcome.success, "{}", outcome.message);

        // the backup directory itself lives outside the system roots
        assert_eq!(harness.snapshot().unwrap(), before);
    }

    #[test]
    fn test_nested_items_are_archived_once() {
        let mut harness = BackupTestHarness::new();
        harness.enable_all_categories();
        harness.generate_kodi_tree(2).unwrap();

        let summary = harness.manager(0).run_backup().unwrap();
        let manifest = harness
            .manager(0)
            .backup_info(summary.local_path.as_deref().unwrap())
            .unwrap();

        let mut names = manifest.backed_up_files.clone();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), manifest.backed_up_files.len());

        // nested categories stay visible in the manifest
        for item in ["repository.sample", "gamesaves", "skin.sample"] {
            assert!(manifest.items.contains(&item.to_string()), "{} missing", item);
        }
        assert!(!manifest
            .backed_up_files
            .iter()
            .any(|name| name.starts_with("repository.sample/") || name.starts_with("gamesaves/")));
        assert!(manifest
            .backed_up_files
            .iter()
            .any(|name| name.ends_with("game.saves/slot1.sav")));
    }

    #[test]
    fn test_corrupted_entry_is_detected() {
        let mut harness = BackupTestHarness::new();
        harness.settings.set("compression_level", "0").unwrap();
        harness.generate_kodi_tree(1).unwrap();
        fs::write(harness.paths.userdata.join("sources.xml"), "MARKER-SOURCES-CONTENT").unwrap();

        let manager = harness.manager(0);
        let archive = manager.run_backup().unwrap().local_path.unwrap();

        let mut bytes = fs::read(&archive).unwrap();
        let marker = b"MARKER-SOURCES-CONTENT";
        let offset = bytes
            .windows(marker.len())
            .position(|window| window == marker)
            .unwrap();
        bytes[offset] ^= 0xff;
        fs::write(&archive, &bytes).unwrap();

        let report = ArchiveVerifier::verify(&archive).unwrap();
        assert!(!report.is_valid());
        assert!(!manager.verify_backup(&archive).success);
        assert!(!manager.restore_backup(&archive).success);
    }

    #[test]
    fn test_truncated_archive_is_reported() {
        let mut harness = BackupTestHarness::new();
        harness.generate_kodi_tree(1).unwrap();
        let manager = harness.manager(0);
        let archive = manager.run_backup().unwrap().local_path.unwrap();

        let bytes = fs::read(&archive).unwrap();
        fs::write(&archive, &bytes[..bytes.len() / 2]).unwrap();

        let report = ArchiveVerifier::verify(&archive).unwrap();
        assert!(!report.is_valid());
        assert!(report.failure_message().is_some());
    }

    #[test]
    fn test_traversal_entry_aborts_before_writing() {
        let harness = BackupTestHarness::new();
        let archive = harness.temp_dir.path().join("backup_evil_20240101_000000.zip");
        let manifest = serde_json::json!({
            "timestamp": "20240101_000000",
            "items": ["config"],
            "paths": {"config": harness.paths.flash.join("config.txt")},
            "backed_up_files": ["flash/config.txt", "flash/../../escaped.txt"],
            "total_size": 10
        });
        write_crafted_archive(
            &archive,
            &manifest,
            &[
                ("flash/config.txt", b"safe=1"),
                ("flash/../../escaped.txt", b"boom"),
            ],
        );

        let result = RestoreEngine::new(harness.paths.clone(), harness.mounts.clone()).restore(&archive);
        assert!(matches!(result, Err(BackupError::RestoreFailed { .. })));
        assert!(!harness.paths.flash.join("config.txt").exists());
        assert!(!harness.temp_dir.path().join("escaped.txt").exists());
        assert!(harness.mounts.calls().is_empty());
    }

    #[test]
    fn test_legacy_manifest_without_kinds_restores() {
        let harness = BackupTestHarness::new();
        let archive = harness.temp_dir.path().join("backup_data_20230101_000000.zip");
        let addon_data = harness.paths.userdata.join("addon_data");
        let manifest = serde_json::json!({
            "timestamp": "20230101_000000",
            "items": ["addon_data"],
            "paths": {"addon_data": addon_data},
            "backed_up_files": ["addon_data/plugin.audio.x/settings.xml"],
            "total_size": 12
        });
        write_crafted_archive(
            &archive,
            &manifest,
            &[("addon_data/plugin.audio.x/settings.xml", b"<settings/>\n")],
        );

        let target = harness.temp_dir.path().join("relocated");
        let result = RestoreEngine::new(harness.paths.clone(), harness.mounts.clone())
            .options(RestoreOptions::new().relocate_to(&target))
            .restore(&archive)
            .unwrap();
        assert_eq!(result.files_restored, 1);

        let relative: PathBuf = addon_data
            .join("plugin.audio.x/settings.xml")
            .components()
            .filter(|c| matches!(c, std::path::Component::Normal(_)))
            .collect();
        assert_eq!(fs::read(target.join(relative)).unwrap(), b"<settings/>\n");
    }

    #[test]
    fn test_settings_file_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("conf/settings.json");
        {
            let settings = JsonSettings::open(&path).unwrap();
            settings.set("max_backups", "4").unwrap();
            settings.set_bool("enable_rotation", true).unwrap();
        }

        let settings = JsonSettings::open(&path).unwrap();
        assert_eq!(settings.get_int("max_backups"), 4);
        assert!(settings.get_bool("enable_rotation"));
        assert_eq!(settings.get_string("backup_time"), "03:00");
        let config = BackupConfig::load(&settings).unwrap();
        assert_eq!(config.max_backups, 4);
        assert_eq!(config.rotation_strategy, RotationStrategy::KeepNewest);
    }

    #[test]
    fn test_scheduled_service_tick() {
        let mut harness = BackupTestHarness::new();
        harness.generate_kodi_tree(1).unwrap();
        harness.settings.set("enable_schedule", "true").unwrap();
        harness.settings.set("backup_interval", "1").unwrap();
        harness.settings.set("backup_time", "00:30").unwrap();

        let manager = Arc::new(harness.manager(0));
        let service = BackupService::new(manager.clone(), Arc::new(AbortSignal::new()));
        service.start();
        assert_eq!(harness.settings.get_string("next_backup"), "2024-06-01 03:30");

        let before = Local.with_ymd_and_hms(2024, 6, 1, 3, 29, 0).unwrap().naive_local();
        assert!(service.tick(before).is_none());

        let due = Local.with_ymd_and_hms(2024, 6, 1, 3, 30, 0).unwrap().naive_local();
        let outcome = service.tick(due).unwrap();
        assert!(outcome.success, "{}", outcome.message);
        assert_eq!(manager.list_backups().unwrap().len(), 1);
    }
}
