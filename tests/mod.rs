//! Main test module for backupper
//!
//! This module includes all test suites:
//! - Integration tests for complete backup and restore cycles
//! - Property-based tests for rotation, naming and scheduling invariants
//! - Edge cases around unusual file trees

pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::backupper::host::FixedDialog;
    use ::backupper::mount::RecordingMountTool;
    use ::backupper::utils::FixedSpace;
    use ::backupper::*;
    use chrono::{Local, TimeZone};
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn manager(root: &Path) -> BackupManager {
        let settings = Arc::new(MemorySettings::with_values([
            (
                "backup_location".to_string(),
                root.join("backups").to_string_lossy().into_owned(),
            ),
            ("backup_config".to_string(), "false".to_string()),
            ("backup_addons".to_string(), "false".to_string()),
        ]));
        let when = Local.with_ymd_and_hms(2024, 2, 29, 23, 59, 0).unwrap();
        BackupManager::builder(settings)
            .paths(SystemPaths::rooted_at(root))
            .dialog(Arc::new(FixedDialog::decline()))
            .mount_tool(Arc::new(RecordingMountTool::new()))
            .space_probe(Arc::new(FixedSpace(u64::MAX)))
            .clock(Arc::new(move || when))
            .build()
    }

    #[test]
    fn test_unicode_file_names() {
        let temp = TempDir::new().unwrap();
        let addon_data = SystemPaths::rooted_at(temp.path()).userdata.join("addon_data/plugin.test");
        fs::create_dir_all(&addon_data).unwrap();

        // distinct lengths keep the sanitized entry names apart
        let names = ["🚀.txt", "文件.txt", "файл.txt", "αρχείο.txt"];
        let mut created = Vec::new();
        for name in names {
            if fs::write(addon_data.join(name), name.as_bytes()).is_ok() {
                created.push(name);
            }
        }
        if created.is_empty() {
            return;
        }

        let manager = manager(temp.path());
        let summary = manager.run_backup().unwrap();
        assert_eq!(summary.files_archived, created.len());

        // non-ASCII characters are replaced in entry names
        let manifest = manager
            .backup_info(summary.local_path.as_deref().unwrap())
            .unwrap();
        assert!(manifest.backed_up_files.iter().all(|name| name.is_ascii()));
        assert!(manager
            .verify_backup(summary.local_path.as_deref().unwrap())
            .success);
    }

    #[test]
    fn test_empty_item_directory() {
        let temp = TempDir::new().unwrap();
        let paths = SystemPaths::rooted_at(temp.path());
        fs::create_dir_all(paths.userdata.join("addon_data")).unwrap();

        let manager = manager(temp.path());
        let summary = manager.run_backup().unwrap();
        assert_eq!(summary.files_archived, 0);
        assert!(summary.archive_name.starts_with("backup_data_20240229_235900"));
        assert!(summary.verification.unwrap().is_valid());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_item_is_not_followed() {
        let temp = TempDir::new().unwrap();
        let paths = SystemPaths::rooted_at(temp.path());
        let outside = temp.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("secret.txt"), "do not copy").unwrap();
        fs::create_dir_all(&paths.userdata).unwrap();
        std::os::unix::fs::symlink(&outside, paths.userdata.join("addon_data")).unwrap();
        fs::write(paths.userdata.join("sources.xml"), "<sources/>").unwrap();

        let manager = manager(temp.path());
        let summary = manager.run_backup().unwrap();
        let manifest = manager
            .backup_info(summary.local_path.as_deref().unwrap())
            .unwrap();
        assert_eq!(manifest.items, vec!["sources"]);
    }
}

// Re-export test utilities for use across suites
pub use integration::{BackupTestHarness, ContentGenerator};
