//! Background scheduling loop
//!
//! The service wakes every [`WAKE_INTERVAL`] to react to abort requests and
//! checks the schedule every [`CHECK_INTERVAL`]. A due backup runs on the
//! service thread; the next due time is persisted by the manager.

use crate::host::Monitor;
use crate::manager::BackupManager;
use crate::schedule;
use crate::types::OperationOutcome;
use chrono::NaiveDateTime;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long the loop sleeps between abort checks
pub const WAKE_INTERVAL: Duration = Duration::from_secs(10);

/// How often the schedule is consulted
pub const CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Runs scheduled backups until the host asks it to stop
pub struct BackupService {
    manager: Arc<BackupManager>,
    monitor: Arc<dyn Monitor>,
    wake_interval: Duration,
    check_interval: Duration,
}

impl BackupService {
    /// Create a service with the default intervals
    pub fn new(manager: Arc<BackupManager>, monitor: Arc<dyn Monitor>) -> Self {
        Self {
            manager,
            monitor,
            wake_interval: WAKE_INTERVAL,
            check_interval: CHECK_INTERVAL,
        }
    }

    /// Override the wake and check intervals
    pub fn with_intervals(mut self, wake: Duration, check: Duration) -> Self {
        self.wake_interval = wake;
        self.check_interval = check;
        self
    }

    /// Recompute the next due time from the current settings
    pub fn start(&self) {
        let now = self.manager.now().naive_local();
        match schedule::refresh(&**self.manager.settings(), now) {
            Ok(Some(next)) => info!("Backup service started, next backup at {}", next),
            Ok(None) => info!("Backup service started, no backup scheduled"),
            Err(e) => warn!("Backup service could not schedule: {}", e),
        }
    }

    /// One schedule check at `now`
    pub fn tick(&self, now: NaiveDateTime) -> Option<OperationOutcome> {
        self.manager.run_scheduled(now)
    }

    /// Run until the monitor reports an abort
    pub fn run(&self) {
        self.start();
        let mut last_check: Option<Instant> = None;

        loop {
            let check_due = last_check
                .map(|at| at.elapsed() >= self.check_interval)
                .unwrap_or(true);
            if check_due {
                last_check = Some(Instant::now());
                if let Some(outcome) = self.tick(self.manager.now().naive_local()) {
                    debug!("Scheduled run: success={}", outcome.success);
                }
            }

            if self.monitor.wait_for_abort(self.wake_interval) {
                break;
            }
        }
        info!("Backup service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{AbortSignal, FixedDialog};
    use crate::paths::SystemPaths;
    use crate::settings::{MemorySettings, SettingsStore};
    use crate::utils::FixedSpace;
    use chrono::{Local, NaiveDate, TimeZone};
    use std::fs;
    use tempfile::TempDir;

    fn service(temp: &TempDir, settings: Arc<MemorySettings>) -> (BackupService, AbortSignal) {
        let paths = SystemPaths::rooted_at(temp.path());
        fs::create_dir_all(&paths.flash).unwrap();
        fs::write(paths.flash.join("config.txt"), "gpu_mem=128\n").unwrap();

        let when = Local.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let manager = BackupManager::builder(settings)
            .paths(paths)
            .dialog(Arc::new(FixedDialog::decline()))
            .space_probe(Arc::new(FixedSpace(u64::MAX)))
            .clock(Arc::new(move || when))
            .build();
        let signal = AbortSignal::new();
        (
            BackupService::new(Arc::new(manager), Arc::new(signal.clone())),
            signal,
        )
    }

    fn settings(temp: &TempDir) -> Arc<MemorySettings> {
        Arc::new(MemorySettings::with_values([
            (
                "backup_location".to_string(),
                temp.path().join("backups").to_string_lossy().into_owned(),
            ),
            ("enable_schedule".to_string(), "true".to_string()),
            ("backup_interval".to_string(), "2".to_string()),
            ("backup_time".to_string(), "03:00".to_string()),
        ]))
    }

    fn at(d: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, d)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn test_start_schedules_next_run() {
        let temp = TempDir::new().unwrap();
        let settings = settings(&temp);
        let (service, _) = service(&temp, settings.clone());
        service.start();
        assert_eq!(settings.get_string("next_backup"), "2024-01-02 03:00");
    }

    #[test]
    fn test_tick_runs_only_when_due() {
        let temp = TempDir::new().unwrap();
        let settings = settings(&temp);
        settings.set("next_backup", "2024-01-02 03:00").unwrap();
        let (service, _) = service(&temp, settings.clone());

        assert!(service.tick(at(2, 2, 59)).is_none());
        let outcome = service.tick(at(2, 3, 0)).unwrap();
        assert!(outcome.success, "{}", outcome.message);
        assert!(!settings.get_string("last_backup").is_empty());
        assert_eq!(fs::read_dir(temp.path().join("backups")).unwrap().count(), 1);
    }

    #[test]
    fn test_run_stops_on_abort() {
        let temp = TempDir::new().unwrap();
        let (service, signal) = service(&temp, settings(&temp));
        let service = service.with_intervals(Duration::from_millis(10), Duration::from_secs(60));

        signal.request_abort();
        service.run();
        assert!(signal.abort_requested());
    }
}
