//! Backup orchestration
//!
//! [`BackupManager`] is the single entry point a host (the CLI or the
//! scheduling service) talks to. It reads the settings at the start of
//! every operation, wires the resolver, archive builder, verifier, rotation
//! and remote transports together, and reports through the host's
//! [`Notifier`] and [`Dialog`].
//!
//! Every public operation returns an [`OperationOutcome`]; the `run_*` and
//! `try_*` variants return the underlying [`Result`] for callers that want
//! the details.
//!
//! # Examples
//!
//! ```rust,no_run
//! use backupper::{BackupManager, JsonSettings};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Arc::new(JsonSettings::open("/storage/.backupper/settings.json")?);
//! let manager = BackupManager::builder(settings).build();
//!
//! let outcome = manager.create_backup();
//! println!("{}", outcome.message);
//! # Ok(())
//! # }
//! ```

use crate::archive::ArchiveBuilder;
use crate::error::{BackupError, Result};
use crate::host::{Dialog, FixedDialog, LogNotifier, Notifications, Notifier, ProgressThrottle};
use crate::manifest::{self, Manifest, MANIFEST_NAME};
use crate::mount::{MountTool, SystemMountTool};
use crate::paths::{PathResolver, Scratch, SystemPaths};
use crate::remote::{self, RemoteConfig, RemotePlaceholder, RemoteTransport};
use crate::restore::{RestoreEngine, RestoreOptions};
use crate::rotation::{self, RotationReport};
use crate::schedule;
use crate::settings::{BackupConfig, SettingsStore};
use crate::types::{ArchiveRecord, OperationOutcome, ProgressCallback, ProgressInfo, RestoreResult};
use crate::utils::{self, SpaceProbe, StatvfsProbe};
use crate::verification::{ArchiveVerifier, VerificationReport};
use chrono::{DateTime, Local, NaiveDateTime};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use zip::ZipArchive;

/// Heading used for dialogs
pub const DIALOG_HEADING: &str = "LibreELEC Backupper";

/// Confirmation shown the first time rotation is found enabled
pub const ROTATION_WARNING: &str =
    "Backup rotation will automatically delete old backups when enabled.\n\nAre you sure you want to continue?";

/// Confirmation shown before an interactive restore
pub const RESTORE_CONFIRMATION: &str = "Are you sure you want to restore this backup?";

/// Creates the transport for a remote configuration
pub type TransportFactory = Arc<
    dyn Fn(&RemoteConfig, Arc<dyn MountTool>) -> Result<Box<dyn RemoteTransport>> + Send + Sync,
>;

/// Source of the current local time
pub type Clock = Arc<dyn Fn() -> DateTime<Local> + Send + Sync>;

/// What a successful backup run produced
#[derive(Debug, Clone)]
pub struct BackupSummary {
    /// Archive file name
    pub archive_name: String,
    /// Local archive path, or `None` once it was uploaded and removed
    pub local_path: Option<PathBuf>,
    /// Remote path setting when the archive was uploaded
    pub remote_path: Option<String>,
    /// Files written into the archive
    pub files_archived: usize,
    /// Files that could not be read
    pub files_skipped: usize,
    /// Sum of the source sizes
    pub total_size: u64,
    /// Verification report when verification ran
    pub verification: Option<VerificationReport>,
    /// Rotation report when rotation ran
    pub rotation: Option<RotationReport>,
    /// Next scheduled backup, if scheduling is on
    pub next_backup: Option<NaiveDateTime>,
}

impl BackupSummary {
    /// One-line description for notifications and the CLI
    pub fn message(&self) -> String {
        let mut message = format!(
            "Backup created: {} ({} files, {})",
            self.archive_name,
            self.files_archived,
            utils::format_bytes(self.total_size)
        );
        if self.files_skipped > 0 {
            message.push_str(&format!(", {} skipped", self.files_skipped));
        }
        if let Some(remote) = &self.remote_path {
            message.push_str(&format!(", uploaded to {}", remote));
        }
        if let Some(rotation) = &self.rotation {
            if !rotation.deleted.is_empty() {
                message.push_str(&format!(", {} old backups removed", rotation.deleted.len()));
            }
        }
        message
    }
}

/// An archive that can be restored
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupListing {
    /// Archive file name
    pub name: String,
    /// Local archive or placeholder path
    pub path: PathBuf,
    /// Creation time from the file name
    pub created: Option<NaiveDateTime>,
    /// Size in bytes, when known
    pub size: Option<u64>,
    /// Whether `path` is a remote placeholder
    pub remote: bool,
}

/// Connected transport that disconnects when dropped
struct RemoteSession {
    transport: Box<dyn RemoteTransport>,
}

impl RemoteSession {
    fn open(
        factory: &TransportFactory,
        config: &RemoteConfig,
        mount_tool: Arc<dyn MountTool>,
    ) -> Result<Self> {
        let mut transport = factory(config, mount_tool)?;
        transport.connect()?;
        Ok(Self { transport })
    }

    fn close(mut self) -> Result<()> {
        self.transport.disconnect()
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        if let Err(e) = self.transport.disconnect() {
            warn!("Failed to disconnect from {} remote: {}", self.transport.kind(), e);
        }
    }
}

/// Orchestrates backup, restore, verification and rotation
pub struct BackupManager {
    settings: Arc<dyn SettingsStore>,
    paths: SystemPaths,
    notifier: Arc<dyn Notifier>,
    dialog: Arc<dyn Dialog>,
    mount_tool: Arc<dyn MountTool>,
    space_probe: Arc<dyn SpaceProbe>,
    transports: TransportFactory,
    scratch_dir: Option<PathBuf>,
    clock: Clock,
}

impl std::fmt::Debug for BackupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupManager")
            .field("paths", &self.paths)
            .field("scratch_dir", &self.scratch_dir)
            .finish()
    }
}

impl BackupManager {
    /// Start building a manager around a settings store
    pub fn builder(settings: Arc<dyn SettingsStore>) -> BackupManagerBuilder {
        BackupManagerBuilder::new(settings)
    }

    /// Settings store in use
    pub fn settings(&self) -> &Arc<dyn SettingsStore> {
        &self.settings
    }

    /// System layout in use
    pub fn paths(&self) -> &SystemPaths {
        &self.paths
    }

    fn notifications(&self, config: &BackupConfig) -> Notifications {
        Notifications::new(
            self.notifier.clone(),
            config.show_notifications,
            config.detailed_notifications,
        )
    }

    fn scratch(&self) -> Scratch {
        match &self.scratch_dir {
            Some(dir) => Scratch::in_dir(dir.clone()),
            None => Scratch::new(),
        }
    }

    fn progress_forwarder(notifications: &Notifications) -> ProgressCallback {
        let throttle = Mutex::new(ProgressThrottle::default());
        let notifications = notifications.clone();
        Arc::new(move |info: &ProgressInfo| {
            if throttle.lock().should_emit(info) {
                notifications.progress(info);
            }
        })
    }

    /// Local backup directory, falling back to the addon profile
    ///
    /// When the configured location cannot be created or written, the
    /// addon's own data directory is used instead and saved as the new
    /// `backup_location`.
    pub fn backup_dir(&self) -> Result<PathBuf> {
        let config = BackupConfig::load(&*self.settings)?;
        self.resolve_backup_dir(&config)
    }

    fn resolve_backup_dir(&self, config: &BackupConfig) -> Result<PathBuf> {
        match utils::ensure_writable_dir(&config.backup_location) {
            Ok(()) => Ok(config.backup_location.clone()),
            Err(e) => {
                let fallback = self.paths.addon_profile();
                error!(
                    "Cannot use backup location {:?} ({}), falling back to {:?}",
                    config.backup_location, e, fallback
                );
                utils::ensure_writable_dir(&fallback)?;
                self.settings
                    .set("backup_location", &fallback.to_string_lossy())?;
                Ok(fallback)
            }
        }
    }

    /// Ask once before the first destructive rotation
    ///
    /// Returns whether rotation may run. Declining switches rotation off;
    /// accepting is remembered in `rotation_confirmed`.
    pub fn ensure_rotation_confirmed(&self) -> Result<bool> {
        if !self.settings.get_bool("enable_rotation") {
            return Ok(false);
        }
        if self.settings.get_bool("rotation_confirmed") {
            return Ok(true);
        }

        if self.dialog.confirm(DIALOG_HEADING, ROTATION_WARNING) {
            info!("Rotation confirmed");
            self.settings.set_bool("rotation_confirmed", true)?;
            Ok(true)
        } else {
            info!("Rotation declined, disabling it");
            self.settings.set_bool("enable_rotation", false)?;
            Ok(false)
        }
    }

    /// Run a backup and report the outcome
    pub fn create_backup(&self) -> OperationOutcome {
        match self.run_backup() {
            Ok(summary) => OperationOutcome::success(summary.message()),
            Err(e) => e.into(),
        }
    }

    /// Run a backup
    ///
    /// Steps, in order: path resolution, rotation confirmation, remote
    /// connect (remote mode), archive build, verification, upload and local
    /// removal (remote mode), rotation, schedule bookkeeping.
    #[instrument(skip(self))]
    pub fn run_backup(&self) -> Result<BackupSummary> {
        let config = BackupConfig::load(&*self.settings)?;
        let notifications = self.notifications(&config);
        notifications.notify("Starting backup...", None);

        let result = self.backup_with(&config, &notifications);
        match &result {
            Ok(summary) => {
                info!("{}", summary.message());
                notifications.notify("Backup completed successfully", Some(&summary.archive_name));
            }
            Err(e) => {
                error!("Backup failed: {}", e);
                notifications.notify("Backup failed", Some(&e.user_message()));
            }
        }
        result
    }

    fn backup_with(
        &self,
        config: &BackupConfig,
        notifications: &Notifications,
    ) -> Result<BackupSummary> {
        let mut scratch = self.scratch();
        let selection = PathResolver::new(self.paths.clone()).resolve(&config.toggles, &mut scratch)?;
        if selection.is_empty() {
            return Err(BackupError::NoItemsSelected);
        }

        let rotate = self.ensure_rotation_confirmed()?;
        let backup_dir = self.resolve_backup_dir(config)?;

        let mut session = if config.remote_enabled {
            let remote_config = RemoteConfig::from_settings(&*self.settings)?;
            info!("Connecting to {} remote {}", remote_config.kind, remote_config.path);
            let session =
                RemoteSession::open(&self.transports, &remote_config, self.mount_tool.clone())?;
            Some((remote_config, session))
        } else {
            None
        };

        let report = ArchiveBuilder::new(self.paths.clone())
            .compression(config.compression)
            .space_probe(self.space_probe.clone())
            .progress_callback(Self::progress_forwarder(notifications))
            .build_at(&selection, &backup_dir, (self.clock)())?;
        scratch.cleanup();

        let archive_name = report
            .archive_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| BackupError::internal("archive path has no file name"))?;

        let verification = if config.verify_backups {
            let verified = ArchiveVerifier::verify(&report.archive_path)?;
            info!("Verification of {}: {}", archive_name, verified.summary());
            Some(verified.into_result()?)
        } else {
            None
        };

        let mut local_path = Some(report.archive_path.clone());
        let mut remote_path = None;
        let mut rotation = None;

        if let Some((remote_config, session)) = session.as_mut() {
            session.transport.upload(&report.archive_path, &archive_name)?;
            info!("Uploaded {} to {}", archive_name, remote_config.path);
            if utils::remove_file_quietly(&report.archive_path) {
                local_path = None;
            }
            remote_path = Some(remote_config.path.clone());

            if rotate {
                rotation = Some(Self::rotate_remote(
                    session.transport.as_mut(),
                    config.max_backups,
                    config.rotation_strategy,
                ));
            }
        } else if rotate {
            rotation = Some(rotation::rotate_local(
                &backup_dir,
                config.max_backups,
                config.rotation_strategy,
            )?);
        }

        if let Some((_, session)) = session.take() {
            if let Err(e) = session.close() {
                warn!("Remote disconnect failed: {}", e);
            }
        }

        let next_backup = schedule::record_run(&*self.settings, (self.clock)().naive_local())?;

        Ok(BackupSummary {
            archive_name,
            local_path,
            remote_path,
            files_archived: report.files_archived(),
            files_skipped: report.skipped().count(),
            total_size: report.manifest.total_size,
            verification,
            rotation,
            next_backup,
        })
    }

    /// Rotation over a remote listing; failures skip rather than abort
    fn rotate_remote(
        transport: &mut dyn RemoteTransport,
        keep: usize,
        strategy: rotation::RotationStrategy,
    ) -> RotationReport {
        let records = match transport.list_files() {
            Ok(records) => records,
            Err(e) => {
                warn!("Skipping remote rotation, listing failed: {}", e);
                return RotationReport::default();
            }
        };

        let mut report = RotationReport {
            examined: records.len(),
            ..Default::default()
        };
        for record in rotation::select_for_deletion(&records, keep, strategy) {
            match transport.delete(&record.name) {
                Ok(()) => {
                    info!("Removed old remote backup: {}", record.name);
                    report.deleted.push(record.name);
                }
                Err(e) => {
                    warn!("Failed to remove old remote backup {}: {}", record.name, e);
                    report.failed.push((record.name, e.to_string()));
                }
            }
        }
        report
    }

    /// Apply rotation now, outside of a backup run
    pub fn rotate(&self) -> OperationOutcome {
        match self.try_rotate() {
            Ok(Some(report)) => OperationOutcome::success(format!(
                "Rotation removed {} of {} backups",
                report.deleted.len(),
                report.examined
            )),
            Ok(None) => OperationOutcome::success("Rotation is disabled"),
            Err(e) => e.into(),
        }
    }

    /// Apply rotation now; `None` when rotation is off or was declined
    pub fn try_rotate(&self) -> Result<Option<RotationReport>> {
        let config = BackupConfig::load(&*self.settings)?;
        if !self.ensure_rotation_confirmed()? {
            return Ok(None);
        }
        if config.remote_enabled {
            let remote_config = RemoteConfig::from_settings(&*self.settings)?;
            let mut session =
                RemoteSession::open(&self.transports, &remote_config, self.mount_tool.clone())?;
            let report = Self::rotate_remote(
                session.transport.as_mut(),
                config.max_backups,
                config.rotation_strategy,
            );
            session.close()?;
            Ok(Some(report))
        } else {
            let dir = self.resolve_backup_dir(&config)?;
            Ok(Some(rotation::rotate_local(
                &dir,
                config.max_backups,
                config.rotation_strategy,
            )?))
        }
    }

    /// Local archives and remote placeholders, newest first
    pub fn list_backups(&self) -> Result<Vec<BackupListing>> {
        let dir = self.backup_dir()?;
        let mut listings: Vec<BackupListing> = rotation::list_local_archives(&dir)?
            .into_iter()
            .map(|record| BackupListing {
                path: dir.join(&record.name),
                created: manifest::archive_timestamp(&record.name),
                size: record.size,
                remote: false,
                name: record.name,
            })
            .collect();

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if !RemotePlaceholder::is_placeholder_name(&file_name) {
                continue;
            }
            match RemotePlaceholder::read(&entry.path()) {
                Ok(placeholder) => listings.push(BackupListing {
                    created: manifest::archive_timestamp(&placeholder.remote_file),
                    name: placeholder.remote_file,
                    path: entry.path(),
                    size: None,
                    remote: true,
                }),
                Err(e) => warn!("Ignoring unreadable placeholder {:?}: {}", entry.path(), e),
            }
        }

        listings.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| b.name.cmp(&a.name)));
        Ok(listings)
    }

    /// Archives on the configured remote location, newest first
    pub fn list_remote_backups(&self) -> Result<Vec<ArchiveRecord>> {
        let remote_config = RemoteConfig::from_settings(&*self.settings)?;
        let mut session =
            RemoteSession::open(&self.transports, &remote_config, self.mount_tool.clone())?;
        let records = session.transport.list_files()?;
        session.close()?;
        Ok(records)
    }

    /// Write a placeholder for a remote archive so it can be restored
    pub fn prepare_remote_restore(&self, remote_file: &str) -> Result<PathBuf> {
        remote::validate_remote_name(remote_file)?;
        let remote_config = RemoteConfig::from_settings(&*self.settings)?;
        let dir = self.backup_dir()?;
        let path = RemotePlaceholder::new(&remote_config, remote_file).write_to(&dir)?;
        debug!("Placeholder for {} written to {:?}", remote_file, path);
        Ok(path)
    }

    /// Manifest of a local archive
    pub fn backup_info(&self, archive: &Path) -> Result<Manifest> {
        if !archive.is_file() {
            return Err(BackupError::BackupNotFound(archive.to_path_buf()));
        }
        let mut zip = ZipArchive::new(BufReader::new(File::open(archive)?))?;
        let mut entry = zip
            .by_name(MANIFEST_NAME)
            .map_err(|_| BackupError::InvalidManifest(format!("{} not found", MANIFEST_NAME)))?;
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;
        Manifest::from_slice(&bytes)
    }

    /// Verify an archive and report the outcome
    pub fn verify_backup(&self, archive: &Path) -> OperationOutcome {
        match ArchiveVerifier::verify(archive).and_then(VerificationReport::into_result) {
            Ok(report) => OperationOutcome::success(format!("Backup is valid: {}", report.summary())),
            Err(e) => OperationOutcome::failure(format!("Verification failed: {}", e.user_message())),
        }
    }

    /// Restore an archive or a remote placeholder and report the outcome
    pub fn restore_backup(&self, path: &Path) -> OperationOutcome {
        match self.run_restore(path, RestoreOptions::new()) {
            Ok(result) => {
                let mut message = format!(
                    "Backup restored successfully ({} files, {})",
                    result.files_restored,
                    utils::format_bytes(result.bytes_written)
                );
                for warning in &result.warnings {
                    message.push_str(&format!("\nWarning: {}", warning));
                }
                OperationOutcome::success(message)
            }
            Err(e) => OperationOutcome::failure(format!("Restore failed: {}", e.user_message())),
        }
    }

    /// Restore an archive or a remote placeholder
    ///
    /// A placeholder is resolved by downloading its archive into scratch
    /// space first; the placeholder is removed once the download completes.
    #[instrument(skip(self, options))]
    pub fn run_restore(&self, path: &Path, options: RestoreOptions) -> Result<RestoreResult> {
        let config = BackupConfig::load(&*self.settings)?;
        let notifications = self.notifications(&config);
        notifications.notify("Starting restore...", None);

        let result = self.restore_with(path, options, &notifications);
        match &result {
            Ok(restored) => {
                for warning in &restored.warnings {
                    warn!("{}", warning);
                }
                notifications.notify("Restore completed successfully", None);
            }
            Err(e) => {
                error!("Restore of {:?} failed: {}", path, e);
                notifications.notify("Restore failed", Some(&e.user_message()));
            }
        }
        result
    }

    fn restore_with(
        &self,
        path: &Path,
        options: RestoreOptions,
        notifications: &Notifications,
    ) -> Result<RestoreResult> {
        let mut scratch = self.scratch();
        let is_placeholder = path
            .file_name()
            .is_some_and(|name| RemotePlaceholder::is_placeholder_name(&name.to_string_lossy()));

        let archive = if is_placeholder {
            let placeholder = RemotePlaceholder::read(path)?;
            let remote_config = placeholder.to_config()?;
            let local = scratch.path_for(&placeholder.remote_file)?;

            let mut session =
                RemoteSession::open(&self.transports, &remote_config, self.mount_tool.clone())?;
            session.transport.download(&placeholder.remote_file, &local)?;
            session.close()?;

            info!("Downloaded {} from {}", placeholder.remote_file, remote_config.path);
            if !utils::remove_file_quietly(path) {
                warn!("Could not remove placeholder {:?}", path);
            }
            local
        } else {
            path.to_path_buf()
        };

        let result = RestoreEngine::new(self.paths.clone(), self.mount_tool.clone())
            .options(options)
            .progress_callback(Self::progress_forwarder(notifications))
            .restore(&archive);
        scratch.cleanup();
        result
    }

    /// Let the user pick a backup through the dialog and restore it
    pub fn restore_interactive(&self) -> OperationOutcome {
        let listings = match self.interactive_candidates() {
            Ok(listings) => listings,
            Err(e) => return e.into(),
        };
        if listings.is_empty() {
            self.dialog.ok(DIALOG_HEADING, "No backups found");
            return OperationOutcome::failure("No backups found");
        }

        let names: Vec<String> = listings.iter().map(|listing| listing.name.clone()).collect();
        let Some(choice) = self.dialog.select("Select backup to restore", &names) else {
            return OperationOutcome::failure("Restore cancelled");
        };
        let Some(selected) = listings.get(choice) else {
            return OperationOutcome::failure("Restore cancelled");
        };
        if !self.dialog.confirm(DIALOG_HEADING, RESTORE_CONFIRMATION) {
            return OperationOutcome::failure("Restore cancelled");
        }

        let path = if selected.remote && !selected.path.exists() {
            match self.prepare_remote_restore(&selected.name) {
                Ok(path) => path,
                Err(e) => return e.into(),
            }
        } else {
            selected.path.clone()
        };

        let outcome = self.restore_backup(&path);
        if !outcome.success {
            self.dialog.ok(DIALOG_HEADING, &outcome.message);
        }
        outcome
    }

    fn interactive_candidates(&self) -> Result<Vec<BackupListing>> {
        let config = BackupConfig::load(&*self.settings)?;
        if !config.remote_enabled {
            return self.list_backups();
        }
        Ok(self
            .list_remote_backups()?
            .into_iter()
            .map(|record| BackupListing {
                path: PathBuf::new(),
                created: manifest::archive_timestamp(&record.name),
                size: record.size,
                remote: true,
                name: record.name,
            })
            .collect())
    }

    /// Connect to the configured remote, list it and disconnect
    pub fn test_connection(&self) -> OperationOutcome {
        let remote_config = match RemoteConfig::from_settings(&*self.settings) {
            Ok(config) => config,
            Err(e) => return e.into(),
        };
        match self.list_remote_backups() {
            Ok(records) => OperationOutcome::success(format!(
                "Connection to {} {} successful ({} backups found)",
                remote_config.kind,
                remote_config.path,
                records.len()
            )),
            Err(e) => OperationOutcome::failure(format!(
                "Connection to {} {} failed: {}",
                remote_config.kind,
                remote_config.path,
                e.user_message()
            )),
        }
    }

    /// Run a scheduled backup if one is due at `now`
    pub fn run_scheduled(&self, now: NaiveDateTime) -> Option<OperationOutcome> {
        match schedule::is_due(&*self.settings, now) {
            Ok(true) => {
                info!("Starting scheduled backup");
                let outcome = self.create_backup();
                if !outcome.success {
                    // keep the service from retrying every minute
                    if let Err(e) = schedule::refresh(&*self.settings, now) {
                        warn!("Could not reschedule: {}", e);
                    }
                }
                info!("Scheduled backup finished: {}", outcome.message);
                Some(outcome)
            }
            Ok(false) => None,
            Err(e) => {
                warn!("Schedule check failed: {}", e);
                None
            }
        }
    }

    /// Current local time according to the manager's clock
    pub fn now(&self) -> DateTime<Local> {
        (self.clock)()
    }
}

/// Builder for [`BackupManager`]
///
/// # Default Values
///
/// - `paths`: taken from the `kodi_*`, `flash_path` and `storage_path` settings
/// - `notifier`: [`LogNotifier`]
/// - `dialog`: [`FixedDialog::decline`]
/// - `mount_tool`: [`SystemMountTool`]
/// - `space_probe`: [`StatvfsProbe`]
/// - `transports`: [`remote::open_transport`]
/// - `clock`: [`Local::now`]
pub struct BackupManagerBuilder {
    settings: Arc<dyn SettingsStore>,
    paths: Option<SystemPaths>,
    notifier: Arc<dyn Notifier>,
    dialog: Arc<dyn Dialog>,
    mount_tool: Arc<dyn MountTool>,
    space_probe: Arc<dyn SpaceProbe>,
    transports: TransportFactory,
    scratch_dir: Option<PathBuf>,
    clock: Clock,
}

impl BackupManagerBuilder {
    /// Builder with default collaborators
    pub fn new(settings: Arc<dyn SettingsStore>) -> Self {
        Self {
            settings,
            paths: None,
            notifier: Arc::new(LogNotifier),
            dialog: Arc::new(FixedDialog::decline()),
            mount_tool: Arc::new(SystemMountTool),
            space_probe: Arc::new(StatvfsProbe),
            transports: Arc::new(|config: &RemoteConfig, mount_tool: Arc<dyn MountTool>| {
                remote::open_transport(config, mount_tool)
            }),
            scratch_dir: None,
            clock: Arc::new(Local::now),
        }
    }

    /// Use an explicit system layout
    pub fn paths(mut self, paths: SystemPaths) -> Self {
        self.paths = Some(paths);
        self
    }

    /// Set the notifier
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Set the dialog
    pub fn dialog(mut self, dialog: Arc<dyn Dialog>) -> Self {
        self.dialog = dialog;
        self
    }

    /// Set the mount tool
    pub fn mount_tool(mut self, mount_tool: Arc<dyn MountTool>) -> Self {
        self.mount_tool = mount_tool;
        self
    }

    /// Set the free-space probe
    pub fn space_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.space_probe = probe;
        self
    }

    /// Set the transport factory
    pub fn transports(mut self, factory: TransportFactory) -> Self {
        self.transports = factory;
        self
    }

    /// Keep scratch files under `dir` instead of the system temp directory
    pub fn scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    /// Set the clock
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Build the manager
    pub fn build(self) -> BackupManager {
        let paths = self
            .paths
            .unwrap_or_else(|| SystemPaths::from_settings(&*self.settings));
        BackupManager {
            settings: self.settings,
            paths,
            notifier: self.notifier,
            dialog: self.dialog,
            mount_tool: self.mount_tool,
            space_probe: self.space_probe,
            transports: self.transports,
            scratch_dir: self.scratch_dir,
            clock: self.clock,
        }
    }
}
