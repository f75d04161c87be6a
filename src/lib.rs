//! # Backupper - scheduled backups for LibreELEC/Kodi
//!
//! Creates self-describing zip archives of a Kodi installation's
//! configuration and user data, keeps them locally or on a network share,
//! prunes old ones and restores them, including into the read-only
//! `/flash` boot partition.
//!
//! ## Overview
//!
//! A backup run goes through these stages:
//! - **Resolve**: category toggles become a concrete [`BackupSelection`]
//!   of existing files and directories ([`paths`])
//! - **Build**: the selection is written to a timestamped zip archive with
//!   an embedded `manifest.json` ([`archive`], [`manifest`])
//! - **Verify**: every entry is CRC-checked and the manifest cross-checked
//!   against the archive contents ([`verification`])
//! - **Upload**: optionally, the archive moves to SMB, NFS, FTP, SFTP or
//!   WebDAV storage ([`remote`])
//! - **Rotate**: the oldest or newest archives beyond the retention count
//!   are deleted ([`rotation`])
//!
//! Restoring reverses the mapping recorded in the manifest. Entries that
//! land on protected partitions are written inside a
//! [`PrivilegedSession`] that remounts the partition read-write and always
//! puts it back to read-only ([`restore`], [`privileged`]).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use backupper::{BackupManager, JsonSettings, SettingsStore};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Arc::new(JsonSettings::open("/storage/.backupper/settings.json")?);
//! settings.set("backup_location", "/storage/backup")?;
//!
//! let manager = BackupManager::builder(settings).build();
//! let outcome = manager.create_backup();
//! println!("{}", outcome.message);
//!
//! for backup in manager.list_backups()? {
//!     println!("{} ({})", backup.name, if backup.remote { "remote" } else { "local" });
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Host Integration
//!
//! The library never talks to a media center directly. Settings, toasts,
//! dialogs and the shutdown signal come in through the traits in
//! [`settings`] and [`host`]; the bundled `backupper` binary implements them
//! for a terminal.
//!
//! ## Error Handling
//!
//! Internal operations return `Result<T, BackupError>`. The manager's
//! public operations fold that into an [`OperationOutcome`] carrying a
//! success flag and a user-facing message.
//!
//! ## Module Organization
//!
//! - [`manager`]: orchestration of backup, restore, listing and rotation
//! - [`service`]: the scheduling loop
//! - [`schedule`]: next-run computation
//! - [`settings`]: settings store and typed configuration
//! - [`error`]: error types and handling

// Public API modules
pub mod archive;
pub mod compression;
pub mod error;
pub mod host;
pub mod manager;
pub mod manifest;
pub mod mount;
pub mod paths;
pub mod privileged;
pub mod remote;
pub mod restore;
pub mod rotation;
pub mod schedule;
pub mod service;
pub mod settings;
pub mod types;
pub mod utils;
pub mod verification;

// Re-export main types for convenience
pub use archive::ArchiveBuilder;
pub use compression::CompressionLevel;
pub use error::{BackupError, Result};
pub use host::{AbortSignal, Dialog, Monitor, Notifier};
pub use manager::{BackupListing, BackupManager, BackupManagerBuilder, BackupSummary};
pub use manifest::Manifest;
pub use mount::{MountMode, MountTool, SystemMountTool};
pub use paths::{PathResolver, SystemPaths};
pub use privileged::PrivilegedSession;
pub use remote::{RemoteConfig, RemoteKind, RemoteTransport};
pub use restore::{RestoreEngine, RestoreOptions};
pub use rotation::RotationStrategy;
pub use schedule::Schedule;
pub use service::BackupService;
pub use settings::{BackupConfig, JsonSettings, MemorySettings, SettingsStore};
pub use types::*;
pub use verification::{ArchiveVerifier, VerificationReport};
