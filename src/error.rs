//! Error types for the backupper library
//!
//! Every fallible operation in the library returns [`Result<T>`]. The manager
//! converts these errors into an [`OperationOutcome`](crate::types::OperationOutcome)
//! at its public boundary so a host process never sees a raw error.
//!
//! Errors fall into a handful of categories:
//!
//! - **Configuration**: nothing selected, invalid or missing settings
//! - **Resource**: insufficient disk space, unwritable destination
//! - **Transport**: remote connect/upload/download failures
//! - **Integrity**: corrupt archive entries, bad or mismatching manifests
//! - **Remount**: protected partition could not be remounted

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the backupper library
pub type Result<T> = std::result::Result<T, BackupError>;

/// Main error type for all backup and restore operations
#[derive(Debug, Error)]
pub enum BackupError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors raised by the zip container layer
    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// No backup category produced an existing path
    #[error("No items selected for backup")]
    NoItemsSelected,

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A remote setting required by the selected protocol is empty
    #[error("Missing remote setting: {0}")]
    MissingRemoteSetting(&'static str),

    /// Not enough free space at the destination
    #[error("Insufficient space: {required} bytes required, {available} bytes available")]
    InsufficientSpace {
        /// Bytes required including the safety margin
        required: u64,
        /// Bytes available at the destination
        available: u64,
    },

    /// Destination directory cannot be created or written
    #[error("Destination not writable: {path:?}")]
    DestinationNotWritable {
        /// Directory that failed the write probe
        path: PathBuf,
    },

    /// Archive or placeholder file does not exist
    #[error("Backup file not found: {0:?}")]
    BackupNotFound(PathBuf),

    /// An entry failed its CRC check
    #[error("Corrupt archive entry: {0}")]
    CorruptEntry(String),

    /// Manifest missing or unparseable
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    /// Verification found a hard failure
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// Generic remote transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// FTP client errors
    #[error("FTP error: {0}")]
    Ftp(#[from] suppaftp::FtpError),

    /// SSH / SFTP client errors
    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Unexpected HTTP status from a WebDAV server
    #[error("HTTP {status} for {method} {url}")]
    HttpStatus {
        /// HTTP method used
        method: String,
        /// Request URL
        url: String,
        /// Final status code received
        status: u16,
    },

    /// Remounting a protected partition failed
    #[error("Remount of {mount_point:?} failed: {message}")]
    Remount {
        /// Mount point that was being remounted
        mount_point: PathBuf,
        /// Output or reason reported by the mount tool
        message: String,
    },

    /// Restore aborted on a specific entry
    #[error("Failed to restore {entry}: {reason}")]
    RestoreFailed {
        /// Archive entry that could not be restored
        entry: String,
        /// Underlying reason
        reason: String,
    },

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BackupError {
    /// Create a transport error with a custom message
    pub fn transport(msg: impl Into<String>) -> Self {
        BackupError::Transport(msg.into())
    }

    /// Create a configuration error with a custom message
    pub fn config(msg: impl Into<String>) -> Self {
        BackupError::InvalidConfiguration(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        BackupError::Internal(msg.into())
    }

    /// Wrap any error as the reason a given archive entry failed to restore
    pub fn restore_failed(entry: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        BackupError::RestoreFailed {
            entry: entry.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if this error came from a remote transport
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BackupError::Transport(_)
                | BackupError::Ftp(_)
                | BackupError::Ssh(_)
                | BackupError::Http(_)
                | BackupError::HttpStatus { .. }
        )
    }

    /// Check if this error indicates a damaged archive
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            BackupError::CorruptEntry(_)
                | BackupError::InvalidManifest(_)
                | BackupError::VerificationFailed(_)
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            BackupError::InsufficientSpace { required, available } => format!(
                "Not enough free space for the backup: {} needed, {} available.",
                crate::utils::format_bytes(*required),
                crate::utils::format_bytes(*available)
            ),
            BackupError::MissingRemoteSetting(key) => {
                format!("Remote backup location is incomplete: '{}' is not set.", key)
            }
            BackupError::DestinationNotWritable { path } => {
                format!("Cannot write to {:?}. Check the backup location setting.", path)
            }
            _ => self.to_string(),
        }
    }
}
