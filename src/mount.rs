//! Mount and remount through the system `mount` utility
//!
//! Network shares (SMB, NFS) are attached with `mount -t <fstype>` and the
//! protected partitions are switched between read-only and read-write with
//! `mount -o remount,<mode>`. All of it goes through the [`MountTool`] trait
//! so the rest of the crate can be exercised without root privileges.

use crate::error::{BackupError, Result};
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, instrument};

/// Mount mode for a remount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    /// `remount,ro`
    ReadOnly,
    /// `remount,rw`
    ReadWrite,
}

impl MountMode {
    fn option(self) -> &'static str {
        match self {
            MountMode::ReadOnly => "remount,ro",
            MountMode::ReadWrite => "remount,rw",
        }
    }
}

/// A filesystem to attach
#[derive(Clone, PartialEq, Eq)]
pub struct MountRequest {
    /// Filesystem type passed to `-t`
    pub fstype: String,
    /// Device or remote source (`//server/share`, `server:/export`)
    pub source: String,
    /// Local mount point
    pub target: PathBuf,
    /// Options joined into `-o`
    pub options: Vec<String>,
    /// Password handed to the helper through its environment
    pub secret: Option<String>,
}

impl fmt::Debug for MountRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountRequest")
            .field("fstype", &self.fstype)
            .field("source", &self.source)
            .field("target", &self.target)
            .field("options", &self.options)
            .field("secret", &self.secret.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Mount operations needed by the remote transports and restore
pub trait MountTool: Send + Sync {
    /// Attach a filesystem
    fn mount(&self, request: &MountRequest) -> Result<()>;

    /// Detach whatever is mounted at `target`
    fn unmount(&self, target: &Path) -> Result<()>;

    /// Change the mode of an existing mount
    fn remount(&self, mount_point: &Path, mode: MountMode) -> Result<()>;
}

/// [`MountTool`] running `/bin/mount` and `/bin/umount`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMountTool;

impl SystemMountTool {
    fn run(mut command: Command, what: &str, mount_point: &Path) -> Result<()> {
        let output = command.output().map_err(|e| BackupError::Remount {
            mount_point: mount_point.to_path_buf(),
            message: format!("failed to run {}: {}", what, e),
        })?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(BackupError::Remount {
                mount_point: mount_point.to_path_buf(),
                message: format!("{} exited with {}: {}", what, output.status, stderr),
            })
        }
    }
}

impl MountTool for SystemMountTool {
    #[instrument(skip(self))]
    fn mount(&self, request: &MountRequest) -> Result<()> {
        let mut command = Command::new("mount");
        command.arg("-t").arg(&request.fstype);
        if !request.options.is_empty() {
            command.arg("-o").arg(request.options.join(","));
        }
        command.arg(&request.source).arg(&request.target);
        if let Some(secret) = &request.secret {
            // mount.cifs reads the password from PASSWD
            command.env("PASSWD", secret);
        }
        Self::run(command, "mount", &request.target)
            .map_err(|e| BackupError::transport(e.to_string()))
    }

    #[instrument(skip(self))]
    fn unmount(&self, target: &Path) -> Result<()> {
        let mut command = Command::new("umount");
        command.arg(target);
        Self::run(command, "umount", target).map_err(|e| BackupError::transport(e.to_string()))
    }

    #[instrument(skip(self))]
    fn remount(&self, mount_point: &Path, mode: MountMode) -> Result<()> {
        debug!("Remounting {:?} with {}", mount_point, mode.option());
        let mut command = Command::new("mount");
        command.arg("-o").arg(mode.option()).arg(mount_point);
        Self::run(command, "mount", mount_point)
    }
}

/// A call made on a [`RecordingMountTool`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountCall {
    /// `mount` with the filesystem type, source and target
    Mount {
        /// Filesystem type
        fstype: String,
        /// Remote source
        source: String,
        /// Mount point
        target: PathBuf,
    },
    /// `umount`
    Unmount(PathBuf),
    /// `mount -o remount,<mode>`
    Remount(PathBuf, MountMode),
}

/// [`MountTool`] that only records calls
///
/// Mounting leaves the target as a plain local directory, which is enough to
/// drive the share transports against the local filesystem. Individual
/// operations can be made to fail.
#[derive(Debug, Default)]
pub struct RecordingMountTool {
    calls: Mutex<Vec<MountCall>>,
    fail_mount: bool,
    fail_remount: Option<MountMode>,
}

impl RecordingMountTool {
    /// Tool where every call succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Tool whose `mount` calls fail
    pub fn failing_mount() -> Self {
        Self {
            fail_mount: true,
            ..Self::default()
        }
    }

    /// Tool whose remounts into `mode` fail
    pub fn failing_remount(mode: MountMode) -> Self {
        Self {
            fail_remount: Some(mode),
            ..Self::default()
        }
    }

    /// Calls made so far
    pub fn calls(&self) -> Vec<MountCall> {
        self.calls.lock().clone()
    }
}

impl MountTool for RecordingMountTool {
    fn mount(&self, request: &MountRequest) -> Result<()> {
        self.calls.lock().push(MountCall::Mount {
            fstype: request.fstype.clone(),
            source: request.source.clone(),
            target: request.target.clone(),
        });
        if self.fail_mount {
            return Err(BackupError::transport(format!("cannot mount {}", request.source)));
        }
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        self.calls.lock().push(MountCall::Unmount(target.to_path_buf()));
        Ok(())
    }

    fn remount(&self, mount_point: &Path, mode: MountMode) -> Result<()> {
        self.calls
            .lock()
            .push(MountCall::Remount(mount_point.to_path_buf(), mode));
        if self.fail_remount == Some(mode) {
            return Err(BackupError::Remount {
                mount_point: mount_point.to_path_buf(),
                message: format!("{} refused", mode.option()),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_tool_records_and_fails_on_request() {
        let tool = RecordingMountTool::failing_remount(MountMode::ReadOnly);
        tool.remount(Path::new("/flash"), MountMode::ReadWrite).unwrap();
        let err = tool.remount(Path::new("/flash"), MountMode::ReadOnly).unwrap_err();

        assert!(matches!(err, BackupError::Remount { .. }));
        assert_eq!(
            tool.calls(),
            vec![
                MountCall::Remount(PathBuf::from("/flash"), MountMode::ReadWrite),
                MountCall::Remount(PathBuf::from("/flash"), MountMode::ReadOnly),
            ]
        );
    }

    #[test]
    fn test_request_debug_hides_secret() {
        let request = MountRequest {
            fstype: "cifs".into(),
            source: "//nas/backup".into(),
            target: PathBuf::from("/tmp/m"),
            options: vec!["username=kodi".into()],
            secret: Some("hunter2".into()),
        };
        assert!(!format!("{:?}", request).contains("hunter2"));
    }
}
