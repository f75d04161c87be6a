//! Scoped write access to read-only partitions
//!
//! `/flash` is mounted read-only. Restoring into it needs a remount to
//! read-write for the duration of the writes and a remount back to
//! read-only afterwards, even when the restore fails halfway. A
//! [`PrivilegedSession`] ties that second remount to its lifetime.

use crate::error::Result;
use crate::mount::{MountMode, MountTool};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// A protected mount held read-write until released or dropped
pub struct PrivilegedSession {
    tool: Arc<dyn MountTool>,
    mount_point: PathBuf,
    active: bool,
}

impl PrivilegedSession {
    /// Remount `mount_point` read-write
    ///
    /// # Errors
    ///
    /// Returns [`BackupError::Remount`](crate::error::BackupError::Remount)
    /// when the remount is refused; nothing needs undoing in that case.
    pub fn acquire(tool: Arc<dyn MountTool>, mount_point: impl Into<PathBuf>) -> Result<Self> {
        let mount_point = mount_point.into();
        tool.remount(&mount_point, MountMode::ReadWrite)?;
        debug!("{:?} remounted read-write", mount_point);
        Ok(Self {
            tool,
            mount_point,
            active: true,
        })
    }

    /// Mount point held by this session
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Remount read-only, returning a warning when that fails
    pub fn release(mut self) -> Option<String> {
        self.restore_read_only()
    }

    fn restore_read_only(&mut self) -> Option<String> {
        if !self.active {
            return None;
        }
        self.active = false;
        match self.tool.remount(&self.mount_point, MountMode::ReadOnly) {
            Ok(()) => {
                debug!("{:?} remounted read-only", self.mount_point);
                None
            }
            Err(e) => {
                let message = format!(
                    "Could not remount {} read-only: {}",
                    self.mount_point.display(),
                    e
                );
                warn!("{}", message);
                Some(message)
            }
        }
    }
}

impl Drop for PrivilegedSession {
    fn drop(&mut self) {
        let _ = self.restore_read_only();
    }
}
