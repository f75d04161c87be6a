//! SMB and NFS through a temporary mount point
//!
//! The share is mounted on a private temporary directory and the remote
//! directory is then handled with ordinary file operations.

use super::{validate_remote_name, RemoteConfig, RemoteKind, RemoteTransport};
use crate::error::{BackupError, Result};
use crate::mount::{MountRequest, MountTool};
use crate::rotation::list_local_archives;
use crate::types::ArchiveRecord;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// A network share mounted for the lifetime of the connection
pub struct MountedShare {
    kind: RemoteKind,
    source: String,
    subdir: PathBuf,
    options: Vec<String>,
    secret: Option<String>,
    tool: Arc<dyn MountTool>,
    mount_point: Option<TempDir>,
}

impl MountedShare {
    /// Prepare a share transport; nothing is mounted until `connect`
    pub fn new(config: &RemoteConfig, tool: Arc<dyn MountTool>) -> Result<Self> {
        let location = config.location()?;
        let (source, subdir, options, secret) = match config.kind {
            RemoteKind::Smb => {
                let mut segments = location.segments.iter();
                let share = segments.next().ok_or_else(|| {
                    BackupError::config("SMB remote path needs a share: server/share/path")
                })?;
                let subdir: PathBuf = segments.collect();

                let mut options = Vec::new();
                if config.username.is_empty() {
                    options.push("guest".to_string());
                } else {
                    options.push(format!("username={}", config.username));
                }
                if let Some(port) = config.port {
                    options.push(format!("port={}", port));
                }
                let secret = (!config.password.is_empty()).then(|| config.password.clone());
                (
                    format!("//{}/{}", location.server, share),
                    subdir,
                    options,
                    secret,
                )
            }
            RemoteKind::Nfs => {
                let mut options = vec!["nolock".to_string()];
                if let Some(port) = config.port {
                    options.push(format!("port={}", port));
                }
                (
                    format!("{}:/{}", location.server, location.joined()),
                    PathBuf::new(),
                    options,
                    None,
                )
            }
            other => {
                return Err(BackupError::internal(format!(
                    "{} is not a mountable share",
                    other
                )))
            }
        };

        Ok(Self {
            kind: config.kind,
            source,
            subdir,
            options,
            secret,
            tool,
            mount_point: None,
        })
    }

    /// Mount source (`//server/share` or `server:/export`)
    pub fn source(&self) -> &str {
        &self.source
    }

    fn fstype(&self) -> &'static str {
        match self.kind {
            RemoteKind::Nfs => "nfs",
            _ => "cifs",
        }
    }

    fn remote_dir(&self) -> Result<PathBuf> {
        self.mount_point
            .as_ref()
            .map(|mount_point| mount_point.path().join(&self.subdir))
            .ok_or_else(|| BackupError::transport(format!("{} share is not mounted", self.kind)))
    }

    fn remote_file(&self, name: &str) -> Result<PathBuf> {
        validate_remote_name(name)?;
        Ok(self.remote_dir()?.join(name))
    }
}

impl RemoteTransport for MountedShare {
    fn kind(&self) -> RemoteKind {
        self.kind
    }

    fn connect(&mut self) -> Result<()> {
        if self.mount_point.is_some() {
            return Ok(());
        }

        let mount_point = tempfile::Builder::new()
            .prefix("backupper-mnt-")
            .tempdir()?;
        let request = MountRequest {
            fstype: self.fstype().to_string(),
            source: self.source.clone(),
            target: mount_point.path().to_path_buf(),
            options: self.options.clone(),
            secret: self.secret.clone(),
        };
        self.tool.mount(&request)?;
        info!("Mounted {} at {:?}", self.source, mount_point.path());
        self.mount_point = Some(mount_point);

        let dir = self.remote_dir()?;
        if let Err(e) = fs::create_dir_all(&dir) {
            let _ = self.disconnect();
            return Err(BackupError::transport(format!(
                "cannot create {:?} on {}: {}",
                self.subdir, self.source, e
            )));
        }
        Ok(())
    }

    fn upload(&mut self, local: &Path, remote_name: &str) -> Result<()> {
        let target = self.remote_file(remote_name)?;
        let staging = target.with_extension("part");
        fs::copy(local, &staging)
            .and_then(|_| fs::rename(&staging, &target))
            .map_err(|e| {
                let _ = fs::remove_file(&staging);
                BackupError::transport(format!("upload of {} failed: {}", remote_name, e))
            })?;
        debug!("Copied {:?} to {}", local, remote_name);
        Ok(())
    }

    fn download(&mut self, remote_name: &str, local: &Path) -> Result<()> {
        let source = self.remote_file(remote_name)?;
        fs::copy(&source, local).map_err(|e| {
            BackupError::transport(format!("download of {} failed: {}", remote_name, e))
        })?;
        Ok(())
    }

    fn list_files(&mut self) -> Result<Vec<ArchiveRecord>> {
        let dir = self.remote_dir()?;
        list_local_archives(&dir)
            .map_err(|e| BackupError::transport(format!("cannot list {}: {}", self.source, e)))
    }

    fn delete(&mut self, remote_name: &str) -> Result<()> {
        let target = self.remote_file(remote_name)?;
        match fs::remove_file(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackupError::transport(format!(
                "cannot delete {}: {}",
                remote_name, e
            ))),
        }
    }

    fn disconnect(&mut self) -> Result<()> {
        if let Some(mount_point) = self.mount_point.take() {
            if let Err(e) = self.tool.unmount(mount_point.path()) {
                // still mounted: removing the directory would recurse into the share
                std::mem::forget(mount_point);
                return Err(e);
            }
            debug!("Unmounted {}", self.source);
        }
        Ok(())
    }
}

impl Drop for MountedShare {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            warn!("Failed to unmount {}: {}", self.source, e);
        }
    }
}
