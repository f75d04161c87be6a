//! SFTP transport over `ssh2`

use super::{validate_remote_name, RemoteConfig, RemoteKind, RemoteLocation, RemoteTransport};
use crate::error::{BackupError, Result};
use crate::manifest;
use crate::types::ArchiveRecord;
use chrono::{DateTime, Utc};
use ssh2::{Session, Sftp};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Blocking calls on the session give up after this many milliseconds
const SESSION_TIMEOUT_MS: u32 = 60_000;

struct Connection {
    session: Session,
    sftp: Sftp,
}

/// SFTP session rooted at `/<path below the server>`
pub struct SftpTransport {
    location: RemoteLocation,
    port: u16,
    username: String,
    password: String,
    connection: Option<Connection>,
}

impl SftpTransport {
    /// Prepare an SFTP transport; the session opens on `connect`
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        if config.username.is_empty() {
            return Err(BackupError::MissingRemoteSetting("remote_username"));
        }
        Ok(Self {
            location: config.location()?,
            port: config.effective_port(),
            username: config.username.clone(),
            password: config.password.clone(),
            connection: None,
        })
    }

    /// Absolute remote directory
    pub fn remote_dir(&self) -> PathBuf {
        Path::new("/").join(self.location.joined())
    }

    fn sftp(&self) -> Result<&Sftp> {
        self.connection
            .as_ref()
            .map(|connection| &connection.sftp)
            .ok_or_else(|| BackupError::transport("SFTP session is not connected"))
    }

    fn remote_file(&self, name: &str) -> Result<PathBuf> {
        validate_remote_name(name)?;
        Ok(self.remote_dir().join(name))
    }

    fn ensure_remote_dir(sftp: &Sftp, dir: &Path) -> Result<()> {
        let mut current = PathBuf::from("/");
        for component in dir.components().skip(1) {
            current.push(component);
            if sftp.stat(&current).is_err() {
                debug!("Creating remote directory {:?}", current);
                sftp.mkdir(&current, 0o755)?;
            }
        }
        Ok(())
    }
}

impl RemoteTransport for SftpTransport {
    fn kind(&self) -> RemoteKind {
        RemoteKind::Sftp
    }

    fn connect(&mut self) -> Result<()> {
        if self.connection.is_some() {
            return Ok(());
        }

        let addr = (self.location.server.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                BackupError::transport(format!("cannot resolve {}", self.location.server))
            })?;
        let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;

        let mut session = Session::new()?;
        session.set_timeout(SESSION_TIMEOUT_MS);
        session.set_tcp_stream(tcp);
        session.handshake()?;
        session.userauth_password(&self.username, &self.password)?;
        if !session.authenticated() {
            return Err(BackupError::transport(format!(
                "SFTP authentication failed for {}@{}",
                self.username, self.location.server
            )));
        }

        let sftp = session.sftp()?;
        Self::ensure_remote_dir(&sftp, &self.remote_dir())?;

        info!(
            "Connected to sftp://{}@{}:{}",
            self.username, self.location.server, self.port
        );
        self.connection = Some(Connection { session, sftp });
        Ok(())
    }

    fn upload(&mut self, local: &Path, remote_name: &str) -> Result<()> {
        let target = self.remote_file(remote_name)?;
        let mut reader = BufReader::new(File::open(local)?);
        let mut remote = self.sftp()?.create(&target)?;
        let written = io::copy(&mut reader, &mut remote)?;
        remote.flush()?;
        debug!("Uploaded {} bytes to {:?}", written, target);
        Ok(())
    }

    fn download(&mut self, remote_name: &str, local: &Path) -> Result<()> {
        let source = self.remote_file(remote_name)?;
        let mut remote = self.sftp()?.open(&source)?;
        let mut writer = BufWriter::new(File::create(local)?);
        io::copy(&mut remote, &mut writer)?;
        writer.flush()?;
        Ok(())
    }

    fn list_files(&mut self) -> Result<Vec<ArchiveRecord>> {
        let dir = self.remote_dir();
        let entries = self.sftp()?.readdir(&dir)?;

        let mut records = Vec::new();
        for (path, stat) in entries {
            if !stat.is_file() {
                continue;
            }
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if !manifest::is_archive_name(&name) {
                continue;
            }
            let modified = stat
                .mtime
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs as i64, 0))
                .or_else(|| manifest::archive_timestamp(&name).map(|t| t.and_utc()))
                .unwrap_or_else(Utc::now);
            records.push(ArchiveRecord {
                name,
                modified,
                size: stat.size,
            });
        }
        records.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.name.cmp(&a.name)));
        Ok(records)
    }

    fn delete(&mut self, remote_name: &str) -> Result<()> {
        let target = self.remote_file(remote_name)?;
        self.sftp()?.unlink(&target)?;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        if let Some(connection) = self.connection.take() {
            drop(connection.sftp);
            if let Err(e) = connection.session.disconnect(None, "backup finished", None) {
                debug!("SSH disconnect failed: {}", e);
            }
        }
        Ok(())
    }
}

impl Drop for SftpTransport {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(username: &str) -> RemoteConfig {
        RemoteConfig {
            kind: RemoteKind::Sftp,
            path: "nas.local/home/kodi/backups".to_string(),
            username: username.to_string(),
            password: "pw".to_string(),
            port: Some(2222),
        }
    }

    #[test]
    fn test_remote_dir_is_absolute() {
        let transport = SftpTransport::new(&config("kodi")).unwrap();
        assert_eq!(transport.remote_dir(), PathBuf::from("/home/kodi/backups"));
        assert_eq!(transport.port, 2222);
    }

    #[test]
    fn test_username_required() {
        assert!(matches!(
            SftpTransport::new(&config("")),
            Err(BackupError::MissingRemoteSetting("remote_username"))
        ));
    }

    #[test]
    fn test_operations_require_connection() {
        let mut transport = SftpTransport::new(&config("kodi")).unwrap();
        assert!(transport.list_files().unwrap_err().is_transport());
        assert!(transport.delete("../x").is_err());
    }
}
