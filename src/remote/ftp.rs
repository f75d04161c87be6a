//! FTP transport over `suppaftp`

use super::{validate_remote_name, RemoteConfig, RemoteKind, RemoteLocation, RemoteTransport};
use crate::error::{BackupError, Result};
use crate::manifest;
use crate::types::ArchiveRecord;
use chrono::Utc;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::net::ToSocketAddrs;
use std::path::Path;
use std::time::Duration;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream};
use tracing::{debug, info, warn};

/// Timeout for establishing the control connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// FTP connection rooted at the configured directory
pub struct FtpTransport {
    location: RemoteLocation,
    port: u16,
    username: String,
    password: String,
    stream: Option<FtpStream>,
}

impl FtpTransport {
    /// Prepare an FTP transport; the connection opens on `connect`
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        Ok(Self {
            location: config.location()?,
            port: config.effective_port(),
            username: config.username.clone(),
            password: config.password.clone(),
            stream: None,
        })
    }

    fn stream(&mut self) -> Result<&mut FtpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| BackupError::transport("FTP session is not connected"))
    }

    /// Change into the remote directory, creating missing segments
    fn enter_directory(stream: &mut FtpStream, segments: &[String]) -> Result<()> {
        stream.cwd("/")?;
        for segment in segments {
            if stream.cwd(segment.as_str()).is_err() {
                debug!("Creating remote directory {}", segment);
                stream.mkdir(segment.as_str())?;
                stream.cwd(segment.as_str())?;
            }
        }
        Ok(())
    }
}

impl RemoteTransport for FtpTransport {
    fn kind(&self) -> RemoteKind {
        RemoteKind::Ftp
    }

    fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let addr = (self.location.server.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                BackupError::transport(format!("cannot resolve {}", self.location.server))
            })?;
        let mut stream = FtpStream::connect_timeout(addr, CONNECT_TIMEOUT)?;

        let (user, password) = if self.username.is_empty() {
            ("anonymous", "anonymous")
        } else {
            (self.username.as_str(), self.password.as_str())
        };
        stream.login(user, password)?;
        stream.transfer_type(FileType::Binary)?;
        Self::enter_directory(&mut stream, &self.location.segments)?;

        info!("Connected to ftp://{}:{}", self.location.server, self.port);
        self.stream = Some(stream);
        Ok(())
    }

    fn upload(&mut self, local: &Path, remote_name: &str) -> Result<()> {
        validate_remote_name(remote_name)?;
        let mut reader = BufReader::new(File::open(local)?);
        let written = self.stream()?.put_file(remote_name, &mut reader)?;
        debug!("Uploaded {} bytes to {}", written, remote_name);
        Ok(())
    }

    fn download(&mut self, remote_name: &str, local: &Path) -> Result<()> {
        validate_remote_name(remote_name)?;
        let mut writer = BufWriter::new(File::create(local)?);
        self.stream()?.retr(remote_name, |reader| {
            io::copy(reader, &mut writer).map_err(FtpError::ConnectionError)
        })?;
        writer.flush()?;
        Ok(())
    }

    fn list_files(&mut self) -> Result<Vec<ArchiveRecord>> {
        let stream = self.stream()?;
        let names = match stream.nlst(None) {
            Ok(names) => names,
            // Some servers answer an empty directory with 550
            Err(FtpError::UnexpectedResponse(response)) => {
                debug!("NLST returned {:?}, treating directory as empty", response.status);
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for name in names {
            // NLST may return paths
            let name = name.rsplit('/').next().unwrap_or(&name).to_string();
            if !manifest::is_archive_name(&name) {
                continue;
            }
            let modified = match stream.mdtm(name.as_str()) {
                Ok(time) => time.and_utc(),
                Err(e) => {
                    warn!("MDTM failed for {}: {}", name, e);
                    manifest::archive_timestamp(&name)
                        .map(|t| t.and_utc())
                        .unwrap_or_else(Utc::now)
                }
            };
            let size = stream.size(name.as_str()).ok().map(|s| s as u64);
            records.push(ArchiveRecord {
                name,
                modified,
                size,
            });
        }
        records.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.name.cmp(&a.name)));
        Ok(records)
    }

    fn delete(&mut self, remote_name: &str) -> Result<()> {
        validate_remote_name(remote_name)?;
        self.stream()?.rm(remote_name)?;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.quit() {
                debug!("FTP QUIT failed: {}", e);
            }
        }
        Ok(())
    }
}

impl Drop for FtpTransport {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}
