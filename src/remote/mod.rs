//! Remote storage transports
//!
//! Archives can live on a remote location instead of the local backup
//! directory. Every backend implements [`RemoteTransport`]; the backend is
//! chosen once from [`RemoteConfig::kind`] by [`open_transport`].
//!
//! | kind | setting | backend |
//! |---|---|---|
//! | SMB | 0 | CIFS mount + file I/O ([`mounted`]) |
//! | NFS | 1 | NFS mount + file I/O ([`mounted`]) |
//! | FTP | 2 | `suppaftp` ([`ftp`]) |
//! | SFTP | 3 | `ssh2` ([`sftp`]) |
//! | WebDAV | 4 | `reqwest` ([`webdav`]) |
//!
//! The remote path setting has the form `server/share-or-export/sub/path`;
//! a leading `scheme://` is ignored.
//!
//! A remote archive selected for restore is represented locally by a
//! [`RemotePlaceholder`] side file.

pub mod ftp;
pub mod mounted;
pub mod sftp;
pub mod webdav;

use crate::error::{BackupError, Result};
use crate::mount::MountTool;
use crate::settings::SettingsStore;
use crate::types::ArchiveRecord;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Suffix of placeholder side files
pub const PLACEHOLDER_SUFFIX: &str = ".remote.json";

/// Remote protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteKind {
    /// Windows share
    Smb,
    /// NFS export
    Nfs,
    /// Plain FTP
    Ftp,
    /// SSH file transfer
    Sftp,
    /// WebDAV over HTTP(S)
    WebDav,
}

impl RemoteKind {
    /// Map the `remote_location_type` setting (0-4)
    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(RemoteKind::Smb),
            1 => Some(RemoteKind::Nfs),
            2 => Some(RemoteKind::Ftp),
            3 => Some(RemoteKind::Sftp),
            4 => Some(RemoteKind::WebDav),
            _ => None,
        }
    }

    /// Numeric setting value
    pub fn index(self) -> i64 {
        match self {
            RemoteKind::Smb => 0,
            RemoteKind::Nfs => 1,
            RemoteKind::Ftp => 2,
            RemoteKind::Sftp => 3,
            RemoteKind::WebDav => 4,
        }
    }

    /// Port used when none is configured
    pub fn default_port(self) -> u16 {
        match self {
            RemoteKind::Smb => 445,
            RemoteKind::Nfs => 2049,
            RemoteKind::Ftp => 21,
            RemoteKind::Sftp => 22,
            RemoteKind::WebDav => 80,
        }
    }
}

impl fmt::Display for RemoteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RemoteKind::Smb => "SMB",
            RemoteKind::Nfs => "NFS",
            RemoteKind::Ftp => "FTP",
            RemoteKind::Sftp => "SFTP",
            RemoteKind::WebDav => "WebDAV",
        };
        f.write_str(name)
    }
}

/// Parsed remote path: a server and the path segments below it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLocation {
    /// Host name or address
    pub server: String,
    /// Remaining path segments
    pub segments: Vec<String>,
}

impl RemoteLocation {
    /// Parse `server/a/b`, ignoring a `scheme://` prefix and empty segments
    pub fn parse(path: &str) -> Result<Self> {
        let trimmed = path.trim();
        let without_scheme = match trimmed.split_once("://") {
            Some((_, rest)) => rest,
            None => trimmed,
        };
        let mut parts = without_scheme
            .split(['/', '\\'])
            .filter(|segment| !segment.is_empty())
            .map(str::to_string);

        let server = parts
            .next()
            .ok_or(BackupError::MissingRemoteSetting("remote_path"))?;
        let segments: Vec<String> = parts.collect();
        if segments.iter().any(|s| s == "..") {
            return Err(BackupError::config("remote path must not contain '..'"));
        }
        Ok(Self { server, segments })
    }

    /// Segments joined with `/`, no leading slash
    pub fn joined(&self) -> String {
        self.segments.join("/")
    }
}

/// Connection settings for a remote location
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Protocol
    pub kind: RemoteKind,
    /// `server/share/sub/path`
    pub path: String,
    /// User name, empty for anonymous/guest
    pub username: String,
    /// Password
    pub password: String,
    /// Explicit port
    pub port: Option<u16>,
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("username", &self.username)
            .field("password", &"***")
            .field("port", &self.port)
            .finish()
    }
}

impl RemoteConfig {
    /// Read the `remote_*` settings
    ///
    /// # Errors
    ///
    /// - [`BackupError::MissingRemoteSetting`] if `remote_path` is empty
    /// - [`BackupError::InvalidConfiguration`] for a bad type or port
    pub fn from_settings(store: &dyn SettingsStore) -> Result<Self> {
        let index = store.get_int("remote_location_type");
        let kind = RemoteKind::from_index(index).ok_or_else(|| {
            BackupError::config(format!("remote_location_type must be 0-4, got {}", index))
        })?;

        let path = store.get_string("remote_path").trim().to_string();
        if path.is_empty() {
            return Err(BackupError::MissingRemoteSetting("remote_path"));
        }

        Ok(Self {
            kind,
            path,
            username: store.get_string("remote_username"),
            password: store.get_string("remote_password"),
            port: parse_port(&store.get_string("remote_port"))?,
        })
    }

    /// Configured port or the protocol default
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.kind.default_port())
    }

    /// Parsed remote path
    pub fn location(&self) -> Result<RemoteLocation> {
        RemoteLocation::parse(&self.path)
    }
}

fn parse_port(raw: &str) -> Result<Option<u16>> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "0" {
        return Ok(None);
    }
    raw.parse::<u16>()
        .map(Some)
        .map_err(|_| BackupError::config(format!("invalid remote_port: {}", raw)))
}

/// Uniform surface over every remote backend
///
/// `remote_name` is always a bare file name inside the configured remote
/// directory.
pub trait RemoteTransport: Send {
    /// Protocol of this transport
    fn kind(&self) -> RemoteKind;

    /// Open the connection (or mount the share)
    fn connect(&mut self) -> Result<()>;

    /// Copy a local file to the remote directory
    fn upload(&mut self, local: &Path, remote_name: &str) -> Result<()>;

    /// Copy a remote file to a local path
    fn download(&mut self, remote_name: &str, local: &Path) -> Result<()>;

    /// Files in the remote directory
    fn list_files(&mut self) -> Result<Vec<ArchiveRecord>>;

    /// Remove a remote file
    fn delete(&mut self, remote_name: &str) -> Result<()>;

    /// Close the connection (or unmount); safe to call more than once
    fn disconnect(&mut self) -> Result<()>;
}

/// Reject names that would escape the remote directory
pub fn validate_remote_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
    {
        return Err(BackupError::transport(format!("invalid remote file name: {:?}", name)));
    }
    Ok(())
}

/// Create the transport for a remote configuration
pub fn open_transport(
    config: &RemoteConfig,
    mount_tool: Arc<dyn MountTool>,
) -> Result<Box<dyn RemoteTransport>> {
    debug!("Opening {} transport for {}", config.kind, config.path);
    let transport: Box<dyn RemoteTransport> = match config.kind {
        RemoteKind::Smb | RemoteKind::Nfs => {
            Box::new(mounted::MountedShare::new(config, mount_tool)?)
        }
        RemoteKind::Ftp => Box::new(ftp::FtpTransport::new(config)?),
        RemoteKind::Sftp => Box::new(sftp::SftpTransport::new(config)?),
        RemoteKind::WebDav => Box::new(webdav::WebDavTransport::new(config)?),
    };
    Ok(transport)
}

/// Local stand-in for an archive stored remotely
///
/// Stored as `<archive name>.remote.json` next to local archives so that a
/// remote backup can be picked for restore like a local one.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePlaceholder {
    /// Archive file name on the remote side
    pub remote_file: String,
    /// Remote path setting at the time of the backup
    pub remote_path: String,
    /// `remote_location_type` value
    pub remote_type: i64,
    /// User name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_username: Option<String>,
    /// Password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_password: Option<String>,
    /// Port
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_port"
    )]
    pub remote_port: Option<u16>,
}

impl fmt::Debug for RemotePlaceholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemotePlaceholder")
            .field("remote_file", &self.remote_file)
            .field("remote_path", &self.remote_path)
            .field("remote_type", &self.remote_type)
            .field("remote_username", &self.remote_username)
            .field("remote_port", &self.remote_port)
            .finish()
    }
}

/// Accept the port as a JSON number or a (possibly empty) string
fn deserialize_port<'de, D>(deserializer: D) -> std::result::Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortValue {
        Number(u16),
        Text(String),
    }

    match Option::<PortValue>::deserialize(deserializer)? {
        None => Ok(None),
        Some(PortValue::Number(0)) => Ok(None),
        Some(PortValue::Number(port)) => Ok(Some(port)),
        Some(PortValue::Text(text)) => parse_port(&text).map_err(serde::de::Error::custom),
    }
}

impl RemotePlaceholder {
    /// Placeholder describing `remote_file` at `config`
    pub fn new(config: &RemoteConfig, remote_file: impl Into<String>) -> Self {
        let non_empty = |value: &str| (!value.is_empty()).then(|| value.to_string());
        Self {
            remote_file: remote_file.into(),
            remote_path: config.path.clone(),
            remote_type: config.kind.index(),
            remote_username: non_empty(&config.username),
            remote_password: non_empty(&config.password),
            remote_port: config.port,
        }
    }

    /// Whether a file name is a placeholder
    pub fn is_placeholder_name(name: &str) -> bool {
        name.ends_with(PLACEHOLDER_SUFFIX)
    }

    /// Path of the placeholder for `remote_file` inside `dir`
    pub fn path_in(dir: &Path, remote_file: &str) -> PathBuf {
        dir.join(format!("{}{}", remote_file, PLACEHOLDER_SUFFIX))
    }

    /// Write the placeholder into `dir`, returning its path
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        let path = Self::path_in(dir, &self.remote_file);
        crate::utils::atomic_write(&path, &serde_json::to_vec_pretty(self)?)?;
        Ok(path)
    }

    /// Read a placeholder file
    pub fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(BackupError::BackupNotFound(path.to_path_buf()));
        }
        let placeholder: Self = serde_json::from_slice(&fs::read(path)?)?;
        validate_remote_name(&placeholder.remote_file)?;
        Ok(placeholder)
    }

    /// Connection settings recorded in the placeholder
    pub fn to_config(&self) -> Result<RemoteConfig> {
        let kind = RemoteKind::from_index(self.remote_type).ok_or_else(|| {
            BackupError::config(format!("unknown remote_type {}", self.remote_type))
        })?;
        if self.remote_path.trim().is_empty() {
            return Err(BackupError::MissingRemoteSetting("remote_path"));
        }
        Ok(RemoteConfig {
            kind,
            path: self.remote_path.clone(),
            username: self.remote_username.clone().unwrap_or_default(),
            password: self.remote_password.clone().unwrap_or_default(),
            port: self.remote_port,
        })
    }
}
