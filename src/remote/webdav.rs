//! WebDAV transport over blocking `reqwest`
//!
//! The base URL is `http://server[:port]/path/`, switching to `https` when
//! the port is 443. Requests answered with a transient status (429, 500,
//! 502, 503, 504) are retried with exponential backoff; connection errors
//! and other statuses fail immediately.

use super::{validate_remote_name, RemoteConfig, RemoteKind, RemoteTransport};
use crate::error::{BackupError, Result};
use crate::manifest;
use crate::types::ArchiveRecord;
use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use reqwest::blocking::{Body, Client, RequestBuilder, Response};
use reqwest::{Method, Url};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop><d:resourcetype/><d:getlastmodified/><d:getcontentlength/></d:prop>
</d:propfind>"#;

/// Retry schedule for transient HTTP failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry, doubled for each further one
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Whether a status is worth another attempt
    pub fn should_retry(status: u16) -> bool {
        matches!(status, 429 | 500 | 502 | 503 | 504)
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

/// WebDAV collection addressed by a base URL
pub struct WebDavTransport {
    base: Url,
    username: String,
    password: String,
    retry: RetryPolicy,
    client: Option<Client>,
}

impl WebDavTransport {
    /// Prepare a WebDAV transport; the HTTP client is built on `connect`
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        Ok(Self {
            base: base_url(config)?,
            username: config.username.clone(),
            password: config.password.clone(),
            retry: RetryPolicy::default(),
            client: None,
        })
    }

    /// Replace the retry schedule
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Collection URL, always ending in `/`
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| BackupError::transport("WebDAV client is not connected"))
    }

    fn file_url(&self, name: &str) -> Result<Url> {
        validate_remote_name(name)?;
        self.base
            .join(name)
            .map_err(|e| BackupError::transport(format!("bad WebDAV URL for {}: {}", name, e)))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        if self.username.is_empty() {
            request
        } else {
            request.basic_auth(&self.username, Some(&self.password))
        }
    }

    /// Send a request, retrying transient statuses
    ///
    /// Returns the last response whatever its status; `build` is called
    /// again for every attempt.
    fn send<F>(&self, method: &Method, url: &Url, mut build: F) -> Result<Response>
    where
        F: FnMut(&Client) -> Result<RequestBuilder>,
    {
        let client = self.client()?;
        let mut attempt = 0;
        loop {
            let request = self.authorize(build(client)?);
            let response = request.send()?;
            let status = response.status().as_u16();
            if !RetryPolicy::should_retry(status) || attempt >= self.retry.max_retries {
                return Ok(response);
            }
            let delay = self.retry.delay(attempt);
            warn!(
                "{} {} returned {}, retrying in {}",
                method,
                url,
                status,
                humantime::format_duration(delay)
            );
            thread::sleep(delay);
            attempt += 1;
        }
    }

    fn propfind(&self, url: &Url, depth: &'static str) -> Result<Response> {
        let method = propfind_method()?;
        self.send(&method, url, |client| {
            Ok(client
                .request(method.clone(), url.clone())
                .header("Depth", depth)
                .header("Content-Type", "application/xml")
                .body(PROPFIND_BODY))
        })
    }

    /// Check the base collection exists, creating it when missing
    fn probe(&self) -> Result<()> {
        let response = self.propfind(&self.base, "0")?;
        match response.status().as_u16() {
            200..=299 => Ok(()),
            404 => self.create_collections(),
            status => Err(status_error(&propfind_method()?, &self.base, status)),
        }
    }

    /// Create the base collection and its parents
    fn create_collections(&self) -> Result<()> {
        let mkcol = Method::from_bytes(b"MKCOL")
            .map_err(|e| BackupError::internal(format!("MKCOL: {}", e)))?;
        let segments: Vec<String> = self
            .base
            .path_segments()
            .map(|segments| {
                segments
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut url = self.base.clone();
        url.set_path("/");
        for segment in segments {
            url = url
                .join(&format!("{}/", segment))
                .map_err(|e| BackupError::transport(e.to_string()))?;
            let response = self.send(&mkcol, &url, |client| {
                Ok(client.request(mkcol.clone(), url.clone()))
            })?;
            // 405: already exists
            match response.status().as_u16() {
                200..=299 | 405 => debug!("Collection {} ready", url),
                status => return Err(status_error(&mkcol, &url, status)),
            }
        }
        Ok(())
    }
}

impl RemoteTransport for WebDavTransport {
    fn kind(&self) -> RemoteKind {
        RemoteKind::WebDav
    }

    fn connect(&mut self) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }
        self.client = Some(Client::builder().timeout(REQUEST_TIMEOUT).build()?);
        if let Err(e) = self.probe() {
            self.client = None;
            return Err(e);
        }
        info!("Connected to {}", self.base);
        Ok(())
    }

    fn upload(&mut self, local: &Path, remote_name: &str) -> Result<()> {
        let url = self.file_url(remote_name)?;
        let length = std::fs::metadata(local)?.len();
        let response = self.send(&Method::PUT, &url, |client| {
            let file = File::open(local)?;
            Ok(client.put(url.clone()).body(Body::sized(file, length)))
        })?;
        check_success(response, &Method::PUT, &url)?;
        debug!("Uploaded {} bytes to {}", length, url);
        Ok(())
    }

    fn download(&mut self, remote_name: &str, local: &Path) -> Result<()> {
        let url = self.file_url(remote_name)?;
        let response = self.send(&Method::GET, &url, |client| Ok(client.get(url.clone())))?;
        let mut response = check_success(response, &Method::GET, &url)?;
        let mut writer = BufWriter::new(File::create(local)?);
        response.copy_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    fn list_files(&mut self) -> Result<Vec<ArchiveRecord>> {
        let base = self.base.clone();
        let response = self.propfind(&base, "1")?;
        let body = check_success(response, &propfind_method()?, &base)?.text()?;

        let mut records: Vec<ArchiveRecord> = parse_multistatus(&body)
            .into_iter()
            .filter(|entry| !entry.is_collection && manifest::is_archive_name(&entry.name))
            .map(|entry| {
                let modified = entry
                    .modified
                    .or_else(|| manifest::archive_timestamp(&entry.name).map(|t| t.and_utc()))
                    .unwrap_or_else(Utc::now);
                ArchiveRecord {
                    name: entry.name,
                    modified,
                    size: entry.size,
                }
            })
            .collect();
        records.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.name.cmp(&a.name)));
        Ok(records)
    }

    fn delete(&mut self, remote_name: &str) -> Result<()> {
        let url = self.file_url(remote_name)?;
        let response = self.send(&Method::DELETE, &url, |client| Ok(client.delete(url.clone())))?;
        if response.status().as_u16() == 404 {
            return Ok(());
        }
        check_success(response, &Method::DELETE, &url)?;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.client = None;
        Ok(())
    }
}

fn propfind_method() -> Result<Method> {
    Method::from_bytes(b"PROPFIND").map_err(|e| BackupError::internal(format!("PROPFIND: {}", e)))
}

fn status_error(method: &Method, url: &Url, status: u16) -> BackupError {
    BackupError::HttpStatus {
        method: method.to_string(),
        url: url.to_string(),
        status,
    }
}

fn check_success(response: Response, method: &Method, url: &Url) -> Result<Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(status_error(method, url, response.status().as_u16()))
    }
}

/// Collection URL for a remote configuration
pub fn base_url(config: &RemoteConfig) -> Result<Url> {
    let location = config.location()?;
    let port = config.effective_port();
    let scheme = if port == 443 { "https" } else { "http" };
    let authority = match port {
        80 | 443 => location.server.clone(),
        port => format!("{}:{}", location.server, port),
    };
    let path = location.joined();
    let raw = if path.is_empty() {
        format!("{}://{}/", scheme, authority)
    } else {
        format!("{}://{}/{}/", scheme, authority, path)
    };
    Url::parse(&raw).map_err(|e| BackupError::config(format!("invalid WebDAV URL {}: {}", raw, e)))
}

/// One `<response>` of a PROPFIND reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DavEntry {
    /// Last path segment of the href, percent-decoded
    pub name: String,
    /// Whether the resource is a collection
    pub is_collection: bool,
    /// `getlastmodified`
    pub modified: Option<DateTime<Utc>>,
    /// `getcontentlength`
    pub size: Option<u64>,
}

/// Parse a `207 Multi-Status` body, ignoring namespace prefixes
pub fn parse_multistatus(xml: &str) -> Vec<DavEntry> {
    elements(xml, "response")
        .into_iter()
        .filter_map(|response| {
            let href = unescape(elements(response, "href").first()?.trim());
            let name = href
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .map(|segment| percent_decode_str(segment).decode_utf8_lossy().into_owned())
                .filter(|name| !name.is_empty())?;

            let is_collection = elements(response, "resourcetype")
                .first()
                .map(|kind| !elements(kind, "collection").is_empty())
                .unwrap_or(false);
            let modified = elements(response, "getlastmodified")
                .first()
                .and_then(|text| DateTime::parse_from_rfc2822(text.trim()).ok())
                .map(|time| time.with_timezone(&Utc));
            let size = elements(response, "getcontentlength")
                .first()
                .and_then(|text| text.trim().parse().ok());

            Some(DavEntry {
                name,
                is_collection,
                modified,
                size,
            })
        })
        .collect()
}

/// Inner text of every element whose local name is `local`
fn elements<'a>(xml: &'a str, local: &str) -> Vec<&'a str> {
    let mut found = Vec::new();
    let mut pos = 0;
    while let Some(offset) = xml[pos..].find('<') {
        let start = pos + offset;
        let rest = &xml[start + 1..];
        pos = start + 1;

        let name_len = rest
            .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
            .unwrap_or(rest.len());
        let qualified = &rest[..name_len];
        if qualified.is_empty() || qualified.starts_with(['?', '!']) {
            continue;
        }
        let local_name = qualified.rsplit(':').next().unwrap_or(qualified);
        if local_name != local {
            continue;
        }

        let Some(tag_len) = rest.find('>') else {
            break;
        };
        let content_start = start + 1 + tag_len + 1;
        if rest[..tag_len].ends_with('/') {
            found.push("");
            pos = content_start;
            continue;
        }
        let Some(content_len) = closing_tag(&xml[content_start..], qualified) else {
            break;
        };
        found.push(&xml[content_start..content_start + content_len]);
        pos = content_start + content_len;
    }
    found
}

/// Offset of the first `</qualified>` closing tag in `xml`
fn closing_tag(xml: &str, qualified: &str) -> Option<usize> {
    let needle = format!("</{}", qualified);
    let mut pos = 0;
    while let Some(offset) = xml[pos..].find(needle.as_str()) {
        let at = pos + offset;
        let after = xml[at + needle.len()..].chars().next();
        if matches!(after, Some(c) if c == '>' || c.is_whitespace()) {
            return Some(at);
        }
        pos = at + needle.len();
    }
    None
}

/// Decode the predefined XML entities and `&#..;` character references
fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let decoded = rest.find(';').and_then(|end| {
            let entity = &rest[1..end];
            let c = match entity {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "amp" => Some('&'),
                _ => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .map(|hex| u32::from_str_radix(hex, 16))
                    .or_else(|| entity.strip_prefix('#').map(str::parse::<u32>))
                    .and_then(|code| code.ok())
                    .and_then(char::from_u32),
            };
            c.map(|c| (c, end))
        });
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
