//! Connection specifications and the parsing of delimited multi-value options.
//!
//! Each backend kind is configured by a handful of comma-separated option
//! strings, one item per connection instance. Item `i` of every list belongs
//! to connection `i`:
//!
//! ```text
//! smb path           = sd_web_ui,archive
//! smb user_passwd    = alice:pw1,bob:pw2
//! smb ip_port        = 10.0.0.2:445,10.0.0.3:445
//! smb server_service = NAS:share,BACKUP:images
//! ```
//!
//! A kind whose required options are all empty is simply unconfigured.
//! Mismatched list lengths or malformed `a:b` items reject the whole kind
//! with `StorageError::Config`. Items with an empty required field are dropped.

use std::fmt;
use std::path::PathBuf;

use tracing::debug;

use crate::connector::{BackendKind, ConnectorId};
use crate::error::StorageError;
use crate::layout::DEFAULT_ROOT;

pub const DEFAULT_SMB_PORT: u16 = 445;
pub const DEFAULT_SFTP_PORT: u16 = 22;
pub const DEFAULT_WORKGROUP: &str = "WORKGROUP";
pub const DEFAULT_LOCAL_NAME: &str = "local";

/// A credential that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Password(String);

impl Password {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmbSpec {
    pub username: String,
    pub password: Password,
    pub local_name: String,
    pub server_name: String,
    pub service_name: String,
    pub domain: String,
    pub ip: String,
    pub port: u16,
    pub root: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SftpSpec {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Password,
    pub remote_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudDriveSpec {
    /// OAuth client secret JSON downloaded from the provider console.
    pub client_secret_path: PathBuf,
    /// Name of the single root-level folder images are uploaded to.
    pub folder_name: String,
    /// Local file the OAuth token is persisted to.
    pub credentials_path: PathBuf,
}

/// One configured connection; each produces exactly one connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSpec {
    Smb(SmbSpec),
    Sftp(SftpSpec),
    CloudDrive(CloudDriveSpec),
}

impl ConnectionSpec {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Smb(_) => BackendKind::Smb,
            Self::Sftp(_) => BackendKind::Sftp,
            Self::CloudDrive(_) => BackendKind::CloudDrive,
        }
    }

    pub fn connector_id(&self) -> ConnectorId {
        let location = match self {
            Self::Smb(s) => format!(
                "smb://{}@{}:{}/{}/{}",
                s.username, s.ip, s.port, s.service_name, s.root
            ),
            Self::Sftp(s) => format!(
                "sftp://{}@{}:{}{}",
                s.username,
                s.host,
                s.port,
                if s.remote_path.starts_with('/') {
                    s.remote_path.clone()
                } else {
                    format!("/{}", s.remote_path)
                }
            ),
            Self::CloudDrive(s) => format!("gdrive://{}", s.folder_name),
        };
        ConnectorId::new(self.kind(), location)
    }
}

/// Raw SMB option strings.
#[derive(Debug, Clone, Default)]
pub struct SmbOptions {
    pub path: String,
    pub user_passwd: String,
    pub ip_port: String,
    pub server_service: String,
    pub domain: String,
}

/// Raw SFTP option strings.
#[derive(Debug, Clone, Default)]
pub struct SftpOptions {
    pub user_passwd: String,
    pub ip_port: String,
    pub remote_path: String,
}

/// Raw cloud drive options.
#[derive(Debug, Clone, Default)]
pub struct CloudDriveOptions {
    pub client_secret: String,
    pub save_dir: String,
    pub credentials_path: PathBuf,
}

fn split_list(value: &str) -> Vec<&str> {
    if value.trim().is_empty() {
        return Vec::new();
    }
    value.split(',').map(str::trim).collect()
}

fn split_pair<'a>(item: &'a str, what: &str) -> Result<(&'a str, &'a str), StorageError> {
    item.split_once(':')
        .map(|(a, b)| (a.trim(), b.trim()))
        .ok_or_else(|| StorageError::Config(format!("{} item '{}' must look like a:b", what, redact(item))))
}

fn split_host_port(item: &str) -> Result<(&str, &str), StorageError> {
    item.rsplit_once(':')
        .map(|(a, b)| (a.trim(), b.trim()))
        .ok_or_else(|| StorageError::Config(format!("address '{}' must look like host:port", item)))
}

fn parse_port(value: &str, default: u16) -> Result<u16, StorageError> {
    if value.is_empty() {
        return Ok(default);
    }
    value
        .parse()
        .map_err(|_| StorageError::Config(format!("invalid port '{}'", value)))
}

fn redact(item: &str) -> String {
    match item.split_once(':') {
        Some((user, _)) => format!("{}:***", user),
        None => "***".to_string(),
    }
}

fn check_len(name: &str, len: usize, expected: usize) -> Result<(), StorageError> {
    if len != expected {
        return Err(StorageError::Config(format!(
            "{} has {} item(s) but {} connection(s) are configured",
            name, len, expected
        )));
    }
    Ok(())
}

/// Parse SMB connections. `Ok(vec![])` means SMB is not configured.
pub fn parse_smb_specs(opts: &SmbOptions) -> Result<Vec<SmbSpec>, StorageError> {
    let user_passwd = split_list(&opts.user_passwd);
    let ip_port = split_list(&opts.ip_port);
    let server_service = split_list(&opts.server_service);
    let paths = split_list(&opts.path);
    let domains = split_list(&opts.domain);

    let required = [&user_passwd, &ip_port, &server_service];
    if required.iter().all(|l| l.is_empty()) {
        return Ok(Vec::new());
    }
    if required.iter().any(|l| l.is_empty()) {
        return Err(StorageError::Config(
            "SMB needs user_passwd, ip_port and server_service together".to_string(),
        ));
    }

    let count = user_passwd.len();
    check_len("SMB ip_port", ip_port.len(), count)?;
    check_len("SMB server_service", server_service.len(), count)?;
    if !paths.is_empty() {
        check_len("SMB path", paths.len(), count)?;
    }
    if domains.len() > count {
        check_len("SMB domain", domains.len(), count)?;
    }

    let mut specs = Vec::with_capacity(count);
    for i in 0..count {
        let (username, password) = split_pair(user_passwd[i], "SMB user_passwd")?;
        let (ip, port) = split_host_port(ip_port[i])?;
        let (server_name, service_name) = split_pair(server_service[i], "SMB server_service")?;
        let port = parse_port(port, DEFAULT_SMB_PORT)?;

        if username.is_empty() || password.is_empty() || ip.is_empty() || service_name.is_empty() {
            debug!("Dropping SMB connection #{} with empty required fields", i);
            continue;
        }

        let root = paths
            .get(i)
            .filter(|p| !p.is_empty())
            .copied()
            .unwrap_or(DEFAULT_ROOT);
        let domain = domains
            .get(i)
            .filter(|d| !d.is_empty())
            .copied()
            .unwrap_or(DEFAULT_WORKGROUP);

        specs.push(SmbSpec {
            username: username.to_string(),
            password: Password::new(password),
            local_name: DEFAULT_LOCAL_NAME.to_string(),
            server_name: (if server_name.is_empty() { ip } else { server_name }).to_string(),
            service_name: service_name.to_string(),
            domain: domain.to_string(),
            ip: ip.to_string(),
            port,
            root: root.to_string(),
        });
    }

    Ok(specs)
}

/// Parse SFTP connections. `Ok(vec![])` means SFTP is not configured.
pub fn parse_sftp_specs(opts: &SftpOptions) -> Result<Vec<SftpSpec>, StorageError> {
    let user_passwd = split_list(&opts.user_passwd);
    let ip_port = split_list(&opts.ip_port);
    let remote_paths = split_list(&opts.remote_path);

    if user_passwd.is_empty() && ip_port.is_empty() {
        return Ok(Vec::new());
    }
    if user_passwd.is_empty() || ip_port.is_empty() {
        return Err(StorageError::Config(
            "SFTP needs user_passwd and ip_port together".to_string(),
        ));
    }

    let count = user_passwd.len();
    check_len("SFTP ip_port", ip_port.len(), count)?;
    if !remote_paths.is_empty() {
        check_len("SFTP remote_path", remote_paths.len(), count)?;
    }

    let mut specs = Vec::with_capacity(count);
    for i in 0..count {
        let (username, password) = split_pair(user_passwd[i], "SFTP user_passwd")?;
        let (host, port) = split_host_port(ip_port[i])?;
        let port = parse_port(port, DEFAULT_SFTP_PORT)?;

        if username.is_empty() || password.is_empty() || host.is_empty() {
            debug!("Dropping SFTP connection #{} with empty required fields", i);
            continue;
        }

        let remote_path = remote_paths
            .get(i)
            .filter(|p| !p.is_empty())
            .map(|p| p.to_string())
            .unwrap_or_else(|| format!("/{}", DEFAULT_ROOT));

        specs.push(SftpSpec {
            host: host.to_string(),
            port,
            username: username.to_string(),
            password: Password::new(password),
            remote_path,
        });
    }

    Ok(specs)
}

/// Parse the single cloud drive connection, if configured.
pub fn parse_cloud_drive_spec(
    opts: &CloudDriveOptions,
) -> Result<Option<CloudDriveSpec>, StorageError> {
    let secret = opts.client_secret.trim();
    let folder = opts.save_dir.trim();

    if secret.is_empty() && folder.is_empty() {
        return Ok(None);
    }
    if secret.is_empty() || folder.is_empty() {
        return Err(StorageError::Config(
            "Cloud drive needs both a client secret path and a folder name".to_string(),
        ));
    }

    Ok(Some(CloudDriveSpec {
        client_secret_path: PathBuf::from(secret),
        folder_name: folder.to_string(),
        credentials_path: opts.credentials_path.clone(),
    }))
}
