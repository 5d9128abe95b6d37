use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::artifact::{ImageArtifact, PixelBuffer, TextMetadata};
use crate::error::StorageError;

/// Remote storage protocols supported by the connectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Smb,
    Sftp,
    CloudDrive,
}

impl BackendKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Smb => "SMB",
            Self::Sftp => "SFTP",
            Self::CloudDrive => "CloudDrive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "smb" => Some(Self::Smb),
            "sftp" => Some(Self::Sftp),
            "clouddrive" | "cloud_drive" | "gdrive" => Some(Self::CloudDrive),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Identity of one connector instance, used in logs and aggregate errors.
/// Never carries credentials.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectorId {
    pub kind: BackendKind,
    pub location: String,
}

impl ConnectorId {
    pub fn new(kind: BackendKind, location: impl Into<String>) -> Self {
        Self {
            kind,
            location: location.into(),
        }
    }
}

impl fmt::Display for ConnectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.location)
    }
}

/// Connect and per-call I/O deadlines applied to every network operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub io: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            io: Duration::from_secs(30),
        }
    }
}

impl Timeouts {
    /// Bound session establishment; expiry is a connection failure.
    pub async fn connect<T, F>(&self, what: &str, fut: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>>,
    {
        tokio::time::timeout(self.connect, fut)
            .await
            .map_err(|_| {
                StorageError::Connection(format!(
                    "{} timed out after {}s",
                    what,
                    self.connect.as_secs()
                ))
            })?
    }

    /// Bound a single remote call; expiry is a transfer failure.
    pub async fn io<T, F>(&self, what: &str, fut: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>>,
    {
        tokio::time::timeout(self.io, fut).await.map_err(|_| {
            StorageError::Transfer(format!("{} timed out after {}s", what, self.io.as_secs()))
        })?
    }
}

/// Capability contract every remote storage backend implements.
///
/// A connector owns exactly one backend session. Implementations serialize
/// calls against that session internally, so the trait takes `&self` and a
/// connector can be shared behind an `Arc`.
#[async_trait]
pub trait StorageConnector: Send + Sync {
    fn id(&self) -> &ConnectorId;

    /// Ensure the remote root and the fixed sub-directories exist.
    /// Safe to call repeatedly.
    async fn bootstrap(&self) -> Result<(), StorageError>;

    /// Encode `image` as PNG with `metadata` as text chunks and upload it under
    /// the sub-directory derived from `name`. Returns the remote path written.
    async fn store(
        &self,
        name: &str,
        image: &PixelBuffer,
        metadata: &TextMetadata,
    ) -> Result<String, StorageError>;

    /// Remote paths under `subdir`, oldest first, without `.`/`..`.
    async fn list(&self, subdir: &str) -> Result<Vec<String>, StorageError>;

    /// Download and decode one listed entry.
    async fn fetch(&self, path: &str) -> Result<ImageArtifact, StorageError>;

    /// Close the session. Idempotent, and safe on a half-open connector.
    async fn release(&self) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!(BackendKind::parse("SMB"), Some(BackendKind::Smb));
        assert_eq!(BackendKind::parse("sftp"), Some(BackendKind::Sftp));
        assert_eq!(BackendKind::parse("gdrive"), Some(BackendKind::CloudDrive));
        assert_eq!(BackendKind::parse("ftp"), None);
    }

    #[tokio::test]
    async fn test_io_timeout_maps_to_transfer_error() {
        let timeouts = Timeouts {
            connect: Duration::from_millis(10),
            io: Duration::from_millis(10),
        };
        let result: Result<(), StorageError> = timeouts
            .io("slow read", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(StorageError::Transfer(m)) if m.contains("slow read")));
    }

    #[tokio::test]
    async fn test_connect_timeout_maps_to_connection_error() {
        let timeouts = Timeouts {
            connect: Duration::from_millis(10),
            io: Duration::from_millis(10),
        };
        let result: Result<(), StorageError> = timeouts
            .connect("handshake", std::future::pending())
            .await;
        assert!(matches!(result, Err(StorageError::Connection(_))));
    }
}
