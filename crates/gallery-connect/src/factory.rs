//! Builds the backend matching a `ConnectionSpec`.

use std::sync::Arc;

use async_trait::async_trait;
use gallery_storage_core::{ConnectionSpec, StorageConnector, StorageError, Timeouts};
use gallery_storage_gdrive::GDriveConnector;
use gallery_storage_sftp::SftpConnector;
use gallery_storage_smb::SmbConnector;
use tracing::{info, warn};

/// Turns a connection spec into a ready connector.
#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    /// Connect and bootstrap. A connector that fails to bootstrap is released
    /// before the error is returned.
    async fn connect(
        &self,
        spec: &ConnectionSpec,
        timeouts: Timeouts,
    ) -> Result<Arc<dyn StorageConnector>, StorageError>;
}

/// Factory for the real network backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct BackendFactory;

#[async_trait]
impl ConnectorFactory for BackendFactory {
    async fn connect(
        &self,
        spec: &ConnectionSpec,
        timeouts: Timeouts,
    ) -> Result<Arc<dyn StorageConnector>, StorageError> {
        let connector: Arc<dyn StorageConnector> = match spec {
            ConnectionSpec::Smb(smb) => Arc::new(SmbConnector::connect(smb, timeouts).await?),
            ConnectionSpec::Sftp(sftp) => Arc::new(SftpConnector::connect(sftp, timeouts).await?),
            ConnectionSpec::CloudDrive(drive) => {
                Arc::new(GDriveConnector::new(drive, timeouts).await?)
            }
        };
        bootstrap_or_release(connector).await
    }
}

pub(crate) async fn bootstrap_or_release(
    connector: Arc<dyn StorageConnector>,
) -> Result<Arc<dyn StorageConnector>, StorageError> {
    if let Err(e) = connector.bootstrap().await {
        if let Err(release_err) = connector.release().await {
            warn!(
                "Releasing {} after failed bootstrap also failed: {}",
                connector.id(),
                release_err
            );
        }
        return Err(e);
    }
    info!("Connector ready: {}", connector.id());
    Ok(connector)
}

/// Factory handing out in-memory connectors, recording each one built.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct MemoryFactory {
    /// Locations whose connect attempt fails.
    pub unreachable: Vec<String>,
    /// Locations whose connector rejects every store.
    pub rejecting: Vec<String>,
    /// Locations whose connect attempt takes 200ms.
    pub slow: Vec<String>,
    pub built: std::sync::Mutex<Vec<Arc<gallery_storage_core::MemoryConnector>>>,
}

#[cfg(test)]
impl MemoryFactory {
    pub fn built(&self) -> Vec<Arc<gallery_storage_core::MemoryConnector>> {
        self.built.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl ConnectorFactory for MemoryFactory {
    async fn connect(
        &self,
        spec: &ConnectionSpec,
        _timeouts: Timeouts,
    ) -> Result<Arc<dyn StorageConnector>, StorageError> {
        let location = spec.connector_id().location;
        if self.slow.contains(&location) {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
        if self.unreachable.contains(&location) {
            return Err(StorageError::Connection(format!("{} unreachable", location)));
        }
        let mut memory = gallery_storage_core::MemoryConnector::new(spec.kind(), &location);
        if self.rejecting.contains(&location) {
            memory = memory.failing();
        }
        let memory = Arc::new(memory);
        self.built.lock().unwrap().push(memory.clone());
        bootstrap_or_release(memory).await
    }
}

/// Connector whose `release` never completes.
#[cfg(test)]
pub(crate) struct StuckRelease {
    pub id: gallery_storage_core::ConnectorId,
}

#[cfg(test)]
#[async_trait]
impl StorageConnector for StuckRelease {
    fn id(&self) -> &gallery_storage_core::ConnectorId {
        &self.id
    }
    async fn bootstrap(&self) -> Result<(), StorageError> {
        Ok(())
    }
    async fn store(
        &self,
        name: &str,
        _image: &gallery_storage_core::PixelBuffer,
        _metadata: &gallery_storage_core::TextMetadata,
    ) -> Result<String, StorageError> {
        Ok(name.to_string())
    }
    async fn list(&self, _subdir: &str) -> Result<Vec<String>, StorageError> {
        Ok(Vec::new())
    }
    async fn fetch(&self, path: &str) -> Result<gallery_storage_core::ImageArtifact, StorageError> {
        Err(StorageError::NotFound(path.to_string()))
    }
    async fn release(&self) -> Result<(), StorageError> {
        std::future::pending::<Result<(), StorageError>>().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gallery_storage_core::{BackendKind, MemoryConnector, StorageConnector};

    #[tokio::test]
    async fn test_bootstrap_or_release_ready() {
        let memory = Arc::new(MemoryConnector::new(BackendKind::Smb, "root"));
        let connector = bootstrap_or_release(memory.clone()).await.unwrap();
        assert_eq!(connector.id(), memory.id());
        assert_eq!(memory.directories().len(), 6);
        assert!(!memory.is_released());
    }

    #[tokio::test]
    async fn test_bootstrap_failure_releases() {
        let memory = Arc::new(MemoryConnector::new(BackendKind::Smb, "root"));
        memory.release().await.unwrap();
        let before = memory.release_calls();

        let result = bootstrap_or_release(memory.clone()).await;
        assert!(matches!(result, Err(StorageError::Connection(_))));
        assert_eq!(memory.release_calls(), before + 1);
    }
}
