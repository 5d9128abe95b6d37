use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use gallery_storage_core::{
    decode_image, encode_png, ArtifactName, CloudDriveSpec, ConnectionSpec, ConnectorId,
    ImageArtifact, PixelBuffer, StorageConnector, StorageError, TextMetadata, Timeouts,
};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::gdrive::{DriveEndpoints, GDriveClient};
use crate::secret::ClientSecret;
use crate::token_manager::TokenManager;

/// Connector keeping every artifact in one flat Drive folder.
///
/// Sub-directories are not mirrored: `list` ignores its argument and returns
/// file ids in creation order, and `fetch` takes one of those ids.
pub struct GDriveConnector {
    id: ConnectorId,
    folder_name: String,
    client: GDriveClient,
    tokens: TokenManager,
    folder_id: Mutex<Option<String>>,
    timeouts: Timeouts,
    released: AtomicBool,
}

impl GDriveConnector {
    /// Load the client secret and any persisted token. No network traffic.
    pub async fn new(spec: &CloudDriveSpec, timeouts: Timeouts) -> Result<Self, StorageError> {
        Self::with_endpoints(spec, timeouts, DriveEndpoints::default()).await
    }

    pub async fn with_endpoints(
        spec: &CloudDriveSpec,
        timeouts: Timeouts,
        endpoints: DriveEndpoints,
    ) -> Result<Self, StorageError> {
        let secret = ClientSecret::load(&spec.client_secret_path).await?;
        let tokens = TokenManager::load(
            secret,
            spec.credentials_path.clone(),
            endpoints.token_url.clone(),
        )
        .await;
        Ok(Self {
            id: ConnectionSpec::CloudDrive(spec.clone()).connector_id(),
            folder_name: spec.folder_name.clone(),
            client: GDriveClient::new(endpoints),
            tokens,
            folder_id: Mutex::new(None),
            timeouts,
            released: AtomicBool::new(false),
        })
    }

    /// Token handling, for driving the consent step.
    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(StorageError::Connection(format!(
                "{} has been released",
                self.id
            )));
        }
        Ok(())
    }

    async fn token(&self) -> Result<String, StorageError> {
        self.timeouts
            .connect("OAuth token", self.tokens.get_valid_token())
            .await
    }

    /// Folder id resolved by `bootstrap`, resolving it now if needed.
    async fn folder_id(&self) -> Result<String, StorageError> {
        if let Some(id) = self.folder_id.lock().await.clone() {
            return Ok(id);
        }
        self.bootstrap().await?;
        self.folder_id.lock().await.clone().ok_or_else(|| {
            StorageError::Directory(format!("Folder {} could not be resolved", self.folder_name))
        })
    }
}

#[async_trait]
impl StorageConnector for GDriveConnector {
    fn id(&self) -> &ConnectorId {
        &self.id
    }

    #[instrument(skip(self), fields(connector = %self.id), level = "debug")]
    async fn bootstrap(&self) -> Result<(), StorageError> {
        self.ensure_open()?;
        let mut folder = self.folder_id.lock().await;
        if folder.is_some() {
            return Ok(());
        }
        let token = self.token().await?;

        let found = self
            .timeouts
            .io("Drive folder search", async {
                self.client
                    .find_root_folder(&token, &self.folder_name)
                    .await
                    .map_err(|e| StorageError::Directory(e.to_string()))
            })
            .await?;

        let id = match found {
            Some(id) => {
                debug!("Using existing folder {} ({})", self.folder_name, id);
                id
            }
            None => {
                let id = self
                    .timeouts
                    .io("Drive folder create", async {
                        self.client
                            .create_root_folder(&token, &self.folder_name)
                            .await
                            .map_err(|e| StorageError::Directory(e.to_string()))
                    })
                    .await?;
                info!("Created Drive folder {} ({})", self.folder_name, id);
                id
            }
        };
        *folder = Some(id);
        Ok(())
    }

    #[instrument(skip(self, image, metadata), fields(connector = %self.id), level = "debug")]
    async fn store(
        &self,
        name: &str,
        image: &PixelBuffer,
        metadata: &TextMetadata,
    ) -> Result<String, StorageError> {
        self.ensure_open()?;
        let file_name = ArtifactName::parse(name)?.file_name();
        let bytes = encode_png(image, metadata)?;
        let folder_id = self.folder_id().await?;
        let token = self.token().await?;

        let file_id = self
            .timeouts
            .io("Drive upload", async {
                self.client
                    .upload_file(&token, &folder_id, &file_name, "image/png", bytes)
                    .await
                    .map_err(|e| StorageError::Transfer(e.to_string()))
            })
            .await?;

        info!("Uploaded {} to Drive as {}", file_name, file_id);
        Ok(file_id)
    }

    #[instrument(skip(self), fields(connector = %self.id), level = "debug")]
    async fn list(&self, _subdir: &str) -> Result<Vec<String>, StorageError> {
        self.ensure_open()?;
        let folder_id = self.folder_id().await?;
        let token = self.token().await?;

        let files = self
            .timeouts
            .io("Drive list", async {
                self.client
                    .list_folder(&token, &folder_id)
                    .await
                    .map_err(|e| StorageError::Directory(e.to_string()))
            })
            .await?;
        Ok(files.into_iter().map(|f| f.id).collect())
    }

    #[instrument(skip(self), fields(connector = %self.id), level = "debug")]
    async fn fetch(&self, path: &str) -> Result<ImageArtifact, StorageError> {
        self.ensure_open()?;
        let token = self.token().await?;

        let data = self
            .timeouts
            .io("Drive download", async {
                self.client
                    .download_file(&token, path)
                    .await
                    .map_err(|e| StorageError::Transfer(e.to_string()))
            })
            .await?;

        match data {
            Some(bytes) => decode_image(&bytes),
            None => Err(StorageError::NotFound(format!(
                "Google Drive file not found: {}",
                path
            ))),
        }
    }

    async fn release(&self) -> Result<(), StorageError> {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.folder_id.lock().await.take();
            debug!("Released {}", self.id);
        }
        Ok(())
    }
}
