use async_trait::async_trait;
use gallery_storage_core::{
    bootstrap_chain, decode_image, encode_png, join_remote, leftover_note, listing_entries,
    partial_name, ArtifactName, ConnectionSpec, ConnectorId, ImageArtifact, PixelBuffer,
    RawEntry, SftpSpec, StorageConnector, StorageError, TextMetadata, Timeouts,
};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::OpenFlags;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::session::{map_sftp_error, Connected};

/// Connector writing into a directory tree over SFTP.
///
/// One SSH connection per connector; the mutex serializes calls against it.
/// `None` after release.
pub struct SftpConnector {
    id: ConnectorId,
    root: String,
    session: Mutex<Option<Connected>>,
    timeouts: Timeouts,
}

impl SftpConnector {
    pub async fn connect(spec: &SftpSpec, timeouts: Timeouts) -> Result<Self, StorageError> {
        let id = ConnectionSpec::Sftp(spec.clone()).connector_id();
        let connected = timeouts
            .connect(
                &format!("SFTP connect to {}:{}", spec.host, spec.port),
                Connected::open(spec),
            )
            .await?;
        Ok(Self {
            id,
            root: spec.remote_path.clone(),
            session: Mutex::new(Some(connected)),
            timeouts,
        })
    }

    fn closed(&self) -> StorageError {
        StorageError::Connection(format!("{} has been released", self.id))
    }

    fn bounded<'a>(&self, sftp: &'a SftpSession) -> BoundedSftp<'a> {
        BoundedSftp {
            sftp,
            timeouts: self.timeouts,
        }
    }
}

/// Remote file operations the bootstrap and upload sequences are built on.
#[async_trait]
pub(crate) trait RemoteFs: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool, StorageError>;
    async fn create_dir(&self, path: &str) -> Result<(), StorageError>;
    async fn write_file(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;
    async fn remove_file(&self, path: &str) -> Result<(), StorageError>;
    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError>;
}

/// An SFTP session with every call bounded by the I/O deadline.
pub(crate) struct BoundedSftp<'a> {
    sftp: &'a SftpSession,
    timeouts: Timeouts,
}

#[async_trait]
impl RemoteFs for BoundedSftp<'_> {
    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        self.timeouts
            .io("SFTP stat", async {
                self.sftp
                    .try_exists(path)
                    .await
                    .map_err(|e| map_sftp_error(&e, path, StorageError::Directory))
            })
            .await
    }

    async fn create_dir(&self, path: &str) -> Result<(), StorageError> {
        self.timeouts
            .io("SFTP mkdir", async {
                self.sftp
                    .create_dir(path)
                    .await
                    .map_err(|e| map_sftp_error(&e, path, StorageError::Directory))
            })
            .await
    }

    async fn write_file(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.timeouts
            .io("SFTP upload", async {
                let mut file = self
                    .sftp
                    .open_with_flags(
                        path,
                        OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
                    )
                    .await
                    .map_err(|e| map_sftp_error(&e, path, StorageError::Transfer))?;
                file.write_all(bytes).await.map_err(|e| {
                    StorageError::Transfer(format!("Failed to write {}: {}", path, e))
                })?;
                file.shutdown().await.map_err(|e| {
                    StorageError::Transfer(format!("Failed to close {}: {}", path, e))
                })
            })
            .await
    }

    async fn remove_file(&self, path: &str) -> Result<(), StorageError> {
        self.timeouts
            .io("SFTP remove", async {
                self.sftp
                    .remove_file(path)
                    .await
                    .map_err(|e| map_sftp_error(&e, path, StorageError::Transfer))
            })
            .await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        self.timeouts
            .io("SFTP rename", async {
                self.sftp
                    .rename(from, to)
                    .await
                    .map_err(|e| map_sftp_error(&e, to, StorageError::Transfer))
            })
            .await
    }
}

/// Create every missing directory of `chain`, in order. Returns the ones
/// created.
pub(crate) async fn ensure_dirs(
    fs: &dyn RemoteFs,
    chain: &[String],
) -> Result<Vec<String>, StorageError> {
    let mut created = Vec::new();
    for dir in chain {
        if fs.exists(dir).await? {
            continue;
        }
        if let Err(e) = fs.create_dir(dir).await {
            // Lost a race with another writer.
            if matches!(fs.exists(dir).await, Ok(true)) {
                continue;
            }
            return Err(e);
        }
        created.push(dir.clone());
    }
    Ok(created)
}

/// Upload to `tmp`, drop any previous `path`, then rename into place. The
/// temporary file is removed on failure, or named in the error if it stays.
pub(crate) async fn write_then_rename(
    fs: &dyn RemoteFs,
    tmp: &str,
    path: &str,
    bytes: &[u8],
) -> Result<(), StorageError> {
    let moved = async {
        fs.write_file(tmp, bytes).await?;
        // SFTPv3 rename refuses to overwrite.
        if fs.exists(path).await? {
            fs.remove_file(path).await?;
        }
        fs.rename(tmp, path).await
    }
    .await;

    match moved {
        Ok(()) => Ok(()),
        Err(e) => {
            let removed = fs.remove_file(tmp).await.is_ok();
            Err(e.with_suffix(&leftover_note(tmp, removed)))
        }
    }
}

#[async_trait]
impl StorageConnector for SftpConnector {
    fn id(&self) -> &ConnectorId {
        &self.id
    }

    #[instrument(skip(self), fields(connector = %self.id), level = "debug")]
    async fn bootstrap(&self) -> Result<(), StorageError> {
        let guard = self.session.lock().await;
        let conn = guard.as_ref().ok_or_else(|| self.closed())?;

        let created = ensure_dirs(&self.bounded(&conn.sftp), &bootstrap_chain(&self.root)).await?;
        for dir in created {
            info!("Created {}", dir);
        }
        Ok(())
    }

    #[instrument(skip(self, image, metadata), fields(connector = %self.id), level = "debug")]
    async fn store(
        &self,
        name: &str,
        image: &PixelBuffer,
        metadata: &TextMetadata,
    ) -> Result<String, StorageError> {
        let target = ArtifactName::parse(name)?;
        let bytes = encode_png(image, metadata)?;
        let dir = join_remote(&[&self.root, &target.subdir]);
        let file_name = target.file_name();
        let path = join_remote(&[&dir, &file_name]);
        let tmp = join_remote(&[
            &dir,
            &partial_name(&file_name, &uuid::Uuid::new_v4().simple().to_string()),
        ]);

        let guard = self.session.lock().await;
        let sftp = &guard.as_ref().ok_or_else(|| self.closed())?.sftp;
        write_then_rename(&self.bounded(sftp), &tmp, &path, &bytes).await?;

        debug!("Stored {}", path);
        Ok(path)
    }

    #[instrument(skip(self), fields(connector = %self.id), level = "debug")]
    async fn list(&self, subdir: &str) -> Result<Vec<String>, StorageError> {
        let dir = join_remote(&[&self.root, subdir]);
        let guard = self.session.lock().await;
        let sftp = &guard.as_ref().ok_or_else(|| self.closed())?.sftp;

        let read_dir = self
            .timeouts
            .io("SFTP list", async {
                sftp.read_dir(&dir)
                    .await
                    .map_err(|e| map_sftp_error(&e, &dir, StorageError::Directory))
            })
            .await?;
        drop(guard);

        let raw = read_dir
            .into_iter()
            .map(|entry| {
                let meta = entry.metadata();
                RawEntry {
                    name: entry.file_name(),
                    is_dir: meta.is_dir(),
                    mtime: u64::from(meta.mtime.unwrap_or(0)),
                }
            })
            .collect();

        Ok(listing_entries(raw)
            .into_iter()
            .map(|name| join_remote(&[&dir, &name]))
            .collect())
    }

    #[instrument(skip(self), fields(connector = %self.id), level = "debug")]
    async fn fetch(&self, path: &str) -> Result<ImageArtifact, StorageError> {
        let guard = self.session.lock().await;
        let sftp = &guard.as_ref().ok_or_else(|| self.closed())?.sftp;

        let bytes = self
            .timeouts
            .io("SFTP download", async {
                sftp.read(path)
                    .await
                    .map_err(|e| map_sftp_error(&e, path, StorageError::Transfer))
            })
            .await?;
        drop(guard);
        decode_image(&bytes)
    }

    async fn release(&self) -> Result<(), StorageError> {
        let connected = self.session.lock().await.take();
        match connected {
            Some(connected) => {
                self.timeouts
                    .io(&format!("SFTP disconnect from {}", self.id), connected.close())
                    .await?;
                info!("Released {}", self.id);
                Ok(())
            }
            None => Ok(()),
        }
    }
}
