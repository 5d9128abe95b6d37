use std::io::{Read, Write};

use async_trait::async_trait;
use gallery_storage_core::{
    bootstrap_chain, decode_image, encode_png, join_remote, leftover_note, listing_entries,
    partial_name, ArtifactName, ConnectionSpec, ConnectorId, ImageArtifact, PixelBuffer,
    RawEntry, SmbSpec, StorageConnector, StorageError, TextMetadata, Timeouts,
};
use pavao::{SmbClient, SmbDirent, SmbDirentType, SmbMode, SmbOpenOptions};
use tracing::{debug, instrument, warn};

use crate::session::{is_not_found, SmbSession};

/// Connector writing into a directory tree on an SMB share.
pub struct SmbConnector {
    id: ConnectorId,
    /// Share-relative root, always starting with `/`.
    root: String,
    session: SmbSession,
    timeouts: Timeouts,
}

impl SmbConnector {
    /// Open the share described by `spec`. Fails if the server is
    /// unreachable or rejects the credentials within the connect deadline.
    pub async fn connect(spec: &SmbSpec, timeouts: Timeouts) -> Result<Self, StorageError> {
        let id = ConnectionSpec::Smb(spec.clone()).connector_id();
        let session = timeouts
            .connect(&format!("SMB connect to {}", spec.ip), SmbSession::open(spec))
            .await?;
        Ok(Self {
            id,
            root: share_root(&spec.root),
            session,
            timeouts,
        })
    }

    async fn run<T, F>(&self, what: &str, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&SmbClient) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        self.timeouts.io(what, self.session.run(f)).await
    }
}

/// Share-relative root; libsmbclient paths are always absolute.
fn share_root(root: &str) -> String {
    join_remote(&["/", root])
}

fn ensure_dir(client: &SmbClient, path: &str) -> Result<bool, StorageError> {
    match client.stat(path) {
        Ok(_) => return Ok(false),
        Err(e) if is_not_found(&e.to_string()) => {}
        Err(e) => {
            return Err(StorageError::Directory(format!(
                "Failed to inspect {}: {}",
                path, e
            )))
        }
    }
    match client.mkdir(path, SmbMode::from(0o755)) {
        Ok(()) => Ok(true),
        // Another writer may have created it between stat and mkdir.
        Err(e) if client.stat(path).is_ok() => {
            debug!("mkdir {} raced: {}", path, e);
            Ok(false)
        }
        Err(e) => Err(StorageError::Directory(format!(
            "Failed to create {}: {}",
            path, e
        ))),
    }
}

fn write_then_rename(
    client: &SmbClient,
    tmp: &str,
    target: &str,
    bytes: &[u8],
) -> Result<(), StorageError> {
    let written = client
        .open_with(
            tmp,
            SmbOpenOptions::default().create(true).write(true).truncate(true),
        )
        .map_err(|e| e.to_string())
        .and_then(|mut file| file.write_all(bytes).map_err(|e| e.to_string()));
    if let Err(e) = written {
        let removed = client.unlink(tmp).is_ok();
        return Err(StorageError::Transfer(format!(
            "Failed to upload {}: {}{}",
            target,
            e,
            leftover_note(tmp, removed)
        )));
    }

    if let Err(e) = client.unlink(target) {
        if !is_not_found(&e.to_string()) {
            debug!("Could not remove previous {}: {}", target, e);
        }
    }
    if let Err(e) = client.rename(tmp, target) {
        let removed = client.unlink(tmp).is_ok();
        return Err(StorageError::Transfer(format!(
            "Failed to move upload into {}: {}{}",
            target,
            e,
            leftover_note(tmp, removed)
        )));
    }
    Ok(())
}

fn raw_entry(entry: SmbDirent) -> RawEntry {
    match entry.get_type() {
        SmbDirentType::File => RawEntry::file(entry.name(), 0),
        _ => RawEntry::dir(entry.name()),
    }
}

#[async_trait]
impl StorageConnector for SmbConnector {
    fn id(&self) -> &ConnectorId {
        &self.id
    }

    #[instrument(skip(self), fields(connector = %self.id), level = "debug")]
    async fn bootstrap(&self) -> Result<(), StorageError> {
        let chain = bootstrap_chain(&self.root);
        let created = self
            .run("SMB bootstrap", move |client| {
                let mut created = Vec::new();
                for dir in chain {
                    if ensure_dir(client, &dir)? {
                        created.push(dir);
                    }
                }
                Ok(created)
            })
            .await?;
        for dir in created {
            debug!("Created {}", dir);
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

        let dest = path.clone();
        self.run("SMB upload", move |client| {
            write_then_rename(client, &tmp, &dest, &bytes)
        })
        .await?;

        debug!("Stored {}", path);
        Ok(path)
    }

    #[instrument(skip(self), fields(connector = %self.id), level = "debug")]
    async fn list(&self, subdir: &str) -> Result<Vec<String>, StorageError> {
        let dir = join_remote(&[&self.root, subdir]);
        let listed_dir = dir.clone();
        let raw = self
            .run("SMB list", move |client| {
                let entries = client.list_dir(&listed_dir).map_err(|e| {
                    if is_not_found(&e.to_string()) {
                        StorageError::NotFound(format!("Directory {} not found", listed_dir))
                    } else {
                        StorageError::Directory(format!("Failed to list {}: {}", listed_dir, e))
                    }
                })?;
                Ok(entries.into_iter().map(raw_entry).collect::<Vec<_>>())
            })
            .await?;

        // Dirents carry no mtime; sequence-prefixed names sort oldest first.
        Ok(listing_entries(raw)
            .into_iter()
            .map(|name| join_remote(&[&dir, &name]))
            .collect())
    }

    #[instrument(skip(self), fields(connector = %self.id), level = "debug")]
    async fn fetch(&self, path: &str) -> Result<ImageArtifact, StorageError> {
        let remote = path.to_string();
        let bytes = self
            .run("SMB download", move |client| {
                let mut file = client
                    .open_with(&remote, SmbOpenOptions::default().read(true))
                    .map_err(|e| {
                        if is_not_found(&e.to_string()) {
                            StorageError::NotFound(format!("File {} not found", remote))
                        } else {
                            StorageError::Transfer(format!("Failed to open {}: {}", remote, e))
                        }
                    })?;
                let mut bytes = Vec::new();
                file.read_to_end(&mut bytes).map_err(|e| {
                    StorageError::Transfer(format!("Failed to read {}: {}", remote, e))
                })?;
                Ok(bytes)
            })
            .await?;
        decode_image(&bytes)
    }

    async fn release(&self) -> Result<(), StorageError> {
        if let Err(e) = self.session.close(self.timeouts.io).await {
            warn!("Releasing {} failed: {}", self.id, e);
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gallery_storage_core::GallerySubdir;

    #[test]
    fn test_share_root_is_absolute() {
        assert_eq!(share_root("sd_web_ui"), "/sd_web_ui");
        assert_eq!(share_root("/photos/sd_web_ui/"), "/photos/sd_web_ui");
        assert_eq!(share_root(""), "/");
    }

    #[test]
    fn test_relative_root_bootstraps_from_share_root() {
        let chain = bootstrap_chain(&share_root("photos/sd_web_ui"));
        assert_eq!(chain[0], "/photos");
        assert_eq!(chain[1], "/photos/sd_web_ui");
        assert_eq!(chain.len(), 2 + GallerySubdir::ALL.len());
    }
}
