//! In-memory connector.
//!
//! Keeps encoded PNG bytes per directory in insertion order and reports the
//! synthetic `.`/`..` entries in its raw listing, like a real directory
//! listing protocol. Used to exercise the registry and browser without a
//! network; only built with the `test-util` feature.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use indexmap::IndexMap;
use tracing::debug;

use crate::artifact::{ImageArtifact, PixelBuffer, TextMetadata};
use crate::codec::{decode_image, encode_png};
use crate::connector::{BackendKind, ConnectorId, StorageConnector};
use crate::error::StorageError;
use crate::layout::{join_remote, strip_synthetic_entries, ArtifactName, GallerySubdir};

type Directory = Vec<(String, Vec<u8>)>;

pub struct MemoryConnector {
    id: ConnectorId,
    root: String,
    dirs: Mutex<IndexMap<String, Directory>>,
    fail_stores: AtomicBool,
    store_calls: AtomicUsize,
    release_calls: AtomicUsize,
    released: AtomicBool,
}

impl MemoryConnector {
    /// Connector posing as `kind`, rooted at `root`.
    pub fn new(kind: BackendKind, root: &str) -> Self {
        Self {
            id: ConnectorId::new(kind, format!("memory://{}", root)),
            root: root.to_string(),
            dirs: Mutex::new(IndexMap::new()),
            fail_stores: AtomicBool::new(false),
            store_calls: AtomicUsize::new(0),
            release_calls: AtomicUsize::new(0),
            released: AtomicBool::new(false),
        }
    }

    /// Make every subsequent `store` fail with a transfer error.
    pub fn failing(self) -> Self {
        self.fail_stores.store(true, Ordering::SeqCst);
        self
    }

    pub fn store_calls(&self) -> usize {
        self.store_calls.load(Ordering::SeqCst)
    }

    pub fn release_calls(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Directory names currently present, in creation order.
    pub fn directories(&self) -> Vec<String> {
        self.lock_dirs().keys().cloned().collect()
    }

    /// Put raw bytes at `<root>/<subdir>/<file_name>` without encoding.
    pub fn insert_raw(&self, subdir: &str, file_name: &str, bytes: Vec<u8>) {
        let dir = join_remote(&[&self.root, subdir]);
        self.lock_dirs()
            .entry(dir)
            .or_default()
            .push((file_name.to_string(), bytes));
    }

    fn lock_dirs(&self) -> std::sync::MutexGuard<'_, IndexMap<String, Directory>> {
        self.dirs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.is_released() {
            return Err(StorageError::Connection(format!(
                "{} has been released",
                self.id
            )));
        }
        Ok(())
    }

    fn raw_listing(&self, dir: &str) -> Option<Vec<String>> {
        self.lock_dirs().get(dir).map(|entries| {
            [".".to_string(), "..".to_string()]
                .into_iter()
                .chain(entries.iter().map(|(name, _)| name.clone()))
                .collect()
        })
    }
}

#[async_trait]
impl StorageConnector for MemoryConnector {
    fn id(&self) -> &ConnectorId {
        &self.id
    }

    async fn bootstrap(&self) -> Result<(), StorageError> {
        self.ensure_open()?;
        let mut dirs = self.lock_dirs();
        dirs.entry(self.root.clone()).or_default();
        for subdir in GallerySubdir::ALL {
            dirs.entry(join_remote(&[&self.root, subdir.as_str()]))
                .or_default();
        }
        Ok(())
    }

    async fn store(
        &self,
        name: &str,
        image: &PixelBuffer,
        metadata: &TextMetadata,
    ) -> Result<String, StorageError> {
        self.ensure_open()?;
        self.store_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_stores.load(Ordering::SeqCst) {
            return Err(StorageError::Transfer(format!(
                "{} rejected the upload",
                self.id
            )));
        }

        let target = ArtifactName::parse(name)?;
        let bytes = encode_png(image, metadata)?;
        let dir = join_remote(&[&self.root, &target.subdir]);
        let file_name = target.file_name();

        let mut dirs = self.lock_dirs();
        let entries = dirs.get_mut(&dir).ok_or_else(|| {
            StorageError::Transfer(format!("Remote directory {} does not exist", dir))
        })?;
        entries.retain(|(existing, _)| existing != &file_name);
        entries.push((file_name.clone(), bytes));

        debug!("Stored {} in {}", file_name, dir);
        Ok(join_remote(&[&dir, &file_name]))
    }

    async fn list(&self, subdir: &str) -> Result<Vec<String>, StorageError> {
        self.ensure_open()?;
        let dir = join_remote(&[&self.root, subdir]);
        let raw = self
            .raw_listing(&dir)
            .ok_or_else(|| StorageError::NotFound(format!("Directory {} not found", dir)))?;
        Ok(strip_synthetic_entries(raw)
            .into_iter()
            .map(|name| join_remote(&[&dir, &name]))
            .collect())
    }

    async fn fetch(&self, path: &str) -> Result<ImageArtifact, StorageError> {
        self.ensure_open()?;
        let (dir, file_name) = path
            .rsplit_once('/')
            .ok_or_else(|| StorageError::NotFound(format!("File {} not found", path)))?;
        let bytes = self
            .lock_dirs()
            .get(dir)
            .and_then(|entries| entries.iter().find(|(n, _)| n == file_name))
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| StorageError::NotFound(format!("File {} not found", path)))?;
        decode_image(&bytes)
    }

    async fn release(&self) -> Result<(), StorageError> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        self.released.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::PixelFormat;

    fn tiny_image(seed: u8) -> PixelBuffer {
        PixelBuffer::new(2, 2, PixelFormat::Rgb, vec![seed; 12]).unwrap()
    }

    #[tokio::test]
    async fn test_bootstrap_is_idempotent() {
        let connector = MemoryConnector::new(BackendKind::Sftp, "sd_web_ui");
        connector.bootstrap().await.unwrap();
        connector.bootstrap().await.unwrap();

        let dirs = connector.directories();
        assert_eq!(dirs.len(), 6);
        assert!(dirs.contains(&"sd_web_ui/txt2img-images".to_string()));
        assert!(dirs.contains(&"sd_web_ui/extras-images".to_string()));
    }

    #[tokio::test]
    async fn test_store_then_fetch_round_trip() {
        let connector = MemoryConnector::new(BackendKind::Sftp, "sd_web_ui");
        connector.bootstrap().await.unwrap();

        let image = tiny_image(9);
        let mut metadata = TextMetadata::new();
        metadata.insert("parameters".to_string(), "X".to_string());

        let path = connector
            .store("outputs/txt2img-images/00001-7", &image, &metadata)
            .await
            .unwrap();
        assert_eq!(path, "sd_web_ui/txt2img-images/00001-7.png");

        let fetched = connector.fetch(&path).await.unwrap();
        assert_eq!(fetched.pixels, image);
        assert_eq!(fetched.parameters(), Some("X"));

        let expected = encode_png(&image, &metadata).unwrap();
        let decoded_again = decode_image(&expected).unwrap();
        assert_eq!(decoded_again, fetched);
    }

    #[tokio::test]
    async fn test_list_excludes_synthetic_entries() {
        let connector = MemoryConnector::new(BackendKind::Smb, "root");
        connector.bootstrap().await.unwrap();
        connector.insert_raw("txt2img-images", "a.png", vec![1]);
        connector.insert_raw("txt2img-images", "b.png", vec![2]);

        let listing = connector.list("txt2img-images").await.unwrap();
        assert_eq!(
            listing,
            vec![
                "root/txt2img-images/a.png".to_string(),
                "root/txt2img-images/b.png".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_store_into_missing_directory_fails() {
        let connector = MemoryConnector::new(BackendKind::Smb, "root");
        let err = connector
            .store("outputs/txt2img-images/1", &tiny_image(1), &TextMetadata::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Transfer(_)));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let connector = MemoryConnector::new(BackendKind::Smb, "root");
        connector.release().await.unwrap();
        connector.release().await.unwrap();
        assert_eq!(connector.release_calls(), 2);
        assert!(connector.list("txt2img-images").await.is_err());
    }
}
