//! Paginated, newest-first browsing of one remote connector.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::stream::{self, StreamExt, TryStreamExt};
use gallery_storage_core::{
    ConnectionSpec, GallerySubdir, PixelBuffer, StorageConnector, StorageError, TextMetadata,
    Timeouts, PARAMETERS_KEY,
};
use tracing::{debug, info, instrument, warn};

use crate::factory::{BackendFactory, ConnectorFactory};

pub const PAGE_SIZE: usize = 60;
pub const DEFAULT_FETCH_CONCURRENCY: usize = 4;
pub const MAX_FETCH_CONCURRENCY: usize = 8;

/// Requested page meaning "the last page".
pub const LAST_PAGE: i64 = -1;

/// Where a requested page lands once clamped against the listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageBounds {
    /// 1-based page actually served.
    pub page: usize,
    pub total: usize,
    pub max_page: usize,
    pub offset: usize,
    pub len: usize,
}

/// Clamp `requested` into `1..=max_page` and compute the slice to serve.
/// `-1` selects the last page; an empty listing still has one (empty) page.
pub fn paginate(total: usize, page_size: usize, requested: i64) -> PageBounds {
    let page_size = page_size.max(1);
    let max_page = total.div_ceil(page_size).max(1);
    let page = if requested == LAST_PAGE {
        max_page
    } else if requested < 1 {
        1
    } else {
        usize::try_from(requested).map_or(max_page, |p| p.min(max_page))
    };
    let offset = ((page - 1) * page_size).min(total);
    let len = page_size.min(total - offset);
    PageBounds {
        page,
        total,
        max_page,
        offset,
        len,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserState {
    Disconnected,
    Connected,
    Listing,
    PageReady,
}

/// One rendered page: images in newest-first order with their metadata and
/// remote paths at matching indices.
#[derive(Debug, Clone, PartialEq)]
pub struct PageView {
    pub images: Vec<PixelBuffer>,
    pub metadata: Vec<TextMetadata>,
    pub paths: Vec<String>,
    pub page: usize,
    pub total: usize,
    pub max_page: usize,
    /// False when no connector is selected.
    pub connected: bool,
}

impl PageView {
    fn no_connection() -> Self {
        Self {
            images: Vec::new(),
            metadata: Vec::new(),
            paths: Vec::new(),
            page: 1,
            total: 0,
            max_page: 1,
            connected: false,
        }
    }

    pub fn summary(&self) -> String {
        if !self.connected {
            return "No remote connection".to_string();
        }
        format!(
            "{} images in this directory, divided into {} pages",
            self.total, self.max_page
        )
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BrowseError {
    /// A newer navigation started before this one finished.
    #[error("Request superseded by a newer navigation")]
    Superseded,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Parameters text and file name of one image on the current page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub parameters: String,
    pub file_name: String,
}

pub struct RemoteBrowser {
    factory: Arc<dyn ConnectorFactory>,
    timeouts: Timeouts,
    page_size: usize,
    fetch_concurrency: usize,
    connector: Mutex<Option<Arc<dyn StorageConnector>>>,
    state: Mutex<BrowserState>,
    generation: AtomicU64,
    current: Mutex<Option<PageView>>,
}

impl RemoteBrowser {
    pub fn new(timeouts: Timeouts, page_size: usize, fetch_concurrency: usize) -> Self {
        Self::with_factory(
            Arc::new(BackendFactory),
            timeouts,
            page_size,
            fetch_concurrency,
        )
    }

    pub fn with_factory(
        factory: Arc<dyn ConnectorFactory>,
        timeouts: Timeouts,
        page_size: usize,
        fetch_concurrency: usize,
    ) -> Self {
        Self {
            factory,
            timeouts,
            page_size: page_size.max(1),
            fetch_concurrency: fetch_concurrency.clamp(1, MAX_FETCH_CONCURRENCY),
            connector: Mutex::new(None),
            state: Mutex::new(BrowserState::Disconnected),
            generation: AtomicU64::new(0),
            current: Mutex::new(None),
        }
    }

    pub fn state(&self) -> BrowserState {
        *lock(&self.state)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn set_state(&self, state: BrowserState) {
        *lock(&self.state) = state;
    }

    /// Start a navigation; earlier in-flight requests become superseded.
    fn begin(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Switch to the backend described by `spec`, releasing the previous one.
    /// Fails with `Superseded` when a newer switch or release overtook it.
    pub async fn connect(&self, spec: &ConnectionSpec) -> Result<(), BrowseError> {
        self.release().await;
        let generation = self.begin();
        let connector = self.factory.connect(spec, self.timeouts).await?;
        if !self.is_current(generation) {
            debug!("Connect to {} superseded", connector.id());
            self.release_connector(connector).await;
            return Err(BrowseError::Superseded);
        }
        self.attach(connector);
        Ok(())
    }

    /// Browse an already bootstrapped connector.
    pub fn attach(&self, connector: Arc<dyn StorageConnector>) {
        info!("Browsing {}", connector.id());
        self.begin();
        *lock(&self.connector) = Some(connector);
        *lock(&self.current) = None;
        self.set_state(BrowserState::Connected);
    }

    /// Release the current connector, if any. Failures are logged.
    pub async fn release(&self) {
        self.begin();
        let previous = lock(&self.connector).take();
        *lock(&self.current) = None;
        self.set_state(BrowserState::Disconnected);
        if let Some(connector) = previous {
            self.release_connector(connector).await;
        }
    }

    async fn release_connector(&self, connector: Arc<dyn StorageConnector>) {
        let released = self
            .timeouts
            .io(&format!("release of {}", connector.id()), connector.release())
            .await;
        if let Err(e) = released {
            warn!("Releasing {} failed: {}", connector.id(), e);
        }
    }

    /// Page for a gallery tab name such as `txt2img` or `Extras`.
    pub async fn page_for_tab(&self, tab: &str, requested: i64) -> Result<PageView, BrowseError> {
        let subdir = GallerySubdir::from_tab(tab).ok_or_else(|| {
            StorageError::Config(format!("Unknown gallery tab: {}", tab))
        })?;
        self.page(subdir.as_str(), requested).await
    }

    /// List `subdir` newest first and fetch the requested page.
    #[instrument(skip(self), level = "debug")]
    pub async fn page(&self, subdir: &str, requested: i64) -> Result<PageView, BrowseError> {
        let generation = self.begin();
        let connector = match lock(&self.connector).clone() {
            Some(connector) => connector,
            None => return Ok(PageView::no_connection()),
        };

        self.set_state(BrowserState::Listing);
        let listed = connector.list(subdir).await;
        if !self.is_current(generation) {
            return Err(BrowseError::Superseded);
        }
        let mut paths = match listed {
            Ok(paths) => paths,
            Err(e) => {
                self.set_state(BrowserState::Connected);
                return Err(e.into());
            }
        };
        paths.reverse();

        let bounds = paginate(paths.len(), self.page_size, requested);
        let slice: Vec<String> = paths
            .into_iter()
            .skip(bounds.offset)
            .take(bounds.len)
            .collect();
        debug!(
            "Page {}/{} of {}: {} entries",
            bounds.page,
            bounds.max_page,
            subdir,
            slice.len()
        );

        let fetched = stream::iter(slice.iter().cloned())
            .map(|path| {
                let connector = connector.clone();
                async move { connector.fetch(&path).await }
            })
            .buffered(self.fetch_concurrency)
            .try_collect::<Vec<_>>()
            .await;

        if !self.is_current(generation) {
            return Err(BrowseError::Superseded);
        }
        let artifacts = match fetched {
            Ok(artifacts) => artifacts,
            Err(e) => {
                self.set_state(BrowserState::Connected);
                return Err(e.into());
            }
        };

        let (images, metadata) = artifacts
            .into_iter()
            .map(|artifact| (artifact.pixels, artifact.metadata))
            .unzip();
        let view = PageView {
            images,
            metadata,
            paths: slice,
            page: bounds.page,
            total: bounds.total,
            max_page: bounds.max_page,
            connected: true,
        };

        *lock(&self.current) = Some(view.clone());
        self.set_state(BrowserState::PageReady);
        Ok(view)
    }

    /// Details of the `index`-th image on the last page served.
    pub fn image_info(&self, index: usize) -> Option<ImageInfo> {
        let current = lock(&self.current);
        let view = current.as_ref()?;
        let path = view.paths.get(index)?;
        let parameters = view
            .metadata
            .get(index)
            .and_then(|m| m.get(PARAMETERS_KEY))
            .cloned()
            .unwrap_or_default();
        let file_name = path.rsplit('/').next().unwrap_or(path).to_string();
        Some(ImageInfo {
            parameters,
            file_name,
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::factory::{MemoryFactory, StuckRelease};
    use gallery_storage_core::{
        encode_png, BackendKind, ConnectorId, ImageArtifact, MemoryConnector, Password,
        PixelFormat, SftpSpec,
    };
    use std::time::Duration;

    #[test]
    fn test_paginate_125_entries() {
        let b = paginate(125, 60, 1);
        assert_eq!((b.page, b.max_page, b.offset, b.len), (1, 3, 0, 60));
        assert_eq!(paginate(125, 60, -1).page, 3);
        assert_eq!(paginate(125, 60, 0).page, 1);
        assert_eq!(paginate(125, 60, -7).page, 1);
        assert_eq!(paginate(125, 60, 99).page, 3);
        let last = paginate(125, 60, 3);
        assert_eq!((last.offset, last.len), (120, 5));
    }

    #[test]
    fn test_paginate_empty_listing() {
        let b = paginate(0, 60, -1);
        assert_eq!((b.page, b.total, b.max_page, b.offset, b.len), (1, 0, 1, 0, 0));
    }

    #[test]
    fn test_paginate_exact_multiple() {
        let b = paginate(120, 60, -1);
        assert_eq!((b.page, b.max_page, b.offset, b.len), (2, 2, 60, 60));
    }

    async fn seeded(count: usize) -> Arc<MemoryConnector> {
        let memory = Arc::new(MemoryConnector::new(BackendKind::Sftp, "root"));
        memory.bootstrap().await.unwrap();
        for i in 0..count {
            let image = PixelBuffer::new(1, 1, PixelFormat::Gray, vec![i as u8]).unwrap();
            let mut metadata = TextMetadata::new();
            metadata.insert(PARAMETERS_KEY.to_string(), format!("seed {}", i));
            memory.insert_raw(
                "txt2img-images",
                &format!("{:05}.png", i),
                encode_png(&image, &metadata).unwrap(),
            );
        }
        memory
    }

    fn browser() -> RemoteBrowser {
        RemoteBrowser::new(Timeouts::default(), PAGE_SIZE, DEFAULT_FETCH_CONCURRENCY)
    }

    #[tokio::test]
    async fn test_page_without_connection() {
        let browser = browser();
        let view = browser.page("txt2img-images", 1).await.unwrap();
        assert!(!view.connected);
        assert!(view.images.is_empty());
        assert_eq!(view.summary(), "No remote connection");
        assert_eq!(browser.state(), BrowserState::Disconnected);
    }

    #[tokio::test]
    async fn test_pages_are_newest_first() {
        let browser = browser();
        browser.attach(seeded(125).await);

        let first = browser.page("txt2img-images", 1).await.unwrap();
        assert_eq!((first.page, first.total, first.max_page), (1, 125, 3));
        assert_eq!(first.images.len(), 60);
        assert!(first.paths[0].ends_with("00124.png"));
        assert_eq!(first.metadata[0].get(PARAMETERS_KEY).unwrap(), "seed 124");
        assert_eq!(
            first.summary(),
            "125 images in this directory, divided into 3 pages"
        );

        let last = browser.page("txt2img-images", LAST_PAGE).await.unwrap();
        assert_eq!(last.page, 3);
        assert_eq!(last.images.len(), 5);
        assert!(last.paths[4].ends_with("00000.png"));
        assert_eq!(last.images[4].data(), &[0]);
        assert_eq!(browser.state(), BrowserState::PageReady);
    }

    #[tokio::test]
    async fn test_page_for_tab_and_image_info() {
        let browser = browser();
        browser.attach(seeded(3).await);

        let view = browser.page_for_tab("txt2img", 1).await.unwrap();
        assert_eq!(view.total, 3);

        let info = browser.image_info(0).unwrap();
        assert_eq!(info.parameters, "seed 2");
        assert_eq!(info.file_name, "00002.png");
        assert!(browser.image_info(3).is_none());

        assert!(matches!(
            browser.page_for_tab("nope", 1).await,
            Err(BrowseError::Storage(StorageError::Config(_)))
        ));
    }

    #[tokio::test]
    async fn test_release_gives_up_on_stuck_connector() {
        let browser = RemoteBrowser::new(
            Timeouts {
                connect: Duration::from_millis(50),
                io: Duration::from_millis(50),
            },
            PAGE_SIZE,
            DEFAULT_FETCH_CONCURRENCY,
        );
        browser.attach(Arc::new(StuckRelease {
            id: ConnectorId::new(BackendKind::Smb, "smb://nas:445/share"),
        }));

        tokio::time::timeout(Duration::from_secs(5), browser.release())
            .await
            .expect("release must not hang");
        assert_eq!(browser.state(), BrowserState::Disconnected);
    }

    fn sftp_spec(host: &str) -> ConnectionSpec {
        ConnectionSpec::Sftp(SftpSpec {
            host: host.to_string(),
            port: 22,
            username: "u".to_string(),
            password: Password::new("p"),
            remote_path: "/sd_web_ui".to_string(),
        })
    }

    #[tokio::test]
    async fn test_overtaken_connect_is_superseded() {
        let slow_spec = sftp_spec("slow");
        let slow_location = slow_spec.connector_id().location;
        let factory = Arc::new(MemoryFactory {
            slow: vec![slow_location.clone()],
            ..Default::default()
        });
        let browser = Arc::new(RemoteBrowser::with_factory(
            factory.clone(),
            Timeouts::default(),
            PAGE_SIZE,
            DEFAULT_FETCH_CONCURRENCY,
        ));

        let slow = {
            let browser = browser.clone();
            tokio::spawn(async move { browser.connect(&slow_spec).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        browser.connect(&sftp_spec("fast")).await.unwrap();

        assert!(matches!(slow.await.unwrap(), Err(BrowseError::Superseded)));
        assert_eq!(browser.state(), BrowserState::Connected);
        for memory in factory.built() {
            let orphaned = memory.id().location == format!("memory://{}", slow_location);
            assert_eq!(memory.is_released(), orphaned);
        }
        assert!(browser.page("txt2img-images", 1).await.unwrap().connected);
    }

    #[tokio::test]
    async fn test_release_disconnects() {
        let browser = browser();
        let memory = seeded(1).await;
        browser.attach(memory.clone());
        browser.release().await;

        assert!(memory.is_released());
        assert_eq!(browser.state(), BrowserState::Disconnected);
        assert!(!browser.page("txt2img-images", 1).await.unwrap().connected);
    }

    /// Delays listing so a second navigation can overtake the first.
    struct SlowList {
        inner: Arc<MemoryConnector>,
        delay: Duration,
    }

    #[async_trait]
    impl StorageConnector for SlowList {
        fn id(&self) -> &ConnectorId {
            self.inner.id()
        }
        async fn bootstrap(&self) -> Result<(), StorageError> {
            self.inner.bootstrap().await
        }
        async fn store(
            &self,
            name: &str,
            image: &PixelBuffer,
            metadata: &TextMetadata,
        ) -> Result<String, StorageError> {
            self.inner.store(name, image, metadata).await
        }
        async fn list(&self, subdir: &str) -> Result<Vec<String>, StorageError> {
            tokio::time::sleep(self.delay).await;
            self.inner.list(subdir).await
        }
        async fn fetch(&self, path: &str) -> Result<ImageArtifact, StorageError> {
            self.inner.fetch(path).await
        }
        async fn release(&self) -> Result<(), StorageError> {
            self.inner.release().await
        }
    }

    #[tokio::test]
    async fn test_superseded_request_is_discarded() {
        let browser = Arc::new(browser());
        browser.attach(Arc::new(SlowList {
            inner: seeded(2).await,
            delay: Duration::from_millis(200),
        }));

        let slow = {
            let browser = browser.clone();
            tokio::spawn(async move { browser.page("txt2img-images", 1).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let newer = browser.page("txt2img-images", 1).await.unwrap();

        assert_eq!(newer.total, 2);
        assert!(matches!(slow.await.unwrap(), Err(BrowseError::Superseded)));
    }
}
