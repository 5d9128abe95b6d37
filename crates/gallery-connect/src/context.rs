//! Application context: parsed settings plus the save registry and browser.

use std::sync::Arc;

use gallery_storage_core::{
    parse_cloud_drive_spec, parse_sftp_specs, parse_smb_specs, AggregateError, BackendKind,
    CloudDriveOptions, ConnectionSpec, ConnectorFailure, PixelBuffer, SftpOptions, SmbOptions,
    StorageError, TextMetadata, Timeouts,
};
use tracing::{info, warn};

use crate::browser::{BrowseError, RemoteBrowser, DEFAULT_FETCH_CONCURRENCY, PAGE_SIZE};
use crate::factory::{BackendFactory, ConnectorFactory};
use crate::registry::{ConnectorRegistry, SaveOutcome};

/// Parsed connection settings. A backend kind whose options failed to parse
/// is left out of `specs` and its error kept in `config_errors`.
#[derive(Debug, Clone)]
pub struct Settings {
    pub specs: Vec<ConnectionSpec>,
    pub config_errors: Vec<(BackendKind, StorageError)>,
    pub timeouts: Timeouts,
    pub page_size: usize,
    pub fetch_concurrency: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            specs: Vec::new(),
            config_errors: Vec::new(),
            timeouts: Timeouts::default(),
            page_size: PAGE_SIZE,
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
        }
    }
}

impl Settings {
    /// Parse every backend's options. Never fails: errors are logged and
    /// recorded per kind.
    pub fn from_options(smb: &SmbOptions, sftp: &SftpOptions, drive: &CloudDriveOptions) -> Self {
        let mut settings = Self::default();

        match parse_smb_specs(smb) {
            Ok(specs) => settings
                .specs
                .extend(specs.into_iter().map(ConnectionSpec::Smb)),
            Err(e) => settings.record_error(BackendKind::Smb, e),
        }
        match parse_sftp_specs(sftp) {
            Ok(specs) => settings
                .specs
                .extend(specs.into_iter().map(ConnectionSpec::Sftp)),
            Err(e) => settings.record_error(BackendKind::Sftp, e),
        }
        match parse_cloud_drive_spec(drive) {
            Ok(spec) => settings
                .specs
                .extend(spec.into_iter().map(ConnectionSpec::CloudDrive)),
            Err(e) => settings.record_error(BackendKind::CloudDrive, e),
        }

        settings
    }

    fn record_error(&mut self, kind: BackendKind, error: StorageError) {
        warn!("{} treated as unconfigured: {}", kind, error);
        self.config_errors.push((kind, error));
    }

    /// Specs of one kind, in configuration order.
    pub fn specs_of(&self, kind: BackendKind) -> Vec<&ConnectionSpec> {
        self.specs.iter().filter(|s| s.kind() == kind).collect()
    }

    pub fn is_configured(&self, kind: BackendKind) -> bool {
        self.specs.iter().any(|s| s.kind() == kind)
    }

    pub fn config_error(&self, kind: BackendKind) -> Option<&StorageError> {
        self.config_errors
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, e)| e)
    }
}

pub struct AppContext {
    settings: Settings,
    registry: ConnectorRegistry,
    browser: RemoteBrowser,
}

impl AppContext {
    pub fn new(settings: Settings) -> Self {
        Self::with_factory(settings, Arc::new(BackendFactory))
    }

    pub fn with_factory(settings: Settings, factory: Arc<dyn ConnectorFactory>) -> Self {
        let registry = ConnectorRegistry::with_factory(factory.clone(), settings.timeouts);
        let browser = RemoteBrowser::with_factory(
            factory,
            settings.timeouts,
            settings.page_size,
            settings.fetch_concurrency,
        );
        Self {
            settings,
            registry,
            browser,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn browser(&self) -> &RemoteBrowser {
        &self.browser
    }

    /// Save one image everywhere: fresh connectors for every configured spec,
    /// one concurrent store each, then release. Connect failures are reported
    /// alongside store failures.
    pub async fn save_image(
        &mut self,
        image: &PixelBuffer,
        name: &str,
        metadata: &TextMetadata,
    ) -> Result<SaveOutcome, AggregateError> {
        self.registry.reset();
        let mut failures = Vec::new();
        for spec in &self.settings.specs {
            if let Err(error) = self.registry.add_from_spec(spec).await {
                warn!("Skipping {}: {}", spec.connector_id(), error);
                failures.push(ConnectorFailure {
                    connector: spec.connector_id(),
                    error,
                });
            }
        }

        let saved = self.registry.save_all(image, name, metadata).await;
        for failure in self.registry.release_all().await {
            warn!("Release after save failed: {}", failure);
        }

        match saved {
            Ok(outcome) if failures.is_empty() => Ok(outcome),
            Ok(_) => Err(AggregateError::new(failures)),
            Err(mut aggregate) => {
                failures.append(&mut aggregate.failures);
                Err(AggregateError::new(failures))
            }
        }
    }

    /// Point the browser at the `index`-th configured backend of `kind`.
    pub async fn select_browser(&self, kind: BackendKind, index: usize) -> Result<(), BrowseError> {
        let spec = self
            .settings
            .specs_of(kind)
            .get(index)
            .copied()
            .ok_or_else(|| match self.settings.config_error(kind) {
                Some(e) => e.clone(),
                None => StorageError::Config(format!("No {} connection #{} configured", kind, index)),
            })?;
        info!("Selecting {} for browsing", spec.connector_id());
        self.browser.connect(spec).await
    }

    /// Release everything the context holds.
    pub async fn shutdown(&mut self) {
        self.browser.release().await;
        for failure in self.registry.release_all().await {
            warn!("Release on shutdown failed: {}", failure);
        }
    }
}
