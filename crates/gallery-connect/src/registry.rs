//! Ordered set of live connectors with fan-out saving.

use std::sync::Arc;

use futures::future::join_all;
use gallery_storage_core::{
    AggregateError, BackendKind, ConnectionSpec, ConnectorFailure, ConnectorId, PixelBuffer,
    StorageConnector, StorageError, TextMetadata, Timeouts,
};
use tracing::{debug, info, warn};

use crate::factory::{BackendFactory, ConnectorFactory};

/// Result of a save when no connector failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Nothing is configured, so nothing was attempted.
    NoConnectors,
    /// Every connector stored the image; one remote path per connector.
    Saved(Vec<(ConnectorId, String)>),
}

pub struct ConnectorRegistry {
    connectors: Vec<Arc<dyn StorageConnector>>,
    factory: Arc<dyn ConnectorFactory>,
    timeouts: Timeouts,
}

impl ConnectorRegistry {
    pub fn new(timeouts: Timeouts) -> Self {
        Self::with_factory(Arc::new(BackendFactory), timeouts)
    }

    pub fn with_factory(factory: Arc<dyn ConnectorFactory>, timeouts: Timeouts) -> Self {
        Self {
            connectors: Vec::new(),
            factory,
            timeouts,
        }
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    pub fn connectors(&self) -> &[Arc<dyn StorageConnector>] {
        &self.connectors
    }

    /// The `index`-th connector of `kind`, in insertion order.
    pub fn get(&self, kind: BackendKind, index: usize) -> Option<Arc<dyn StorageConnector>> {
        self.connectors
            .iter()
            .filter(|c| c.id().kind == kind)
            .nth(index)
            .cloned()
    }

    /// Forget every connector without releasing it.
    pub fn reset(&mut self) {
        if !self.connectors.is_empty() {
            debug!("Discarding {} connectors", self.connectors.len());
        }
        self.connectors.clear();
    }

    /// Connect and bootstrap the backend for `spec`, then append it.
    pub async fn add_from_spec(&mut self, spec: &ConnectionSpec) -> Result<(), StorageError> {
        let connector = self.factory.connect(spec, self.timeouts).await?;
        self.connectors.push(connector);
        Ok(())
    }

    pub fn add_connector(&mut self, connector: Arc<dyn StorageConnector>) {
        self.connectors.push(connector);
    }

    /// Store the image on every connector concurrently. One connector failing
    /// or timing out never prevents the others from being attempted.
    pub async fn save_all(
        &self,
        image: &PixelBuffer,
        name: &str,
        metadata: &TextMetadata,
    ) -> Result<SaveOutcome, AggregateError> {
        if self.connectors.is_empty() {
            info!("No connectors configured, skipping save of {}", name);
            return Ok(SaveOutcome::NoConnectors);
        }

        let results = join_all(self.connectors.iter().map(|connector| async move {
            let stored = self
                .timeouts
                .io(
                    &format!("store on {}", connector.id()),
                    connector.store(name, image, metadata),
                )
                .await;
            (connector.id().clone(), stored)
        }))
        .await;

        let mut saved = Vec::new();
        let mut failures = Vec::new();
        for (connector, result) in results {
            match result {
                Ok(path) => {
                    info!("Saved {} to {}", path, connector);
                    saved.push((connector, path));
                }
                Err(error) => {
                    warn!("Save to {} failed: {}", connector, error);
                    failures.push(ConnectorFailure { connector, error });
                }
            }
        }

        if failures.is_empty() {
            Ok(SaveOutcome::Saved(saved))
        } else {
            Err(AggregateError::new(failures))
        }
    }

    /// Release and drop every connector, each within the I/O deadline.
    /// Individual failures are logged and returned, never raised.
    pub async fn release_all(&mut self) -> Vec<ConnectorFailure> {
        let connectors = std::mem::take(&mut self.connectors);
        let timeouts = self.timeouts;
        let results = join_all(connectors.iter().map(|connector| async move {
            let released = timeouts
                .io(&format!("release of {}", connector.id()), connector.release())
                .await;
            (connector.id().clone(), released)
        }))
        .await;

        results
            .into_iter()
            .filter_map(|(connector, result)| match result {
                Ok(()) => {
                    debug!("Released {}", connector);
                    None
                }
                Err(error) => {
                    warn!("Release of {} failed: {}", connector, error);
                    Some(ConnectorFailure { connector, error })
                }
            })
            .collect()
    }
}
