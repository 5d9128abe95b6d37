//! Fan-out saving and paginated browsing over remote gallery storage.
//!
//! - `ConnectorRegistry`: builds one connector per configured connection and
//!   stores every image on all of them, isolating failures
//! - `RemoteBrowser`: newest-first pages over one connector's listing
//! - `AppContext`: settings plus both of the above, with explicit teardown

pub mod browser;
pub mod config;
pub mod context;
pub mod factory;
pub mod registry;

pub use browser::{
    paginate, BrowseError, BrowserState, ImageInfo, PageBounds, PageView, RemoteBrowser,
    LAST_PAGE, PAGE_SIZE,
};
pub use context::{AppContext, Settings};
pub use factory::{BackendFactory, ConnectorFactory};
pub use registry::{ConnectorRegistry, SaveOutcome};
