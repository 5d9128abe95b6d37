//! Google Drive backend for remote gallery storage.
//!
//! Artifacts go into a single folder at the root of the user's drive. Access
//! uses an installed-app OAuth client; the token is persisted locally and
//! refreshed on expiry.

mod connector;
mod gdrive;
mod secret;
mod token_manager;

pub use connector::GDriveConnector;
pub use gdrive::{DriveEndpoints, DriveFile, GDriveClient};
pub use secret::ClientSecret;
pub use token_manager::{AuthState, RefreshDecision, StoredToken, TokenManager, DRIVE_SCOPE};
