//! Core traits and types for remote gallery storage.
//!
//! This crate defines the abstractions shared by every backend:
//! - `StorageConnector`: bootstrap, store, list, fetch and release
//! - `ConnectionSpec`: parsed per-connection configuration
//! - PNG encoding with embedded text metadata
//! - The fixed remote directory layout

mod artifact;
mod codec;
mod connector;
mod error;
mod layout;
#[cfg(any(test, feature = "test-util"))]
mod memory;
mod spec;

pub use artifact::{ImageArtifact, PixelBuffer, PixelFormat, TextMetadata, PARAMETERS_KEY};
pub use codec::{decode_image, encode_png, PNG_SIGNATURE};
pub use connector::{BackendKind, ConnectorId, StorageConnector, Timeouts};
pub use error::{AggregateError, ConnectorFailure, StorageError};
pub use layout::{
    bootstrap_chain, is_image_file, join_remote, leftover_note, listing_entries, partial_name,
    strip_synthetic_entries, ArtifactName, GallerySubdir, RawEntry, DEFAULT_ROOT,
    IMAGE_EXTENSIONS,
};
#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryConnector;
pub use spec::{
    parse_cloud_drive_spec, parse_sftp_specs, parse_smb_specs, CloudDriveOptions,
    CloudDriveSpec, ConnectionSpec, Password, SftpOptions, SftpSpec, SmbOptions, SmbSpec,
    DEFAULT_SFTP_PORT, DEFAULT_SMB_PORT,
};
