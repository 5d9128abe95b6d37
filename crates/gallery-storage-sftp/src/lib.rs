//! SFTP backend for remote gallery storage.
//!
//! Connects with password authentication over russh and keeps one SFTP
//! subsystem channel open for the lifetime of the connector.

mod connector;
mod session;

pub use connector::SftpConnector;
