//! SMB backend for remote gallery storage.
//!
//! Talks to a Windows/Samba share through libsmbclient. The client is
//! blocking, so each connector owns a worker thread that runs every share
//! operation in order.

mod connector;
mod session;

pub use connector::SmbConnector;
