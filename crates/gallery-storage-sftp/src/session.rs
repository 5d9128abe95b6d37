use std::sync::Arc;

use gallery_storage_core::{SftpSpec, StorageError};
use russh::client::{self, Handle};
use russh::Disconnect;
use russh_sftp::client::SftpSession;
use tracing::{info, warn};

/// Accepts any host key. Gallery targets are LAN boxes configured by the
/// operator; the key is logged so a change is at least visible.
pub struct TrustingHandler {
    host: String,
}

impl client::Handler for TrustingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        warn!(
            "Trusting unverified host key {} for {}",
            server_public_key.algorithm().as_str(),
            self.host
        );
        Ok(true)
    }
}

/// An authenticated SSH connection with the SFTP subsystem open.
pub struct Connected {
    pub sftp: SftpSession,
    handle: Handle<TrustingHandler>,
}

impl Connected {
    pub async fn open(spec: &SftpSpec) -> Result<Self, StorageError> {
        let config = Arc::new(client::Config::default());
        let handler = TrustingHandler {
            host: spec.host.clone(),
        };

        let mut handle = client::connect(config, (spec.host.as_str(), spec.port), handler)
            .await
            .map_err(|e| {
                StorageError::Connection(format!(
                    "SSH connect to {}:{} failed: {}",
                    spec.host, spec.port, e
                ))
            })?;

        let auth = handle
            .authenticate_password(spec.username.as_str(), spec.password.expose())
            .await
            .map_err(|e| StorageError::Connection(format!("SSH auth exchange failed: {}", e)))?;
        if !auth.success() {
            return Err(StorageError::Auth(format!(
                "SSH password rejected for {}@{}",
                spec.username, spec.host
            )));
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| StorageError::Connection(format!("Failed to open channel: {}", e)))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| {
                StorageError::Connection(format!("Failed to request SFTP subsystem: {}", e))
            })?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| StorageError::Connection(format!("SFTP init failed: {}", e)))?;

        info!("SFTP session opened to {}:{}", spec.host, spec.port);
        Ok(Self { sftp, handle })
    }

    pub async fn close(self) -> Result<(), StorageError> {
        let closed = self.sftp.close().await;
        let disconnected = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await;
        closed.map_err(|e| StorageError::Connection(format!("SFTP close failed: {}", e)))?;
        disconnected
            .map_err(|e| StorageError::Connection(format!("SSH disconnect failed: {}", e)))?;
        Ok(())
    }
}

/// Map an SFTP failure on `path` to a storage error, `fallback` deciding the
/// variant for anything not recognized as missing or forbidden.
pub fn map_sftp_error(
    err: &russh_sftp::client::error::Error,
    path: &str,
    fallback: fn(String) -> StorageError,
) -> StorageError {
    classify(&err.to_string(), path, fallback)
}

pub(crate) fn classify(
    message: &str,
    path: &str,
    fallback: fn(String) -> StorageError,
) -> StorageError {
    if message.contains("No such file") || message.contains("not found") {
        StorageError::NotFound(format!("{} not found", path))
    } else if message.contains("Permission denied") {
        StorageError::Directory(format!("Permission denied on {}", path))
    } else {
        fallback(format!("{}: {}", path, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known_messages() {
        assert!(matches!(
            classify("No such file", "/a", StorageError::Transfer),
            StorageError::NotFound(_)
        ));
        assert!(matches!(
            classify("Permission denied", "/a", StorageError::Transfer),
            StorageError::Directory(_)
        ));
        assert!(matches!(
            classify("Failure", "/a", StorageError::Transfer),
            StorageError::Transfer(m) if m == "/a: Failure"
        ));
    }
}
