use std::fmt;

use crate::connector::ConnectorId;

/// Errors raised by a single storage connector or by configuration parsing.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    /// Malformed or incomplete connection specification.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Session could not be established.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Credentials were rejected or a token could not be obtained.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// No usable OAuth token; the host must run the consent step.
    #[error("Authorization required: {0}")]
    AuthorizationRequired(String),

    /// The fixed directory layout could not be created.
    #[error("Directory error: {0}")]
    Directory(String),

    /// A single store or fetch failed. The connector stays usable.
    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl StorageError {
    /// Whether the error leaves the connector unusable for further calls.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Transfer(_) | Self::NotFound(_))
    }

    /// Append `suffix` to the message, keeping the variant.
    pub fn with_suffix(self, suffix: &str) -> Self {
        if suffix.is_empty() {
            return self;
        }
        match self {
            Self::Config(m) => Self::Config(m + suffix),
            Self::Connection(m) => Self::Connection(m + suffix),
            Self::Auth(m) => Self::Auth(m + suffix),
            Self::AuthorizationRequired(m) => Self::AuthorizationRequired(m + suffix),
            Self::Directory(m) => Self::Directory(m + suffix),
            Self::Transfer(m) => Self::Transfer(m + suffix),
            Self::NotFound(m) => Self::NotFound(m + suffix),
        }
    }
}

/// One failed connector inside a fan-out operation.
#[derive(Debug, Clone)]
pub struct ConnectorFailure {
    pub connector: ConnectorId,
    pub error: StorageError,
}

impl fmt::Display for ConnectorFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.connector, self.error)
    }
}

/// Every per-connector failure collected by one fan-out call.
#[derive(Debug, Clone)]
pub struct AggregateError {
    pub failures: Vec<ConnectorFailure>,
}

impl AggregateError {
    pub fn new(failures: Vec<ConnectorFailure>) -> Self {
        Self { failures }
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} connector(s) failed", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}", sep, failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::BackendKind;

    #[test]
    fn test_aggregate_error_lists_every_failure() {
        let err = AggregateError::new(vec![
            ConnectorFailure {
                connector: ConnectorId::new(BackendKind::Smb, "smb://10.0.0.2:445/share/sd_web_ui"),
                error: StorageError::Transfer("broken pipe".to_string()),
            },
            ConnectorFailure {
                connector: ConnectorId::new(BackendKind::Sftp, "sftp://alice@nas:22/srv/images"),
                error: StorageError::Connection("timed out".to_string()),
            },
        ]);

        let message = err.to_string();
        assert!(message.starts_with("2 connector(s) failed"));
        assert!(message.contains("broken pipe"));
        assert!(message.contains("timed out"));
        assert_eq!(err.len(), 2);
    }

    #[test]
    fn test_transfer_errors_are_not_fatal() {
        assert!(!StorageError::Transfer("x".into()).is_fatal());
        assert!(StorageError::Directory("x".into()).is_fatal());
        assert!(StorageError::AuthorizationRequired("x".into()).is_fatal());
    }

    #[test]
    fn test_with_suffix_keeps_variant() {
        let err = StorageError::Transfer("rename failed".into()).with_suffix(" (left over)");
        assert!(matches!(err, StorageError::Transfer(ref m) if m == "rename failed (left over)"));
        assert!(matches!(
            StorageError::NotFound("x".into()).with_suffix(""),
            StorageError::NotFound(ref m) if m == "x"
        ));
    }
}
