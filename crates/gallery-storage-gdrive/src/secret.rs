//! OAuth client secret file as downloaded from the Google Cloud console.

use std::fmt;
use std::path::Path;

use gallery_storage_core::StorageError;
use serde::Deserialize;

const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Desktop ("installed") or web OAuth client credentials.
#[derive(Clone, Deserialize)]
pub struct ClientSecret {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

fn default_auth_uri() -> String {
    DEFAULT_AUTH_URI.to_string()
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Deserialize)]
struct SecretFile {
    installed: Option<ClientSecret>,
    web: Option<ClientSecret>,
}

impl ClientSecret {
    pub fn from_json(json: &str) -> Result<Self, StorageError> {
        let file: SecretFile = serde_json::from_str(json)
            .map_err(|e| StorageError::Config(format!("Invalid client secret JSON: {}", e)))?;
        file.installed.or(file.web).ok_or_else(|| {
            StorageError::Config(
                "Client secret has neither an \"installed\" nor a \"web\" section".to_string(),
            )
        })
    }

    pub async fn load(path: &Path) -> Result<Self, StorageError> {
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            StorageError::Config(format!(
                "Failed to read client secret {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&json)
    }

    /// Redirect used for the out-of-band consent step.
    pub fn redirect_uri(&self) -> &str {
        self.redirect_uris
            .first()
            .map(String::as_str)
            .unwrap_or("http://localhost")
    }
}

impl fmt::Debug for ClientSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSecret")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_installed_section() {
        let secret = ClientSecret::from_json(
            r#"{"installed":{"client_id":"id-1","client_secret":"s3cret","redirect_uris":["urn:ietf:wg:oauth:2.0:oob"]}}"#,
        )
        .unwrap();
        assert_eq!(secret.client_id, "id-1");
        assert_eq!(secret.token_uri, DEFAULT_TOKEN_URI);
        assert_eq!(secret.redirect_uri(), "urn:ietf:wg:oauth:2.0:oob");
        assert!(!format!("{:?}", secret).contains("s3cret"));
    }

    #[test]
    fn test_web_section_and_missing_sections() {
        let secret =
            ClientSecret::from_json(r#"{"web":{"client_id":"w","client_secret":"x"}}"#).unwrap();
        assert_eq!(secret.client_id, "w");
        assert_eq!(secret.redirect_uri(), "http://localhost");

        let err = ClientSecret::from_json(r#"{"other":{}}"#).unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ClientSecret::load(&dir.path().join("nope.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }
}
