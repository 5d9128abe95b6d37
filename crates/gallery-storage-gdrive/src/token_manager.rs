//! OAuth token manager with on-disk persistence and automatic refresh.
//!
//! The token lives in a JSON credentials file next to the user's config. It
//! is cached in memory and refreshed via Google OAuth2 when it is within five
//! minutes of expiry. The first token has to come from an interactive consent
//! step the host drives with `authorization_url` and `exchange_code`.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use gallery_storage_core::StorageError;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::secret::ClientSecret;

/// Scope limited to files the application created.
pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";

/// Token as persisted in the credentials file.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredToken {
    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(exp) => now >= exp - Duration::minutes(5),
            None => true,
        }
    }
}

impl fmt::Debug for StoredToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredToken")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthState {
    Unauthorized,
    Authorized(StoredToken),
}

/// What to do with the current token before the next API call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshDecision {
    UseCached,
    Refresh,
    ConsentRequired,
}

impl AuthState {
    pub fn refresh_decision(&self, now: DateTime<Utc>) -> RefreshDecision {
        match self {
            Self::Unauthorized => RefreshDecision::ConsentRequired,
            Self::Authorized(token) if !token.is_expired_at(now) => RefreshDecision::UseCached,
            Self::Authorized(token) if token.refresh_token.is_some() => RefreshDecision::Refresh,
            Self::Authorized(_) => RefreshDecision::ConsentRequired,
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
    refresh_token: Option<String>,
}

impl TokenResponse {
    fn into_token(self, previous_refresh: Option<&str>) -> StoredToken {
        StoredToken {
            access_token: self.access_token,
            // Google only sometimes rotates the refresh token
            refresh_token: self
                .refresh_token
                .or_else(|| previous_refresh.map(str::to_string)),
            expires_at: Some(Utc::now() + Duration::seconds(self.expires_in as i64)),
        }
    }
}

pub struct TokenManager {
    http: reqwest::Client,
    secret: ClientSecret,
    token_url: String,
    credentials_path: PathBuf,
    state: Mutex<AuthState>,
}

impl TokenManager {
    /// Build the manager, picking up a previously persisted token if any.
    /// An unreadable credentials file is treated as no token.
    pub async fn load(
        secret: ClientSecret,
        credentials_path: PathBuf,
        token_url: Option<String>,
    ) -> Self {
        let state = match read_token(&credentials_path).await {
            Ok(Some(token)) => {
                debug!("Loaded token from {}", credentials_path.display());
                AuthState::Authorized(token)
            }
            Ok(None) => AuthState::Unauthorized,
            Err(e) => {
                warn!("Ignoring credentials file: {}", e);
                AuthState::Unauthorized
            }
        };
        let token_url = token_url.unwrap_or_else(|| secret.token_uri.clone());
        Self {
            http: reqwest::Client::new(),
            secret,
            token_url,
            credentials_path,
            state: Mutex::new(state),
        }
    }

    pub async fn state(&self) -> AuthState {
        self.state.lock().await.clone()
    }

    /// Get a valid access token, refreshing if necessary.
    pub async fn get_valid_token(&self) -> Result<String, StorageError> {
        let mut state = self.state.lock().await;
        match state.refresh_decision(Utc::now()) {
            RefreshDecision::UseCached => {
                if let AuthState::Authorized(token) = &*state {
                    debug!("Token cache hit");
                    return Ok(token.access_token.clone());
                }
                Err(consent_required())
            }
            RefreshDecision::ConsentRequired => Err(consent_required()),
            RefreshDecision::Refresh => {
                let refresh = match &*state {
                    AuthState::Authorized(StoredToken {
                        refresh_token: Some(r),
                        ..
                    }) => r.clone(),
                    _ => return Err(consent_required()),
                };
                info!("Refreshing cloud drive OAuth token");
                let token = self
                    .refresh_token(&refresh)
                    .await
                    .map_err(|e| StorageError::Auth(format!("Token refresh failed: {}", e)))?;
                if let Err(e) = write_token(&self.credentials_path, &token).await {
                    warn!("Failed to persist refreshed token: {}", e);
                }
                let access = token.access_token.clone();
                *state = AuthState::Authorized(token);
                Ok(access)
            }
        }
    }

    /// Refresh an OAuth token using the refresh_token grant.
    async fn refresh_token(&self, refresh_token: &str) -> anyhow::Result<StoredToken> {
        let resp = self
            .http
            .post(&self.token_url)
            .form(&[
                ("client_id", self.secret.client_id.as_str()),
                ("client_secret", self.secret.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("OAuth token refresh failed: {} {}", status, body);
        }

        let token_resp: TokenResponse = resp.json().await?;
        Ok(token_resp.into_token(Some(refresh_token)))
    }

    /// Consent page the user must open to grant access.
    pub fn authorization_url(&self) -> Result<String, StorageError> {
        let url = reqwest::Url::parse_with_params(
            &self.secret.auth_uri,
            &[
                ("client_id", self.secret.client_id.as_str()),
                ("redirect_uri", self.secret.redirect_uri()),
                ("response_type", "code"),
                ("scope", DRIVE_SCOPE),
                ("access_type", "offline"),
                ("prompt", "consent"),
            ],
        )
        .map_err(|e| StorageError::Config(format!("Invalid auth_uri in client secret: {}", e)))?;
        Ok(url.to_string())
    }

    /// Trade the code from the consent page for a token and persist it.
    pub async fn exchange_code(&self, code: &str) -> Result<(), StorageError> {
        let token = self
            .request_code_exchange(code.trim())
            .await
            .map_err(|e| StorageError::Auth(format!("Authorization code exchange failed: {}", e)))?;
        write_token(&self.credentials_path, &token).await?;
        *self.state.lock().await = AuthState::Authorized(token);
        info!(
            "Cloud drive authorized, token stored at {}",
            self.credentials_path.display()
        );
        Ok(())
    }

    async fn request_code_exchange(&self, code: &str) -> anyhow::Result<StoredToken> {
        let resp = self
            .http
            .post(&self.token_url)
            .form(&[
                ("code", code),
                ("client_id", self.secret.client_id.as_str()),
                ("client_secret", self.secret.client_secret.as_str()),
                ("redirect_uri", self.secret.redirect_uri()),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("{} {}", status, body);
        }

        let token_resp: TokenResponse = resp.json().await?;
        Ok(token_resp.into_token(None))
    }
}

fn consent_required() -> StorageError {
    StorageError::AuthorizationRequired(
        "Cloud drive has no usable token; run the authorize command first".to_string(),
    )
}

async fn read_token(path: &Path) -> Result<Option<StoredToken>, StorageError> {
    let json = match tokio::fs::read_to_string(path).await {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(StorageError::Config(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };
    serde_json::from_str(&json)
        .map(Some)
        .map_err(|e| StorageError::Config(format!("Invalid token file {}: {}", path.display(), e)))
}

async fn write_token(path: &Path, token: &StoredToken) -> Result<(), StorageError> {
    let io_err =
        |e: std::io::Error| StorageError::Config(format!("Failed to write {}: {}", path.display(), e));

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let json = serde_json::to_string_pretty(token)
        .map_err(|e| StorageError::Config(format!("Failed to encode token: {}", e)))?;
    tokio::fs::write(path, json).await.map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(io_err)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn secret() -> ClientSecret {
        ClientSecret::from_json(r#"{"installed":{"client_id":"cid","client_secret":"csecret"}}"#)
            .unwrap()
    }

    fn token(expires_in_minutes: i64, refresh: Option<&str>) -> StoredToken {
        StoredToken {
            access_token: "old-access".to_string(),
            refresh_token: refresh.map(str::to_string),
            expires_at: Some(Utc::now() + Duration::minutes(expires_in_minutes)),
        }
    }

    #[test]
    fn test_refresh_decision() {
        let now = Utc::now();
        assert_eq!(
            AuthState::Unauthorized.refresh_decision(now),
            RefreshDecision::ConsentRequired
        );
        assert_eq!(
            AuthState::Authorized(token(60, Some("r"))).refresh_decision(now),
            RefreshDecision::UseCached
        );
        // Inside the five minute margin counts as expired.
        assert_eq!(
            AuthState::Authorized(token(3, Some("r"))).refresh_decision(now),
            RefreshDecision::Refresh
        );
        assert_eq!(
            AuthState::Authorized(token(-10, None)).refresh_decision(now),
            RefreshDecision::ConsentRequired
        );
    }

    #[tokio::test]
    async fn test_missing_credentials_require_consent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TokenManager::load(secret(), dir.path().join("token.json"), None).await;
        assert_eq!(manager.state().await, AuthState::Unauthorized);
        let err = manager.get_valid_token().await.unwrap_err();
        assert!(matches!(err, StorageError::AuthorizationRequired(_)));
    }

    #[tokio::test]
    async fn test_cached_token_skips_network() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        write_token(&path, &token(60, Some("r"))).await.unwrap();

        let manager =
            TokenManager::load(secret(), path, Some("http://127.0.0.1:9/token".to_string())).await;
        assert_eq!(manager.get_valid_token().await.unwrap(), "old-access");
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed_and_persisted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=keep-me"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new-access",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("token.json");
        write_token(&path, &token(-1, Some("keep-me"))).await.unwrap();

        let manager =
            TokenManager::load(secret(), path.clone(), Some(format!("{}/token", server.uri())))
                .await;
        assert_eq!(manager.get_valid_token().await.unwrap(), "new-access");
        // Second call is served from cache.
        assert_eq!(manager.get_valid_token().await.unwrap(), "new-access");

        let stored = read_token(&path).await.unwrap().unwrap();
        assert_eq!(stored.access_token, "new-access");
        assert_eq!(stored.refresh_token.as_deref(), Some("keep-me"));
    }

    #[tokio::test]
    async fn test_refresh_rejected_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        write_token(&path, &token(-1, Some("revoked"))).await.unwrap();

        let manager =
            TokenManager::load(secret(), path, Some(format!("{}/token", server.uri()))).await;
        let err = manager.get_valid_token().await.unwrap_err();
        assert!(matches!(err, StorageError::Auth(m) if m.contains("invalid_grant")));
    }

    #[tokio::test]
    async fn test_exchange_code_authorizes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "granted",
                "expires_in": 3600,
                "refresh_token": "long-lived"
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        let manager =
            TokenManager::load(secret(), path.clone(), Some(format!("{}/token", server.uri())))
                .await;

        let url = manager.authorization_url().unwrap();
        assert!(url.starts_with("https://accounts.google.com/o/oauth2/auth?"));
        assert!(url.contains("client_id=cid"));
        assert!(url.contains("access_type=offline"));

        manager.exchange_code(" abc\n").await.unwrap();
        assert_eq!(manager.get_valid_token().await.unwrap(), "granted");
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_corrupt_credentials_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        tokio::fs::write(&path, "not json").await.unwrap();
        let manager = TokenManager::load(secret(), path, None).await;
        assert_eq!(manager.state().await, AuthState::Unauthorized);
    }
}
