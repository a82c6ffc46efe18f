//! OAuth 2.0 authorization lifecycle.
//!
//! Drives the authorization-code flow against Google:
//! 1. UI requests an authorization URL for a scope tier
//! 2. User consents in the browser; the app shell delivers `code` + `state`
//! 3. The code is exchanged for a token pair, persisted in the vault
//! 4. Expired access tokens are refreshed lazily on use
//!
//! Two scope tiers exist: the standard tier can only touch files this app
//! created (least privilege); the extended tier grants full Drive access and
//! is required to sync against a file shared by a different account.

use crate::error::{RemoteError, SyncErrorCode};
use crate::vault::{TokenPair, Vault};
use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

mod state;

pub use state::{decode_state, encode_state};

/// Scope for files created or opened by this application only.
pub const DRIVE_FILE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";

/// Full Drive access, needed for multi-account (shared file) sync.
pub const DRIVE_FULL_SCOPE: &str = "https://www.googleapis.com/auth/drive";

/// Lets the engine display which account is connected.
pub const EMAIL_SCOPE: &str = "https://www.googleapis.com/auth/userinfo.email";

/// Refresh this many seconds before the recorded expiry.
const EXPIRY_SKEW_SECONDS: i64 = 60;

/// Breadth of permission requested from the provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeLevel {
    /// App-created files only.
    Standard,
    /// Full account access.
    Extended,
}

/// Scopes requested for a tier.
pub fn scopes(level: ScopeLevel) -> Vec<&'static str> {
    match level {
        ScopeLevel::Standard => vec![DRIVE_FILE_SCOPE, EMAIL_SCOPE],
        ScopeLevel::Extended => vec![DRIVE_FULL_SCOPE, EMAIL_SCOPE],
    }
}

/// Provider endpoint URLs, overridable for tests.
#[derive(Clone, Debug)]
pub struct AuthEndpoints {
    pub auth_url: String,
    pub token_url: String,
    pub revoke_url: String,
    pub userinfo_url: String,
}

impl Default for AuthEndpoints {
    fn default() -> Self {
        Self {
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            revoke_url: "https://oauth2.googleapis.com/revoke".to_string(),
            userinfo_url: "https://www.googleapis.com/oauth2/v2/userinfo".to_string(),
        }
    }
}

/// Token endpoint response (exchange and refresh share the shape).
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Deserialize)]
struct UserInfo {
    #[serde(default)]
    email: Option<String>,
}

/// Manages the OAuth authorization lifecycle on top of the vault.
pub struct AuthManager {
    vault: Arc<Vault>,
    http: reqwest::Client,
    endpoints: AuthEndpoints,
    redirect_uri: String,
}

impl AuthManager {
    pub fn new(vault: Arc<Vault>, redirect_uri: String) -> Self {
        Self::with_endpoints(vault, redirect_uri, AuthEndpoints::default())
    }

    /// Custom endpoints, for tests against a mock server.
    pub fn with_endpoints(
        vault: Arc<Vault>,
        redirect_uri: String,
        endpoints: AuthEndpoints,
    ) -> Self {
        Self {
            vault,
            http: reqwest::Client::new(),
            endpoints,
            redirect_uri,
        }
    }

    /// True when a client registration is available from any source.
    pub fn is_configured(&self) -> bool {
        self.vault.has_credentials()
    }

    /// Builds the provider authorization URL for a scope tier.
    ///
    /// Requests offline access with a consent prompt so a refresh token is
    /// issued on every grant. The `state` parameter encodes the tier (and an
    /// optional caller value) for the callback handler.
    pub fn build_authorization_url(
        &self,
        level: ScopeLevel,
        custom_state: Option<&str>,
    ) -> Result<String, RemoteError> {
        let registration = self.vault.get_credentials().ok_or_else(|| {
            RemoteError::new(
                SyncErrorCode::AuthRequired,
                "No OAuth client registration configured",
            )
        })?;

        let scope = scopes(level).join(" ");
        let state = state::encode_state(level, custom_state);

        Ok(format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&access_type=offline&prompt=consent&state={}",
            self.endpoints.auth_url,
            urlencoding::encode(&registration.client_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(&scope),
            urlencoding::encode(&state)
        ))
    }

    /// Exchanges an authorization code for a token pair and persists it.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenPair, RemoteError> {
        let registration = self.vault.get_credentials().ok_or_else(|| {
            RemoteError::new(
                SyncErrorCode::AuthRequired,
                "No OAuth client registration configured",
            )
        })?;

        let mut form = HashMap::new();
        form.insert("grant_type", "authorization_code");
        form.insert("code", code);
        form.insert("redirect_uri", &self.redirect_uri);
        form.insert("client_id", &registration.client_id);
        form.insert("client_secret", &registration.client_secret);

        debug!("Exchanging authorization code for tokens");

        let response = self
            .http
            .post(&self.endpoints.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                RemoteError::new(
                    SyncErrorCode::Transient,
                    format!("Token exchange request failed: {}", e),
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let code = if status.is_server_error() {
                SyncErrorCode::Transient
            } else {
                SyncErrorCode::AuthRequired
            };
            return Err(RemoteError::new(
                code,
                format!("Token exchange rejected with status {}", status),
            ));
        }

        let token_response: TokenResponse = response.json().await.map_err(|e| {
            RemoteError::new(
                SyncErrorCode::AuthRequired,
                format!("Malformed token response: {}", e),
            )
        })?;

        let pair = TokenPair {
            access_token: token_response.access_token,
            refresh_token: token_response.refresh_token,
            expires_at: token_response
                .expires_in
                .map(|seconds| Utc::now() + Duration::seconds(seconds)),
            token_type: token_response.token_type,
            granted_scope: token_response.scope,
        };

        self.vault.save_tokens(&pair).map_err(|e| {
            RemoteError::new(
                SyncErrorCode::CorruptLocalState,
                format!("Failed to persist tokens: {}", e),
            )
        })?;

        info!(
            has_refresh_token = pair.refresh_token.is_some(),
            "Authorization code exchanged"
        );

        Ok(pair)
    }

    /// Returns a valid bearer token, refreshing it first if expired.
    ///
    /// `None` means re-authorization is required (no tokens, or the refresh
    /// token was rejected) — callers must not treat it as a transient fault.
    pub async fn authorized_token(&self) -> Option<String> {
        let pair = self.vault.get_tokens()?;

        if !is_expired(&pair) {
            return Some(pair.access_token);
        }

        match self.refresh(pair).await {
            Ok(refreshed) => Some(refreshed.access_token),
            Err(e) => {
                warn!(error = %e, "Token refresh failed, re-authorization required");
                None
            }
        }
    }

    /// Exchanges the refresh token for a new access token and persists the
    /// updated pair. The original refresh token and granted scope are kept
    /// when the provider omits them from the response.
    async fn refresh(&self, pair: TokenPair) -> Result<TokenPair> {
        let refresh_token = pair
            .refresh_token
            .clone()
            .context("No refresh token stored")?;
        let registration = self
            .vault
            .get_credentials()
            .context("No client registration configured")?;

        let mut form = HashMap::new();
        form.insert("grant_type", "refresh_token");
        form.insert("refresh_token", refresh_token.as_str());
        form.insert("client_id", &registration.client_id);
        form.insert("client_secret", &registration.client_secret);

        info!("Refreshing OAuth access token");

        let response = self
            .http
            .post(&self.endpoints.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .context("Failed to send token refresh request")?;

        if !response.status().is_success() {
            let status = response.status();
            anyhow::bail!("Token refresh rejected with status {}", status);
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .context("Failed to parse token refresh response")?;

        let refreshed = TokenPair {
            access_token: token_response.access_token,
            // Keep the existing refresh token if the provider did not rotate it
            refresh_token: token_response.refresh_token.or(Some(refresh_token)),
            expires_at: token_response
                .expires_in
                .map(|seconds| Utc::now() + Duration::seconds(seconds)),
            token_type: token_response.token_type.or(pair.token_type),
            // Refresh responses may omit the scope; the grant is unchanged
            granted_scope: token_response.scope.or(pair.granted_scope),
        };

        self.vault
            .save_tokens(&refreshed)
            .context("Failed to persist refreshed tokens")?;

        Ok(refreshed)
    }

    /// True when the stored grant includes full Drive access.
    ///
    /// The narrow scope string is a literal prefix of the broad one, so this
    /// must compare whole tokens of the scope list, never substrings.
    pub fn has_extended_scope(&self) -> bool {
        self.vault
            .get_tokens()
            .and_then(|pair| pair.granted_scope)
            .map(|scope| scope.split_whitespace().any(|s| s == DRIVE_FULL_SCOPE))
            .unwrap_or(false)
    }

    /// Best-effort revocation of the stored grant at the provider.
    ///
    /// Returns true when the provider confirmed the revocation (or there was
    /// nothing to revoke). The stored tokens are not deleted here; that is
    /// the vault's job during disconnect.
    pub async fn revoke(&self) -> bool {
        let pair = match self.vault.get_tokens() {
            Some(pair) => pair,
            None => return true,
        };

        // Revoking the refresh token invalidates the whole grant
        let token = pair.refresh_token.unwrap_or(pair.access_token);

        let mut form = HashMap::new();
        form.insert("token", token.as_str());

        match self
            .http
            .post(&self.endpoints.revoke_url)
            .form(&form)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                info!("OAuth grant revoked");
                true
            }
            Ok(response) => {
                warn!(status = %response.status(), "Token revocation rejected");
                false
            }
            Err(e) => {
                warn!(error = %e, "Token revocation request failed");
                false
            }
        }
    }

    /// Fetches the authenticated user's email address, for display only.
    pub async fn fetch_user_email(&self) -> Result<Option<String>> {
        let token = match self.authorized_token().await {
            Some(token) => token,
            None => return Ok(None),
        };

        let response = self
            .http
            .get(&self.endpoints.userinfo_url)
            .bearer_auth(&token)
            .send()
            .await
            .context("Failed to send userinfo request")?;

        if !response.status().is_success() {
            anyhow::bail!("Userinfo request failed with status {}", response.status());
        }

        let info: UserInfo = response
            .json()
            .await
            .context("Failed to parse userinfo response")?;
        Ok(info.email)
    }
}

fn is_expired(pair: &TokenPair) -> bool {
    match pair.expires_at {
        Some(expires_at) => expires_at <= Utc::now() + Duration::seconds(EXPIRY_SKEW_SECONDS),
        // No recorded expiry: assume still valid
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::ClientRegistration;

    fn vault_with_registration(dir: &std::path::Path) -> Arc<Vault> {
        let vault = Arc::new(Vault::open(dir).unwrap());
        vault
            .save_credentials(&ClientRegistration {
                client_id: "test-client".to_string(),
                client_secret: "test-secret".to_string(),
                api_key: None,
            })
            .unwrap();
        vault
    }

    fn pair_with_scope(scope: &str) -> TokenPair {
        TokenPair {
            access_token: "tok".to_string(),
            refresh_token: Some("refresh".to_string()),
            expires_at: Some(Utc::now() + Duration::hours(1)),
            token_type: Some("Bearer".to_string()),
            granted_scope: Some(scope.to_string()),
        }
    }

    #[test]
    fn test_scope_tiers() {
        assert!(scopes(ScopeLevel::Standard).contains(&DRIVE_FILE_SCOPE));
        assert!(!scopes(ScopeLevel::Standard).contains(&DRIVE_FULL_SCOPE));
        assert!(scopes(ScopeLevel::Extended).contains(&DRIVE_FULL_SCOPE));
    }

    #[test]
    fn test_extended_scope_requires_exact_token_match() {
        let dir = tempfile::tempdir().unwrap();
        let vault = vault_with_registration(dir.path());
        let manager = AuthManager::new(Arc::clone(&vault), "http://127.0.0.1".to_string());

        // The narrow scope contains the broad scope as a substring; that
        // must NOT count as extended access.
        vault
            .save_tokens(&pair_with_scope(DRIVE_FILE_SCOPE))
            .unwrap();
        assert!(!manager.has_extended_scope());

        vault
            .save_tokens(&pair_with_scope(&format!(
                "{} {}",
                DRIVE_FILE_SCOPE, EMAIL_SCOPE
            )))
            .unwrap();
        assert!(!manager.has_extended_scope());

        vault
            .save_tokens(&pair_with_scope(&format!(
                "{} {}",
                DRIVE_FULL_SCOPE, EMAIL_SCOPE
            )))
            .unwrap();
        assert!(manager.has_extended_scope());
    }

    #[test]
    fn test_authorization_url_contents() {
        let dir = tempfile::tempdir().unwrap();
        let vault = vault_with_registration(dir.path());
        let manager =
            AuthManager::new(vault, "http://127.0.0.1:49152/callback".to_string());

        let url = manager
            .build_authorization_url(ScopeLevel::Standard, Some("win-1"))
            .unwrap();

        assert!(url.starts_with("https://accounts.google.com/o/oauth2/v2/auth?"));
        assert!(url.contains("client_id=test-client"));
        assert!(url.contains("redirect_uri=http%3A%2F%2F127.0.0.1%3A49152%2Fcallback"));
        assert!(url.contains("access_type=offline"));
        assert!(url.contains("prompt=consent"));
        assert!(url.contains("response_type=code"));

        // The state round-trips through the URL
        let state_param = url
            .split("state=")
            .nth(1)
            .map(|rest| rest.split('&').next().unwrap())
            .unwrap();
        let decoded = urlencoding::decode(state_param).unwrap();
        let (level, custom) = decode_state(&decoded);
        assert_eq!(level, ScopeLevel::Standard);
        assert_eq!(custom.as_deref(), Some("win-1"));
    }

    #[test]
    fn test_authorization_url_without_registration() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Arc::new(Vault::open(dir.path()).unwrap());
        let manager = AuthManager::new(vault, "http://127.0.0.1".to_string());

        let err = manager
            .build_authorization_url(ScopeLevel::Standard, None)
            .unwrap_err();
        assert_eq!(err.code, crate::error::SyncErrorCode::AuthRequired);
    }

    #[tokio::test]
    async fn test_exchange_code_persists_pair() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!(
                r#"{{"access_token":"ya29.new","refresh_token":"1//r","expires_in":3600,"token_type":"Bearer","scope":"{}"}}"#,
                DRIVE_FILE_SCOPE
            ))
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let vault = vault_with_registration(dir.path());
        let manager = AuthManager::with_endpoints(
            Arc::clone(&vault),
            "http://127.0.0.1".to_string(),
            AuthEndpoints {
                token_url: format!("{}/token", server.url()),
                ..AuthEndpoints::default()
            },
        );

        let pair = manager.exchange_code("auth-code").await.unwrap();
        assert_eq!(pair.access_token, "ya29.new");
        assert_eq!(pair.granted_scope.as_deref(), Some(DRIVE_FILE_SCOPE));

        // Persisted through the vault
        let stored = vault.get_tokens().unwrap();
        assert_eq!(stored.access_token, "ya29.new");
        assert!(stored.expires_at.is_some());

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_exchange_code_rejected() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let vault = vault_with_registration(dir.path());
        let manager = AuthManager::with_endpoints(
            Arc::clone(&vault),
            "http://127.0.0.1".to_string(),
            AuthEndpoints {
                token_url: format!("{}/token", server.url()),
                ..AuthEndpoints::default()
            },
        );

        let err = manager.exchange_code("bad-code").await.unwrap_err();
        assert_eq!(err.code, crate::error::SyncErrorCode::AuthRequired);
        assert!(!vault.has_tokens());
    }

    #[tokio::test]
    async fn test_refresh_preserves_refresh_token_and_scope() {
        let mut server = mockito::Server::new_async().await;
        // Provider omits refresh_token and scope from the refresh response
        let mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"ya29.fresh","expires_in":3600}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let vault = vault_with_registration(dir.path());
        let mut expired = pair_with_scope(DRIVE_FULL_SCOPE);
        expired.expires_at = Some(Utc::now() - Duration::seconds(10));
        vault.save_tokens(&expired).unwrap();

        let manager = AuthManager::with_endpoints(
            Arc::clone(&vault),
            "http://127.0.0.1".to_string(),
            AuthEndpoints {
                token_url: format!("{}/token", server.url()),
                ..AuthEndpoints::default()
            },
        );

        let token = manager.authorized_token().await.unwrap();
        assert_eq!(token, "ya29.fresh");

        let stored = vault.get_tokens().unwrap();
        assert_eq!(stored.refresh_token.as_deref(), Some("refresh"));
        assert_eq!(stored.granted_scope.as_deref(), Some(DRIVE_FULL_SCOPE));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_failure_means_reauthorization() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let vault = vault_with_registration(dir.path());
        let mut expired = pair_with_scope(DRIVE_FILE_SCOPE);
        expired.expires_at = Some(Utc::now() - Duration::seconds(10));
        vault.save_tokens(&expired).unwrap();

        let manager = AuthManager::with_endpoints(
            Arc::clone(&vault),
            "http://127.0.0.1".to_string(),
            AuthEndpoints {
                token_url: format!("{}/token", server.url()),
                ..AuthEndpoints::default()
            },
        );

        // Null, not an error: the caller must start re-authorization
        assert!(manager.authorized_token().await.is_none());
    }

    #[tokio::test]
    async fn test_valid_token_needs_no_network() {
        let dir = tempfile::tempdir().unwrap();
        let vault = vault_with_registration(dir.path());
        vault.save_tokens(&pair_with_scope(DRIVE_FILE_SCOPE)).unwrap();

        // Endpoints point nowhere; a network call would fail loudly
        let manager = AuthManager::with_endpoints(
            vault,
            "http://127.0.0.1".to_string(),
            AuthEndpoints {
                token_url: "http://127.0.0.1:1/token".to_string(),
                ..AuthEndpoints::default()
            },
        );

        assert_eq!(manager.authorized_token().await.unwrap(), "tok");
    }
}
