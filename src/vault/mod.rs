//! Encrypted credential vault.
//!
//! Persists the OAuth client registration and the obtained token pair in
//! encrypted flat files under the application data directory, outside the
//! embedded database. All payloads are sealed with AES-256-GCM and a fresh
//! nonce per write.
//!
//! The vault never panics or propagates errors across its public getters: a
//! corrupt or undecryptable file degrades to "absent" with a log line.
//! Callers that need to distinguish absent from corrupt use the `try_*`
//! variants, which return a typed [`VaultError`].

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

mod encryption;
mod sources;

pub use encryption::{master_key, validate_key, SecretEnvelope, KEY_ENV_VAR};
pub use sources::{
    CredentialSource, EncryptedFileSource, EnvSource, API_KEY_ENV_VAR, CLIENT_ID_ENV_VAR,
    CLIENT_SECRET_ENV_VAR,
};

const TOKENS_FILE_NAME: &str = "tokens.enc";
const CREDENTIALS_FILE_NAME: &str = "credentials.enc";

/// OAuth client registration, supplied by the operator or the user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRegistration {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

/// The token pair obtained from a successful authorization-code exchange.
///
/// Mutated in place on refresh; the refresh token is preserved unless the
/// provider rotates it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Scope string as granted by the provider, verbatim.
    #[serde(default)]
    pub granted_scope: Option<String>,
}

/// Typed failure at the vault boundary.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("stored secret at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// Encrypted persistence for secrets.
pub struct Vault {
    tokens_path: PathBuf,
    credentials_path: PathBuf,
    key: Vec<u8>,
}

impl Vault {
    /// Opens (or prepares) the vault under a data directory.
    ///
    /// Resolves the master key (environment first, per-install key file
    /// otherwise) and fixes the secret file locations. No secret files are
    /// created until something is saved.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let key = encryption::master_key(data_dir).context("Failed to resolve master key")?;
        Ok(Self {
            tokens_path: data_dir.join(TOKENS_FILE_NAME),
            credentials_path: data_dir.join(CREDENTIALS_FILE_NAME),
            key,
        })
    }

    // --- token pair ---

    pub fn save_tokens(&self, pair: &TokenPair) -> Result<()> {
        write_sealed_json(&self.tokens_path, &self.key, pair)
    }

    /// Typed load: `Ok(None)` means no tokens were ever saved.
    pub fn try_load_tokens(&self) -> Result<Option<TokenPair>, VaultError> {
        read_sealed_json(&self.tokens_path, &self.key)
    }

    /// Lenient load: a corrupt token file degrades to `None` with a log line.
    pub fn get_tokens(&self) -> Option<TokenPair> {
        match self.try_load_tokens() {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "Stored tokens unreadable, treating as absent");
                None
            }
        }
    }

    pub fn has_tokens(&self) -> bool {
        self.get_tokens().is_some()
    }

    // --- client registration ---

    pub fn save_credentials(&self, registration: &ClientRegistration) -> Result<()> {
        write_sealed_json(&self.credentials_path, &self.key, registration)
    }

    /// Resolves the client registration: environment first, then the
    /// encrypted file. Operators can pre-provision credentials without any
    /// per-user setup.
    pub fn get_credentials(&self) -> Option<ClientRegistration> {
        let file_source = self.file_source();
        sources::resolve(&[&EnvSource, &file_source])
    }

    /// Typed load of the on-disk registration only (no environment).
    pub fn try_load_credentials(&self) -> Result<Option<ClientRegistration>, VaultError> {
        self.file_source().try_load()
    }

    pub fn has_credentials(&self) -> bool {
        self.get_credentials().is_some()
    }

    fn file_source(&self) -> EncryptedFileSource {
        EncryptedFileSource {
            path: self.credentials_path.clone(),
            key: self.key.clone(),
        }
    }

    // --- teardown ---

    /// Deletes the stored token pair. Idempotent.
    pub fn clear_tokens(&self) -> Result<()> {
        remove_if_present(&self.tokens_path)
    }

    /// Deletes every stored secret. Idempotent.
    pub fn clear(&self) -> Result<()> {
        remove_if_present(&self.tokens_path)?;
        remove_if_present(&self.credentials_path)
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "Removed secret file");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

fn write_sealed_json<T: Serialize>(path: &Path, key: &[u8], value: &T) -> Result<()> {
    let plaintext = serde_json::to_string(value).context("Failed to serialize secret")?;
    let envelope = encryption::seal(&plaintext, key).context("Failed to seal secret")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, serde_json::to_vec(&envelope)?)
        .with_context(|| format!("Failed to write {}", path.display()))
}

fn read_sealed_json<T: DeserializeOwned>(
    path: &Path,
    key: &[u8],
) -> Result<Option<T>, VaultError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(VaultError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    let corrupt = |reason: String| VaultError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    let envelope: SecretEnvelope =
        serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;
    let plaintext = encryption::open(&envelope, key).map_err(|e| corrupt(e.to_string()))?;
    let value = serde_json::from_str(&plaintext).map_err(|e| corrupt(e.to_string()))?;
    Ok(Some(value))
}
