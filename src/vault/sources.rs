//! Ordered credential sources.
//!
//! The OAuth client registration can be pre-provisioned by an operator
//! through the environment, or entered once by the user and persisted
//! encrypted. Sources are tried in priority order; the first one that
//! yields a registration wins.

use super::{ClientRegistration, VaultError};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Environment variables for deployment-provisioned credentials.
pub const CLIENT_ID_ENV_VAR: &str = "POCKETSYNC_CLIENT_ID";
pub const CLIENT_SECRET_ENV_VAR: &str = "POCKETSYNC_CLIENT_SECRET";
pub const API_KEY_ENV_VAR: &str = "POCKETSYNC_API_KEY";

/// A place a client registration can come from.
pub trait CredentialSource: Send + Sync {
    fn name(&self) -> &'static str;
    fn load(&self) -> Option<ClientRegistration>;
}

/// Deployment-level configuration from the environment.
pub struct EnvSource;

impl CredentialSource for EnvSource {
    fn name(&self) -> &'static str {
        "environment"
    }

    fn load(&self) -> Option<ClientRegistration> {
        let client_id = std::env::var(CLIENT_ID_ENV_VAR).ok()?;
        let client_secret = std::env::var(CLIENT_SECRET_ENV_VAR).ok()?;
        Some(ClientRegistration {
            client_id,
            client_secret,
            api_key: std::env::var(API_KEY_ENV_VAR).ok(),
        })
    }
}

/// The encrypted on-disk registration written by `Vault::save_credentials`.
pub struct EncryptedFileSource {
    pub(super) path: PathBuf,
    pub(super) key: Vec<u8>,
}

impl EncryptedFileSource {
    /// Typed variant: distinguishes "absent" from "corrupt".
    pub fn try_load(&self) -> Result<Option<ClientRegistration>, VaultError> {
        super::read_sealed_json(&self.path, &self.key)
    }
}

impl CredentialSource for EncryptedFileSource {
    fn name(&self) -> &'static str {
        "encrypted file"
    }

    fn load(&self) -> Option<ClientRegistration> {
        match self.try_load() {
            Ok(reg) => reg,
            Err(e) => {
                warn!(error = %e, "Stored client registration unreadable, treating as absent");
                None
            }
        }
    }
}

/// Tries each source in order, returning the first registration found.
pub(super) fn resolve(sources: &[&dyn CredentialSource]) -> Option<ClientRegistration> {
    for source in sources {
        if let Some(registration) = source.load() {
            debug!(source = source.name(), "Resolved client registration");
            return Some(registration);
        }
    }
    None
}
