//! Error taxonomy for the sync engine.
//!
//! Remote failures carry a stable code so the UI can choose the right
//! remediation (re-authenticate, re-pick the folder, request edit access)
//! without parsing provider messages. Raw provider bodies never cross the
//! engine boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error codes surfaced to callers of the sync engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncErrorCode {
    /// No usable credentials, or the refresh token was rejected.
    /// Triggers the re-authorization flow, never a retry.
    AuthRequired,
    /// Authenticated but the object denies access entirely.
    NoAccess,
    /// Readable but not writable (e.g. a shared folder without edit grant).
    ReadOnly,
    /// Object id is stale, deleted, or resolves to the wrong kind of object.
    NotFound,
    /// Rate limit or server error; retried automatically and surfaced only
    /// after the retry budget is exhausted.
    Transient,
    /// A long-running transfer exceeded its bound. Not auto-retried.
    Timeout,
    /// The operation would discard unsynced local edits; the caller must
    /// acknowledge the loss explicitly.
    ConfirmationRequired,
    /// Another push or pull is already in flight.
    AlreadyRunning,
    /// Sync has not been configured yet.
    NotConfigured,
    /// Local persisted state could not be read, written, or decrypted.
    CorruptLocalState,
}

/// A structured failure from the transport, adapter, or orchestrator.
#[derive(Clone, Debug, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct RemoteError {
    pub code: SyncErrorCode,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: SyncErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// True for failures the transport is allowed to retry.
    pub fn is_transient(&self) -> bool {
        self.code == SyncErrorCode::Transient
    }

    /// Short remediation hint for the UI, where one exists.
    pub fn remediation(&self) -> Option<&'static str> {
        match self.code {
            SyncErrorCode::AuthRequired => Some("Reconnect your account"),
            SyncErrorCode::NoAccess => {
                Some("Ask the folder owner to share it with this account")
            }
            SyncErrorCode::ReadOnly => Some("Ask the folder owner for edit access"),
            SyncErrorCode::NotFound => Some("Re-pick the sync folder"),
            SyncErrorCode::Transient => Some("The service is busy, try again shortly"),
            SyncErrorCode::Timeout => Some("Check your connection and retry"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_serialization() {
        let json = serde_json::to_string(&SyncErrorCode::AuthRequired).unwrap();
        assert_eq!(json, "\"AUTH_REQUIRED\"");

        let json = serde_json::to_string(&SyncErrorCode::ReadOnly).unwrap();
        assert_eq!(json, "\"READ_ONLY\"");
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(RemoteError::new(SyncErrorCode::Transient, "503").is_transient());
        assert!(!RemoteError::new(SyncErrorCode::NotFound, "404").is_transient());
        assert!(!RemoteError::new(SyncErrorCode::AuthRequired, "401").is_transient());
        assert!(!RemoteError::new(SyncErrorCode::Timeout, "stalled").is_transient());
    }

    #[test]
    fn test_remediation_hints() {
        assert!(RemoteError::new(SyncErrorCode::ReadOnly, "x")
            .remediation()
            .unwrap()
            .contains("edit access"));
        assert!(RemoteError::new(SyncErrorCode::AlreadyRunning, "x")
            .remediation()
            .is_none());
    }
}
