//! Local sync-state bookkeeping.
//!
//! The single source of truth for "is the local database in sync with the
//! last known cloud copy". Divergence is tracked by content hash, never by
//! timestamps — clocks are unreliable across clients, file contents are not.
//!
//! The configuration document is plain JSON in the application data
//! directory. Every update is a read-merge-write over the whole document, so
//! partial updates can never erase fields the caller did not touch. Like the
//! vault, the tracker never throws across its read-side boundary: a corrupt
//! document degrades to "not configured" with a log line.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const CONFIG_FILE_NAME: &str = "sync-config.json";
const HASH_BUF_SIZE: usize = 64 * 1024;

/// Persisted sync configuration.
///
/// `is_configured` is derived, never stored. `synced_db_hash` is only ever
/// written by a successful push or pull.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Bound remote folder id. Mutually exclusive with `remote_file_id`.
    pub remote_folder_id: Option<String>,
    pub remote_folder_name: Option<String>,
    /// Bound shared-file id (multi-account mode).
    pub remote_file_id: Option<String>,
    pub is_file_based_sync: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Informational only; shown in the UI.
    pub user_email: Option<String>,
    /// Hex digest of the local database as of the last successful sync.
    pub synced_db_hash: Option<String>,
    /// Provider-reported checksum of the remote object as of the last
    /// successful sync. Compared against fresh remote metadata to detect
    /// remote-side divergence; never compared against the local digest.
    pub remote_content_hash: Option<String>,
}

impl SyncConfig {
    /// True iff a remote folder or a shared file is bound.
    pub fn is_configured(&self) -> bool {
        self.remote_folder_id.is_some() || self.remote_file_id.is_some()
    }
}

/// Tracks the sync configuration and the local database digest.
#[derive(Clone)]
pub struct SyncTracker {
    config_path: PathBuf,
    db_path: PathBuf,
}

impl SyncTracker {
    pub fn new(data_dir: &Path, db_path: PathBuf) -> Self {
        Self {
            config_path: data_dir.join(CONFIG_FILE_NAME),
            db_path,
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Loads the configuration. Absent or corrupt documents degrade to the
    /// empty (not configured) configuration.
    pub fn load(&self) -> SyncConfig {
        let contents = match std::fs::read_to_string(&self.config_path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return SyncConfig::default(),
            Err(e) => {
                warn!(error = %e, "Failed to read sync configuration, treating as empty");
                return SyncConfig::default();
            }
        };

        match serde_json::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Sync configuration is corrupt, treating as empty");
                SyncConfig::default()
            }
        }
    }

    /// Read-merge-write update over the whole document.
    pub fn update(&self, mutate: impl FnOnce(&mut SyncConfig)) -> Result<SyncConfig> {
        let mut config = self.load();
        mutate(&mut config);

        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let contents =
            serde_json::to_string_pretty(&config).context("Failed to serialize configuration")?;
        std::fs::write(&self.config_path, contents)
            .with_context(|| format!("Failed to write {}", self.config_path.display()))?;

        Ok(config)
    }

    /// Erases the configuration document. Idempotent.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.config_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to remove {}", self.config_path.display())),
        }
    }

    /// Binds a remote folder, replacing any previous binding. The sync
    /// baseline resets: the new container has no known synced copy yet.
    pub fn set_bound_container(&self, folder_id: &str, folder_name: &str) -> Result<()> {
        self.update(|config| {
            config.remote_folder_id = Some(folder_id.to_string());
            config.remote_folder_name = Some(folder_name.to_string());
            config.remote_file_id = None;
            config.is_file_based_sync = false;
            config.last_synced_at = None;
            config.synced_db_hash = None;
            config.remote_content_hash = None;
        })
        .map(|_| ())
    }

    /// Binds a directly-shared remote file (multi-account mode).
    pub fn set_bound_file(&self, file_id: &str) -> Result<()> {
        self.update(|config| {
            config.remote_file_id = Some(file_id.to_string());
            config.remote_folder_id = None;
            config.remote_folder_name = None;
            config.is_file_based_sync = true;
            config.last_synced_at = None;
            config.synced_db_hash = None;
            config.remote_content_hash = None;
        })
        .map(|_| ())
    }

    /// Records a successful sync of the given local content digest.
    pub fn mark_synced(&self, hash: &str) -> Result<()> {
        self.update(|config| {
            config.synced_db_hash = Some(hash.to_string());
            config.last_synced_at = Some(Utc::now());
        })
        .map(|_| ())
    }

    /// Records the provider checksum observed for the synced remote object.
    pub fn record_remote_content_hash(&self, hash: Option<String>) -> Result<()> {
        self.update(|config| config.remote_content_hash = hash).map(|_| ())
    }

    pub fn set_user_email(&self, email: Option<String>) -> Result<()> {
        self.update(|config| config.user_email = email).map(|_| ())
    }

    /// Streaming SHA-256 of the local database. `None` when the file does
    /// not exist yet (fresh install).
    pub fn compute_db_hash(&self) -> Option<String> {
        Self::compute_file_hash(&self.db_path)
    }

    /// Streaming SHA-256 digest of any file, lowercase hex.
    pub fn compute_file_hash(path: &Path) -> Option<String> {
        let mut file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No file to hash yet");
                return None;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to open file for hashing");
                return None;
            }
        };

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_BUF_SIZE];
        loop {
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => hasher.update(&buf[..n]),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Read failed while hashing");
                    return None;
                }
            }
        }

        Some(hex::encode(hasher.finalize()))
    }

    /// True when the live local content differs from the last synced digest,
    /// or when no sync has happened yet.
    pub fn has_local_changes(&self) -> bool {
        let config = self.load();
        match (self.compute_db_hash(), config.synced_db_hash) {
            (Some(live), Some(synced)) => live != synced,
            // Never synced, or the local file is gone
            _ => true,
        }
    }

    /// The authoritative gate consulted before destructive local writes.
    ///
    /// False whenever sync is not configured; true whenever never synced or
    /// the local content drifted from the recorded baseline. Remote-side
    /// divergence is layered on top by the orchestrator, which is the only
    /// component that can observe the cloud hash.
    pub fn is_sync_required(&self) -> bool {
        let config = self.load();
        if !config.is_configured() {
            return false;
        }
        self.has_local_changes()
    }

    /// True when a freshly observed remote checksum differs from the one
    /// recorded at the last successful sync.
    pub fn remote_diverged(&self, current_remote_hash: Option<&str>) -> bool {
        let config = self.load();
        match (config.remote_content_hash.as_deref(), current_remote_hash) {
            (Some(recorded), Some(current)) => recorded != current,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_in(dir: &Path) -> SyncTracker {
        SyncTracker::new(dir, dir.join("ledger.db"))
    }

    #[test]
    fn test_empty_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker_in(dir.path());

        let config = tracker.load();
        assert!(!config.is_configured());
        assert!(config.synced_db_hash.is_none());
        assert!(!tracker.is_sync_required());
    }

    #[test]
    fn test_update_merges_not_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker_in(dir.path());

        tracker.set_bound_container("F1", "Finances").unwrap();
        tracker.set_user_email(Some("a@example.com".to_string())).unwrap();

        // The email update must not have erased the folder binding
        let config = tracker.load();
        assert_eq!(config.remote_folder_id.as_deref(), Some("F1"));
        assert_eq!(config.remote_folder_name.as_deref(), Some("Finances"));
        assert_eq!(config.user_email.as_deref(), Some("a@example.com"));
    }

    #[test]
    fn test_bindings_are_mutually_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker_in(dir.path());

        tracker.set_bound_container("F1", "Finances").unwrap();
        tracker.set_bound_file("SHARED1").unwrap();

        let config = tracker.load();
        assert_eq!(config.remote_file_id.as_deref(), Some("SHARED1"));
        assert!(config.remote_folder_id.is_none());
        assert!(config.is_file_based_sync);
        assert!(config.is_configured());

        tracker.set_bound_container("F2", "Budget").unwrap();
        let config = tracker.load();
        assert!(config.remote_file_id.is_none());
        assert!(!config.is_file_based_sync);
    }

    #[test]
    fn test_rebinding_resets_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker_in(dir.path());

        tracker.set_bound_container("F1", "Finances").unwrap();
        tracker.mark_synced("abc123").unwrap();
        tracker
            .record_remote_content_hash(Some("md5-1".to_string()))
            .unwrap();

        tracker.set_bound_container("F2", "Budget").unwrap();
        let config = tracker.load();
        assert!(config.synced_db_hash.is_none());
        assert!(config.last_synced_at.is_none());
        assert!(config.remote_content_hash.is_none());
    }

    #[test]
    fn test_hash_determinism() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.db");
        let b = dir.path().join("b.db");
        std::fs::write(&a, b"identical bytes").unwrap();
        std::fs::write(&b, b"identical bytes").unwrap();

        let hash_a = SyncTracker::compute_file_hash(&a).unwrap();
        let hash_b = SyncTracker::compute_file_hash(&b).unwrap();
        assert_eq!(hash_a, hash_b);
        assert_eq!(hash_a.len(), 64); // SHA-256 hex

        std::fs::write(&b, b"different bytes").unwrap();
        assert_ne!(hash_a, SyncTracker::compute_file_hash(&b).unwrap());
    }

    #[test]
    fn test_missing_file_hashes_to_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SyncTracker::compute_file_hash(&dir.path().join("nope.db")).is_none());
    }

    #[test]
    fn test_sync_required_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker_in(dir.path());
        std::fs::write(tracker.db_path(), b"db-v1").unwrap();

        // Unconfigured: never required
        assert!(!tracker.is_sync_required());

        // Configured but never synced: required
        tracker.set_bound_container("F1", "Finances").unwrap();
        assert!(tracker.is_sync_required());
        assert!(tracker.has_local_changes());

        // Marked synced at the current content: in sync
        let hash = tracker.compute_db_hash().unwrap();
        tracker.mark_synced(&hash).unwrap();
        assert!(!tracker.has_local_changes());
        assert!(!tracker.is_sync_required());

        // Local mutation without a new mark: required again
        std::fs::write(tracker.db_path(), b"db-v2").unwrap();
        assert!(tracker.has_local_changes());
        assert!(tracker.is_sync_required());
    }

    #[test]
    fn test_remote_divergence_detection() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker_in(dir.path());

        // Nothing recorded yet: no verdict
        assert!(!tracker.remote_diverged(Some("md5-2")));

        tracker
            .record_remote_content_hash(Some("md5-1".to_string()))
            .unwrap();
        assert!(!tracker.remote_diverged(Some("md5-1")));
        assert!(tracker.remote_diverged(Some("md5-2")));
        assert!(!tracker.remote_diverged(None));
    }

    #[test]
    fn test_corrupt_document_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker_in(dir.path());

        std::fs::write(dir.path().join(CONFIG_FILE_NAME), b"{not json").unwrap();
        assert!(!tracker.load().is_configured());
        assert!(!tracker.is_sync_required());
    }

    #[test]
    fn test_clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker_in(dir.path());

        tracker.set_bound_container("F1", "Finances").unwrap();
        tracker.clear().unwrap();
        assert!(!tracker.load().is_configured());
        tracker.clear().unwrap();
    }

    #[test]
    fn test_document_uses_camel_case_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker_in(dir.path());

        tracker.set_bound_container("F1", "Finances").unwrap();
        let on_disk = std::fs::read_to_string(dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert!(on_disk.contains("remoteFolderId"));
        assert!(on_disk.contains("\"F1\""));
    }
}
