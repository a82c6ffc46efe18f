//! Push/pull orchestration.
//!
//! Composes the vault, authorization manager, state tracker, and storage
//! adapter into the operations the application shell calls: connect, push,
//! pull, check status, disconnect. Only one push or pull may run at a time —
//! both read or replace the same file on disk — so mutating operations are
//! serialized behind a single in-flight guard.
//!
//! The engine supplies structured status and error codes; all prompting and
//! confirmation copy belongs to the UI. A pull that would discard unsynced
//! local edits is refused until the caller acknowledges the loss.

use crate::auth::{self, AuthManager, ScopeLevel};
use crate::config::EngineConfig;
use crate::error::{RemoteError, SyncErrorCode};
use crate::remote::{ContainerInfo, DownloadOutcome, DriveAdapter, RemoteInfo};
use crate::tracker::{SyncConfig, SyncTracker};
use crate::transport::RetryPolicy;
use crate::vault::Vault;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where the engine currently stands with respect to the cloud copy.
///
/// Derived from the configuration and hashes on demand, never stored, so it
/// survives crashes without repair logic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncPhase {
    NotConfigured,
    InSync,
    Diverged,
    Syncing,
}

/// Snapshot of the sync state for the UI. Recomputed per request.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub configured: bool,
    pub is_file_based: bool,
    pub has_local_changes: bool,
    pub sync_required: bool,
    /// Whether the remote copy changed since the last sync; `None` when the
    /// remote could not be reached.
    pub remote_changed: Option<bool>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub remote_folder_name: Option<String>,
    pub user_email: Option<String>,
}

/// Caller choices for a pull.
#[derive(Clone, Copy, Debug, Default)]
pub struct PullOptions {
    /// The user has confirmed that unsynced local edits may be discarded.
    pub acknowledge_local_loss: bool,
}

/// Seam for local backup housekeeping, invoked just before a pull
/// overwrites the database file. The default does nothing.
pub trait BackupHook: Send + Sync {
    fn before_overwrite(&self, db_path: &Path) -> anyhow::Result<()>;
}

struct NoopBackup;

impl BackupHook for NoopBackup {
    fn before_overwrite(&self, _db_path: &Path) -> anyhow::Result<()> {
        Ok(())
    }
}

/// The sync engine. Constructed once at the application's composition root
/// and passed by reference to whoever needs it.
pub struct SyncEngine {
    vault: Arc<Vault>,
    auth: Arc<AuthManager>,
    tracker: SyncTracker,
    adapter: DriveAdapter,
    remote_db_name: String,
    backup: Box<dyn BackupHook>,
    in_flight: tokio::sync::Mutex<()>,
}

impl SyncEngine {
    /// Builds the whole engine from configuration.
    pub fn initialize(config: &EngineConfig, redirect_uri: String) -> anyhow::Result<Self> {
        let vault = Arc::new(Vault::open(&config.data_dir)?);
        let auth = Arc::new(AuthManager::new(Arc::clone(&vault), redirect_uri));
        let tracker = SyncTracker::new(&config.data_dir, config.db_path());
        let adapter = DriveAdapter::new(
            Arc::clone(&auth),
            RetryPolicy::from(&config.retry),
            Duration::from_secs(config.download_timeout_seconds),
        );
        Ok(Self::from_parts(
            vault,
            auth,
            tracker,
            adapter,
            config.remote_db_name.clone(),
        ))
    }

    /// Assembles an engine from pre-built parts (used by tests).
    pub fn from_parts(
        vault: Arc<Vault>,
        auth: Arc<AuthManager>,
        tracker: SyncTracker,
        adapter: DriveAdapter,
        remote_db_name: String,
    ) -> Self {
        Self {
            vault,
            auth,
            tracker,
            adapter,
            remote_db_name,
            backup: Box::new(NoopBackup),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    /// Installs a backup hook to run before destructive pulls.
    pub fn with_backup_hook(mut self, hook: Box<dyn BackupHook>) -> Self {
        self.backup = hook;
        self
    }

    /// True while a push or pull is in flight. Application shutdown should
    /// be deferred while this holds.
    pub fn is_busy(&self) -> bool {
        self.in_flight.try_lock().is_err()
    }

    /// Authorization URL for the requested scope tier.
    pub fn get_authorization_url(&self, level: ScopeLevel) -> Result<String, RemoteError> {
        self.auth.build_authorization_url(level, None)
    }

    /// Completes the authorization flow with the callback's code and state.
    ///
    /// The account email is fetched asynchronously afterwards; the callback
    /// response never waits on it.
    pub async fn handle_callback(&self, code: &str, state: &str) -> Result<(), RemoteError> {
        let (level, _custom) = auth::decode_state(state);
        let pair = self.auth.exchange_code(code).await?;

        if pair.granted_scope.is_none() {
            // Provider omitted the scope string; record the requested tier
            // so scope checks have something to work with
            let mut pair = pair;
            pair.granted_scope = Some(auth::scopes(level).join(" "));
            self.vault.save_tokens(&pair).map_err(persist_error)?;
        }

        let auth = Arc::clone(&self.auth);
        let tracker = self.tracker.clone();
        tokio::spawn(async move {
            match auth.fetch_user_email().await {
                Ok(Some(email)) => {
                    if let Err(e) = tracker.set_user_email(Some(email)) {
                        warn!(error = %e, "Failed to store account email");
                    }
                }
                Ok(None) => {}
                Err(e) => debug!(error = %e, "Could not fetch account email"),
            }
        });

        Ok(())
    }

    /// Validates a folder and binds it as the sync target.
    pub async fn connect_folder(&self, folder_id: &str) -> Result<ContainerInfo, RemoteError> {
        let info = self.adapter.validate_container(folder_id).await?;
        self.tracker
            .set_bound_container(&info.id, &info.name)
            .map_err(persist_error)?;
        info!(folder_id = %info.id, folder_name = %info.name, "Sync folder connected");
        Ok(info)
    }

    /// Binds a file shared by a different account as the sync target.
    ///
    /// Requires the extended scope tier: shared objects are not visible to a
    /// grant that only covers app-created files.
    pub async fn connect_shared_file(&self, file_id: &str) -> Result<(), RemoteError> {
        if !self.auth.has_extended_scope() {
            return Err(RemoteError::new(
                SyncErrorCode::NoAccess,
                "Full-access authorization is required to sync a shared file",
            ));
        }

        let info = self.adapter.file_info(file_id).await?;
        if !info.exists {
            return Err(RemoteError::new(
                SyncErrorCode::NotFound,
                "Shared file not found or not accessible",
            ));
        }

        self.tracker.set_bound_file(file_id).map_err(persist_error)?;
        info!(file_id = %file_id, "Shared file connected");
        Ok(())
    }

    /// Uploads the local database to the bound target.
    ///
    /// The synced digest is recorded only after the upload succeeds; a
    /// failed push leaves the recorded state untouched.
    pub async fn push(&self) -> Result<(), RemoteError> {
        let _guard = self.acquire()?;
        let config = self.configured()?;

        let hash = self.tracker.compute_db_hash().ok_or_else(|| {
            RemoteError::new(
                SyncErrorCode::CorruptLocalState,
                "Local database file does not exist yet",
            )
        })?;

        let outcome = if config.is_file_based_sync {
            let file_id = target_id(config.remote_file_id.as_deref())?;
            self.adapter
                .upload_to_file(file_id, self.tracker.db_path())
                .await?
        } else {
            let folder_id = target_id(config.remote_folder_id.as_deref())?;
            self.adapter
                .upload(self.tracker.db_path(), folder_id, &self.remote_db_name)
                .await?
        };

        self.tracker.mark_synced(&hash).map_err(persist_error)?;
        self.tracker
            .record_remote_content_hash(outcome.content_hash)
            .map_err(persist_error)?;

        info!(file_id = %outcome.file_id, "Push complete");
        Ok(())
    }

    /// Replaces the local database with the remote copy.
    ///
    /// Refused with `ConfirmationRequired` when unsynced local edits exist
    /// and the caller has not acknowledged the loss. The backup hook runs
    /// before the local file is overwritten.
    pub async fn pull(&self, options: PullOptions) -> Result<(), RemoteError> {
        let _guard = self.acquire()?;
        let config = self.configured()?;

        let db_path = self.tracker.db_path().to_path_buf();
        let local_exists = db_path.exists();
        if local_exists && self.tracker.has_local_changes() && !options.acknowledge_local_loss {
            return Err(RemoteError::new(
                SyncErrorCode::ConfirmationRequired,
                "Unsynced local changes would be overwritten by the remote copy",
            ));
        }

        if local_exists {
            self.backup.before_overwrite(&db_path).map_err(|e| {
                RemoteError::new(
                    SyncErrorCode::CorruptLocalState,
                    format!("Local backup failed: {}", e),
                )
            })?;
        }

        let outcome = if config.is_file_based_sync {
            let file_id = target_id(config.remote_file_id.as_deref())?;
            self.adapter.download_file(file_id, &db_path).await?
        } else {
            let folder_id = target_id(config.remote_folder_id.as_deref())?;
            self.adapter
                .download(folder_id, &self.remote_db_name, &db_path)
                .await?
        };

        if outcome == DownloadOutcome::NotFound {
            return Err(RemoteError::new(
                SyncErrorCode::NotFound,
                "No remote copy exists yet",
            ));
        }

        let hash = self.tracker.compute_db_hash().ok_or_else(|| {
            RemoteError::new(
                SyncErrorCode::CorruptLocalState,
                "Downloaded database is missing from disk",
            )
        })?;

        self.tracker.mark_synced(&hash).map_err(persist_error)?;
        let remote_hash = match self.fetch_remote_info(&config).await {
            Ok(info) => info.content_hash,
            Err(e) => {
                debug!(error = %e, "Could not record remote checksum after pull");
                None
            }
        };
        self.tracker
            .record_remote_content_hash(remote_hash)
            .map_err(persist_error)?;

        info!("Pull complete");
        Ok(())
    }

    /// Recomputes the full sync status. Remote reachability problems degrade
    /// to a local-only answer instead of failing the status check.
    pub async fn check_status(&self) -> SyncStatus {
        let config = self.tracker.load();
        if !config.is_configured() {
            return SyncStatus {
                phase: SyncPhase::NotConfigured,
                configured: false,
                is_file_based: false,
                has_local_changes: false,
                sync_required: false,
                remote_changed: None,
                last_synced_at: None,
                remote_folder_name: None,
                user_email: config.user_email,
            };
        }

        let syncing = self.is_busy();
        let has_local_changes = self.tracker.has_local_changes();
        let remote_changed = match self.fetch_remote_info(&config).await {
            Ok(info) => {
                Some(info.exists && self.tracker.remote_diverged(info.content_hash.as_deref()))
            }
            Err(e) => {
                debug!(error = %e, "Remote status unavailable");
                None
            }
        };

        let sync_required = self.tracker.is_sync_required() || remote_changed == Some(true);
        let phase = if syncing {
            SyncPhase::Syncing
        } else if sync_required {
            SyncPhase::Diverged
        } else {
            SyncPhase::InSync
        };

        SyncStatus {
            phase,
            configured: true,
            is_file_based: config.is_file_based_sync,
            has_local_changes,
            sync_required,
            remote_changed,
            last_synced_at: config.last_synced_at,
            remote_folder_name: config.remote_folder_name,
            user_email: config.user_email,
        }
    }

    /// Revokes the grant (best effort) and purges every trace of the sync
    /// setup: tokens, registration, and configuration.
    pub async fn disconnect(&self) -> Result<(), RemoteError> {
        let _guard = self.acquire()?;

        if !self.auth.revoke().await {
            warn!("Token revocation failed, clearing local state anyway");
        }

        self.vault.clear().map_err(persist_error)?;
        self.tracker.clear().map_err(persist_error)?;

        info!("Disconnected from cloud sync");
        Ok(())
    }

    // --- internals ---

    fn acquire(&self) -> Result<tokio::sync::MutexGuard<'_, ()>, RemoteError> {
        self.in_flight.try_lock().map_err(|_| {
            RemoteError::new(
                SyncErrorCode::AlreadyRunning,
                "A sync operation is already in progress",
            )
        })
    }

    fn configured(&self) -> Result<SyncConfig, RemoteError> {
        let config = self.tracker.load();
        if !config.is_configured() {
            return Err(RemoteError::new(
                SyncErrorCode::NotConfigured,
                "Cloud sync has not been set up",
            ));
        }
        Ok(config)
    }

    async fn fetch_remote_info(&self, config: &SyncConfig) -> Result<RemoteInfo, RemoteError> {
        if config.is_file_based_sync {
            let file_id = target_id(config.remote_file_id.as_deref())?;
            self.adapter.file_info(file_id).await
        } else {
            let folder_id = target_id(config.remote_folder_id.as_deref())?;
            self.adapter.remote_info(folder_id, &self.remote_db_name).await
        }
    }
}

fn target_id(id: Option<&str>) -> Result<&str, RemoteError> {
    id.ok_or_else(|| {
        RemoteError::new(
            SyncErrorCode::NotConfigured,
            "No remote target bound for this mode",
        )
    })
}

fn persist_error(e: anyhow::Error) -> RemoteError {
    RemoteError::new(
        SyncErrorCode::CorruptLocalState,
        format!("Failed to persist sync state: {}", e),
    )
}
