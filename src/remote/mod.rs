//! Google Drive storage adapter.
//!
//! Performs the actual remote operations: validate a target folder, upload
//! (create-or-replace) the database file, download it, and fetch metadata.
//! Two addressing strategies exist: folder-scoped lookup-by-name for the
//! common case, and direct file-id access for a file shared by a different
//! account, which is not enumerable by folder listing. Every call that can
//! touch shared objects passes `supportsAllDrives`, since omitting it turns
//! legitimately shared objects into 404s.
//!
//! The adapter reports outcomes; it never owns sync bookkeeping — updating
//! `lastSyncedAt` and the recorded digests is the orchestrator's job.

use crate::auth::AuthManager;
use crate::error::{RemoteError, SyncErrorCode};
use crate::transport::{with_retry, RetryPolicy};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

mod query;

pub use query::{escape_name, sanitize_id};

const API_BASE_URL: &str = "https://www.googleapis.com/drive/v3";
const UPLOAD_BASE_URL: &str = "https://www.googleapis.com/upload/drive/v3";
const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// Remote object metadata, as much of it as the engine cares about.
#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "mimeType", default)]
    mime_type: Option<String>,
    #[serde(rename = "md5Checksum", default)]
    md5_checksum: Option<String>,
    #[serde(rename = "modifiedTime", default)]
    modified_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

/// A validated, writable remote folder.
#[derive(Clone, Debug)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
}

/// Result of a successful upload.
#[derive(Clone, Debug)]
pub struct UploadOutcome {
    pub file_id: String,
    /// Provider-reported checksum of the stored content.
    pub content_hash: Option<String>,
}

/// Download result. Remote-absent is a state, not a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadOutcome {
    Complete,
    NotFound,
}

/// Existence and freshness of the remote copy.
#[derive(Clone, Debug, Default)]
pub struct RemoteInfo {
    pub exists: bool,
    pub modified_at: Option<DateTime<Utc>>,
    pub content_hash: Option<String>,
}

/// Drive client bound to the authorization manager.
pub struct DriveAdapter {
    auth: Arc<AuthManager>,
    http: reqwest::Client,
    api_base: String,
    upload_base: String,
    retry: RetryPolicy,
    download_timeout: Duration,
}

impl DriveAdapter {
    pub fn new(auth: Arc<AuthManager>, retry: RetryPolicy, download_timeout: Duration) -> Self {
        Self::with_bases(
            auth,
            API_BASE_URL.to_string(),
            UPLOAD_BASE_URL.to_string(),
            retry,
            download_timeout,
        )
    }

    /// Custom base URLs, for tests against a mock server.
    pub fn with_bases(
        auth: Arc<AuthManager>,
        api_base: String,
        upload_base: String,
        retry: RetryPolicy,
        download_timeout: Duration,
    ) -> Self {
        Self {
            auth,
            http: reqwest::Client::new(),
            api_base,
            upload_base,
            retry,
            download_timeout,
        }
    }

    /// Validates that `folder_id` resolves to a writable folder.
    ///
    /// Three checks, in order: the id resolves to a folder (a plain file is
    /// reported as not-found — there is no such *container*); it is readable
    /// with the current credentials; and it is writable, proven empirically
    /// by creating and deleting a marker object, because read and write
    /// grants are not equivalent on shared folders. The marker is deleted
    /// whether or not validation succeeds.
    pub async fn validate_container(
        &self,
        folder_id: &str,
    ) -> Result<ContainerInfo, RemoteError> {
        let folder_id = query::sanitize_id(folder_id)?.to_string();
        let token = self.bearer().await?;

        let metadata = self.fetch_metadata(&folder_id, &token).await?;
        if metadata.mime_type.as_deref() != Some(FOLDER_MIME_TYPE) {
            return Err(RemoteError::new(
                SyncErrorCode::NotFound,
                format!("'{}' is not a folder", metadata.name),
            ));
        }

        let marker_name = format!(".pocketsync-probe-{}", Uuid::new_v4());
        match self.create_marker(&folder_id, &marker_name, &token).await {
            Ok(marker_id) => {
                if let Err(e) = self.delete_object(&marker_id, &token).await {
                    warn!(marker_id = %marker_id, error = %e, "Failed to delete write-probe marker");
                }
                info!(folder_id = %folder_id, folder_name = %metadata.name, "Folder validated");
                Ok(ContainerInfo {
                    id: metadata.id,
                    name: metadata.name,
                })
            }
            Err(e) if e.code == SyncErrorCode::NoAccess => Err(RemoteError::new(
                SyncErrorCode::ReadOnly,
                format!("Folder '{}' is readable but not writable", metadata.name),
            )),
            Err(e) => Err(e),
        }
    }

    /// Uploads the local file into the folder, replacing an existing object
    /// of the same name in place (its id is preserved) or creating a new one.
    pub async fn upload(
        &self,
        local_path: &Path,
        folder_id: &str,
        remote_name: &str,
    ) -> Result<UploadOutcome, RemoteError> {
        let folder_id = query::sanitize_id(folder_id)?.to_string();
        let token = self.bearer().await?;
        let bytes = read_local(local_path).await?;

        match self.find_by_name(&folder_id, remote_name, &token).await? {
            Some(existing) => {
                debug!(file_id = %existing.id, "Replacing remote object in place");
                self.replace_content(&existing.id, bytes, &token).await
            }
            None => {
                debug!(folder_id = %folder_id, name = remote_name, "Creating remote object");
                self.create_in_folder(&folder_id, remote_name, bytes, &token)
                    .await
            }
        }
    }

    /// Replaces the content of a directly-bound (shared) file.
    pub async fn upload_to_file(
        &self,
        file_id: &str,
        local_path: &Path,
    ) -> Result<UploadOutcome, RemoteError> {
        let file_id = query::sanitize_id(file_id)?.to_string();
        let token = self.bearer().await?;
        let bytes = read_local(local_path).await?;
        self.replace_content(&file_id, bytes, &token).await
    }

    /// Downloads the named object from the folder to `dest`.
    pub async fn download(
        &self,
        folder_id: &str,
        remote_name: &str,
        dest: &Path,
    ) -> Result<DownloadOutcome, RemoteError> {
        let folder_id = query::sanitize_id(folder_id)?.to_string();
        let token = self.bearer().await?;

        match self.find_by_name(&folder_id, remote_name, &token).await? {
            Some(file) => {
                self.download_content(&file.id, dest, &token).await?;
                Ok(DownloadOutcome::Complete)
            }
            None => Ok(DownloadOutcome::NotFound),
        }
    }

    /// Downloads a directly-bound (shared) file to `dest`.
    pub async fn download_file(
        &self,
        file_id: &str,
        dest: &Path,
    ) -> Result<DownloadOutcome, RemoteError> {
        let file_id = query::sanitize_id(file_id)?.to_string();
        let token = self.bearer().await?;

        match self.download_content(&file_id, dest, &token).await {
            Ok(()) => Ok(DownloadOutcome::Complete),
            Err(e) if e.code == SyncErrorCode::NotFound => Ok(DownloadOutcome::NotFound),
            Err(e) => Err(e),
        }
    }

    /// Existence and freshness of the named object within the folder.
    pub async fn remote_info(
        &self,
        folder_id: &str,
        remote_name: &str,
    ) -> Result<RemoteInfo, RemoteError> {
        let folder_id = query::sanitize_id(folder_id)?.to_string();
        let token = self.bearer().await?;

        Ok(match self.find_by_name(&folder_id, remote_name, &token).await? {
            Some(file) => RemoteInfo {
                exists: true,
                modified_at: file.modified_time,
                content_hash: file.md5_checksum,
            },
            None => RemoteInfo::default(),
        })
    }

    /// Existence and freshness of a directly-bound (shared) file.
    pub async fn file_info(&self, file_id: &str) -> Result<RemoteInfo, RemoteError> {
        let file_id = query::sanitize_id(file_id)?.to_string();
        let token = self.bearer().await?;

        match self.fetch_metadata(&file_id, &token).await {
            Ok(file) => Ok(RemoteInfo {
                exists: true,
                modified_at: file.modified_time,
                content_hash: file.md5_checksum,
            }),
            Err(e) if e.code == SyncErrorCode::NotFound => Ok(RemoteInfo::default()),
            Err(e) => Err(e),
        }
    }

    // --- internals ---

    async fn bearer(&self) -> Result<String, RemoteError> {
        self.auth.authorized_token().await.ok_or_else(|| {
            RemoteError::new(SyncErrorCode::AuthRequired, "Authorization required")
        })
    }

    async fn fetch_metadata(
        &self,
        file_id: &str,
        token: &str,
    ) -> Result<DriveFile, RemoteError> {
        let url = format!("{}/files/{}", self.api_base, file_id);
        with_retry(&self.retry, "metadata fetch", || async {
            let response = self
                .http
                .get(&url)
                .bearer_auth(token)
                .query(&[
                    ("fields", "id,name,mimeType,md5Checksum,modifiedTime"),
                    ("supportsAllDrives", "true"),
                ])
                .send()
                .await
                .map_err(|e| network_error("metadata fetch", e))?;
            let response = ensure_success(response, "Metadata fetch").await?;
            response
                .json::<DriveFile>()
                .await
                .map_err(|e| decode_error("metadata", e))
        })
        .await
    }

    async fn find_by_name(
        &self,
        folder_id: &str,
        name: &str,
        token: &str,
    ) -> Result<Option<DriveFile>, RemoteError> {
        let q = format!(
            "name = '{}' and '{}' in parents and trashed = false",
            query::escape_name(name),
            folder_id
        );
        let url = format!("{}/files", self.api_base);

        with_retry(&self.retry, "lookup by name", || async {
            let response = self
                .http
                .get(&url)
                .bearer_auth(token)
                .query(&[
                    ("q", q.as_str()),
                    ("fields", "files(id,name,mimeType,md5Checksum,modifiedTime)"),
                    ("supportsAllDrives", "true"),
                    ("includeItemsFromAllDrives", "true"),
                ])
                .send()
                .await
                .map_err(|e| network_error("lookup", e))?;
            let response = ensure_success(response, "Lookup").await?;
            let list: FileList = response
                .json()
                .await
                .map_err(|e| decode_error("file list", e))?;
            Ok(list.files.into_iter().next())
        })
        .await
    }

    async fn replace_content(
        &self,
        file_id: &str,
        bytes: Vec<u8>,
        token: &str,
    ) -> Result<UploadOutcome, RemoteError> {
        let url = format!("{}/files/{}", self.upload_base, file_id);
        let file = with_retry(&self.retry, "content replace", || async {
            let response = self
                .http
                .patch(&url)
                .bearer_auth(token)
                .query(&[
                    ("uploadType", "media"),
                    ("supportsAllDrives", "true"),
                    ("fields", "id,md5Checksum"),
                ])
                .header("Content-Type", "application/octet-stream")
                .body(bytes.clone())
                .send()
                .await
                .map_err(|e| network_error("content replace", e))?;
            let response = ensure_success(response, "Content replace").await?;
            response
                .json::<DriveFile>()
                .await
                .map_err(|e| decode_error("upload response", e))
        })
        .await?;

        info!(file_id = %file.id, "Remote content replaced");
        Ok(UploadOutcome {
            file_id: file.id,
            content_hash: file.md5_checksum,
        })
    }

    async fn create_in_folder(
        &self,
        folder_id: &str,
        name: &str,
        bytes: Vec<u8>,
        token: &str,
    ) -> Result<UploadOutcome, RemoteError> {
        let boundary = format!("pocketsync-{}", Uuid::new_v4().simple());
        let metadata = serde_json::json!({ "name": name, "parents": [folder_id] });
        let body = multipart_related(&boundary, &metadata.to_string(), &bytes);
        let url = format!("{}/files", self.upload_base);

        let file = with_retry(&self.retry, "object create", || async {
            let response = self
                .http
                .post(&url)
                .bearer_auth(token)
                .query(&[
                    ("uploadType", "multipart"),
                    ("supportsAllDrives", "true"),
                    ("fields", "id,md5Checksum"),
                ])
                .header(
                    "Content-Type",
                    format!("multipart/related; boundary={}", boundary),
                )
                .body(body.clone())
                .send()
                .await
                .map_err(|e| network_error("object create", e))?;
            let response = ensure_success(response, "Object create").await?;
            response
                .json::<DriveFile>()
                .await
                .map_err(|e| decode_error("upload response", e))
        })
        .await?;

        info!(file_id = %file.id, name = name, "Remote object created");
        Ok(UploadOutcome {
            file_id: file.id,
            content_hash: file.md5_checksum,
        })
    }

    /// Creates an empty marker object used only to probe write access.
    async fn create_marker(
        &self,
        folder_id: &str,
        name: &str,
        token: &str,
    ) -> Result<String, RemoteError> {
        let url = format!("{}/files", self.api_base);
        let metadata = serde_json::json!({
            "name": name,
            "parents": [folder_id],
            "mimeType": "text/plain",
        });

        let file = with_retry(&self.retry, "write probe", || async {
            let response = self
                .http
                .post(&url)
                .bearer_auth(token)
                .query(&[("supportsAllDrives", "true"), ("fields", "id")])
                .json(&metadata)
                .send()
                .await
                .map_err(|e| network_error("write probe", e))?;
            let response = ensure_success(response, "Write probe").await?;
            response
                .json::<DriveFile>()
                .await
                .map_err(|e| decode_error("probe response", e))
        })
        .await?;

        Ok(file.id)
    }

    async fn delete_object(&self, file_id: &str, token: &str) -> Result<(), RemoteError> {
        let url = format!("{}/files/{}", self.api_base, file_id);
        with_retry(&self.retry, "object delete", || async {
            let response = self
                .http
                .delete(&url)
                .bearer_auth(token)
                .query(&[("supportsAllDrives", "true")])
                .send()
                .await
                .map_err(|e| network_error("object delete", e))?;
            ensure_success(response, "Object delete").await.map(|_| ())
        })
        .await
    }

    /// Streams `file_id` into `dest` through a `.part` sibling.
    ///
    /// The copy runs under one hard timeout. On timeout or stream error the
    /// partial file is removed and `dest` is never touched; on success the
    /// partial file is renamed over `dest`.
    async fn download_content(
        &self,
        file_id: &str,
        dest: &Path,
        token: &str,
    ) -> Result<(), RemoteError> {
        let url = format!("{}/files/{}", self.api_base, file_id);
        let response = with_retry(&self.retry, "download", || async {
            let response = self
                .http
                .get(&url)
                .bearer_auth(token)
                .query(&[("alt", "media"), ("supportsAllDrives", "true")])
                .send()
                .await
                .map_err(|e| network_error("download", e))?;
            ensure_success(response, "Download").await
        })
        .await?;

        let part_path = partial_path(dest);
        let copied =
            tokio::time::timeout(self.download_timeout, stream_to_file(response, &part_path))
                .await;

        match copied {
            Ok(Ok(())) => {
                tokio::fs::rename(&part_path, dest).await.map_err(|e| {
                    RemoteError::new(
                        SyncErrorCode::CorruptLocalState,
                        format!("Failed to move downloaded file into place: {}", e),
                    )
                })?;
                info!(file_id = %file_id, dest = %dest.display(), "Download complete");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = tokio::fs::remove_file(&part_path).await;
                Err(e)
            }
            Err(_elapsed) => {
                let _ = tokio::fs::remove_file(&part_path).await;
                Err(RemoteError::new(
                    SyncErrorCode::Timeout,
                    format!(
                        "Download did not finish within {} seconds",
                        self.download_timeout.as_secs()
                    ),
                ))
            }
        }
    }
}

async fn read_local(path: &Path) -> Result<Vec<u8>, RemoteError> {
    tokio::fs::read(path).await.map_err(|e| {
        RemoteError::new(
            SyncErrorCode::CorruptLocalState,
            format!("Failed to read local database: {}", e),
        )
    })
}

async fn stream_to_file(response: reqwest::Response, path: &Path) -> Result<(), RemoteError> {
    let local_err = |e: std::io::Error| {
        RemoteError::new(
            SyncErrorCode::CorruptLocalState,
            format!("Failed to write download: {}", e),
        )
    };

    let mut file = tokio::fs::File::create(path).await.map_err(local_err)?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            RemoteError::new(
                SyncErrorCode::Transient,
                format!("Download stream error: {}", e),
            )
        })?;
        file.write_all(&chunk).await.map_err(local_err)?;
    }
    file.flush().await.map_err(local_err)
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

fn multipart_related(boundary: &str, metadata_json: &str, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(content.len() + metadata_json.len() + 256);
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata_json}\r\n--{boundary}\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{boundary}--").as_bytes());
    body
}

fn network_error(what: &str, e: reqwest::Error) -> RemoteError {
    RemoteError::new(
        SyncErrorCode::Transient,
        format!("{} request failed: {}", what, e),
    )
}

fn decode_error(what: &str, e: reqwest::Error) -> RemoteError {
    RemoteError::new(
        SyncErrorCode::Transient,
        format!("Malformed {} response: {}", what, e),
    )
}

/// Maps a non-success response to the error taxonomy.
///
/// 403 needs a body sniff: Drive reports rate limiting as 403 with a
/// `rateLimitExceeded`-family reason, which must be retried, while a plain
/// 403 is a real permission problem, which must not.
async fn ensure_success(
    response: reqwest::Response,
    what: &str,
) -> Result<reqwest::Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let code = match status {
        StatusCode::UNAUTHORIZED => SyncErrorCode::AuthRequired,
        StatusCode::FORBIDDEN if body.contains("ateLimit") => SyncErrorCode::Transient,
        StatusCode::FORBIDDEN => SyncErrorCode::NoAccess,
        StatusCode::NOT_FOUND => SyncErrorCode::NotFound,
        StatusCode::TOO_MANY_REQUESTS => SyncErrorCode::Transient,
        s if s.is_server_error() => SyncErrorCode::Transient,
        _ => SyncErrorCode::NoAccess,
    };

    Err(RemoteError::new(
        code,
        format!("{} failed with status {}", what, status),
    ))
}
