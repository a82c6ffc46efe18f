//! Engine configuration.
//!
//! Settings for the sync engine: where local state lives, what the synced
//! database is called remotely, and how patient the transport is. Loadable
//! from a TOML file; every field has a sensible default so a missing or
//! partial file still yields a working engine.

use serde::Deserialize;
use std::path::PathBuf;

/// Well-known name of the synced database inside the bound remote folder.
pub const REMOTE_DB_NAME: &str = "ledger.db";

/// Complete engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Application data directory (config JSON, encrypted secrets).
    /// Overridable via `POCKETSYNC_DATA_DIR`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Path to the local embedded database file. Defaults to
    /// `<data_dir>/ledger.db`.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    /// Name the database is stored under in the remote folder.
    #[serde(default = "default_remote_db_name")]
    pub remote_db_name: String,
    /// Hard bound on a single download, in seconds. Database files can be
    /// tens of megabytes, so this is minutes, not seconds.
    #[serde(default = "default_download_timeout_seconds")]
    pub download_timeout_seconds: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Transport retry tuning
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("POCKETSYNC_DATA_DIR") {
        return PathBuf::from(dir);
    }
    directories::ProjectDirs::from("", "", "pocketsync")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".pocketsync"))
}

fn default_remote_db_name() -> String {
    REMOTE_DB_NAME.to_string()
}

fn default_download_timeout_seconds() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            db_path: None,
            remote_db_name: default_remote_db_name(),
            download_timeout_seconds: default_download_timeout_seconds(),
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Resolved path of the local database file.
    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join(&self.remote_db_name))
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &str) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: EngineConfig = toml::from_str(&contents)?;
    Ok(config)
}
