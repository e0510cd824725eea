//! Configuration for elohim-dedup

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("elohim-dedup")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory holding the ledger database and blob objects
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Ledger SQLite file name, relative to `storage_dir`
    #[serde(default = "default_database_file")]
    pub database_file: String,

    /// Blob object directory, relative to `storage_dir`
    #[serde(default = "default_blobs_subdir")]
    pub blobs_subdir: String,

    /// Quota assigned to newly registered users (bytes)
    #[serde(default = "default_quota_bytes")]
    pub default_quota_bytes: u64,

    /// Maximum pooled ledger connections
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// How long a writer waits on a locked ledger before failing (ms)
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Upper bound on lookup/commit rounds for one ingest when racing other writers
    #[serde(default = "default_max_ingest_attempts")]
    pub max_ingest_attempts: u32,

    /// How long an ingest waits for a collector to finish deleting the same
    /// hash's old object (ms)
    #[serde(default = "default_pending_delete_wait_ms")]
    pub pending_delete_wait_ms: u64,
}

fn default_database_file() -> String {
    "ledger.db".to_string()
}

fn default_blobs_subdir() -> String {
    "blobs".to_string()
}

/// 10 MiB
fn default_quota_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_pool_size() -> u32 {
    8
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_max_ingest_attempts() -> u32 {
    4
}

fn default_pending_delete_wait_ms() -> u64 {
    5_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            database_file: default_database_file(),
            blobs_subdir: default_blobs_subdir(),
            default_quota_bytes: default_quota_bytes(),
            pool_size: default_pool_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
            max_ingest_attempts: default_max_ingest_attempts(),
            pending_delete_wait_ms: default_pending_delete_wait_ms(),
        }
    }
}

impl Config {
    /// Config rooted at `storage_dir` with every other field defaulted
    pub fn with_storage_dir<P: Into<PathBuf>>(storage_dir: P) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            ..Self::default()
        }
    }

    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Get blobs directory
    pub fn blobs_dir(&self) -> PathBuf {
        self.storage_dir.join(&self.blobs_subdir)
    }

    /// Get ledger database path
    pub fn database_path(&self) -> PathBuf {
        self.storage_dir.join(&self.database_file)
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }
}
