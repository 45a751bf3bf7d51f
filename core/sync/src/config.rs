//! Sync configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use mirrorsync_common::{Error, ProfileId, Result};
use mirrorsync_storage::HalConfig;

use crate::retry::RetryConfig;

fn default_lock_name() -> String {
    "mirrorsync".to_string()
}

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("mirrorsync").join("sync.db"))
        .unwrap_or_else(|| PathBuf::from("mirrorsync-sync.db"))
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_initial_delay_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

/// Settings of one sync deployment, stored as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Remote-system configuration the bookkeeping belongs to.
    #[serde(default)]
    pub profile_id: ProfileId,
    /// Name of the batch process lock.
    #[serde(default = "default_lock_name")]
    pub lock_name: String,
    /// SQLite database with sync states, ledger and settings.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Retries of failed reads.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    /// Whether a skipped update on an update-incapable target counts as
    /// synced. When false the next run tries again.
    #[serde(default = "default_true")]
    pub skipped_changes_settle: bool,
    /// Remote API connection.
    #[serde(default)]
    pub remote: Option<HalConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            profile_id: ProfileId::default(),
            lock_name: default_lock_name(),
            database_path: default_database_path(),
            max_retries: default_max_retries(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            skipped_changes_settle: true,
            remote: None,
        }
    }
}

impl SyncConfig {
    /// Default config file location, `<config dir>/mirrorsync/config.json`.
    pub fn default_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("mirrorsync").join("config.json"))
            .ok_or_else(|| Error::Config("No configuration directory on this platform".to_string()))
    }

    /// Load from a JSON file.
    ///
    /// # Errors
    /// - File cannot be read
    /// - File is not valid configuration JSON
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load from `path`, or defaults if it does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Write as pretty JSON, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!("Wrote config to {}", path.display());
        Ok(())
    }

    /// Retry settings for store reads.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_retries)
            .with_initial_delay(Duration::from_millis(self.retry_initial_delay_ms))
    }
}
