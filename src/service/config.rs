//! Server configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_CHAT_PORT, DEFAULT_FILE_PORT};

/// Environment variable naming the config file to load.
pub const CONFIG_PATH_ENV: &str = "PARLEY_CONFIG";

/// Config file read when [`CONFIG_PATH_ENV`] is unset.
pub const DEFAULT_CONFIG_PATH: &str = "parley.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address both listeners bind to
    pub host: String,

    /// Port for the line-oriented control protocol
    pub chat_port: u16,

    /// Port for binary SEND/RECEIVE legs
    pub file_port: u16,

    /// SQLite database file
    pub database_path: PathBuf,

    /// Directory holding uploaded files
    pub storage_dir: PathBuf,

    /// Transfer legs served at once; further legs wait for a slot
    pub max_concurrent_transfers: usize,

    /// Limit on any single read or write on the transfer port
    pub transfer_io_timeout_secs: u64,

    /// Announced transfers not started within this window are dropped
    pub pending_transfer_ttl_secs: u64,

    /// How often stale transfers are swept
    pub sweep_interval_secs: u64,

    /// Largest file accepted by `/filesend`
    pub max_file_size: u64,

    /// Default page size for `/history`
    pub history_limit: u32,

    /// Default page size for `/loadmore`
    pub load_more_limit: u32,

    /// Upper bound on any client supplied page size
    pub max_history_limit: u32,

    /// Queued outbound lines per session before deliveries are dropped
    pub outbox_capacity: usize,

    /// Longest accepted control line in bytes
    pub max_line_length: usize,

    /// Default log level when RUST_LOG is unset
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            chat_port: DEFAULT_CHAT_PORT,
            file_port: DEFAULT_FILE_PORT,
            database_path: PathBuf::from("database/chatapp.db"),
            storage_dir: PathBuf::from("file_storage"),
            max_concurrent_transfers: 10,
            transfer_io_timeout_secs: 30,
            pending_transfer_ttl_secs: 600,
            sweep_interval_secs: 60,
            max_file_size: 1024 * 1024 * 1024,
            history_limit: 20,
            load_more_limit: 10,
            max_history_limit: 200,
            outbox_capacity: 512,
            max_line_length: 64 * 1024,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Load from `$PARLEY_CONFIG`, falling back to `parley.toml`.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        Self::load_or_default(path)
    }

    pub fn transfer_io_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_io_timeout_secs)
    }

    pub fn pending_transfer_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_transfer_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Clamp a requested page size, using `default` when none was given.
    pub fn page_limit(&self, requested: Option<u32>, default: u32) -> u32 {
        requested
            .unwrap_or(default)
            .clamp(1, self.max_history_limit.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = Config::load_or_default("/nonexistent/parley.toml").unwrap();
        assert_eq!(config.chat_port, 9999);
        assert_eq!(config.file_port, 9998);
        assert_eq!(config.max_concurrent_transfers, 10);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parley.toml");
        std::fs::write(&path, "chat_port = 7000\nhistory_limit = 5\n").unwrap();

        let config = Config::load_or_default(&path).unwrap();
        assert_eq!(config.chat_port, 7000);
        assert_eq!(config.history_limit, 5);
        assert_eq!(config.file_port, 9998);
    }

    #[test]
    fn test_page_limit_is_clamped() {
        let config = Config::default();
        assert_eq!(config.page_limit(None, 20), 20);
        assert_eq!(config.page_limit(Some(0), 20), 1);
        assert_eq!(config.page_limit(Some(10_000), 20), 200);
    }
}
