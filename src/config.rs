use crate::error::{Result, SwivelError};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Pool configuration applied by [`ProxyPool::configure`](crate::pool::ProxyPool::configure)
///
/// Re-applying the same settings is idempotent: entries are keyed by
/// fingerprint, so loading an identical proxy list twice leaves the catalog
/// unchanged apart from counter resets.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Quiet period after a successful rotation, before `acquire` returns
    pub change_proxy_wait_time: Duration,
    /// Pipe-delimited proxy entries, one per element (see module docs for the grammar)
    pub proxy_strings: Vec<String>,
    /// Truncate the catalog (and stop all forwarders) before loading
    pub clear_all_proxy: bool,
    /// How many times an entry may be handed out before it must rotate
    pub max_used: i64,
    /// Route static-asset traffic around the upstream via local forwarders
    pub block_assets: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            change_proxy_wait_time: Duration::ZERO,
            proxy_strings: Vec::new(),
            clear_all_proxy: false,
            max_used: 10,
            block_assets: false,
        }
    }
}

/// Catalog storage configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the SQLite catalog file
    pub path: PathBuf,
    /// SQLite busy timeout in seconds
    pub busy_timeout: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("swivel.db"),
            busy_timeout: 5,
        }
    }
}

impl StoreConfig {
    /// Load storage configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let busy_timeout = get_env_or("SWIVEL_DB_BUSY_TIMEOUT", "5")
            .parse()
            .map_err(|_| {
                SwivelError::InvalidConfig("SWIVEL_DB_BUSY_TIMEOUT must be a number of seconds".into())
            })?;

        Ok(StoreConfig {
            path: PathBuf::from(get_env_or("SWIVEL_DB_PATH", "swivel.db")),
            busy_timeout,
        })
    }

    /// Connection URL for the catalog file
    pub fn database_url(&self) -> String {
        format!("sqlite:{}?mode=rwc", self.path.display())
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
