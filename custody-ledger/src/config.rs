//! Configuration for the custody ledger

use crate::types::MAX_WITHDRAWAL_DELAY_SECS;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Ledger behaviour
    pub ledger: LedgerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/custody"),
            service_name: "custody-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            rocksdb: RocksDBConfig::default(),
            ledger: LedgerConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Target file size (MB)
    pub target_file_size_mb: u64,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Level 0 file num compaction trigger
    pub level0_file_num_compaction_trigger: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 2,
            target_file_size_mb: 64,
            max_background_jobs: 2,
            level0_file_num_compaction_trigger: 4,
            enable_statistics: false,
        }
    }
}

/// Ledger behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Actor mailbox capacity (backpressure bound)
    pub mailbox_capacity: usize,

    /// Withdrawal delay given to the v3 field when v3 is activated
    pub default_withdrawal_delay_secs: u64,

    /// Credit unclaimed yield before a deposit resets the accrual baseline.
    /// Off by default: a deposit discards unclaimed yield.
    pub credit_pending_yield_on_deposit: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1000,
            default_withdrawal_delay_secs: 86_400, // 1 day
            credit_pending_yield_on_deposit: false,
        }
    }
}

impl Config {
    /// Load from file (TOML, or JSON for `.json` paths)
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        let config: Config = if path.extension().and_then(|e| e.to_str()) == Some("json") {
            serde_json::from_str(&content)
                .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?
        } else {
            toml::from_str(&content)
                .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("CUSTODY_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(capacity) = std::env::var("CUSTODY_MAILBOX_CAPACITY") {
            config.ledger.mailbox_capacity = capacity.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid CUSTODY_MAILBOX_CAPACITY: {}", e))
            })?;
        }

        if let Ok(delay) = std::env::var("CUSTODY_WITHDRAWAL_DELAY_SECS") {
            config.ledger.default_withdrawal_delay_secs = delay.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid CUSTODY_WITHDRAWAL_DELAY_SECS: {}", e))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the ledger cannot honour
    pub fn validate(&self) -> crate::Result<()> {
        if self.ledger.mailbox_capacity == 0 {
            return Err(crate::Error::Config(
                "mailbox_capacity must be positive".to_string(),
            ));
        }

        if self.ledger.default_withdrawal_delay_secs > MAX_WITHDRAWAL_DELAY_SECS {
            return Err(crate::Error::Config(format!(
                "default_withdrawal_delay_secs must be at most {}",
                MAX_WITHDRAWAL_DELAY_SECS
            )));
        }

        Ok(())
    }
}
