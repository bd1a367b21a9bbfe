//! Configuration for the tank ledger

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Writer actor mailbox capacity
    pub mailbox_capacity: usize,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Composition and reconciliation thresholds
    pub composition: CompositionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/tank-ledger"),
            service_name: "tank-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            mailbox_capacity: 256,
            rocksdb: RocksDBConfig::default(),
            composition: CompositionConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            max_background_jobs: 2,
            enable_statistics: false,
        }
    }
}

/// Composition thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositionConfig {
    /// Inherited entries smaller than this (liters, absolute) are not written
    pub materiality_threshold_l: Decimal,

    /// Ledger/tank volume difference tolerated by reconciliation (inclusive)
    pub reconciliation_tolerance_l: Decimal,

    /// History length when the caller gives none
    pub default_history_limit: usize,
}

impl Default for CompositionConfig {
    fn default() -> Self {
        Self {
            materiality_threshold_l: Decimal::new(1, 2), // 0.01 L
            reconciliation_tolerance_l: Decimal::ONE,    // 1.00 L
            default_history_limit: 100,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("TANK_LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(value) = std::env::var("TANK_LEDGER_MATERIALITY_L") {
            config.composition.materiality_threshold_l = parse_liters(&value)?;
        }

        if let Ok(value) = std::env::var("TANK_LEDGER_TOLERANCE_L") {
            config.composition.reconciliation_tolerance_l = parse_liters(&value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject thresholds that would break derivation or reconciliation
    pub fn validate(&self) -> crate::Result<()> {
        if self.composition.materiality_threshold_l < Decimal::ZERO {
            return Err(crate::Error::Config(
                "materiality_threshold_l must not be negative".to_string(),
            ));
        }
        if self.composition.reconciliation_tolerance_l < Decimal::ZERO {
            return Err(crate::Error::Config(
                "reconciliation_tolerance_l must not be negative".to_string(),
            ));
        }
        if self.mailbox_capacity == 0 {
            return Err(crate::Error::Config(
                "mailbox_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_liters(value: &str) -> crate::Result<Decimal> {
    value
        .trim()
        .parse::<Decimal>()
        .map_err(|e| crate::Error::Config(format!("Invalid liters value {:?}: {}", value, e)))
}
