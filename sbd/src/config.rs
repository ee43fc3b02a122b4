//! Suit builder configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::persistence::DEFAULT_HISTORY_CAP;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level when not given on the command line
    #[serde(rename = "log-level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Network listener
    pub server: ServerConfig,

    /// Definition and data directories
    pub storage: StorageConfig,

    /// Dispatch timing and error budget
    pub orchestrator: OrchestratorConfig,

    /// Snapshot and history settings
    pub persistence: PersistenceConfig,

    /// Optional YAML file replacing the built-in lookup tables
    #[serde(rename = "tables-path", skip_serializing_if = "Option::is_none")]
    pub tables_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Project-local config: .suitbuilder.yml
        let local_config = PathBuf::from(".suitbuilder.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // User config: ~/.config/suitbuilder/suitbuilder.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("suitbuilder").join("suitbuilder.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Network listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    #[serde(rename = "listen-addr")]
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:16753".to_string(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory searched for `<name>.alb` definitions
    #[serde(rename = "definitions-dir")]
    pub definitions_dir: PathBuf,

    /// Root for persisted build data (`<data-dir>/builds`)
    #[serde(rename = "data-dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    // XDG data directory (~/.local/share/suitbuilder on Linux)
    dirs::data_local_dir()
        .map(|d| d.join("suitbuilder"))
        .unwrap_or_else(|| PathBuf::from(".suitbuilder"))
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            definitions_dir: default_data_dir(),
            data_dir: default_data_dir(),
        }
    }
}

/// Dispatch timing and error thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Sleep between coordinator iterations
    #[serde(rename = "tick-interval-ms")]
    pub tick_interval_ms: u64,

    /// An unacknowledged assignment becomes eligible again after this long
    #[serde(rename = "redelivery-window-secs")]
    pub redelivery_window_secs: u64,

    /// Consecutive failures of one item that fail the build
    #[serde(rename = "max-item-errors")]
    pub max_item_errors: u32,

    /// Failures across the build that fail it
    #[serde(rename = "max-total-errors")]
    pub max_total_errors: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            redelivery_window_secs: 30,
            max_item_errors: 10,
            max_total_errors: 50,
        }
    }
}

impl OrchestratorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn redelivery_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.redelivery_window_secs as i64)
    }
}

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Keep a crash-recoverable snapshot and history on disk
    pub enabled: bool,

    #[serde(rename = "history-cap")]
    pub history_cap: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            history_cap: DEFAULT_HISTORY_CAP,
        }
    }
}
