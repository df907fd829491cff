//! Engine configuration
//!
//! Configuration is read in layers:
//! - Built-in defaults (serde default functions)
//! - An optional JSON file
//! - `HOT_UPDATER_*` environment variables (`__` separates nested keys,
//!   e.g. `HOT_UPDATER_FETCH__MAX_RETRIES=5`)
//!
//! Saving writes the file atomically (temp file + rename).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::core::error::UpdateError;
use crate::core::types::record::default_min_bundle_id;
use crate::core::types::{BundleId, Channel};
use crate::logging::LoggingConfig;
use crate::store::StoreSeed;

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "HOT_UPDATER";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

impl From<ConfigError> for UpdateError {
    fn from(err: ConfigError) -> Self {
        UpdateError::Config(err.to_string())
    }
}

/// Download tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Total time allowed for one HTTP request, body included
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

/// Update engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root of the persisted layout (state, downloads, staging, slots)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Base URL of the update server; required for update checks
    #[serde(default)]
    pub update_server: Option<String>,

    /// Native application build version
    #[serde(default)]
    pub app_version: Option<String>,

    /// Bundles below this id are incompatible with the native build
    #[serde(default = "default_min_bundle_id")]
    pub min_bundle_id: BundleId,

    /// Channel used until `set_channel` is called
    #[serde(default)]
    pub default_channel: Channel,

    #[serde(default = "default_platform")]
    pub platform: String,

    #[serde(default)]
    pub fetch: FetchConfig,

    /// Time a reloaded bundle has to confirm it is healthy
    #[serde(default = "default_health_check_window_secs")]
    pub health_check_window_secs: u64,

    /// Retired slots kept besides the active one and the rollback target
    #[serde(default = "default_retained_slots")]
    pub retained_slots: usize,

    /// Accepted entry point file names, in priority order
    #[serde(default = "default_entry_points")]
    pub entry_points: Vec<String>,

    /// Refuse archives that come without a checksum
    #[serde(default)]
    pub require_checksum: bool,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Default data directory (`<local data>/hot-updater`)
pub fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.data_local_dir().join("hot-updater"))
        .unwrap_or_else(|| PathBuf::from("hot-updater"))
}

/// Default configuration file (`<config dir>/hot-updater/config.json`)
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hot-updater")
        .join("config.json")
}

fn default_platform() -> String {
    std::env::consts::OS.to_string()
}

fn default_health_check_window_secs() -> u64 {
    30
}

fn default_retained_slots() -> usize {
    1
}

pub fn default_entry_points() -> Vec<String> {
    vec![
        "index.android.bundle".to_string(),
        "main.jsbundle".to_string(),
        "index.ios.bundle".to_string(),
        "index.bundle".to_string(),
    ]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            update_server: None,
            app_version: None,
            min_bundle_id: default_min_bundle_id(),
            default_channel: Channel::default(),
            platform: default_platform(),
            fetch: FetchConfig::default(),
            health_check_window_secs: default_health_check_window_secs(),
            retained_slots: default_retained_slots(),
            entry_points: default_entry_points(),
            require_checksum: false,
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults rooted at `data_dir`
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Load defaults, then `path` (when given), then the process environment
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        Self::build(
            path,
            ::config::Environment::with_prefix(ENV_PREFIX),
        )
    }

    /// Like [`load`](Self::load) with an explicit set of environment variables
    pub fn load_with_env(path: Option<&Path>, env: HashMap<String, String>) -> ConfigResult<Self> {
        Self::build(
            path,
            ::config::Environment::with_prefix(ENV_PREFIX).source(Some(env)),
        )
    }

    fn build(path: Option<&Path>, env: ::config::Environment) -> ConfigResult<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Json)
                    .required(true),
            );
        }
        let settings = builder
            .add_source(
                env.prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: EngineConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges and URLs
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(server) = &self.update_server {
            let url = reqwest::Url::parse(server)
                .map_err(|e| ConfigError::Invalid(format!("update_server {}: {}", server, e)))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ConfigError::Invalid(format!(
                    "update_server must be http(s): {}",
                    server
                )));
            }
        }
        if self.platform.trim().is_empty() {
            return Err(ConfigError::Invalid("platform is empty".to_string()));
        }
        if self.fetch.timeout_secs == 0 || self.fetch.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid("fetch timeouts must be positive".to_string()));
        }
        if self.fetch.backoff_base_ms > self.fetch.backoff_max_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff_base_ms ({}) exceeds backoff_max_ms ({})",
                self.fetch.backoff_base_ms, self.fetch.backoff_max_ms
            )));
        }
        if self.health_check_window_secs == 0 {
            return Err(ConfigError::Invalid(
                "health_check_window_secs must be positive".to_string(),
            ));
        }
        if self.entry_points.is_empty() {
            return Err(ConfigError::Invalid("no entry points configured".to_string()));
        }
        if let Some(bad) = self
            .entry_points
            .iter()
            .find(|e| e.is_empty() || e.contains('/') || e.contains('\\'))
        {
            return Err(ConfigError::Invalid(format!(
                "entry point must be a plain file name: {:?}",
                bad
            )));
        }
        Ok(())
    }

    /// Write the configuration to `path` atomically
    pub async fn save(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(self)?;

        let temp_path = path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temp_path, path).await?;
        Ok(())
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.data_dir.join("downloads")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("staging")
    }

    pub fn slots_dir(&self) -> PathBuf {
        self.data_dir.join("slots")
    }

    pub fn health_check_window(&self) -> Duration {
        Duration::from_secs(self.health_check_window_secs)
    }

    /// Read-only record fields owned by the native build
    pub fn store_seed(&self) -> StoreSeed {
        StoreSeed {
            app_version: self.app_version.clone(),
            min_bundle_id: self.min_bundle_id.clone(),
            default_channel: self.default_channel.clone(),
        }
    }

    /// Logging configuration with file output rooted in the data dir
    pub fn logging_config(&self) -> LoggingConfig {
        let mut logging = self.logging.clone();
        if logging.log_directory.is_none() && logging.output.uses_file() {
            logging.log_directory = Some(self.data_dir.join("logs"));
        }
        logging
    }
}
