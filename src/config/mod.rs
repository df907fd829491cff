//! Configuration for the update engine
//!
//! Provides:
//! - Layered loading (defaults, JSON file, environment)
//! - Validation of URLs, timeouts and entry points
//! - Atomic saving

mod storage;

pub use self::storage::{
    default_config_path, default_data_dir, default_entry_points, ConfigError, ConfigResult,
    EngineConfig, FetchConfig, ENV_PREFIX,
};
