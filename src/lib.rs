//! hot-updater - over-the-air bundle update engine
//!
//! This crate provides the native side of a hot-update system:
//! - Manifest resolution per release channel
//! - Resumable, verified bundle downloads
//! - Crash-consistent staging and atomic activation
//! - Health checking with automatic rollback
//! - Durable update state with backup recovery

pub mod config;
pub mod core;
pub mod logging;
pub mod store;
pub mod update;

// Re-export commonly used items
pub use crate::config::{EngineConfig, FetchConfig};
pub use crate::core::error::{UpdateError, UpdateResult};
pub use crate::core::types::{BundleId, BundleSlot, Channel, Constants, SlotHealth, UpdateRecord};
pub use crate::store::StateStore;
pub use crate::update::{
    HotUpdater, ListenerId, ReloadTarget, UpdateEngine, UpdateEvent, UpdateListener,
    UpdateRequest,
};
