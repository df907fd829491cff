//! Persisted update state
//!
//! [`UpdateRecord`] is the single document the state store owns. Everything
//! the host can observe about the active bundle is derived from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::bundle::{BundleId, Channel};

/// Current on-disk schema version of [`UpdateRecord`]
pub const RECORD_SCHEMA_VERSION: u32 = 1;

/// Rollback entries older than this many are dropped
pub const MAX_ROLLBACK_HISTORY: usize = 16;

/// An activation that has not passed its startup checkpoint yet
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingActivation {
    pub bundle_id: BundleId,
    pub activated_at: DateTime<Utc>,
    /// Set once the host has been told to run the bundle
    #[serde(default)]
    pub launched: bool,
}

/// One automatic or manual rollback
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RollbackEntry {
    pub bundle_id: BundleId,
    /// `None` when the built-in bundle was restored
    pub restored_bundle_id: Option<BundleId>,
    pub reason: String,
    pub rolled_back_at: DateTime<Utc>,
}

/// Persisted update state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateRecord {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    /// `None` means the built-in bundle is running
    #[serde(default)]
    pub active_bundle_id: Option<BundleId>,

    /// Rollback target
    #[serde(default)]
    pub previous_bundle_id: Option<BundleId>,

    #[serde(default)]
    pub channel: Channel,

    /// Native application build version (read-only, refreshed from config)
    #[serde(default)]
    pub app_version: Option<String>,

    /// Bundles below this id are incompatible with the native build
    #[serde(default = "default_min_bundle_id")]
    pub min_bundle_id: BundleId,

    #[serde(default)]
    pub pending: Option<PendingActivation>,

    #[serde(default)]
    pub rollback_history: Vec<RollbackEntry>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_schema_version() -> u32 {
    RECORD_SCHEMA_VERSION
}

/// The nil UUID disables the floor
pub fn default_min_bundle_id() -> BundleId {
    BundleId::new(uuid::Uuid::nil().to_string()).unwrap_or_else(|_| BundleId::generate())
}

impl Default for UpdateRecord {
    fn default() -> Self {
        Self {
            schema_version: RECORD_SCHEMA_VERSION,
            active_bundle_id: None,
            previous_bundle_id: None,
            channel: Channel::default(),
            app_version: None,
            min_bundle_id: default_min_bundle_id(),
            pending: None,
            rollback_history: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

impl UpdateRecord {
    /// Constants view exposed to the host
    pub fn constants(&self) -> Constants {
        Constants {
            min_bundle_id: self.min_bundle_id.to_string(),
            app_version: self.app_version.clone(),
            channel: Some(self.channel.to_string()),
        }
    }

    /// Whether `id` is allowed by the minimum bundle id floor
    pub fn is_compatible(&self, id: &BundleId) -> bool {
        self.min_bundle_id == default_min_bundle_id() || *id >= self.min_bundle_id
    }

    /// Whether `id` was rolled back before
    pub fn was_rolled_back(&self, id: &BundleId) -> bool {
        self.rollback_history.iter().any(|e| &e.bundle_id == id)
    }

    /// Append a rollback entry, dropping the oldest beyond the cap
    pub fn push_rollback(&mut self, entry: RollbackEntry) {
        self.rollback_history.push(entry);
        if self.rollback_history.len() > MAX_ROLLBACK_HISTORY {
            let excess = self.rollback_history.len() - MAX_ROLLBACK_HISTORY;
            self.rollback_history.drain(..excess);
        }
    }
}

/// Constants read by the host (`getConstants()`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Constants {
    #[serde(rename = "MIN_BUNDLE_ID")]
    pub min_bundle_id: String,
    #[serde(rename = "APP_VERSION")]
    pub app_version: Option<String>,
    #[serde(rename = "CHANNEL")]
    pub channel: Option<String>,
}
