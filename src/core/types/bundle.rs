//! Bundle identity and slot types
//!
//! A bundle is identified by an opaque [`BundleId`]; once unpacked on disk it
//! lives in a [`BundleSlot`] whose health follows the activation lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::PathBuf;
use uuid::Uuid;

use crate::core::error::{UpdateError, UpdateResult};

/// Maximum length of a bundle id in bytes
pub const MAX_BUNDLE_ID_LEN: usize = 128;

/// Maximum length of a channel name in bytes
pub const MAX_CHANNEL_LEN: usize = 64;

/// Opaque identifier of one bundle version
///
/// Ids double as slot directory names, so only `[A-Za-z0-9._-]` is accepted.
/// Ordering compares UUID values when both sides are UUIDs (UUIDv7 ids sort
/// by creation time) and falls back to byte order otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BundleId(String);

impl BundleId {
    /// Wire sentinel for "no downloaded bundle is active"
    pub const NONE_SENTINEL: &'static str = "none";

    /// Validate and wrap a bundle id
    pub fn new(id: impl Into<String>) -> UpdateResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(UpdateError::InvalidBundleId("bundle id is empty".to_string()));
        }
        if id.len() > MAX_BUNDLE_ID_LEN {
            return Err(UpdateError::InvalidBundleId(format!(
                "bundle id exceeds {} bytes",
                MAX_BUNDLE_ID_LEN
            )));
        }
        if id == "." || id == ".." || id == Self::NONE_SENTINEL {
            return Err(UpdateError::InvalidBundleId(format!("reserved bundle id: {}", id)));
        }
        if let Some(c) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return Err(UpdateError::InvalidBundleId(format!(
                "invalid character {:?} in {}",
                c, id
            )));
        }
        Ok(Self(id))
    }

    /// A fresh time-ordered id
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Render an optional id the way the update server expects it
    pub fn wire(id: Option<&BundleId>) -> &str {
        id.map(|b| b.as_str()).unwrap_or(Self::NONE_SENTINEL)
    }

    fn as_uuid(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.0).ok()
    }
}

impl Ord for BundleId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.as_uuid(), other.as_uuid()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            _ => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for BundleId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for BundleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for BundleId {
    type Err = UpdateError;

    fn from_str(s: &str) -> UpdateResult<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for BundleId {
    type Error = UpdateError;

    fn try_from(value: String) -> UpdateResult<Self> {
        Self::new(value)
    }
}

impl From<BundleId> for String {
    fn from(id: BundleId) -> Self {
        id.0
    }
}

/// Named update stream a device follows
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Channel(String);

impl Channel {
    pub const DEFAULT: &'static str = "production";

    pub fn new(name: impl Into<String>) -> UpdateResult<Self> {
        let name = name.into();
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(UpdateError::InvalidChannel("channel is empty".to_string()));
        }
        if trimmed.len() > MAX_CHANNEL_LEN {
            return Err(UpdateError::InvalidChannel(format!(
                "channel exceeds {} bytes",
                MAX_CHANNEL_LEN
            )));
        }
        if trimmed.chars().any(|c| c.is_control()) {
            return Err(UpdateError::InvalidChannel(format!(
                "control character in {:?}",
                trimmed
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self(Self::DEFAULT.to_string())
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Channel {
    type Error = UpdateError;

    fn try_from(value: String) -> UpdateResult<Self> {
        Self::new(value)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

/// Health of an unpacked bundle slot
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SlotHealth {
    /// Unpacked, never activated
    Staged,
    /// Activated, waiting for the startup checkpoint
    Activating,
    /// Confirmed healthy and running
    Active,
    /// Superseded by a newer bundle, kept for rollback
    Retired,
    /// Failed its startup checkpoint
    RolledBack,
    /// Contents missing or damaged on disk
    Corrupt,
}

impl SlotHealth {
    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: SlotHealth) -> bool {
        use SlotHealth::*;
        match (self, next) {
            (_, Corrupt) => true,
            (Staged, Activating) => true,
            (Activating, Active) | (Activating, RolledBack) => true,
            (Active, Retired) | (Active, RolledBack) => true,
            // a retired slot becomes active again when it is the rollback target
            (Retired, Active) | (Retired, Activating) => true,
            _ => false,
        }
    }

    /// Slots in these states may be deleted by garbage collection
    pub fn is_disposable(&self) -> bool {
        matches!(self, SlotHealth::RolledBack | SlotHealth::Corrupt)
    }
}

impl std::fmt::Display for SlotHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotHealth::Staged => write!(f, "staged"),
            SlotHealth::Activating => write!(f, "activating"),
            SlotHealth::Active => write!(f, "active"),
            SlotHealth::Retired => write!(f, "retired"),
            SlotHealth::RolledBack => write!(f, "rolled_back"),
            SlotHealth::Corrupt => write!(f, "corrupt"),
        }
    }
}

/// One fully unpacked bundle on disk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BundleSlot {
    pub bundle_id: BundleId,
    /// Directory holding the unpacked bundle contents
    pub path: PathBuf,
    /// Entry point relative to `path`
    pub entry_point: PathBuf,
    /// SHA256 of the archive the slot was unpacked from
    pub checksum: String,
    pub staged_at: DateTime<Utc>,
    #[serde(default)]
    pub activated_at: Option<DateTime<Utc>>,
    pub health: SlotHealth,
}

impl BundleSlot {
    /// Absolute path of the entry point
    pub fn entry_point_path(&self) -> PathBuf {
        self.path.join(&self.entry_point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_bundle_id_validation() {
        assert!(BundleId::new("v2").is_ok());
        assert!(BundleId::new("0190a3c4-7d2e-7000-8000-000000000000").is_ok());
        assert!(BundleId::new("").is_err());
        assert!(BundleId::new("..").is_err());
        assert!(BundleId::new("none").is_err());
        assert!(BundleId::new("a/b").is_err());
        assert!(BundleId::new("a\\b").is_err());
        assert!(BundleId::new("x".repeat(MAX_BUNDLE_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_bundle_id_uuid_ordering() {
        let old = BundleId::new("0190a3c4-7d2e-7000-8000-000000000000").unwrap();
        let new = BundleId::new("0190a3c5-0000-7000-8000-000000000000").unwrap();
        assert!(old < new);

        let nil = BundleId::new(Uuid::nil().to_string()).unwrap();
        assert!(nil < old);

        let generated_a = BundleId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let generated_b = BundleId::generate();
        assert!(generated_a < generated_b);
    }

    #[test]
    fn test_bundle_id_wire() {
        let id = BundleId::new("v1").unwrap();
        assert_eq!(BundleId::wire(Some(&id)), "v1");
        assert_eq!(BundleId::wire(None), "none");
    }

    #[test]
    fn test_bundle_id_serde_rejects_invalid() {
        let parsed: Result<BundleId, _> = serde_json::from_str("\"../etc\"");
        assert!(parsed.is_err());
        let parsed: BundleId = serde_json::from_str("\"v3\"").unwrap();
        assert_eq!(parsed.as_str(), "v3");
    }

    #[test]
    fn test_channel_validation() {
        assert_eq!(Channel::new("  staging ").unwrap().as_str(), "staging");
        assert!(Channel::new("").is_err());
        assert!(Channel::new("   ").is_err());
        assert!(Channel::new("a\nb").is_err());
        assert_eq!(Channel::default().as_str(), "production");
    }

    #[test]
    fn test_slot_health_transitions() {
        use SlotHealth::*;
        assert!(Staged.can_transition_to(Activating));
        assert!(Activating.can_transition_to(Active));
        assert!(Activating.can_transition_to(RolledBack));
        assert!(Active.can_transition_to(Retired));
        assert!(Retired.can_transition_to(Active));
        assert!(!Staged.can_transition_to(Active));
        assert!(!RolledBack.can_transition_to(Active));
        assert!(Active.can_transition_to(Corrupt));
    }

    proptest! {
        /// Any id made of the allowed alphabet is accepted and round-trips
        #[test]
        fn prop_valid_ids_accepted(id in "[A-Za-z0-9_-][A-Za-z0-9._-]{0,60}") {
            prop_assume!(id != "none");
            let parsed = BundleId::new(id.clone()).unwrap();
            prop_assert_eq!(parsed.as_str(), id.as_str());
        }

        /// UUID ordering agrees with the numeric order of the UUIDs
        #[test]
        fn prop_uuid_ordering_matches_value(a in any::<u128>(), b in any::<u128>()) {
            let ida = BundleId::new(Uuid::from_u128(a).to_string()).unwrap();
            let idb = BundleId::new(Uuid::from_u128(b).to_string()).unwrap();
            prop_assert_eq!(ida.cmp(&idb), a.cmp(&b));
        }
    }
}
