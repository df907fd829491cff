//! Core data types for the update engine
//!
//! This module defines the bundle identity, slot and persisted record types
//! shared by every pipeline stage.

pub mod bundle;
pub mod record;

// Re-export commonly used types
pub use bundle::{BundleId, BundleSlot, Channel, SlotHealth};
pub use record::{Constants, PendingActivation, RollbackEntry, UpdateRecord};
