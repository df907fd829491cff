//! Core module for the update engine
//!
//! This module contains:
//! - Error taxonomy and recovery classification
//! - Core data types (bundle ids, slots, persisted record)

pub mod error;
pub mod types;

// Re-export commonly used items
pub use error::{ErrorRecovery, RecoveryAction, UpdateError, UpdateResult};
pub use types::*;
