//! Bundle update pipeline
//!
//! This module provides:
//! - Manifest resolution against the update server
//! - Resumable archive downloads with retry and backoff
//! - Archive validation (checksum, layout, entry point)
//! - All-or-nothing staging into bundle slots
//! - Atomic activation with health checking and rollback

pub mod activation;
pub mod engine;
pub mod events;
pub mod fetcher;
pub mod resolver;
pub mod stager;
pub mod validator;

#[cfg(test)]
pub(crate) mod test_support;


pub use activation::{ActivationManager, RecoveryReport, ReloadTarget, RollbackOutcome};
pub use engine::{EngineStatus, GcReport, HotUpdater, UpdateEngine, UpdateRequest};
pub use events::{ChannelListener, ListenerId, ListenerSet, UpdateEvent, UpdateListener};
pub use fetcher::{FetchProgress, Fetcher};
pub use resolver::{HttpManifestResolver, ManifestResolver, ResolveOutcome, UpdateDescriptor};
pub use stager::Stager;
pub use validator::{ArchiveValidator, ValidatedArchive};
