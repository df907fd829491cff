//! Update events and listener registry
//!
//! The host subscribes through an explicit [`UpdateListener`] capability.
//! [`ListenerSet`] mirrors the host's `addListener` / `removeListeners(count)`
//! subscription API.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::resolver::UpdateDescriptor;
use crate::core::types::BundleId;

/// Event delivered to the host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpdateEvent {
    /// Download progress, `progress` is in `0.0..=1.0` when the size is known
    Progress {
        bundle_id: BundleId,
        progress: f64,
        downloaded: u64,
        total: Option<u64>,
    },
    /// Bundle staged and activated; takes effect on the next reload
    Complete { bundle_id: BundleId },
    Failed {
        bundle_id: BundleId,
        code: String,
        message: String,
    },
    /// Result of a check-only request
    UpdateAvailable { descriptor: UpdateDescriptor },
    /// The host should restart its runtime against `entry_point`
    ///
    /// `bundle_id` is `None` when the built-in bundle should run.
    ReloadRequested {
        bundle_id: Option<BundleId>,
        entry_point: Option<PathBuf>,
    },
    RolledBack {
        from: BundleId,
        to: Option<BundleId>,
        reason: String,
    },
}

impl UpdateEvent {
    /// Progress fraction; `0.0` when the total size is unknown
    pub fn progress_fraction(downloaded: u64, total: Option<u64>) -> f64 {
        match total {
            Some(total) if total > 0 => (downloaded as f64 / total as f64).min(1.0),
            _ => 0.0,
        }
    }
}

/// Receives update events
pub trait UpdateListener: Send + Sync {
    fn on_event(&self, event: &UpdateEvent);
}

impl<F> UpdateListener for F
where
    F: Fn(&UpdateEvent) + Send + Sync,
{
    fn on_event(&self, event: &UpdateEvent) {
        self(event)
    }
}

/// Forwards events into an unbounded tokio channel
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<UpdateEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UpdateEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl UpdateListener for ChannelListener {
    fn on_event(&self, event: &UpdateEvent) {
        // receiver gone means nobody is listening anymore
        let _ = self.tx.send(event.clone());
    }
}

/// Handle returned by [`ListenerSet::add_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Registered listeners, in subscription order
#[derive(Default)]
pub struct ListenerSet {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn UpdateListener>)>>,
    next_id: AtomicU64,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn UpdateListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Returns whether a listener was removed
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Remove the `count` most recently added listeners
    pub fn remove_listeners(&self, count: usize) -> usize {
        let mut listeners = self.listeners.write();
        let keep = listeners.len().saturating_sub(count);
        let removed = listeners.len() - keep;
        listeners.truncate(keep);
        removed
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every listener
    ///
    /// Listeners are called outside the lock so they may (un)subscribe.
    pub fn emit(&self, event: &UpdateEvent) {
        let listeners: Vec<_> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener.on_event(event);
        }
    }
}
