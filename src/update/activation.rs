//! Activation, health checking and rollback
//!
//! Activation flips the active bundle pointer in one State Store commit.
//! The new bundle then has to prove itself: after `reload` it must call
//! `confirm_healthy` within the health window, otherwise the previous
//! bundle is restored. A launch that never confirmed before the process
//! died is detected on the next start by [`ActivationManager::recover`].

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::{ListenerSet, UpdateEvent};
use super::stager::Stager;
use crate::core::error::{UpdateError, UpdateResult};
use crate::core::types::{
    BundleId, BundleSlot, Constants, PendingActivation, RollbackEntry, SlotHealth,
};
use crate::store::StateStore;

/// What the host should run after a reload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadTarget {
    /// `None` means the built-in bundle
    pub bundle_id: Option<BundleId>,
    pub entry_point: Option<PathBuf>,
}

impl ReloadTarget {
    fn builtin() -> Self {
        Self {
            bundle_id: None,
            entry_point: None,
        }
    }
}

/// Result of a rollback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackOutcome {
    pub from: BundleId,
    /// `None` when the built-in bundle was restored
    pub to: Option<BundleId>,
}

/// What startup recovery did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub rolled_back: Option<RollbackOutcome>,
    /// The native build raised its minimum bundle id past the active bundle
    pub reset_to_builtin: bool,
    /// A pending activation that starts its first launch with this process
    pub launched: Option<BundleId>,
    pub staging_cleaned: usize,
}

struct HealthTimer {
    bundle_id: BundleId,
    cancel: CancellationToken,
}

/// Drives the `Staged -> Activating -> Active -> Retired | RolledBack` lifecycle
pub struct ActivationManager {
    store: Arc<StateStore>,
    stager: Stager,
    listeners: Arc<ListenerSet>,
    health_window: Duration,
    retained_slots: usize,
    /// Serializes lifecycle operations so record and slot metadata agree
    op_lock: AsyncMutex<()>,
    timer: Mutex<Option<HealthTimer>>,
    shutdown: CancellationToken,
}

impl ActivationManager {
    pub fn new(
        store: Arc<StateStore>,
        stager: Stager,
        listeners: Arc<ListenerSet>,
        health_window: Duration,
        retained_slots: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            stager,
            listeners,
            health_window,
            retained_slots,
            op_lock: AsyncMutex::new(()),
            timer: Mutex::new(None),
            shutdown,
        }
    }

    pub fn constants(&self) -> Constants {
        self.store.read().constants()
    }

    /// Bundle id under health watch, if any
    pub fn watched_bundle(&self) -> Option<BundleId> {
        self.timer.lock().as_ref().map(|t| t.bundle_id.clone())
    }

    /// Make `slot` the active bundle
    ///
    /// Returns only after the new pointer is durable. The bundle runs after
    /// the next [`reload`](Self::reload).
    pub async fn activate(&self, slot: &BundleSlot) -> UpdateResult<()> {
        let _op = self.op_lock.lock().await;
        let bundle_id = slot.bundle_id.clone();

        if !self.stager.verify_slot(slot) {
            return Err(UpdateError::ActivationFailed(format!(
                "slot {} has no entry point on disk",
                bundle_id
            )));
        }

        let record = self
            .store
            .try_update(|r| {
                if !r.is_compatible(&bundle_id) {
                    return Err(UpdateError::IncompatibleBundle {
                        bundle_id: bundle_id.to_string(),
                        min_bundle_id: r.min_bundle_id.to_string(),
                    });
                }
                if r.was_rolled_back(&bundle_id) {
                    return Err(UpdateError::PreviouslyRolledBack(bundle_id.to_string()));
                }

                let old = r.active_bundle_id.clone();
                // an unconfirmed bundle is never a rollback target
                if r.pending.is_none() && old.as_ref() != Some(&bundle_id) {
                    r.previous_bundle_id = old;
                }
                r.active_bundle_id = Some(bundle_id.clone());
                r.pending = Some(PendingActivation {
                    bundle_id: bundle_id.clone(),
                    activated_at: Utc::now(),
                    launched: false,
                });
                Ok(())
            })
            .await?;

        self.disarm_timer();
        if let Err(e) = self.stager.set_health(&bundle_id, SlotHealth::Activating) {
            warn!("Failed to record activation of slot {}: {}", bundle_id, e);
        }

        info!(
            "Activated bundle {} (rollback target: {})",
            bundle_id,
            BundleId::wire(record.previous_bundle_id.as_ref())
        );
        Ok(())
    }

    /// Tell the host to restart against the active bundle
    ///
    /// A pending activation is marked as launched and the health window
    /// starts. Each call emits a `ReloadRequested` event.
    pub async fn reload(self: &Arc<Self>) -> UpdateResult<ReloadTarget> {
        let _op = self.op_lock.lock().await;
        let record = self.store.read();

        let Some(active) = record.active_bundle_id.clone() else {
            let target = ReloadTarget::builtin();
            self.emit_reload(&target);
            return Ok(target);
        };

        let slot = match self.usable_slot(&active) {
            Some(slot) => slot,
            None => {
                error!("Active bundle {} is missing or damaged", active);
                self.mark(&active, SlotHealth::Corrupt);
                let outcome = self
                    .rollback_locked(format!("active bundle {} is missing or damaged", active))
                    .await?;
                return Ok(self.target_for(outcome.and_then(|o| o.to)));
            }
        };

        if let Some(pending) = record.pending.as_ref().filter(|p| p.bundle_id == active) {
            if !pending.launched {
                self.store
                    .update(|r| {
                        if let Some(p) = r.pending.as_mut() {
                            p.launched = true;
                        }
                    })
                    .await?;
            }
            self.arm_timer(active.clone());
        }

        let target = ReloadTarget {
            bundle_id: Some(active),
            entry_point: Some(slot.entry_point_path()),
        };
        self.emit_reload(&target);
        Ok(target)
    }

    /// Accept `bundle_id` as healthy; `false` when it was not pending
    pub async fn confirm_healthy(&self, bundle_id: &BundleId) -> UpdateResult<bool> {
        let _op = self.op_lock.lock().await;
        let record = self.store.read();

        match &record.pending {
            Some(pending) if &pending.bundle_id == bundle_id => {}
            _ => {
                debug!("No pending activation for {}", bundle_id);
                return Ok(false);
            }
        }

        self.store.update(|r| r.pending = None).await?;
        self.disarm_timer();

        self.mark(bundle_id, SlotHealth::Active);
        if let Some(previous) = record.previous_bundle_id.as_ref().filter(|p| *p != bundle_id) {
            self.mark(previous, SlotHealth::Retired);
        }

        info!("Bundle {} confirmed healthy", bundle_id);
        Ok(true)
    }

    /// Revert to the previous bundle, or the built-in one
    ///
    /// Returns `None` when the built-in bundle is already running.
    pub async fn rollback(&self, reason: impl Into<String>) -> UpdateResult<Option<RollbackOutcome>> {
        let _op = self.op_lock.lock().await;
        self.rollback_locked(reason.into()).await
    }

    async fn rollback_locked(&self, reason: String) -> UpdateResult<Option<RollbackOutcome>> {
        let record = self.store.read();
        let Some(failed) = record.active_bundle_id.clone() else {
            debug!("Rollback requested while running the built-in bundle");
            return Ok(None);
        };

        let target = record
            .previous_bundle_id
            .clone()
            .filter(|p| *p != failed)
            .filter(|p| {
                let usable = record.is_compatible(p) && self.usable_slot(p).is_some();
                if !usable {
                    warn!("Rollback target {} is not usable, falling back to built-in", p);
                }
                usable
            });

        let entry = RollbackEntry {
            bundle_id: failed.clone(),
            restored_bundle_id: target.clone(),
            reason: reason.clone(),
            rolled_back_at: Utc::now(),
        };
        self.store
            .update(|r| {
                r.active_bundle_id = target.clone();
                r.previous_bundle_id = None;
                r.pending = None;
                r.push_rollback(entry);
            })
            .await?;
        self.disarm_timer();

        self.mark(&failed, SlotHealth::RolledBack);
        if let Some(target) = &target {
            self.mark(target, SlotHealth::Active);
        }

        warn!(
            "Rolled back bundle {} to {}: {}",
            failed,
            BundleId::wire(target.as_ref()),
            reason
        );

        self.listeners.emit(&UpdateEvent::RolledBack {
            from: failed.clone(),
            to: target.clone(),
            reason,
        });
        let reload = self.target_for(target.clone());
        self.emit_reload(&reload);

        Ok(Some(RollbackOutcome {
            from: failed,
            to: target,
        }))
    }

    /// Repair state left by a previous process
    ///
    /// Opening the engine counts as a launch of the active bundle: a pending
    /// activation that was never launched is marked launched and watched,
    /// one that was already launched is rolled back.
    pub async fn recover(self: &Arc<Self>) -> UpdateResult<RecoveryReport> {
        let _op = self.op_lock.lock().await;
        let mut report = RecoveryReport {
            staging_cleaned: self.stager.cleanup_staging()?,
            ..Default::default()
        };

        let record = self.store.read();
        let Some(active) = record.active_bundle_id.clone() else {
            if record.pending.is_some() {
                self.store.update(|r| r.pending = None).await?;
            }
            return Ok(report);
        };

        if !record.is_compatible(&active) {
            info!(
                "Bundle {} is below minimum bundle id {}, using built-in bundle",
                active, record.min_bundle_id
            );
            self.store
                .update(|r| {
                    r.active_bundle_id = None;
                    r.previous_bundle_id = None;
                    r.pending = None;
                })
                .await?;
            self.mark(&active, SlotHealth::Retired);
            report.reset_to_builtin = true;
            return Ok(report);
        }

        if self.usable_slot(&active).is_none() {
            error!("Active bundle {} is missing or damaged", active);
            self.mark(&active, SlotHealth::Corrupt);
            report.rolled_back = self
                .rollback_locked(format!("active bundle {} is missing or damaged", active))
                .await?;
            return Ok(report);
        }

        match &record.pending {
            Some(p) if p.bundle_id == active && p.launched => {
                warn!("Bundle {} was launched but never confirmed healthy", active);
                report.rolled_back = self
                    .rollback_locked(format!(
                        "bundle {} did not confirm health before the last shutdown",
                        active
                    ))
                    .await?;
            }
            Some(p) if p.bundle_id == active => {
                self.store
                    .update(|r| {
                        if let Some(p) = r.pending.as_mut() {
                            p.launched = true;
                        }
                    })
                    .await?;
                info!("Bundle {} starts its first launch", active);
                self.arm_timer(active.clone());
                report.launched = Some(active);
            }
            Some(_) => {
                self.store.update(|r| r.pending = None).await?;
            }
            None => {}
        }

        Ok(report)
    }

    /// Remove slots no longer needed; returns the removed ids
    ///
    /// Keeps the active bundle, the rollback target and the newest
    /// `retained_slots` other slots. Must not run while an update is staging.
    pub async fn collect_garbage(&self) -> UpdateResult<Vec<BundleId>> {
        let _op = self.op_lock.lock().await;
        let record = self.store.read();

        let keep: HashSet<&BundleId> = record
            .active_bundle_id
            .iter()
            .chain(record.previous_bundle_id.iter())
            .chain(record.pending.iter().map(|p| &p.bundle_id))
            .collect();

        let mut removed = Vec::new();
        let mut candidates = Vec::new();
        for slot in self.stager.list_slots()? {
            if keep.contains(&slot.bundle_id) {
                continue;
            }
            if slot.health.is_disposable() {
                self.stager.remove_slot(&slot.bundle_id)?;
                removed.push(slot.bundle_id);
            } else {
                candidates.push(slot);
            }
        }

        candidates.sort_by(|a, b| b.staged_at.cmp(&a.staged_at));
        for slot in candidates.into_iter().skip(self.retained_slots) {
            self.stager.remove_slot(&slot.bundle_id)?;
            removed.push(slot.bundle_id);
        }

        self.stager.cleanup_staging()?;
        if !removed.is_empty() {
            info!("Garbage collected {} slot(s)", removed.len());
        }
        Ok(removed)
    }

    /// Roll back `bundle_id` if it is still the unconfirmed activation
    ///
    /// Checked under the operation lock, so a confirmation that commits
    /// first always wins.
    async fn rollback_if_pending(
        &self,
        bundle_id: &BundleId,
        cancel: &CancellationToken,
        reason: String,
    ) -> UpdateResult<Option<RollbackOutcome>> {
        let _op = self.op_lock.lock().await;
        let still_pending = self
            .store
            .read()
            .pending
            .map(|p| &p.bundle_id == bundle_id)
            .unwrap_or(false);
        if cancel.is_cancelled() || !still_pending {
            return Err(UpdateError::NoPendingActivation(bundle_id.to_string()));
        }
        self.rollback_locked(reason).await
    }

    /// Cancel the health timer without rolling back
    pub fn disarm_timer(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.cancel.cancel();
        }
    }

    fn arm_timer(self: &Arc<Self>, bundle_id: BundleId) {
        let cancel = self.shutdown.child_token();
        let previous = self.timer.lock().replace(HealthTimer {
            bundle_id: bundle_id.clone(),
            cancel: cancel.clone(),
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        let window = self.health_window;
        let manager: Weak<Self> = Arc::downgrade(self);
        debug!("Health window of {:?} started for {}", window, bundle_id);

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(window) => {
                    let Some(manager) = manager.upgrade() else { return };
                    let reason = format!("health check not confirmed within {}s", window.as_secs_f64());
                    match manager.rollback_if_pending(&bundle_id, &cancel, reason).await {
                        Ok(_) => warn!("Bundle {} did not confirm health within {:?}", bundle_id, window),
                        Err(UpdateError::NoPendingActivation(_)) => {
                            debug!("Health window of {} closed after confirmation", bundle_id);
                        }
                        Err(e) => error!("Automatic rollback of {} failed: {}", bundle_id, e),
                    }
                }
            }
        });
    }

    fn usable_slot(&self, bundle_id: &BundleId) -> Option<BundleSlot> {
        match self.stager.load_slot(bundle_id) {
            Ok(Some(slot)) if slot.health != SlotHealth::Corrupt && self.stager.verify_slot(&slot) => {
                Some(slot)
            }
            Ok(_) => None,
            Err(e) => {
                warn!("Cannot read slot {}: {}", bundle_id, e);
                None
            }
        }
    }

    /// Slot health is advisory; failures are logged, not surfaced
    fn mark(&self, bundle_id: &BundleId, health: SlotHealth) {
        if let Err(e) = self.stager.set_health(bundle_id, health) {
            warn!("Failed to mark slot {} as {}: {}", bundle_id, health, e);
        }
    }

    fn target_for(&self, bundle_id: Option<BundleId>) -> ReloadTarget {
        match bundle_id {
            Some(id) => {
                let entry_point = self.usable_slot(&id).map(|s| s.entry_point_path());
                ReloadTarget {
                    bundle_id: Some(id),
                    entry_point,
                }
            }
            None => ReloadTarget::builtin(),
        }
    }

    fn emit_reload(&self, target: &ReloadTarget) {
        info!(
            "Reload requested for bundle {}",
            BundleId::wire(target.bundle_id.as_ref())
        );
        self.listeners.emit(&UpdateEvent::ReloadRequested {
            bundle_id: target.bundle_id.clone(),
            entry_point: target.entry_point.clone(),
        });
    }
}
