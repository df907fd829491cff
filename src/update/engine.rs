//! Engine facade
//!
//! [`UpdateEngine`] is the capability the host binds to. [`HotUpdater`]
//! implements it by wiring the pipeline together:
//!
//! resolve -> fetch -> validate -> stage -> activate
//!
//! At most one update runs at a time. Reads (`constants`, `app_version`,
//! `status`) never wait for an in-flight update and see the committed
//! state until activation succeeds.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::activation::{ActivationManager, RecoveryReport, ReloadTarget};
use super::events::{ListenerId, ListenerSet, UpdateEvent, UpdateListener};
use super::fetcher::{FetchProgress, Fetcher};
use super::resolver::{HttpManifestResolver, ManifestResolver, ResolveOutcome, UpdateDescriptor};
use super::stager::Stager;
use super::validator::ArchiveValidator;
use crate::config::EngineConfig;
use crate::core::error::{ErrorRecovery, RecoveryAction, UpdateError, UpdateResult};
use crate::core::types::{BundleId, BundleSlot, Channel, Constants, UpdateRecord};
use crate::store::StateStore;

/// Host-facing update capability
#[async_trait]
pub trait UpdateEngine: Send + Sync {
    /// Ask the host to restart against the active bundle
    async fn reload(&self) -> UpdateResult<ReloadTarget>;

    /// Install `bundle_id` from `zip_url`; with no URL only check for an update
    ///
    /// Never fails loudly: errors are reported through a `Failed` event and
    /// a `false` result.
    async fn update_bundle(&self, bundle_id: &str, zip_url: Option<&str>) -> bool;

    async fn set_channel(&self, channel: &str) -> UpdateResult<()>;

    fn constants(&self) -> Constants;

    /// Accept the pending bundle; `false` when `bundle_id` was not pending
    async fn confirm_healthy(&self, bundle_id: &str) -> UpdateResult<bool>;

    /// Revert to the previous bundle; `false` when the built-in one runs
    async fn rollback(&self) -> UpdateResult<bool>;
}

/// Explicit install request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    pub bundle_id: BundleId,
    pub zip_url: String,
    pub checksum: Option<String>,
}

impl From<UpdateDescriptor> for UpdateRequest {
    fn from(descriptor: UpdateDescriptor) -> Self {
        Self {
            bundle_id: descriptor.bundle_id,
            zip_url: descriptor.zip_url,
            checksum: descriptor.checksum,
        }
    }
}

/// Snapshot of the engine for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub record: UpdateRecord,
    pub slots: Vec<BundleSlot>,
    pub update_in_progress: bool,
    /// Bundle inside its health window
    pub watched_bundle: Option<BundleId>,
}

/// What a garbage collection pass removed
#[derive(Debug, Clone, Default, Serialize)]
pub struct GcReport {
    pub slots_removed: Vec<BundleId>,
    pub partials_removed: usize,
}

/// Clears the in-progress flag when an update ends, however it ends
struct InProgressGuard<'a>(&'a AtomicBool);

impl<'a> InProgressGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> UpdateResult<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| UpdateError::AlreadyInProgress)?;
        Ok(Self(flag))
    }
}

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The bundle update engine
pub struct HotUpdater {
    config: EngineConfig,
    store: Arc<StateStore>,
    listeners: Arc<ListenerSet>,
    resolver: Option<Arc<dyn ManifestResolver>>,
    fetcher: Fetcher,
    validator: ArchiveValidator,
    stager: Stager,
    activation: Arc<ActivationManager>,
    in_progress: AtomicBool,
    shutdown: CancellationToken,
    /// Last descriptor returned by the server, source of manifest checksums
    last_descriptor: Mutex<Option<UpdateDescriptor>>,
    recovery: RecoveryReport,
}

impl HotUpdater {
    /// Open the engine rooted at `config.data_dir` and repair leftover state
    pub async fn open(config: EngineConfig) -> UpdateResult<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let store = Arc::new(StateStore::open(config.data_dir.clone(), config.store_seed())?);
        let listeners = Arc::new(ListenerSet::new());
        let shutdown = CancellationToken::new();

        let client = Fetcher::build_client(&config.fetch, config.app_version.as_deref())?;
        let resolver: Option<Arc<dyn ManifestResolver>> = match &config.update_server {
            Some(server) => Some(Arc::new(HttpManifestResolver::new(
                client.clone(),
                server,
                config.app_version.clone(),
                config.platform.clone(),
            )?)),
            None => None,
        };

        let fetcher = Fetcher::new(client, config.downloads_dir(), config.fetch.clone());
        let validator = ArchiveValidator::new(config.entry_points.clone(), config.require_checksum);
        let stager = Stager::new(config.slots_dir(), config.staging_dir());
        let activation = Arc::new(ActivationManager::new(
            store.clone(),
            stager.clone(),
            listeners.clone(),
            config.health_check_window(),
            config.retained_slots,
            shutdown.clone(),
        ));

        let recovery = activation.recover().await?;
        if recovery.rolled_back.is_some() || recovery.reset_to_builtin {
            warn!("Startup recovery changed the active bundle: {:?}", recovery);
        }

        let record = store.read();
        info!(
            "Update engine ready (active: {}, channel: {}, data dir: {})",
            BundleId::wire(record.active_bundle_id.as_ref()),
            record.channel,
            config.data_dir.display()
        );

        Ok(Self {
            config,
            store,
            listeners,
            resolver,
            fetcher,
            validator,
            stager,
            activation,
            in_progress: AtomicBool::new(false),
            shutdown,
            last_descriptor: Mutex::new(None),
            recovery,
        })
    }

    /// Replace the manifest resolver
    pub fn with_resolver(mut self, resolver: Arc<dyn ManifestResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// What startup recovery did when the engine was opened
    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Native application version
    pub fn app_version(&self) -> Option<String> {
        self.store.read().app_version
    }

    pub fn add_listener(&self, listener: Arc<dyn UpdateListener>) -> ListenerId {
        self.listeners.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove_listener(id)
    }

    /// Remove the `count` most recently added listeners
    pub fn remove_listeners(&self, count: usize) -> usize {
        self.listeners.remove_listeners(count)
    }

    pub fn is_update_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Ask the server whether a newer bundle exists for the current channel
    ///
    /// Emits `UpdateAvailable` when one does. Bundles that were rolled back
    /// before or fall below the minimum bundle id are not offered.
    pub async fn check(&self) -> UpdateResult<Option<UpdateDescriptor>> {
        let resolver = self
            .resolver
            .as_ref()
            .ok_or_else(|| UpdateError::ResolveFailed("no update server configured".to_string()))?;

        let record = self.store.read();
        let outcome = resolver
            .resolve(&record.channel, record.active_bundle_id.as_ref())
            .await?;

        let descriptor = match outcome {
            ResolveOutcome::UpdateAvailable(descriptor) => descriptor,
            ResolveOutcome::NoUpdate => {
                info!("No bundle update available");
                return Ok(None);
            }
        };

        if record.was_rolled_back(&descriptor.bundle_id) {
            info!(
                "Ignoring bundle {}: it was rolled back on this device",
                descriptor.bundle_id
            );
            return Ok(None);
        }
        if !record.is_compatible(&descriptor.bundle_id) {
            info!(
                "Ignoring bundle {}: below minimum bundle id {}",
                descriptor.bundle_id, record.min_bundle_id
            );
            return Ok(None);
        }

        info!("Bundle update available: {}", descriptor.bundle_id);
        *self.last_descriptor.lock() = Some(descriptor.clone());
        self.listeners.emit(&UpdateEvent::UpdateAvailable {
            descriptor: descriptor.clone(),
        });
        Ok(Some(descriptor))
    }

    /// Check, then install whatever the server offers
    pub async fn check_and_update(&self) -> UpdateResult<Option<BundleSlot>> {
        match self.check().await? {
            Some(descriptor) => self.install(descriptor.into()).await.map(Some),
            None => Ok(None),
        }
    }

    /// Download, validate, stage and activate one bundle
    ///
    /// The bundle runs after the next [`UpdateEngine::reload`]. Emits
    /// `Progress` while downloading and `Complete` or `Failed` at the end.
    pub async fn install(&self, request: UpdateRequest) -> UpdateResult<BundleSlot> {
        let _guard = InProgressGuard::acquire(&self.in_progress)?;
        self.install_guarded(request).await
    }

    /// Body of [`install`](Self::install); the caller holds the in-progress guard
    async fn install_guarded(&self, request: UpdateRequest) -> UpdateResult<BundleSlot> {
        let bundle_id = request.bundle_id.clone();

        info!("Installing bundle {} from {}", bundle_id, request.zip_url);
        let result = self.run_install(&request).await;
        match &result {
            Ok(_) => {
                info!("Bundle {} installed, pending reload", bundle_id);
                self.listeners.emit(&UpdateEvent::Complete { bundle_id });
            }
            Err(e) => {
                warn!("Update to bundle {} failed: {}", bundle_id, e);
                self.clean_up_failure(&request, e).await;
                self.listeners.emit(&UpdateEvent::Failed {
                    bundle_id,
                    code: e.code().to_string(),
                    message: e.to_string(),
                });
            }
        }
        result
    }

    async fn run_install(&self, request: &UpdateRequest) -> UpdateResult<BundleSlot> {
        let bundle_id = &request.bundle_id;
        let record = self.store.read();

        if record.active_bundle_id.as_ref() == Some(bundle_id) {
            if let Some(slot) = self.stager.load_slot(bundle_id)? {
                if self.stager.verify_slot(&slot) {
                    debug!("Bundle {} is already active", bundle_id);
                    return Ok(slot);
                }
            }
        }
        if record.was_rolled_back(bundle_id) {
            return Err(UpdateError::PreviouslyRolledBack(bundle_id.to_string()));
        }
        if !record.is_compatible(bundle_id) {
            return Err(UpdateError::IncompatibleBundle {
                bundle_id: bundle_id.to_string(),
                min_bundle_id: record.min_bundle_id.to_string(),
            });
        }

        let cancel = self.shutdown.child_token();
        let listeners = self.listeners.clone();
        let progress_id = bundle_id.clone();
        let progress = move |p: FetchProgress| {
            listeners.emit(&UpdateEvent::Progress {
                bundle_id: progress_id.clone(),
                progress: UpdateEvent::progress_fraction(p.downloaded, p.total),
                downloaded: p.downloaded,
                total: p.total,
            });
        };

        let archive = self
            .fetcher
            .fetch(&request.zip_url, &cancel, Some(&progress))
            .await?;

        let validator = self.validator.clone();
        let stager = self.stager.clone();
        let stage_id = bundle_id.clone();
        let checksum = request.checksum.clone();
        let staged = tokio::task::spawn_blocking(move || {
            let validated = validator.validate(&archive, checksum.as_deref())?;
            stager.stage(&validated, &stage_id)
        })
        .await
        .map_err(|e| UpdateError::UnpackError(format!("staging task failed: {}", e)));
        let slot = staged??;
        self.fetcher.discard(&request.zip_url).await;

        if cancel.is_cancelled() {
            self.discard_unreferenced(&slot);
            return Err(UpdateError::Cancelled);
        }

        self.activation.activate(&slot).await?;
        Ok(self.stager.load_slot(bundle_id)?.unwrap_or(slot))
    }

    /// Undo what a failed install left behind
    async fn clean_up_failure(&self, request: &UpdateRequest, error: &UpdateError) {
        match error.recovery_action() {
            RecoveryAction::Retry => {
                debug!("Keeping partial download of {} for a later resume", request.zip_url);
            }
            RecoveryAction::Discard => self.fetcher.discard(&request.zip_url).await,
            RecoveryAction::Rollback => {
                let active = self.store.read().active_bundle_id;
                if active.as_ref() == Some(&request.bundle_id) {
                    if let Err(e) = self.activation.rollback(error.to_string()).await {
                        warn!("Rollback after failed activation failed: {}", e);
                    }
                } else {
                    // the pointer never moved, only the archive is left
                    self.fetcher.discard(&request.zip_url).await;
                }
            }
            RecoveryAction::Reject | RecoveryAction::Abort => {}
        }
    }

    /// Drop a freshly staged slot nothing points at
    fn discard_unreferenced(&self, slot: &BundleSlot) {
        let record = self.store.read();
        let referenced = record.active_bundle_id.as_ref() == Some(&slot.bundle_id)
            || record.previous_bundle_id.as_ref() == Some(&slot.bundle_id);
        if !referenced {
            if let Err(e) = self.stager.remove_slot(&slot.bundle_id) {
                warn!("Failed to remove cancelled slot {}: {}", slot.bundle_id, e);
            }
        }
    }

    /// Checksum the server published for `bundle_id`, if it is known
    async fn manifest_checksum(&self, bundle_id: &BundleId) -> Option<String> {
        let cached = self
            .last_descriptor
            .lock()
            .as_ref()
            .filter(|d| &d.bundle_id == bundle_id)
            .map(|d| d.checksum.clone());
        if let Some(checksum) = cached {
            return checksum;
        }

        let resolver = self.resolver.as_ref()?;
        let record = self.store.read();
        match resolver
            .resolve(&record.channel, record.active_bundle_id.as_ref())
            .await
        {
            Ok(ResolveOutcome::UpdateAvailable(descriptor)) if &descriptor.bundle_id == bundle_id => {
                let checksum = descriptor.checksum.clone();
                *self.last_descriptor.lock() = Some(descriptor);
                checksum
            }
            Ok(_) => {
                debug!("Server does not offer {}, no manifest checksum", bundle_id);
                None
            }
            Err(e) => {
                warn!("Could not fetch manifest checksum for {}: {}", bundle_id, e);
                None
            }
        }
    }

    /// Remove unused slots and stale partial downloads
    pub async fn gc(&self) -> UpdateResult<GcReport> {
        let _guard = InProgressGuard::acquire(&self.in_progress)?;
        Ok(GcReport {
            slots_removed: self.activation.collect_garbage().await?,
            partials_removed: self.fetcher.cleanup_partials().await?,
        })
    }

    pub fn status(&self) -> UpdateResult<EngineStatus> {
        Ok(EngineStatus {
            record: self.store.read(),
            slots: self.stager.list_slots()?,
            update_in_progress: self.is_update_in_progress(),
            watched_bundle: self.activation.watched_bundle(),
        })
    }

    /// Cancel the in-flight update and the health timer
    ///
    /// The engine accepts no further updates afterwards.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Shutting down update engine");
            self.shutdown.cancel();
        }
        self.activation.disarm_timer();
    }
}

impl Drop for HotUpdater {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl UpdateEngine for HotUpdater {
    async fn reload(&self) -> UpdateResult<ReloadTarget> {
        self.activation.reload().await
    }

    async fn update_bundle(&self, bundle_id: &str, zip_url: Option<&str>) -> bool {
        let bundle_id = match BundleId::new(bundle_id) {
            Ok(id) => id,
            Err(e) => {
                warn!("Rejected update request: {}", e);
                return false;
            }
        };

        let Some(zip_url) = zip_url else {
            return match self.check().await {
                Ok(descriptor) => descriptor.is_some(),
                Err(e) => {
                    warn!("Update check failed: {}", e);
                    false
                }
            };
        };

        let _guard = match InProgressGuard::acquire(&self.in_progress) {
            Ok(guard) => guard,
            Err(e) => {
                warn!("Rejected update to bundle {}: {}", bundle_id, e);
                return false;
            }
        };
        let checksum = self.manifest_checksum(&bundle_id).await;
        let request = UpdateRequest {
            bundle_id,
            zip_url: zip_url.to_string(),
            checksum,
        };
        self.install_guarded(request).await.is_ok()
    }

    async fn set_channel(&self, channel: &str) -> UpdateResult<()> {
        let channel = Channel::new(channel)?;
        let previous = self.store.read().channel;
        if previous == channel {
            return Ok(());
        }

        self.store.update(|r| r.channel = channel.clone()).await?;
        *self.last_descriptor.lock() = None;
        info!("Channel changed from {} to {}", previous, channel);
        Ok(())
    }

    fn constants(&self) -> Constants {
        self.activation.constants()
    }

    async fn confirm_healthy(&self, bundle_id: &str) -> UpdateResult<bool> {
        let bundle_id = BundleId::new(bundle_id)?;
        let confirmed = self.activation.confirm_healthy(&bundle_id).await?;
        if confirmed {
            // skipped while an update is staging; the next pass catches up
            match InProgressGuard::acquire(&self.in_progress) {
                Ok(_guard) => {
                    if let Err(e) = self.activation.collect_garbage().await {
                        warn!("Garbage collection after confirmation failed: {}", e);
                    }
                }
                Err(_) => debug!("Update in progress, garbage collection deferred"),
            }
        }
        Ok(confirmed)
    }

    async fn rollback(&self) -> UpdateResult<bool> {
        let outcome = self.activation.rollback("rollback requested by host").await?;
        Ok(outcome.is_some())
    }
}
