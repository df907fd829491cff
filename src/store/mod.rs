//! Durable update state
//!
//! The [`StateStore`] exclusively owns the [`UpdateRecord`]:
//! - Readers get a cheap clone of an in-memory snapshot
//! - Writers are serialized by an async mutex
//! - Every commit goes temp file -> fsync -> backup -> rename -> dir fsync
//!
//! The snapshot is only replaced after the rename succeeded, so a reader
//! never observes a record that is not on disk.

use parking_lot::RwLock;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::error::{UpdateError, UpdateResult};
use crate::core::types::record::{default_min_bundle_id, RECORD_SCHEMA_VERSION};
use crate::core::types::{BundleId, Channel, UpdateRecord};


pub const STATE_FILE: &str = "state.json";
pub const STATE_TMP_FILE: &str = "state.json.tmp";
pub const STATE_BACKUP_FILE: &str = "state.json.bak";

/// Values the native build owns; refreshed into the record on every open
#[derive(Debug, Clone)]
pub struct StoreSeed {
    pub app_version: Option<String>,
    pub min_bundle_id: BundleId,
    /// Channel for a record created from scratch
    pub default_channel: Channel,
}

impl Default for StoreSeed {
    fn default() -> Self {
        Self {
            app_version: None,
            min_bundle_id: default_min_bundle_id(),
            default_channel: Channel::default(),
        }
    }
}

/// Durable, crash-consistent holder of the [`UpdateRecord`]
pub struct StateStore {
    dir: PathBuf,
    snapshot: Arc<RwLock<UpdateRecord>>,
    writer: Mutex<()>,
}

impl StateStore {
    /// Open (or create) the store in `dir`
    ///
    /// Falls back to the backup when the main file is unreadable and fails
    /// with `StoreUnavailable` when neither copy can be loaded.
    pub fn open(dir: impl Into<PathBuf>, seed: StoreSeed) -> UpdateResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            UpdateError::StoreUnavailable(format!("cannot create {}: {}", dir.display(), e))
        })?;

        let tmp = dir.join(STATE_TMP_FILE);
        if tmp.exists() {
            warn!("Discarding uncommitted state write at {}", tmp.display());
            fs::remove_file(&tmp)?;
        }

        let main = dir.join(STATE_FILE);
        let backup = dir.join(STATE_BACKUP_FILE);

        let (mut record, fresh) = if main.exists() {
            match load_record(&main) {
                Ok(record) => (record, false),
                Err(main_err) => {
                    warn!("State file unreadable ({}), trying backup", main_err);
                    match load_record(&backup) {
                        Ok(record) => {
                            info!("Recovered update state from {}", backup.display());
                            (record, true)
                        }
                        Err(backup_err) => {
                            return Err(UpdateError::StoreUnavailable(format!(
                                "state file: {}; backup: {}",
                                main_err, backup_err
                            )));
                        }
                    }
                }
            }
        } else if backup.exists() {
            // crashed between backup and rename on a filesystem without atomic rename
            match load_record(&backup) {
                Ok(record) => (record, true),
                Err(e) => return Err(UpdateError::StoreUnavailable(e.to_string())),
            }
        } else {
            let record = UpdateRecord {
                channel: seed.default_channel.clone(),
                ..Default::default()
            };
            (record, true)
        };

        let mut dirty = fresh;
        if record.app_version != seed.app_version {
            record.app_version = seed.app_version.clone();
            dirty = true;
        }
        if record.min_bundle_id != seed.min_bundle_id {
            record.min_bundle_id = seed.min_bundle_id.clone();
            dirty = true;
        }
        if record.schema_version != RECORD_SCHEMA_VERSION {
            record.schema_version = RECORD_SCHEMA_VERSION;
            dirty = true;
        }

        if dirty {
            persist(&dir, &record)?;
        }

        debug!(
            "State store opened at {} (active: {})",
            dir.display(),
            BundleId::wire(record.active_bundle_id.as_ref())
        );

        Ok(Self {
            dir,
            snapshot: Arc::new(RwLock::new(record)),
            writer: Mutex::new(()),
        })
    }

    /// Current committed record
    pub fn read(&self) -> UpdateRecord {
        self.snapshot.read().clone()
    }

    /// Replace the whole record
    pub async fn write(&self, record: UpdateRecord) -> UpdateResult<()> {
        let _guard = self.writer.lock().await;
        self.commit(record).await
    }

    /// Apply `updater` to the current record and commit the result
    ///
    /// The updater sees the latest committed record; concurrent updates are
    /// applied one after the other.
    pub async fn update<F>(&self, updater: F) -> UpdateResult<UpdateRecord>
    where
        F: FnOnce(&mut UpdateRecord),
    {
        let _guard = self.writer.lock().await;
        let mut record = self.read();
        updater(&mut record);
        self.commit(record.clone()).await?;
        Ok(record)
    }

    /// Like [`update`](Self::update) but the updater may refuse the change
    pub async fn try_update<F>(&self, updater: F) -> UpdateResult<UpdateRecord>
    where
        F: FnOnce(&mut UpdateRecord) -> UpdateResult<()>,
    {
        let _guard = self.writer.lock().await;
        let mut record = self.read();
        updater(&mut record)?;
        self.commit(record.clone()).await?;
        Ok(record)
    }

    /// Directory holding the state files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn commit(&self, mut record: UpdateRecord) -> UpdateResult<()> {
        record.updated_at = chrono::Utc::now();
        record.schema_version = RECORD_SCHEMA_VERSION;

        let dir = self.dir.clone();
        let to_write = record.clone();
        tokio::task::spawn_blocking(move || persist(&dir, &to_write))
            .await
            .map_err(|e| UpdateError::StoreUnavailable(format!("writer task failed: {}", e)))??;

        *self.snapshot.write() = record;
        Ok(())
    }
}

fn load_record(path: &Path) -> UpdateResult<UpdateRecord> {
    let content = fs::read_to_string(path)?;
    let record: UpdateRecord = serde_json::from_str(&content)?;
    Ok(record)
}

/// Durably replace `state.json` in `dir` with `record`
fn persist(dir: &Path, record: &UpdateRecord) -> UpdateResult<()> {
    let content = serde_json::to_vec_pretty(record)?;
    let main = dir.join(STATE_FILE);
    let tmp = dir.join(STATE_TMP_FILE);
    let backup = dir.join(STATE_BACKUP_FILE);

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&content)?;
        file.sync_all()?;
    }

    if main.exists() {
        // only a readable main file is worth keeping as backup
        if load_record(&main).is_ok() {
            fs::copy(&main, &backup)?;
            File::open(&backup)?.sync_all()?;
        }
    }

    fs::rename(&tmp, &main)?;
    sync_dir(dir)?;
    Ok(())
}

#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
