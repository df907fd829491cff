//! Bundle staging
//!
//! A validated archive is unpacked into `staging/<id>.<uuid>/bundle/`, its
//! slot metadata written next to it, and the whole directory renamed to
//! `slots/<id>/` once everything is on disk. A slot directory therefore
//! either holds a complete bundle or does not exist.

use chrono::Utc;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zip::ZipArchive;

use super::validator::ValidatedArchive;
use crate::core::error::{is_disk_full, UpdateError, UpdateResult};
use crate::core::types::{BundleId, BundleSlot, SlotHealth};
use crate::store::sync_dir;

pub const SLOT_METADATA_FILE: &str = "slot.json";
pub const SLOT_CONTENT_DIR: &str = "bundle";

/// Owns the on-disk slot and staging directories
#[derive(Debug, Clone)]
pub struct Stager {
    slots_dir: PathBuf,
    staging_dir: PathBuf,
}

impl Stager {
    pub fn new(slots_dir: impl Into<PathBuf>, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            slots_dir: slots_dir.into(),
            staging_dir: staging_dir.into(),
        }
    }

    pub fn slots_dir(&self) -> &Path {
        &self.slots_dir
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn slot_dir(&self, bundle_id: &BundleId) -> PathBuf {
        self.slots_dir.join(bundle_id.as_str())
    }

    /// Unpack `validated` into the slot for `bundle_id`
    ///
    /// Returns the existing slot when the same archive was staged before.
    pub fn stage(&self, validated: &ValidatedArchive, bundle_id: &BundleId) -> UpdateResult<BundleSlot> {
        let slot_dir = self.slot_dir(bundle_id);

        if slot_dir.exists() {
            match self.load_slot(bundle_id) {
                Ok(Some(existing)) if existing.checksum == validated.checksum => {
                    if existing.entry_point_path().is_file() {
                        info!("Bundle {} already staged, reusing slot", bundle_id);
                        return Ok(existing);
                    }
                    warn!("Slot {} is missing its entry point, restaging", bundle_id);
                }
                Ok(Some(existing)) => {
                    return Err(UpdateError::UnpackError(format!(
                        "slot {} already holds a different archive (checksum {})",
                        bundle_id, existing.checksum
                    )));
                }
                Ok(None) | Err(_) => {
                    warn!("Slot {} has no readable metadata, replacing it", bundle_id);
                }
            }
            fs::remove_dir_all(&slot_dir).map_err(map_unpack_error)?;
        }

        fs::create_dir_all(&self.slots_dir).map_err(map_unpack_error)?;
        fs::create_dir_all(&self.staging_dir).map_err(map_unpack_error)?;

        let staging = self
            .staging_dir
            .join(format!("{}.{}", bundle_id, Uuid::now_v7()));

        match self.stage_into(&staging, &slot_dir, validated, bundle_id) {
            Ok(slot) => Ok(slot),
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&staging) {
                    if cleanup.kind() != io::ErrorKind::NotFound {
                        warn!("Failed to remove staging dir {}: {}", staging.display(), cleanup);
                    }
                }
                Err(e)
            }
        }
    }

    fn stage_into(
        &self,
        staging: &Path,
        slot_dir: &Path,
        validated: &ValidatedArchive,
        bundle_id: &BundleId,
    ) -> UpdateResult<BundleSlot> {
        let content_dir = staging.join(SLOT_CONTENT_DIR);
        fs::create_dir_all(&content_dir).map_err(map_unpack_error)?;

        let files = unpack(&validated.path, &content_dir)?;
        debug!("Unpacked {} files for {}", files, bundle_id);

        let slot = BundleSlot {
            bundle_id: bundle_id.clone(),
            path: slot_dir.join(SLOT_CONTENT_DIR),
            entry_point: validated.entry_point.clone(),
            checksum: validated.checksum.clone(),
            staged_at: Utc::now(),
            activated_at: None,
            health: SlotHealth::Staged,
        };
        write_metadata(staging, &slot)?;
        sync_dir(staging).map_err(map_unpack_error)?;

        fs::rename(staging, slot_dir).map_err(map_unpack_error)?;
        sync_dir(&self.slots_dir).map_err(map_unpack_error)?;

        info!("Staged bundle {} at {}", bundle_id, slot_dir.display());
        Ok(slot)
    }

    /// Slot metadata for `bundle_id`, `None` when no slot exists
    pub fn load_slot(&self, bundle_id: &BundleId) -> UpdateResult<Option<BundleSlot>> {
        let slot_dir = self.slot_dir(bundle_id);
        let metadata = slot_dir.join(SLOT_METADATA_FILE);
        if !metadata.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&metadata)?;
        let mut slot: BundleSlot = serde_json::from_str(&content)?;
        if &slot.bundle_id != bundle_id {
            return Err(UpdateError::UnpackError(format!(
                "slot {} holds metadata for {}",
                bundle_id, slot.bundle_id
            )));
        }
        // the data dir may have moved since staging
        slot.path = slot_dir.join(SLOT_CONTENT_DIR);
        Ok(Some(slot))
    }

    /// Every slot with readable metadata, oldest first
    pub fn list_slots(&self) -> UpdateResult<Vec<BundleSlot>> {
        let mut slots = Vec::new();
        if !self.slots_dir.exists() {
            return Ok(slots);
        }

        for entry in fs::read_dir(&self.slots_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Ok(bundle_id) = BundleId::new(name.as_str()) else {
                warn!("Ignoring unexpected directory in slots: {}", name);
                continue;
            };
            match self.load_slot(&bundle_id) {
                Ok(Some(slot)) => slots.push(slot),
                Ok(None) => debug!("Slot {} has no metadata", bundle_id),
                Err(e) => warn!("Slot {} has unreadable metadata: {}", bundle_id, e),
            }
        }

        slots.sort_by(|a, b| {
            a.staged_at
                .cmp(&b.staged_at)
                .then_with(|| a.bundle_id.cmp(&b.bundle_id))
        });
        Ok(slots)
    }

    /// Atomically replace the metadata of an existing slot
    pub fn write_slot(&self, slot: &BundleSlot) -> UpdateResult<()> {
        let slot_dir = self.slot_dir(&slot.bundle_id);
        if !slot_dir.exists() {
            return Err(UpdateError::ActivationFailed(format!(
                "slot {} does not exist",
                slot.bundle_id
            )));
        }
        write_metadata(&slot_dir, slot)
    }

    /// Move a slot to `health` when the lifecycle allows it
    pub fn set_health(&self, bundle_id: &BundleId, health: SlotHealth) -> UpdateResult<Option<BundleSlot>> {
        let Some(mut slot) = self.load_slot(bundle_id)? else {
            return Ok(None);
        };
        if slot.health == health {
            return Ok(Some(slot));
        }
        if !slot.health.can_transition_to(health) {
            debug!(
                "Ignoring slot transition {} -> {} for {}",
                slot.health, health, bundle_id
            );
            return Ok(Some(slot));
        }
        slot.health = health;
        if matches!(health, SlotHealth::Activating | SlotHealth::Active) && slot.activated_at.is_none() {
            slot.activated_at = Some(Utc::now());
        }
        self.write_slot(&slot)?;
        Ok(Some(slot))
    }

    /// Whether the slot's contents are still usable
    pub fn verify_slot(&self, slot: &BundleSlot) -> bool {
        slot.entry_point_path().is_file()
    }

    pub fn remove_slot(&self, bundle_id: &BundleId) -> UpdateResult<()> {
        let slot_dir = self.slot_dir(bundle_id);
        match fs::remove_dir_all(&slot_dir) {
            Ok(()) => {
                info!("Removed slot {}", bundle_id);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove staging directories left behind by interrupted runs
    pub fn cleanup_staging(&self) -> UpdateResult<usize> {
        if !self.staging_dir.exists() {
            return Ok(0);
        }

        let mut removed = 0;
        for entry in fs::read_dir(&self.staging_dir)? {
            let path = entry?.path();
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
        if removed > 0 {
            info!("Removed {} orphaned staging item(s)", removed);
        }
        Ok(removed)
    }
}

/// Extract every entry of `archive` below `dest`; returns the file count
fn unpack(archive: &Path, dest: &Path) -> UpdateResult<usize> {
    let file = File::open(archive).map_err(map_unpack_error)?;
    let mut zip = ZipArchive::new(file)
        .map_err(|e| UpdateError::CorruptArchive(format!("{}: {}", archive.display(), e)))?;

    let mut files = 0;
    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| UpdateError::CorruptArchive(format!("entry {}: {}", i, e)))?;
        let relative = entry.enclosed_name().ok_or_else(|| {
            UpdateError::CorruptArchive(format!("entry escapes the bundle root: {}", entry.name()))
        })?;
        let target = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(map_unpack_error)?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(map_unpack_error)?;
        }
        let mut out = File::create(&target).map_err(map_unpack_error)?;
        io::copy(&mut entry, &mut out).map_err(map_unpack_error)?;
        out.sync_all().map_err(map_unpack_error)?;
        files += 1;
    }

    Ok(files)
}

fn write_metadata(dir: &Path, slot: &BundleSlot) -> UpdateResult<()> {
    let content = serde_json::to_vec_pretty(slot)?;
    let tmp = dir.join(format!("{}.tmp", SLOT_METADATA_FILE));
    {
        let mut file = File::create(&tmp).map_err(map_unpack_error)?;
        file.write_all(&content).map_err(map_unpack_error)?;
        file.sync_all().map_err(map_unpack_error)?;
    }
    fs::rename(&tmp, dir.join(SLOT_METADATA_FILE)).map_err(map_unpack_error)?;
    Ok(())
}

fn map_unpack_error(err: io::Error) -> UpdateError {
    if is_disk_full(&err) {
        UpdateError::DiskFull
    } else {
        UpdateError::UnpackError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_entry_points;
    use crate::update::test_support::{bundle_zip, write_file, write_zip};
    use crate::update::validator::ArchiveValidator;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> Stager {
        Stager::new(dir.path().join("slots"), dir.path().join("staging"))
    }

    fn validated(dir: &TempDir, name: &str, bytes: &[u8]) -> ValidatedArchive {
        let path = dir.path().join(name);
        write_file(&path, bytes);
        ArchiveValidator::new(default_entry_points(), false)
            .validate(&path, None)
            .unwrap()
    }

    fn id(s: &str) -> BundleId {
        BundleId::new(s).unwrap()
    }

    #[test]
    fn test_stage_unpacks_into_slot() {
        let dir = TempDir::new().unwrap();
        let stager = setup(&dir);
        let archive = validated(&dir, "v2.zip", &bundle_zip("v2"));

        let slot = stager.stage(&archive, &id("v2")).unwrap();
        assert_eq!(slot.health, SlotHealth::Staged);
        assert_eq!(slot.checksum, archive.checksum);
        assert_eq!(slot.path, dir.path().join("slots").join("v2").join("bundle"));
        assert!(slot.entry_point_path().is_file());
        assert!(slot.path.join("assets").join("logo.png").is_file());

        let code = std::fs::read_to_string(slot.entry_point_path()).unwrap();
        assert!(code.contains("v2"));

        // staging is empty again
        assert_eq!(std::fs::read_dir(stager.staging_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_stage_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let stager = setup(&dir);
        let archive = validated(&dir, "v2.zip", &bundle_zip("v2"));

        let first = stager.stage(&archive, &id("v2")).unwrap();
        let second = stager.stage(&archive, &id("v2")).unwrap();
        assert_eq!(first.staged_at, second.staged_at);
        assert_eq!(stager.list_slots().unwrap().len(), 1);
    }

    #[test]
    fn test_stage_refuses_different_archive_for_same_id() {
        let dir = TempDir::new().unwrap();
        let stager = setup(&dir);
        let a = validated(&dir, "a.zip", &bundle_zip("a"));
        let b = validated(&dir, "b.zip", &bundle_zip("b"));

        stager.stage(&a, &id("v2")).unwrap();
        let err = stager.stage(&b, &id("v2")).unwrap_err();
        assert!(matches!(err, UpdateError::UnpackError(_)));

        // the original contents are untouched
        let slot = stager.load_slot(&id("v2")).unwrap().unwrap();
        assert_eq!(slot.checksum, a.checksum);
    }

    #[test]
    fn test_stage_replaces_slot_without_metadata() {
        let dir = TempDir::new().unwrap();
        let stager = setup(&dir);
        let broken = stager.slot_dir(&id("v2"));
        std::fs::create_dir_all(broken.join("bundle")).unwrap();

        let archive = validated(&dir, "v2.zip", &bundle_zip("v2"));
        let slot = stager.stage(&archive, &id("v2")).unwrap();
        assert!(slot.entry_point_path().is_file());
    }

    #[test]
    fn test_failed_stage_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let stager = setup(&dir);
        let archive = validated(&dir, "v2.zip", &bundle_zip("v2"));

        // archive vanished between validation and staging
        std::fs::remove_file(&archive.path).unwrap();

        let err = stager.stage(&archive, &id("v2")).unwrap_err();
        assert!(matches!(err, UpdateError::UnpackError(_)));
        assert!(!stager.slot_dir(&id("v2")).exists());
        assert_eq!(std::fs::read_dir(stager.staging_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_set_health_follows_lifecycle() {
        let dir = TempDir::new().unwrap();
        let stager = setup(&dir);
        let archive = validated(&dir, "v2.zip", &bundle_zip("v2"));
        stager.stage(&archive, &id("v2")).unwrap();

        // Staged -> Active is not a legal move
        let slot = stager.set_health(&id("v2"), SlotHealth::Active).unwrap().unwrap();
        assert_eq!(slot.health, SlotHealth::Staged);

        let slot = stager.set_health(&id("v2"), SlotHealth::Activating).unwrap().unwrap();
        assert_eq!(slot.health, SlotHealth::Activating);
        assert!(slot.activated_at.is_some());

        let slot = stager.set_health(&id("v2"), SlotHealth::Active).unwrap().unwrap();
        assert_eq!(slot.health, SlotHealth::Active);
        assert_eq!(stager.load_slot(&id("v2")).unwrap().unwrap().health, SlotHealth::Active);

        assert!(stager.set_health(&id("v9"), SlotHealth::Active).unwrap().is_none());
    }

    #[test]
    fn test_list_and_remove_slots() {
        let dir = TempDir::new().unwrap();
        let stager = setup(&dir);
        for tag in ["v1", "v2", "v3"] {
            let archive = validated(&dir, &format!("{}.zip", tag), &bundle_zip(tag));
            stager.stage(&archive, &id(tag)).unwrap();
        }
        std::fs::create_dir_all(stager.slots_dir().join("not a bundle id")).unwrap();

        let ids: Vec<_> = stager
            .list_slots()
            .unwrap()
            .into_iter()
            .map(|s| s.bundle_id.to_string())
            .collect();
        assert_eq!(ids, vec!["v1", "v2", "v3"]);

        stager.remove_slot(&id("v2")).unwrap();
        stager.remove_slot(&id("v2")).unwrap();
        assert_eq!(stager.list_slots().unwrap().len(), 2);
    }

    #[test]
    fn test_cleanup_staging() {
        let dir = TempDir::new().unwrap();
        let stager = setup(&dir);
        std::fs::create_dir_all(stager.staging_dir().join("v2.0190a3c4").join("bundle")).unwrap();
        write_zip(&stager.staging_dir().join("stray.zip"), &[("index.bundle", b"x")]);

        assert_eq!(stager.cleanup_staging().unwrap(), 2);
        assert_eq!(std::fs::read_dir(stager.staging_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_disk_full_mapping() {
        let err = map_unpack_error(io::Error::new(io::ErrorKind::StorageFull, "full"));
        assert!(matches!(err, UpdateError::DiskFull));
        let err = map_unpack_error(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        assert!(matches!(err, UpdateError::UnpackError(_)));
    }
}
