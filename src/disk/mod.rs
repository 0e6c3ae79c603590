/// Disk balancer: keeps the list of eligible volumes under the configured mount point
/// fresh, picks a volume for new allocation data, and moves allocations between volumes.
pub mod migration;
pub mod strategy;
pub mod volume;

use log::{debug, error, info, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::DiskConfig;
use crate::error::{BlobberError, Result};
use crate::lock::{KeyLock, LockRegistry};

pub use migration::{
    migrate_allocation, AllocationInfo, MigrationOutcome, MANIFEST_FILE, MIGRATED_MARKER,
};
pub use strategy::{strategy_by_name, MinSizeFirst, SelectionStrategy};
pub use volume::{discover_volumes, Volume};

const DEFAULT_VOLUME: &str = "vol0";
const ALLOCATION_DIR_LOCK: &str = "allocation_dir";

pub struct DiskBalancer {
    config: DiskConfig,
    mount_point: PathBuf,
    volumes: RwLock<Vec<Volume>>,
    strategy: Box<dyn SelectionStrategy>,
    /// Where each known allocation lives. Switched by `migrate` once the copy is complete.
    roots: RwLock<HashMap<String, PathBuf>>,
    locks: LockRegistry,
}

/// An allocation directory, held exclusively against migration until dropped.
pub struct AllocationDir {
    pub path: PathBuf,
    _lock: KeyLock,
}

impl DiskBalancer {
    /// Creates the balancer and runs the first volume scan.
    ///
    /// # Arguments
    ///
    /// * `config` - Mount point, minimum volume size, strategy name and timers.
    ///
    /// # Errors
    ///
    /// * `BlobberError::Config` - If the strategy name is unknown.
    /// * `BlobberError::Io` - If the mount point cannot be created or listed.
    pub fn new(config: DiskConfig) -> Result<Self> {
        let strategy = strategy_by_name(&config.strategy)?;
        let mount_point = PathBuf::from(&config.mount_point);
        std::fs::create_dir_all(&mount_point)?;
        // Allocation directories must never sit directly under the mount point, where a
        // later scan would mistake them for volumes.
        if !has_subdirectories(&mount_point)? {
            std::fs::create_dir(mount_point.join(DEFAULT_VOLUME))?;
        }
        let balancer = Self {
            config,
            mount_point,
            volumes: RwLock::new(Vec::new()),
            strategy,
            roots: RwLock::new(HashMap::new()),
            locks: LockRegistry::new(),
        };
        balancer.refresh()?;
        Ok(balancer)
    }

    /// Rescans the mount point and replaces the eligible volume list.
    pub fn refresh(&self) -> Result<()> {
        let volumes = discover_volumes(&self.mount_point, self.config.min_volume_size)?;
        if volumes.is_empty() {
            warn!(
                "No eligible volumes under {}",
                self.mount_point.display()
            );
        }
        debug!("Volume scan found {} eligible volumes", volumes.len());
        *self.volumes.write() = volumes;
        Ok(())
    }

    pub fn volumes(&self) -> Vec<Volume> {
        self.volumes.read().clone()
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Picks the volume new data of `file_size` bytes should be written to.
    ///
    /// Free space is re-measured for every known volume before the strategy runs, so the
    /// answer never relies on a stale scan.
    ///
    /// # Errors
    ///
    /// * `BlobberError::InvalidVolume` - If no volume is eligible or the chosen one is not
    ///   writable.
    /// * `BlobberError::InsufficientSpace` - If the chosen volume has less than `file_size`
    ///   bytes free.
    pub fn get_next_volume_path(&self, file_size: u64) -> Result<PathBuf> {
        let chosen = {
            let mut volumes = self.volumes.write();
            volumes.retain_mut(|v| match v.refresh() {
                Ok(()) => true,
                Err(e) => {
                    warn!("Dropping volume {}: {}", v.path.display(), e);
                    false
                }
            });
            self.strategy
                .select(&volumes)
                .cloned()
                .ok_or_else(|| BlobberError::InvalidVolume("no eligible volumes".into()))?
        };
        if chosen.available_size < file_size {
            return Err(BlobberError::InsufficientSpace {
                requested: file_size,
                available: chosen.available_size,
            });
        }
        chosen.check_writable()?;
        Ok(chosen.path)
    }

    /// Directory currently holding `allocation_id`, if any volume has it.
    ///
    /// Does not wait for a running migration; use `open_allocation` to read or write.
    pub fn allocation_path(&self, allocation_id: &str) -> Option<PathBuf> {
        if let Some(root) = self.roots.read().get(allocation_id) {
            return Some(root.clone());
        }
        let root = self.scan_allocation(allocation_id)?;
        Some(
            self.roots
                .write()
                .entry(allocation_id.to_string())
                .or_insert(root)
                .clone(),
        )
    }

    /// Finds an allocation on disk that is not yet in the root map.
    ///
    /// A tree that finished migrating away is skipped. If a migration was interrupted,
    /// the source tree still carries its manifest and wins over the partial copy.
    fn scan_allocation(&self, allocation_id: &str) -> Option<PathBuf> {
        let candidates: Vec<PathBuf> = self
            .volumes
            .read()
            .iter()
            .map(|v| v.path.join(allocation_id))
            .filter(|p| p.is_dir() && !p.join(MIGRATED_MARKER).exists())
            .collect();
        candidates
            .iter()
            .find(|p| p.join(MANIFEST_FILE).exists())
            .or_else(|| candidates.first())
            .cloned()
    }

    /// Locks `allocation_id`'s directory for reading. Waits out a running migration.
    pub async fn open_allocation(&self, allocation_id: &str) -> Option<AllocationDir> {
        let lock = self.locks.lock(ALLOCATION_DIR_LOCK, allocation_id).await;
        let path = self.allocation_path(allocation_id)?;
        Some(AllocationDir { path, _lock: lock })
    }

    /// Directory to write `file_size` new bytes of `allocation_id` into.
    ///
    /// An allocation stays on the volume it already lives on; new allocations go through
    /// the selection strategy.
    pub async fn allocation_dir_for_write(
        &self,
        allocation_id: &str,
        file_size: u64,
    ) -> Result<AllocationDir> {
        let lock = self.locks.lock(ALLOCATION_DIR_LOCK, allocation_id).await;
        if let Some(path) = self.allocation_path(allocation_id) {
            return Ok(AllocationDir { path, _lock: lock });
        }
        let dir = self.get_next_volume_path(file_size)?.join(allocation_id);
        tokio::fs::create_dir_all(&dir).await?;
        self.roots
            .write()
            .insert(allocation_id.to_string(), dir.clone());
        info!("Placed allocation {} at {}", allocation_id, dir.display());
        Ok(AllocationDir {
            path: dir,
            _lock: lock,
        })
    }

    /// Moves `allocation_id` to `target_volume`, or to the strategy's pick when `None`.
    ///
    /// Readers and writers of the allocation wait until the copy is done and the
    /// allocation points at its new root.
    ///
    /// # Errors
    ///
    /// * `BlobberError::NotFound` - If no volume holds the allocation.
    /// * `BlobberError::InvalidVolume` - If the target is the allocation's current volume.
    pub async fn migrate(
        &self,
        allocation_id: &str,
        target_volume: Option<&Path>,
    ) -> Result<MigrationOutcome> {
        let _lock = self.locks.lock(ALLOCATION_DIR_LOCK, allocation_id).await;
        let old_root = self
            .allocation_path(allocation_id)
            .ok_or_else(|| BlobberError::NotFound(format!("allocation {} on disk", allocation_id)))?;
        let target = match target_volume {
            Some(path) => path.to_path_buf(),
            None => self.get_next_volume_path(0)?,
        };
        let new_root = target.join(allocation_id);
        if new_root == old_root {
            return Err(BlobberError::InvalidVolume(format!(
                "allocation {} already on {}",
                allocation_id,
                target.display()
            )));
        }
        if new_root.join(MIGRATED_MARKER).exists() {
            return Err(BlobberError::InvalidVolume(format!(
                "earlier tree of {} on {} is still awaiting removal",
                allocation_id,
                target.display()
            )));
        }
        let outcome = migrate_allocation(
            allocation_id,
            &old_root,
            &new_root,
            Duration::from_secs(self.config.migration_grace_period_secs),
        )
        .await?;
        self.roots
            .write()
            .insert(allocation_id.to_string(), new_root);
        Ok(outcome)
    }

    /// Rescans volumes on the configured interval until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.refresh_interval_secs));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Volume refresh loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh() {
                        error!("Volume scan of {} failed: {}", self.mount_point.display(), e);
                    }
                }
            }
        }
    }
}

fn has_subdirectories(path: &Path) -> Result<bool> {
    for entry in std::fs::read_dir(path)? {
        if entry?.file_type()?.is_dir() {
            return Ok(true);
        }
    }
    Ok(false)
}
