use log::{debug, trace, warn};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{BlobberError, Result};

const WRITE_PROBE_FILE: &str = ".write_probe";

/// A physical storage mount the node can place allocation data on.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub path: PathBuf,
    /// Free bytes as last measured.
    pub available_size: u64,
    pub total_size: u64,
}

impl Volume {
    /// Measures the filesystem backing `path`.
    pub fn probe<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let available_size = fs2::available_space(path)
            .map_err(|e| BlobberError::InvalidVolume(format!("{}: {}", path.display(), e)))?;
        let total_size = fs2::total_space(path)
            .map_err(|e| BlobberError::InvalidVolume(format!("{}: {}", path.display(), e)))?;
        Ok(Self {
            path: path.to_path_buf(),
            available_size,
            total_size,
        })
    }

    pub fn refresh(&mut self) -> Result<()> {
        let fresh = Self::probe(&self.path)?;
        self.available_size = fresh.available_size;
        self.total_size = fresh.total_size;
        Ok(())
    }

    /// Writes and removes a probe file.
    pub fn check_writable(&self) -> Result<()> {
        let probe = self.path.join(WRITE_PROBE_FILE);
        fs::write(&probe, b"ok")
            .and_then(|_| fs::remove_file(&probe))
            .map_err(|e| {
                BlobberError::InvalidVolume(format!("{} is not writable: {}", self.path.display(), e))
            })
    }
}

/// Scans the immediate subdirectories of `mount_point` for usable volumes.
///
/// A mount point without subdirectories is used as a single volume. Volumes below
/// `min_size` free bytes or failing the write probe are skipped.
pub fn discover_volumes(mount_point: &Path, min_size: u64) -> Result<Vec<Volume>> {
    let mut candidates = Vec::new();
    for entry in fs::read_dir(mount_point)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            candidates.push(entry.path());
        }
    }
    if candidates.is_empty() {
        candidates.push(mount_point.to_path_buf());
    }
    candidates.sort();

    let mut volumes = Vec::new();
    for path in candidates {
        let volume = match Volume::probe(&path) {
            Ok(volume) => volume,
            Err(e) => {
                warn!("Skipping volume {}: {}", path.display(), e);
                continue;
            }
        };
        if volume.available_size < min_size {
            debug!(
                "Skipping volume {}: {} bytes free, minimum {}",
                path.display(),
                volume.available_size,
                min_size
            );
            continue;
        }
        if let Err(e) = volume.check_writable() {
            warn!("Skipping volume: {}", e);
            continue;
        }
        trace!(
            "Discovered volume {} with {} bytes free",
            volume.path.display(),
            volume.available_size
        );
        volumes.push(volume);
    }
    Ok(volumes)
}
