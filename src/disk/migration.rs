//! Moves an allocation's file tree from one volume to another.
//!
//! The old root's file list is recorded up front in a manifest inside the old root, and
//! the manifest is rewritten after every copied file. A crashed migration restarted with
//! the same roots skips the files already copied. Copying is one-directional: files that
//! exist only under the new root are never merged back. Once every file is copied the old
//! tree is marked as migrated and removed after a grace period.

use log::{debug, error, info, trace};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::error::{BlobberError, Result};

pub const MANIFEST_FILE: &str = ".migration_manifest.json";
/// Left in an old root whose files all reached the new root.
pub const MIGRATED_MARKER: &str = ".migrated";

/// Progress record of one migration, persisted as the manifest.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AllocationInfo {
    pub allocation_id: String,
    pub old_root: PathBuf,
    pub new_root: PathBuf,
    /// Files relative to the old root.
    pub files: Vec<PathBuf>,
    pub copied: BTreeSet<PathBuf>,
    pub temp_file: PathBuf,
}

#[derive(Debug)]
pub struct MigrationOutcome {
    pub info: AllocationInfo,
    /// Removes the old root once the grace period elapses.
    pub deletion: JoinHandle<()>,
}

impl AllocationInfo {
    async fn load(path: &Path) -> Result<Option<AllocationInfo>> {
        match tokio::fs::read(path).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn checkpoint(&self) -> Result<()> {
        let tmp = self.temp_file.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(self)?).await?;
        tokio::fs::rename(&tmp, &self.temp_file).await?;
        Ok(())
    }
}

/// Copies every file under `old_root` into `new_root` and schedules removal of `old_root`.
///
/// # Errors
///
/// * `BlobberError::Io` - If the walk, a copy, or a manifest checkpoint fails. Progress
///   made so far stays in the manifest for the next attempt.
pub async fn migrate_allocation(
    allocation_id: &str,
    old_root: &Path,
    new_root: &Path,
    grace_period: Duration,
) -> Result<MigrationOutcome> {
    let temp_file = old_root.join(MANIFEST_FILE);
    let previous = AllocationInfo::load(&temp_file).await?;
    let copied = previous
        .filter(|p| p.new_root == new_root)
        .map(|p| p.copied)
        .unwrap_or_default();
    if !copied.is_empty() {
        info!(
            "Resuming migration of {} with {} files already copied",
            allocation_id,
            copied.len()
        );
    }

    let files = list_files(old_root.to_path_buf()).await?;

    let mut alloc_info = AllocationInfo {
        allocation_id: allocation_id.to_string(),
        old_root: old_root.to_path_buf(),
        new_root: new_root.to_path_buf(),
        files,
        copied,
        temp_file,
    };
    alloc_info.checkpoint().await?;

    tokio::fs::create_dir_all(new_root).await?;
    let pending: Vec<PathBuf> = alloc_info
        .files
        .iter()
        .filter(|f| !alloc_info.copied.contains(*f))
        .cloned()
        .collect();
    for relative in pending {
        copy_file(&old_root.join(&relative), &new_root.join(&relative)).await?;
        alloc_info.copied.insert(relative.clone());
        alloc_info.checkpoint().await?;
        trace!("Migrated {} for {}", relative.display(), allocation_id);
    }

    tokio::fs::write(old_root.join(MIGRATED_MARKER), new_root.to_string_lossy().as_bytes())
        .await?;
    tokio::fs::remove_file(&alloc_info.temp_file).await?;
    info!(
        "Migrated {} files of allocation {} from {} to {}",
        alloc_info.files.len(),
        allocation_id,
        old_root.display(),
        new_root.display()
    );

    let deletion = schedule_deletion(old_root.to_path_buf(), grace_period);
    Ok(MigrationOutcome {
        info: alloc_info,
        deletion,
    })
}

/// Removes `root` after `grace_period`.
pub fn schedule_deletion(root: PathBuf, grace_period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(grace_period).await;
        match tokio::fs::remove_dir_all(&root).await {
            Ok(()) => debug!("Removed migrated tree {}", root.display()),
            Err(e) => error!("Failed to remove migrated tree {}: {}", root.display(), e),
        }
    })
}

/// Relative paths of every file under `root`, sorted, walked off the runtime threads.
async fn list_files(root: PathBuf) -> Result<Vec<PathBuf>> {
    tokio::task::spawn_blocking(move || -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        walk_files(&root, &root, &mut files)?;
        files.sort();
        Ok(files)
    })
    .await
    .map_err(|e| BlobberError::Internal(format!("file walk task failed: {}", e)))?
}

fn walk_files(base: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            walk_files(base, &path, out)?;
        } else if path
            .file_name()
            .map_or(false, |n| n != MANIFEST_FILE && n != MIGRATED_MARKER)
        {
            if let Ok(relative) = path.strip_prefix(base) {
                out.push(relative.to_path_buf());
            }
        }
    }
    Ok(())
}

async fn copy_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut reader = tokio::fs::File::open(from).await?;
    let mut writer = tokio::fs::File::create(to).await?;
    tokio::io::copy(&mut reader, &mut writer).await?;
    writer.sync_all().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populate(root: &Path) {
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("top.bin"), b"top").unwrap();
        fs::write(root.join("a/one.bin"), b"one").unwrap();
        fs::write(root.join("a/b/two.bin"), b"two").unwrap();
    }

    #[tokio::test]
    async fn test_migrates_tree_and_removes_old_root() {
        let dir = tempfile::tempdir().unwrap();
        let old_root = dir.path().join("vol1/alloc");
        let new_root = dir.path().join("vol2/alloc");
        populate(&old_root);

        let outcome = migrate_allocation("alloc", &old_root, &new_root, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(outcome.info.files.len(), 3);
        assert_eq!(fs::read(new_root.join("a/b/two.bin")).unwrap(), b"two");
        assert!(!new_root.join(MANIFEST_FILE).exists());
        assert!(!new_root.join(MIGRATED_MARKER).exists());
        assert!(old_root.join(MIGRATED_MARKER).exists());
        outcome.deletion.await.unwrap();
        assert!(!old_root.exists());
    }

    #[tokio::test]
    async fn test_resumes_from_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let old_root = dir.path().join("old");
        let new_root = dir.path().join("new");
        populate(&old_root);

        // Simulate a crash after the first file: manifest says copied, destination holds
        // a marker value that a re-copy would overwrite.
        fs::create_dir_all(&new_root).unwrap();
        fs::write(new_root.join("top.bin"), b"kept").unwrap();
        let partial = AllocationInfo {
            allocation_id: "alloc".into(),
            old_root: old_root.clone(),
            new_root: new_root.clone(),
            files: vec![PathBuf::from("top.bin")],
            copied: [PathBuf::from("top.bin")].into_iter().collect(),
            temp_file: old_root.join(MANIFEST_FILE),
        };
        partial.checkpoint().await.unwrap();
        // A file added to the old root after the crash is still picked up.
        fs::write(old_root.join("late.bin"), b"late").unwrap();

        let outcome = migrate_allocation("alloc", &old_root, &new_root, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(fs::read(new_root.join("top.bin")).unwrap(), b"kept");
        assert_eq!(fs::read(new_root.join("late.bin")).unwrap(), b"late");
        assert_eq!(outcome.info.copied.len(), 4);
        assert!(old_root.exists());
        outcome.deletion.abort();
    }
}
