/// File content store: where uploaded file bodies live on disk and how the challenge
/// engine pulls a provable slice out of them.
use async_trait::async_trait;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::disk::DiskBalancer;
use crate::error::{BlobberError, Result};
use crate::merkle::{FixedMerkleTree, MerklePath, BLOCK_SIZE, MERKLE_LEAVES};
use crate::reference::Ref;
use crate::utils::hash;

/// Data and proof served to validators for a challenged file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChallengeBlock {
    pub data: Vec<u8>,
    pub merkle_path: MerklePath,
}

/// Content summary of a stored file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredFile {
    pub content_hash: String,
    pub merkle_root: String,
    pub size: i64,
    pub num_blocks: i64,
}

#[async_trait]
pub trait FileStore: Send + Sync {
    /// Returns leaf `block_offset` of `file`'s merkle tree together with its path.
    async fn get_block_for_challenge(
        &self,
        allocation_id: &str,
        file: &Ref,
        block_offset: usize,
    ) -> Result<ChallengeBlock>;
}

/// Stores files as `<volume>/<allocation_id>/<content_hash>`.
pub struct LocalFileStore {
    balancer: Arc<DiskBalancer>,
}

impl LocalFileStore {
    pub fn new(balancer: Arc<DiskBalancer>) -> Self {
        Self { balancer }
    }

    /// Writes `content` for `allocation_id` and returns what the reference tree needs.
    ///
    /// # Errors
    ///
    /// * `BlobberError::InsufficientSpace` / `BlobberError::InvalidVolume` - If a new
    ///   allocation cannot be placed.
    /// * `BlobberError::Io` - If the write fails.
    pub async fn write_file(&self, allocation_id: &str, content: &[u8]) -> Result<StoredFile> {
        let dir = self
            .balancer
            .allocation_dir_for_write(allocation_id, content.len() as u64)
            .await?;
        let content_hash = hash(content);
        let merkle_root = FixedMerkleTree::from_content(content).root();
        tokio::fs::write(dir.path.join(&content_hash), content).await?;
        debug!(
            "Stored {} bytes for allocation {} as {}",
            content.len(),
            allocation_id,
            content_hash
        );
        Ok(StoredFile {
            content_hash,
            merkle_root,
            size: content.len() as i64,
            num_blocks: content.len().div_ceil(BLOCK_SIZE) as i64,
        })
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn get_block_for_challenge(
        &self,
        allocation_id: &str,
        file: &Ref,
        block_offset: usize,
    ) -> Result<ChallengeBlock> {
        if block_offset >= MERKLE_LEAVES {
            return Err(BlobberError::InvalidObjectPath(format!(
                "block offset {} outside the {} merkle leaves",
                block_offset, MERKLE_LEAVES
            )));
        }
        let dir = self
            .balancer
            .open_allocation(allocation_id)
            .await
            .ok_or_else(|| {
                BlobberError::NotFound(format!("allocation {} on disk", allocation_id))
            })?;
        let content = tokio::fs::read(dir.path.join(&file.content_hash)).await?;
        drop(dir);
        let tree = FixedMerkleTree::from_content(&content);
        if !file.merkle_root.is_empty() && tree.root() != file.merkle_root {
            return Err(BlobberError::Internal(format!(
                "stored content of {} does not match its merkle root",
                file.path
            )));
        }
        trace!(
            "Serving leaf {} of {} for allocation {}",
            block_offset,
            file.path,
            allocation_id
        );
        Ok(ChallengeBlock {
            data: FixedMerkleTree::leaf_data(&content, block_offset),
            merkle_path: tree.path(block_offset),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BlobberConfig;
    use crate::merkle::verify_path;

    fn store(mount_point: &std::path::Path) -> LocalFileStore {
        let mut config = BlobberConfig::from_defaults().unwrap().disk;
        config.mount_point = mount_point.to_string_lossy().into_owned();
        LocalFileStore::new(Arc::new(DiskBalancer::new(config).unwrap()))
    }

    #[tokio::test]
    async fn test_written_file_serves_verifiable_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let content: Vec<u8> = (0..BLOCK_SIZE + 10).map(|i| (i % 7) as u8).collect();
        let stored = store.write_file("alloc", &content).await.unwrap();
        assert_eq!(stored.num_blocks, 2);

        let file = Ref::new_file(
            "alloc",
            "/f.bin",
            stored.size,
            &stored.content_hash,
            &stored.merkle_root,
            stored.num_blocks,
        );
        let block = store.get_block_for_challenge("alloc", &file, 0).await.unwrap();
        assert_eq!(block.data.len(), 64 + 10);
        assert!(verify_path(&stored.merkle_root, &block.data, &block.merkle_path));

        let err = store
            .get_block_for_challenge("alloc", &file, MERKLE_LEAVES)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_object_path");
    }

    #[tokio::test]
    async fn test_missing_allocation() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let file = Ref::new_file("nope", "/f", 1, "c", "m", 1);
        let err = store.get_block_for_challenge("nope", &file, 0).await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}
