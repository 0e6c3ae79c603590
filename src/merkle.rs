//! Fixed-width merkle tree over file content.
//!
//! A file is read in 64 KiB blocks and every block is cut into 1024 segments of 64 bytes.
//! Leaf `i` hashes the `i`-th segment of every block in order, so the tree always has
//! 1024 leaves regardless of file size. Inner nodes hash the sorted pair of their
//! children, which lets a verifier fold a path without knowing left/right positions.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const MERKLE_LEAVES: usize = 1024;
pub const CHUNK_SIZE: usize = 64;
pub const BLOCK_SIZE: usize = MERKLE_LEAVES * CHUNK_SIZE;

/// Sibling hashes from a leaf up to the root.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct MerklePath {
    pub nodes: Vec<String>,
    pub leaf_ind: usize,
}

pub struct FixedMerkleTree {
    levels: Vec<Vec<[u8; 32]>>,
}

impl FixedMerkleTree {
    pub fn from_content(content: &[u8]) -> Self {
        let mut hashers: Vec<Sha256> = (0..MERKLE_LEAVES).map(|_| Sha256::new()).collect();
        for block in content.chunks(BLOCK_SIZE) {
            for (index, segment) in block.chunks(CHUNK_SIZE).enumerate() {
                hashers[index].update(segment);
            }
        }
        let leaves: Vec<[u8; 32]> = hashers.into_iter().map(|h| h.finalize().into()).collect();

        let mut levels = vec![leaves];
        while levels.last().map_or(0, Vec::len) > 1 {
            let next = levels
                .last()
                .map(|level| {
                    level
                        .chunks(2)
                        .map(|pair| hash_pair(&pair[0], pair.get(1).unwrap_or(&pair[0])))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            levels.push(next);
        }
        Self { levels }
    }

    /// The bytes leaf `index` was hashed from.
    pub fn leaf_data(content: &[u8], index: usize) -> Vec<u8> {
        let mut data = Vec::new();
        for block in content.chunks(BLOCK_SIZE) {
            if let Some(segment) = block.chunks(CHUNK_SIZE).nth(index) {
                data.extend_from_slice(segment);
            }
        }
        data
    }

    pub fn root(&self) -> String {
        self.levels
            .last()
            .and_then(|level| level.first())
            .map(hex::encode)
            .unwrap_or_default()
    }

    pub fn path(&self, leaf_ind: usize) -> MerklePath {
        let mut nodes = Vec::with_capacity(self.levels.len());
        let mut index = leaf_ind;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = if index % 2 == 0 { index + 1 } else { index - 1 };
            let hash = level.get(sibling).unwrap_or(&level[index]);
            nodes.push(hex::encode(hash));
            index /= 2;
        }
        MerklePath { nodes, leaf_ind }
    }
}

fn hash_pair(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    if a <= b {
        hasher.update(a);
        hasher.update(b);
    } else {
        hasher.update(b);
        hasher.update(a);
    }
    hasher.finalize().into()
}

/// Folds `leaf_data` up through `path` and compares against the hex `root`.
pub fn verify_path(root: &str, leaf_data: &[u8], path: &MerklePath) -> bool {
    let mut computed: [u8; 32] = Sha256::digest(leaf_data).into();
    for node in &path.nodes {
        let Ok(bytes) = hex::decode(node) else {
            return false;
        };
        let Ok(sibling) = <[u8; 32]>::try_from(bytes.as_slice()) else {
            return false;
        };
        computed = hash_pair(&computed, &sibling);
    }
    hex::encode(computed) == root
}
