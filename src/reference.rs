//! Reference tree of an allocation's files and directories, and the object-path proof the
//! challenge engine sends to validators.
//!
//! Every directory's `num_blocks` is the sum of its children's, so a block number in
//! `1..=root.num_blocks` identifies exactly one file and a block inside it.

use log::trace;
use serde::{Deserialize, Serialize};

use crate::db::Transaction;
use crate::error::{BlobberError, Result};
use crate::utils::hash;

const REF_PREFIX: &str = "ref:";
const REF_SEQUENCE: &str = "reference_objects";
pub const ROOT_PATH: &str = "/";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefType {
    #[serde(rename = "f")]
    File,
    #[serde(rename = "d")]
    Directory,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Ref {
    pub id: i64,
    #[serde(rename = "type")]
    pub ref_type: RefType,
    pub allocation_id: String,
    pub name: String,
    pub path: String,
    pub hash: String,
    pub num_blocks: i64,
    pub size: i64,
    #[serde(default)]
    pub content_hash: String,
    #[serde(default)]
    pub merkle_root: String,
    /// Child paths, directories only.
    #[serde(default)]
    pub children: Vec<String>,
}

/// A directory on the way from the root to the challenged file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ObjectPathNode {
    pub path: String,
    pub hash: String,
    pub num_blocks: i64,
    pub children: Vec<ChildSummary>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChildSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub ref_type: RefType,
    pub hash: String,
    pub num_blocks: i64,
}

/// Structural proof that `meta` is reachable from the allocation root at `block_num`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ObjectPath {
    pub root_hash: String,
    pub meta: Ref,
    pub path: Vec<ObjectPathNode>,
    /// Block inside `meta`, 1-based.
    pub file_block_num: i64,
    pub ref_id: i64,
}

impl Ref {
    fn key(allocation_id: &str, path: &str) -> String {
        format!("{}{}:{}", REF_PREFIX, allocation_id, path)
    }

    pub fn new_file(
        allocation_id: &str,
        path: &str,
        size: i64,
        content_hash: &str,
        merkle_root: &str,
        num_blocks: i64,
    ) -> Self {
        Ref {
            id: 0,
            ref_type: RefType::File,
            allocation_id: allocation_id.to_string(),
            name: file_name(path).to_string(),
            path: path.to_string(),
            hash: hash(format!("{}:{}:{}:{}", path, size, content_hash, merkle_root)),
            num_blocks,
            size,
            content_hash: content_hash.to_string(),
            merkle_root: merkle_root.to_string(),
            children: Vec::new(),
        }
    }

    fn new_dir(allocation_id: &str, path: &str) -> Self {
        Ref {
            id: 0,
            ref_type: RefType::Directory,
            allocation_id: allocation_id.to_string(),
            name: file_name(path).to_string(),
            path: path.to_string(),
            hash: String::new(),
            num_blocks: 0,
            size: 0,
            content_hash: String::new(),
            merkle_root: String::new(),
            children: Vec::new(),
        }
    }

    pub fn is_file(&self) -> bool {
        self.ref_type == RefType::File
    }

    pub fn get(tx: &Transaction<'_>, allocation_id: &str, path: &str) -> Result<Option<Ref>> {
        tx.get(&Self::key(allocation_id, path))
    }

    /// Root directory of an allocation, if anything was ever written to it.
    pub fn root(tx: &Transaction<'_>, allocation_id: &str) -> Result<Option<Ref>> {
        Self::get(tx, allocation_id, ROOT_PATH)
    }

    fn save(&mut self, tx: &mut Transaction<'_>) -> Result<()> {
        if self.id == 0 {
            self.id = tx.next_sequence(REF_SEQUENCE)? as i64;
        }
        tx.put(&Self::key(&self.allocation_id, &self.path), self)
    }

    fn children(&self, tx: &Transaction<'_>) -> Result<Vec<Ref>> {
        let mut children = Vec::with_capacity(self.children.len());
        for child_path in &self.children {
            let child = Self::get(tx, &self.allocation_id, child_path)?.ok_or_else(|| {
                BlobberError::InvalidObjectPath(format!("dangling child reference {}", child_path))
            })?;
            children.push(child);
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }
}

/// Inserts or replaces a file and recomputes every directory above it.
pub fn add_file(tx: &mut Transaction<'_>, mut file: Ref) -> Result<Ref> {
    if let Some(existing) = Ref::get(tx, &file.allocation_id, &file.path)? {
        file.id = existing.id;
    }
    file.save(tx)?;

    let mut child_path = file.path.clone();
    let mut dir_path = parent_path(&file.path);
    loop {
        let mut dir = Ref::get(tx, &file.allocation_id, &dir_path)?
            .unwrap_or_else(|| Ref::new_dir(&file.allocation_id, &dir_path));
        if !dir.children.contains(&child_path) {
            dir.children.push(child_path.clone());
        }
        let children = dir.children(tx)?;
        dir.num_blocks = children.iter().map(|c| c.num_blocks).sum();
        dir.size = children.iter().map(|c| c.size).sum();
        dir.hash = hash(
            children
                .iter()
                .map(|c| c.hash.as_str())
                .collect::<Vec<_>>()
                .join(":"),
        );
        dir.save(tx)?;
        trace!(
            "Directory {} now spans {} blocks",
            dir.path,
            dir.num_blocks
        );
        if dir_path == ROOT_PATH {
            break;
        }
        child_path = dir_path.clone();
        dir_path = parent_path(&dir_path);
    }
    Ok(file)
}

/// Resolves the object path for `block_num` (1-based) within an allocation.
///
/// # Errors
///
/// * `BlobberError::InvalidObjectPath` - If the allocation has no root, the block lies
///   outside the tree, or a directory's children do not add up to its block count.
pub fn get_object_path(
    tx: &Transaction<'_>,
    allocation_id: &str,
    block_num: i64,
) -> Result<ObjectPath> {
    let root = Ref::root(tx, allocation_id)?.ok_or_else(|| {
        BlobberError::InvalidObjectPath(format!("allocation {} has no root", allocation_id))
    })?;
    if block_num < 1 || block_num > root.num_blocks {
        return Err(BlobberError::InvalidObjectPath(format!(
            "block {} outside 1..={}",
            block_num, root.num_blocks
        )));
    }

    let mut remaining = block_num;
    let mut current = root.clone();
    let mut path = Vec::new();
    while !current.is_file() {
        let children = current.children(tx)?;
        path.push(ObjectPathNode {
            path: current.path.clone(),
            hash: current.hash.clone(),
            num_blocks: current.num_blocks,
            children: children
                .iter()
                .map(|c| ChildSummary {
                    name: c.name.clone(),
                    ref_type: c.ref_type,
                    hash: c.hash.clone(),
                    num_blocks: c.num_blocks,
                })
                .collect(),
        });

        let mut next = None;
        for child in children {
            if remaining <= child.num_blocks {
                next = Some(child);
                break;
            }
            remaining -= child.num_blocks;
        }
        current = next.ok_or_else(|| {
            BlobberError::InvalidObjectPath(format!(
                "block {} not found under {}",
                block_num, current.path
            ))
        })?;
    }

    Ok(ObjectPath {
        root_hash: root.hash,
        ref_id: current.id,
        meta: current,
        path,
        file_block_num: remaining,
    })
}

fn parent_path(path: &str) -> String {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) | None => ROOT_PATH.to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

fn file_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}
