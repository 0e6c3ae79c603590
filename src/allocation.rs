/// Allocation records: the per-allocation state the write-marker ledger and the challenge
/// engine read and advance.
use serde::{Deserialize, Serialize};

use crate::db::Transaction;
use crate::error::{BlobberError, Result};

const ALLOCATION_PREFIX: &str = "allocation:";

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Allocation {
    pub id: String,
    pub tx: String,
    pub owner_id: String,
    pub owner_public_key: String,
    /// Root after the latest accepted write marker.
    pub allocation_root: String,
    /// Allocation root of the latest write marker confirmed on chain.
    pub latest_redeemed_wm: String,
    pub is_redeem_required: bool,
    pub blobber_size_used: i64,
    pub expiration: i64,
}

impl Allocation {
    fn key(id: &str) -> String {
        format!("{}{}", ALLOCATION_PREFIX, id)
    }

    pub fn get(tx: &Transaction<'_>, id: &str) -> Result<Allocation> {
        tx.get(&Self::key(id))?
            .ok_or_else(|| BlobberError::InvalidAllocation(format!("allocation {} not found", id)))
    }

    pub fn save(&self, tx: &mut Transaction<'_>) -> Result<()> {
        tx.put(&Self::key(&self.id), self)
    }

    /// Allocations with accepted write markers still waiting for redemption.
    pub fn pending_redemption(tx: &Transaction<'_>) -> Result<Vec<Allocation>> {
        Ok(tx
            .scan_prefix::<Allocation>(ALLOCATION_PREFIX)?
            .into_iter()
            .map(|(_, alloc)| alloc)
            .filter(|alloc| alloc.is_redeem_required)
            .collect())
    }
}
