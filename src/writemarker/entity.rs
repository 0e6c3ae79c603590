/// Write markers and the per-allocation ledger they are stored in.
///
/// The ledger is append-only. Every accepted marker gets the next value of the
/// `write_markers` sequence and is stored under `write_marker_seq:{allocation}:{seq}`;
/// `write_marker:{allocation}:{root}` points at the latest marker that produced a root.
/// Rollbacks can bring an allocation back to an earlier root, which is why the sequence
/// and not the root identifies a ledger row.
use serde::{Deserialize, Serialize};

use crate::db::Transaction;
use crate::error::Result;
use crate::utils::{hash, now};

const WRITE_MARKER_PREFIX: &str = "write_marker:";
const WRITE_MARKER_SEQ_PREFIX: &str = "write_marker_seq:";
const WRITE_MARKER_SEQUENCE: &str = "write_markers";

/// A client-signed commit record.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteMarker {
    pub allocation_root: String,
    pub prev_allocation_root: String,
    pub allocation_id: String,
    pub size: i64,
    pub blobber_id: String,
    pub timestamp: i64,
    pub client_id: String,
    pub signature: String,
}

impl WriteMarker {
    /// The string the client signs.
    pub fn hash_data(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}",
            self.allocation_root,
            self.prev_allocation_root,
            self.allocation_id,
            self.blobber_id,
            self.client_id,
            self.size,
            self.timestamp
        )
    }

    pub fn hash(&self) -> String {
        hash(self.hash_data())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WriteMarkerStatus {
    Accepted,
    Committed,
    Failed,
}

/// A write marker with its redemption bookkeeping.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WriteMarkerEntity {
    pub wm: WriteMarker,
    pub status: WriteMarkerStatus,
    pub status_message: String,
    pub redeem_retries: u32,
    pub close_txn_id: String,
    pub connection_id: String,
    pub client_public_key: String,
    pub sequence: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl WriteMarkerEntity {
    pub fn new(wm: WriteMarker, connection_id: &str, client_public_key: &str) -> Self {
        let created_at = now();
        Self {
            wm,
            status: WriteMarkerStatus::Accepted,
            status_message: String::new(),
            redeem_retries: 0,
            close_txn_id: String::new(),
            connection_id: connection_id.to_string(),
            client_public_key: client_public_key.to_string(),
            sequence: 0,
            created_at,
            updated_at: created_at,
        }
    }

    fn root_key(allocation_id: &str, root: &str) -> String {
        format!("{}{}:{}", WRITE_MARKER_PREFIX, allocation_id, root)
    }

    fn seq_prefix(allocation_id: &str) -> String {
        format!("{}{}:", WRITE_MARKER_SEQ_PREFIX, allocation_id)
    }

    fn seq_key(allocation_id: &str, sequence: u64) -> String {
        format!("{}{:020}", Self::seq_prefix(allocation_id), sequence)
    }

    /// Writes the row, assigning a sequence number on first save.
    pub fn save(&mut self, tx: &mut Transaction<'_>) -> Result<()> {
        if self.sequence == 0 {
            self.sequence = tx.next_sequence(WRITE_MARKER_SEQUENCE)?;
        }
        self.updated_at = now();
        tx.put(&Self::seq_key(&self.wm.allocation_id, self.sequence), self)?;
        let root_key = Self::root_key(&self.wm.allocation_id, &self.wm.allocation_root);
        match tx.get::<u64>(&root_key)? {
            Some(newer) if newer > self.sequence => Ok(()),
            _ => tx.put(&root_key, &self.sequence),
        }
    }

    /// Latest marker of `allocation_id` that produced `root`.
    pub fn get(
        tx: &Transaction<'_>,
        allocation_id: &str,
        root: &str,
    ) -> Result<Option<WriteMarkerEntity>> {
        match tx.get::<u64>(&Self::root_key(allocation_id, root))? {
            Some(sequence) => tx.get(&Self::seq_key(allocation_id, sequence)),
            None => Ok(None),
        }
    }

    /// Every marker of `allocation_id`, in sequence order.
    pub fn list(tx: &Transaction<'_>, allocation_id: &str) -> Result<Vec<WriteMarkerEntity>> {
        Ok(tx
            .scan_prefix::<WriteMarkerEntity>(&Self::seq_prefix(allocation_id))?
            .into_iter()
            .map(|(_, entity)| entity)
            .collect())
    }

    pub fn latest(tx: &Transaction<'_>, allocation_id: &str) -> Result<Option<WriteMarkerEntity>> {
        Ok(Self::list(tx, allocation_id)?.pop())
    }
}

/// Markers from the one that produced `start_root` through the one that produced
/// `end_root`, both included, in sequence order.
///
/// An empty `start_root` starts at the first marker. Returns an empty list when either
/// end is missing from the ledger.
pub fn get_write_markers_in_range(
    tx: &Transaction<'_>,
    allocation_id: &str,
    start_root: &str,
    end_root: &str,
) -> Result<Vec<WriteMarkerEntity>> {
    let mut markers = WriteMarkerEntity::list(tx, allocation_id)?;
    let Some(end) = markers
        .iter()
        .rposition(|m| m.wm.allocation_root == end_root)
    else {
        return Ok(Vec::new());
    };
    let start = if start_root.is_empty() {
        0
    } else {
        match markers[..=end]
            .iter()
            .rposition(|m| m.wm.allocation_root == start_root)
        {
            Some(start) => start,
            None => return Ok(Vec::new()),
        }
    };
    markers.truncate(end + 1);
    Ok(markers.split_off(start))
}
