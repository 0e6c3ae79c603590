use serde::{Deserialize, Serialize};

use crate::db::Transaction;
use crate::error::Result;
use crate::utils::now;

const FILE_STATS_PREFIX: &str = "file_stats:";

/// Challenge counters for one file, keyed by the file's reference ID.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct FileStats {
    pub ref_id: i64,
    pub successful_challenges: u64,
    pub failed_challenges: u64,
    pub last_challenge_txn: String,
    pub updated_at: i64,
}

impl FileStats {
    fn key(ref_id: i64) -> String {
        format!("{}{}", FILE_STATS_PREFIX, ref_id)
    }

    pub fn get(tx: &Transaction<'_>, ref_id: i64) -> Result<Option<FileStats>> {
        tx.get(&Self::key(ref_id))
    }

    /// Counts a committed challenge against the file.
    pub fn record_challenge(
        tx: &mut Transaction<'_>,
        ref_id: i64,
        success: bool,
        txn_hash: &str,
    ) -> Result<FileStats> {
        let mut stats = Self::get(tx, ref_id)?.unwrap_or(FileStats {
            ref_id,
            ..Default::default()
        });
        if success {
            stats.successful_challenges += 1;
        } else {
            stats.failed_challenges += 1;
        }
        stats.last_challenge_txn = txn_hash.to_string();
        stats.updated_at = now();
        tx.put(&Self::key(ref_id), &stats)?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_database;

    #[test]
    fn test_record_challenge_counts() {
        let (_dir, db) = test_database();
        let mut tx = db.begin();
        FileStats::record_challenge(&mut tx, 7, true, "t1").unwrap();
        FileStats::record_challenge(&mut tx, 7, false, "t2").unwrap();
        tx.commit().unwrap();

        let stats = FileStats::get(&db.begin(), 7).unwrap().unwrap();
        assert_eq!(stats.successful_challenges, 1);
        assert_eq!(stats.failed_challenges, 1);
        assert_eq!(stats.last_challenge_txn, "t2");
        assert!(FileStats::get(&db.begin(), 8).unwrap().is_none());
    }
}
