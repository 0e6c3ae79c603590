use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::Transaction;
use crate::error::Result;

const TIMING_PREFIX: &str = "challenge_timing:";
const CLOSED_INDEX_PREFIX: &str = "challenge_timing_closed:";

/// Phase timestamps of one challenge, kept for auditing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ChallengeTiming {
    pub challenge_id: String,
    /// Chain creation time, unix seconds.
    pub created_at_chain: i64,
    pub created_at_blobber: Option<DateTime<Utc>>,
    pub file_size: i64,
    pub proof_gen_time_ms: i64,
    pub complete_validation: Option<DateTime<Utc>>,
    pub txn_submission: Option<DateTime<Utc>>,
    pub txn_verification: Option<DateTime<Utc>>,
    pub cancelled: Option<DateTime<Utc>>,
    /// Chain time after which the challenge can no longer be answered, unix seconds.
    pub expiration: i64,
    pub retries: u32,
    pub closed_at: Option<DateTime<Utc>>,
}

impl ChallengeTiming {
    pub fn new(challenge_id: &str, created_at_chain: i64, completion_time_secs: i64) -> Self {
        Self {
            challenge_id: challenge_id.to_string(),
            created_at_chain,
            created_at_blobber: Some(Utc::now()),
            expiration: created_at_chain + completion_time_secs,
            ..Default::default()
        }
    }

    fn key(challenge_id: &str) -> String {
        format!("{}{}", TIMING_PREFIX, challenge_id)
    }

    /// Index key that sorts most recently closed first.
    fn closed_key(closed_at: &DateTime<Utc>, challenge_id: &str) -> String {
        let inverted = i64::MAX - closed_at.timestamp_millis();
        format!("{}{:020}:{}", CLOSED_INDEX_PREFIX, inverted, challenge_id)
    }

    pub fn get(tx: &Transaction<'_>, challenge_id: &str) -> Result<Option<ChallengeTiming>> {
        tx.get(&Self::key(challenge_id))
    }

    /// Stamps `closed_at` once; later calls keep the first value.
    pub fn close(&mut self) {
        if self.closed_at.is_none() {
            self.closed_at = Some(Utc::now());
        }
    }

    pub fn save(&self, tx: &mut Transaction<'_>) -> Result<()> {
        tx.put(&Self::key(&self.challenge_id), self)?;
        if let Some(closed_at) = &self.closed_at {
            tx.put(&Self::closed_key(closed_at, &self.challenge_id), &self.challenge_id)?;
        }
        Ok(())
    }

    /// Up to `limit` closed challenges, most recently closed first.
    pub fn recent_closed(tx: &Transaction<'_>, limit: usize) -> Result<Vec<ChallengeTiming>> {
        let mut timings = Vec::new();
        for (_, challenge_id) in tx.scan_prefix::<String>(CLOSED_INDEX_PREFIX)? {
            if timings.len() >= limit {
                break;
            }
            if let Some(timing) = Self::get(tx, &challenge_id)? {
                timings.push(timing);
            }
        }
        Ok(timings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_database;
    use chrono::Duration;

    #[test]
    fn test_recent_closed_is_descending() {
        let (_dir, db) = test_database();
        let mut tx = db.begin();
        let base = Utc::now();
        for (i, id) in ["c1", "c2", "c3"].iter().enumerate() {
            let mut timing = ChallengeTiming::new(id, 100, 1800);
            timing.closed_at = Some(base + Duration::seconds(i as i64));
            timing.save(&mut tx).unwrap();
        }
        ChallengeTiming::new("open", 100, 1800).save(&mut tx).unwrap();
        tx.commit().unwrap();

        let ids: Vec<_> = ChallengeTiming::recent_closed(&db.begin(), 2)
            .unwrap()
            .into_iter()
            .map(|t| t.challenge_id)
            .collect();
        assert_eq!(ids, vec!["c3", "c2"]);
    }

    #[test]
    fn test_close_keeps_first_stamp() {
        let mut timing = ChallengeTiming::new("c1", 100, 1800);
        assert_eq!(timing.expiration, 1900);
        timing.close();
        let first = timing.closed_at;
        timing.close();
        assert_eq!(timing.closed_at, first);
    }
}
