/// Challenge records and validator tickets.
///
/// A challenge moves `Accepted -> Processed -> Committed`, and may be `Cancelled` from any
/// state before `Committed`. Transitions never go backwards, and the result is fixed at the
/// moment the challenge becomes `Processed`. Records are never deleted.
use log::trace;
use serde::{Deserialize, Serialize};

use crate::chain::{OpenChallenge, ValidationNode};
use crate::db::Transaction;
use crate::error::{BlobberError, Result};
use crate::node::{client_id_for, verify_signature, NodeIdentity};
use crate::reference::ObjectPath;
use crate::utils::{hash, now};

const CHALLENGE_PREFIX: &str = "challenge:";
const CHALLENGE_SEQUENCE: &str = "challenges";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeStatus {
    Accepted,
    Processed,
    Committed,
    Cancelled,
}

impl ChallengeStatus {
    fn rank(self) -> u8 {
        match self {
            ChallengeStatus::Accepted => 0,
            ChallengeStatus::Processed => 1,
            ChallengeStatus::Committed | ChallengeStatus::Cancelled => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeResult {
    #[default]
    Unknown,
    Success,
    Failure,
}

/// A validator's signed verdict on one challenge.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ValidationTicket {
    pub challenge_id: String,
    pub blobber_id: String,
    pub validator_id: String,
    pub validator_key: String,
    #[serde(rename = "success")]
    pub result: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub message_code: String,
    pub timestamp: i64,
    pub signature: String,
}

impl ValidationTicket {
    pub fn hash_data(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}",
            self.challenge_id,
            self.blobber_id,
            self.validator_id,
            self.validator_key,
            self.result,
            self.timestamp
        )
    }

    /// Builds a ticket signed by `validator`.
    pub fn signed(
        validator: &NodeIdentity,
        challenge_id: &str,
        blobber_id: &str,
        result: bool,
        message: &str,
    ) -> Self {
        let mut ticket = ValidationTicket {
            challenge_id: challenge_id.to_string(),
            blobber_id: blobber_id.to_string(),
            validator_id: validator.id().to_string(),
            validator_key: validator.public_key().to_string(),
            result,
            message: message.to_string(),
            message_code: String::new(),
            timestamp: now(),
            signature: String::new(),
        };
        ticket.signature = validator.sign(&hash(ticket.hash_data()));
        ticket
    }

    /// Checks that the ticket answers `challenge_id` for `blobber_id`, comes from
    /// `validator_id`'s key and carries a valid signature.
    pub fn verify(&self, challenge_id: &str, blobber_id: &str, validator_id: &str) -> bool {
        if self.challenge_id != challenge_id
            || self.blobber_id != blobber_id
            || self.validator_id != validator_id
        {
            return false;
        }
        match client_id_for(&self.validator_key) {
            Ok(id) if id == self.validator_id => {}
            _ => return false,
        }
        verify_signature(&self.validator_key, &self.signature, &hash(self.hash_data()))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Challenge {
    pub challenge_id: String,
    pub prev_challenge_id: String,
    pub seed: i64,
    pub allocation_id: String,
    /// Allocation root the chain recorded when issuing the challenge.
    pub allocation_root: String,
    pub responded_allocation_root: String,
    pub status: ChallengeStatus,
    pub result: ChallengeResult,
    pub status_message: String,
    pub commit_txn_id: String,
    pub block_num: i64,
    pub ref_id: i64,
    pub validators: Vec<ValidationNode>,
    /// One slot per validator; `None` for validators without a valid ticket.
    pub validation_tickets: Vec<Option<ValidationTicket>>,
    pub last_commit_txn_ids: Vec<String>,
    pub object_path: Option<ObjectPath>,
    /// Chain creation time, unix seconds.
    pub created_at: i64,
    /// When this node first saw the challenge, unix seconds.
    pub observed_at: i64,
    pub sequence: u64,
    pub updated_at: i64,
}

impl Challenge {
    pub fn from_open(open: OpenChallenge, observed_at: i64) -> Self {
        Challenge {
            challenge_id: open.id,
            prev_challenge_id: open.prev_id,
            seed: open.random_number,
            allocation_id: open.allocation_id,
            allocation_root: open.allocation_root,
            responded_allocation_root: String::new(),
            status: ChallengeStatus::Accepted,
            result: ChallengeResult::Unknown,
            status_message: String::new(),
            commit_txn_id: String::new(),
            block_num: 0,
            ref_id: 0,
            validators: open.validators,
            validation_tickets: Vec::new(),
            last_commit_txn_ids: Vec::new(),
            object_path: None,
            created_at: open.created,
            observed_at,
            sequence: 0,
            updated_at: observed_at,
        }
    }

    fn key(challenge_id: &str) -> String {
        format!("{}{}", CHALLENGE_PREFIX, challenge_id)
    }

    pub fn get(tx: &Transaction<'_>, challenge_id: &str) -> Result<Option<Challenge>> {
        tx.get(&Self::key(challenge_id))
    }

    pub fn save(&mut self, tx: &mut Transaction<'_>) -> Result<()> {
        if self.sequence == 0 {
            self.sequence = tx.next_sequence(CHALLENGE_SEQUENCE)?;
        }
        self.updated_at = now();
        tx.put(&Self::key(&self.challenge_id), self)
    }

    /// Challenges not yet committed or cancelled, oldest first.
    pub fn list_open(tx: &Transaction<'_>) -> Result<Vec<Challenge>> {
        let mut open: Vec<Challenge> = tx
            .scan_prefix::<Challenge>(CHALLENGE_PREFIX)?
            .into_iter()
            .map(|(_, challenge)| challenge)
            .filter(|challenge| !challenge.status.is_terminal())
            .collect();
        open.sort_by_key(|challenge| challenge.sequence);
        Ok(open)
    }

    pub fn is_expired(&self, now: i64, completion_time_secs: i64) -> bool {
        now - self.created_at > completion_time_secs
    }

    fn transition(&mut self, to: ChallengeStatus) -> Result<()> {
        let skips_processing =
            to == ChallengeStatus::Committed && self.status != ChallengeStatus::Processed;
        if to.rank() <= self.status.rank() || skips_processing {
            return Err(BlobberError::InvalidTransition(format!(
                "challenge {} cannot move from {:?} to {:?}",
                self.challenge_id, self.status, to
            )));
        }
        trace!(
            "Challenge {} moves from {:?} to {:?}",
            self.challenge_id,
            self.status,
            to
        );
        self.status = to;
        Ok(())
    }

    /// Fixes the validators' verdict.
    pub fn mark_processed(&mut self, result: ChallengeResult) -> Result<()> {
        self.transition(ChallengeStatus::Processed)?;
        self.result = result;
        self.status_message.clear();
        Ok(())
    }

    pub fn mark_committed(&mut self, txn_hash: &str, output: &str) -> Result<()> {
        self.transition(ChallengeStatus::Committed)?;
        self.commit_txn_id = txn_hash.to_string();
        self.status_message = output.to_string();
        Ok(())
    }

    pub fn cancel(&mut self, message: &str) -> Result<()> {
        self.transition(ChallengeStatus::Cancelled)?;
        self.status_message = message.to_string();
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn open_challenge(id: &str, allocation_id: &str, created: i64) -> OpenChallenge {
    OpenChallenge {
        id: id.to_string(),
        prev_id: String::new(),
        created,
        random_number: 42,
        allocation_id: allocation_id.to_string(),
        allocation_root: String::new(),
        blobber_id: "b1".to_string(),
        validators: vec![ValidationNode {
            id: "v1".into(),
            url: "http://v1".into(),
        }],
    }
}
