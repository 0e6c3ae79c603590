//! Challenge protocol: proof collection, validator fan-out, quorum and on-chain commit.

use chrono::Utc;
use futures::future::join_all;
use log::{debug, error, info, warn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde_json::json;
use std::time::Instant;

use crate::allocation::Allocation;
use crate::chain::CHALLENGE_RESPONSE;
use crate::challenge::entity::{Challenge, ChallengeResult, ValidationTicket};
use crate::challenge::timing::ChallengeTiming;
use crate::challenge::validator::{ChallengeRequest, WriteMarkerWithKey};
use crate::context::BlobberContext;
use crate::error::{BlobberError, Result};
use crate::merkle::MERKLE_LEAVES;
use crate::reference::{get_object_path, Ref};
use crate::stats::FileStats;
use crate::writemarker::get_write_markers_in_range;

/// Block of the allocation to prove, 1-based, derived from the challenge seed.
pub fn select_block(seed: i64, num_blocks: i64) -> i64 {
    let mut rng = ChaCha20Rng::seed_from_u64(seed as u64);
    rng.random_range(0..num_blocks) + 1
}

/// Merkle leaf inside the challenged file, from a generator seeded like `select_block`.
pub fn select_block_offset(seed: i64) -> usize {
    let mut rng = ChaCha20Rng::seed_from_u64(seed as u64);
    rng.random_range(0..MERKLE_LEAVES)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    pub success: usize,
    pub failure: usize,
    pub responded: usize,
    pub total: usize,
}

impl Tally {
    /// `Some(result)` once the round is decisive.
    ///
    /// A strict majority of successes wins. A strict majority of failures, or every
    /// validator having answered without a success majority, fails the challenge.
    pub fn decision(&self) -> Option<ChallengeResult> {
        if self.success > self.total / 2 {
            Some(ChallengeResult::Success)
        } else if self.failure > self.total / 2 || self.responded == self.total {
            Some(ChallengeResult::Failure)
        } else {
            None
        }
    }
}

pub fn tally(tickets: &[Option<ValidationTicket>]) -> Tally {
    let success = tickets.iter().flatten().filter(|t| t.result).count();
    let failure = tickets.iter().flatten().filter(|t| !t.result).count();
    Tally {
        success,
        failure,
        responded: success + failure,
        total: tickets.len(),
    }
}

/// Builds the proof for `challenge`, collects validator tickets and fixes the result.
///
/// Tickets already held for a validator are reused instead of asking again. A validator
/// that fails to answer with a valid ticket leaves its slot empty.
///
/// # Errors
///
/// * `BlobberError::NoValidators` - If the chain assigned no validators.
/// * `BlobberError::InvalidAllocation` - If the allocation is unknown.
/// * `BlobberError::NoWriteMarkers` - If no markers cover the challenged root range.
/// * `BlobberError::InvalidObjectPath` - If the challenged block cannot be resolved.
/// * `BlobberError::NoConsensus` - If the tickets collected do not decide the round. The
///   tickets are kept on the challenge for the next attempt.
pub async fn load_validation_tickets(
    ctx: &BlobberContext,
    challenge: &mut Challenge,
    timing: &mut ChallengeTiming,
) -> Result<()> {
    if challenge.validators.is_empty() {
        return Err(BlobberError::NoValidators);
    }
    let started = Instant::now();

    let (allocation, markers, object_path) = {
        let tx = ctx.db.begin();
        let allocation = Allocation::get(&tx, &challenge.allocation_id)?;
        let markers = get_write_markers_in_range(
            &tx,
            &allocation.id,
            &challenge.allocation_root,
            &allocation.allocation_root,
        )?;
        if markers.is_empty() {
            return Err(BlobberError::NoWriteMarkers);
        }
        let object_path = match Ref::root(&tx, &allocation.id)? {
            Some(root) if root.num_blocks > 0 => {
                let block_num = select_block(challenge.seed, root.num_blocks);
                Some(get_object_path(&tx, &allocation.id, block_num)?)
            }
            _ => None,
        };
        (allocation, markers, object_path)
    };

    let mut data = Vec::new();
    let mut merkle_path = None;
    if let Some(op) = &object_path {
        challenge.block_num = op.file_block_num;
        challenge.ref_id = op.ref_id;
        timing.file_size = op.meta.size;
        if op.meta.is_file() {
            let block = ctx
                .files
                .get_block_for_challenge(
                    &allocation.id,
                    &op.meta,
                    select_block_offset(challenge.seed),
                )
                .await?;
            data = block.data;
            merkle_path = Some(block.merkle_path);
        }
    }
    challenge.responded_allocation_root = allocation.allocation_root.clone();
    challenge.object_path = object_path.clone();
    timing.proof_gen_time_ms = started.elapsed().as_millis() as i64;

    let request = ChallengeRequest {
        challenge_id: challenge.challenge_id.clone(),
        object_path,
        write_markers: markers
            .into_iter()
            .map(|m| WriteMarkerWithKey {
                write_marker: m.wm,
                client_key: m.client_public_key,
            })
            .collect(),
        data,
        merkle_path,
    };

    challenge.validation_tickets.resize(challenge.validators.len(), None);
    let blobber_id = ctx.blobber_id();
    let requests = challenge
        .validators
        .iter()
        .zip(challenge.validation_tickets.iter())
        .map(|(validator, held)| {
            let request = &request;
            let challenge_id = challenge.challenge_id.as_str();
            async move {
                if let Some(ticket) = held {
                    if ticket.verify(challenge_id, blobber_id, &validator.id) {
                        return Some(ticket.clone());
                    }
                }
                match ctx.validators.submit_challenge(validator, request).await {
                    Ok(ticket) if ticket.verify(challenge_id, blobber_id, &validator.id) => {
                        Some(ticket)
                    }
                    Ok(_) => {
                        warn!(
                            "Discarding invalid ticket from validator {} for challenge {}",
                            validator.id, challenge_id
                        );
                        None
                    }
                    Err(e) => {
                        warn!(
                            "Validator {} gave no ticket for challenge {}: {}",
                            validator.id, challenge_id, e
                        );
                        None
                    }
                }
            }
        });
    let tickets = join_all(requests).await;
    challenge.validation_tickets = tickets;

    let counts = tally(&challenge.validation_tickets);
    match counts.decision() {
        Some(result) => {
            challenge.mark_processed(result)?;
            timing.complete_validation = Some(Utc::now());
            info!(
                "Challenge {} validated: {:?} ({} success, {} failure of {})",
                challenge.challenge_id, result, counts.success, counts.failure, counts.total
            );
            Ok(())
        }
        None => Err(BlobberError::NoConsensus {
            success: counts.success,
            failure: counts.failure,
            total: counts.total,
        }),
    }
}

/// Commits a processed challenge's verdict on chain.
///
/// Transactions recorded by earlier attempts are verified first; if one of them landed
/// the challenge is committed with it and nothing new is submitted. Otherwise a
/// `challenge_response` is submitted and verified. Every submitted hash is appended to
/// `last_commit_txn_ids` whether or not it verifies.
///
/// # Errors
///
/// * `BlobberError::ChallengeCommit` - If no transaction could be confirmed. The
///   challenge stays `Processed` with the error in its status message.
pub async fn commit_challenge(
    ctx: &BlobberContext,
    challenge: &mut Challenge,
    timing: &mut ChallengeTiming,
) -> Result<()> {
    for txn_hash in challenge.last_commit_txn_ids.clone() {
        match ctx.chain.verify_transaction(&txn_hash).await {
            Ok(txn) => {
                info!(
                    "Challenge {} already committed in {}",
                    challenge.challenge_id, txn_hash
                );
                challenge.mark_committed(&txn_hash, &txn.transaction_output)?;
                timing.txn_verification = Some(Utc::now());
                return Ok(());
            }
            Err(e) => debug!(
                "Earlier commit {} of challenge {} not confirmed: {}",
                txn_hash, challenge.challenge_id, e
            ),
        }
    }

    timing.retries += 1;
    let input = json!({
        "challenge_id": challenge.challenge_id,
        "validation_tickets": challenge.validation_tickets,
    });
    let txn_hash = match ctx.chain.submit_transaction(CHALLENGE_RESPONSE, input).await {
        Ok(txn_hash) => txn_hash,
        Err(e) => return Err(commit_failed(challenge, e)),
    };
    challenge.last_commit_txn_ids.push(txn_hash.clone());
    timing.txn_submission = Some(Utc::now());

    tokio::time::sleep(ctx.config.chain.sleep_before_verify()).await;
    match ctx.chain.verify_transaction(&txn_hash).await {
        Ok(txn) => {
            challenge.mark_committed(&txn_hash, &txn.transaction_output)?;
            timing.txn_verification = Some(Utc::now());
            info!(
                "Committed challenge {} in {}",
                challenge.challenge_id, txn_hash
            );
            Ok(())
        }
        Err(e) => Err(commit_failed(challenge, e)),
    }
}

fn commit_failed(challenge: &mut Challenge, cause: BlobberError) -> BlobberError {
    let err = BlobberError::ChallengeCommit(cause.to_string());
    challenge.status_message = err.status_message();
    error!(
        "Failed to commit challenge {}: {}",
        challenge.challenge_id, cause
    );
    err
}

/// Counts a committed challenge against the challenged file.
pub fn record_file_stats(ctx: &BlobberContext, challenge: &Challenge) -> Result<()> {
    if challenge.ref_id == 0 {
        return Ok(());
    }
    let mut tx = ctx.db.begin();
    FileStats::record_challenge(
        &mut tx,
        challenge.ref_id,
        challenge.result == ChallengeResult::Success,
        &challenge.commit_txn_id,
    )?;
    tx.commit()
}
