/// Challenge poller and processor.
///
/// The poller asks the chain for open challenges on a fixed interval and feeds them, along
/// with unfinished challenges from the database, into an unbounded channel. A single
/// processor drains the channel in arrival order, so two challenges for one allocation
/// never race.
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::challenge::entity::{Challenge, ChallengeStatus};
use crate::challenge::persist::PersistJob;
use crate::challenge::protocol::{commit_challenge, load_validation_tickets, record_file_stats};
use crate::challenge::timing::ChallengeTiming;
use crate::context::BlobberContext;
use crate::error::{BlobberError, Result};
use crate::utils::now;

const CHALLENGE_LOCK_TABLE: &str = "challenge";

/// Polls until cancelled. Returns the error that stopped it if the chain could not be
/// queried or answered with something undecodable. Database failures while requeueing
/// are logged and retried on the next tick.
pub async fn poll_challenges(
    ctx: Arc<BlobberContext>,
    sender: UnboundedSender<Challenge>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(ctx.config.challenge.polling_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cursor = 0i64;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Challenge poller stopped");
                return Ok(());
            }
            _ = ticker.tick() => {
                if let Err(e) = requeue_open(&ctx, &sender) {
                    error!("Requeueing unfinished challenges failed: {}", e);
                }
                cursor = poll_once(&ctx, &sender, cursor).await?;
            }
        }
    }
}

/// Fetches one page of open challenges created after `cursor` and queues the new ones.
/// Returns the advanced cursor.
pub async fn poll_once(
    ctx: &BlobberContext,
    sender: &UnboundedSender<Challenge>,
    cursor: i64,
) -> Result<i64> {
    let page = ctx
        .chain
        .get_open_challenges(ctx.blobber_id(), cursor, ctx.config.challenge.page_limit)
        .await
        .map_err(|e| {
            error!("Polling open challenges failed, poller stops: {}", e);
            e
        })?;

    let observed_at = now();
    let mut next_cursor = cursor;
    for open in page.challenges {
        next_cursor = open.created;
        let challenge = Challenge::from_open(open, observed_at);
        if !ctx.challenge_status.insert(&challenge.challenge_id) {
            trace!("Challenge {} already in flight", challenge.challenge_id);
            continue;
        }
        debug!("Queued challenge {}", challenge.challenge_id);
        enqueue(sender, challenge)?;
    }
    Ok(next_cursor.max(cursor))
}

/// Puts unfinished challenges from the database back on the channel.
pub fn requeue_open(ctx: &BlobberContext, sender: &UnboundedSender<Challenge>) -> Result<usize> {
    let mut requeued = 0;
    for challenge in Challenge::list_open(&ctx.db.begin())? {
        if ctx.challenge_status.insert(&challenge.challenge_id) {
            enqueue(sender, challenge)?;
            requeued += 1;
        }
    }
    if requeued > 0 {
        debug!("Requeued {} unfinished challenges", requeued);
    }
    Ok(requeued)
}

fn enqueue(sender: &UnboundedSender<Challenge>, challenge: Challenge) -> Result<()> {
    sender
        .send(challenge)
        .map_err(|e| BlobberError::Internal(format!("challenge channel closed: {}", e)))
}

/// Drains the channel one challenge at a time until cancelled or the channel closes.
pub async fn process_challenges(
    ctx: Arc<BlobberContext>,
    mut receiver: UnboundedReceiver<Challenge>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let challenge = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Challenge processor stopped");
                return Ok(());
            }
            received = receiver.recv() => match received {
                Some(challenge) => challenge,
                None => return Ok(()),
            }
        };
        let challenge_id = challenge.challenge_id.clone();
        if let Err(e) = process_challenge(&ctx, challenge).await {
            warn!("Challenge {} not finished: {}", challenge_id, e);
        }
        ctx.challenge_status.remove(&challenge_id);
    }
}

/// Runs a challenge as far through its lifecycle as it gets this round.
///
/// The stored record wins over the polled one, so tickets and earlier commit attempts
/// carry over. Intermediate states are written before returning; terminal ones go through
/// the persistence queue. Malformed challenges are cancelled; any other failure leaves the
/// challenge for the requeue pass.
pub async fn process_challenge(ctx: &BlobberContext, polled: Challenge) -> Result<()> {
    let _guard = ctx
        .locks
        .lock(CHALLENGE_LOCK_TABLE, &polled.challenge_id)
        .await;
    let completion_time = ctx.config.challenge.completion_time_secs;
    let (mut challenge, mut timing) = {
        let tx = ctx.db.begin();
        let challenge = Challenge::get(&tx, &polled.challenge_id)?.unwrap_or(polled);
        let timing = ChallengeTiming::get(&tx, &challenge.challenge_id)?.unwrap_or_else(|| {
            ChallengeTiming::new(&challenge.challenge_id, challenge.created_at, completion_time)
        });
        (challenge, timing)
    };
    if challenge.status.is_terminal() {
        trace!("Challenge {} already {:?}", challenge.challenge_id, challenge.status);
        return Ok(());
    }

    if challenge.is_expired(now(), completion_time) {
        let err = BlobberError::ExpiredChallenge;
        challenge.cancel(&err.to_string())?;
        timing.cancelled = timing.cancelled.or(Some(chrono::Utc::now()));
        warn!("Challenge {} expired", challenge.challenge_id);
        finish(ctx, challenge, timing);
        return Ok(());
    }

    if challenge.status == ChallengeStatus::Accepted {
        if let Err(e) = load_validation_tickets(ctx, &mut challenge, &mut timing).await {
            challenge.status_message = e.status_message();
            if !e.cancels_challenge() {
                save(ctx, &mut challenge, &timing)?;
            } else {
                error!(
                    "Cancelling challenge {}: {}",
                    challenge.challenge_id, e
                );
                challenge.cancel(&e.status_message())?;
                timing.cancelled = Some(chrono::Utc::now());
                finish(ctx, challenge, timing);
            }
            return Err(e);
        }
        save(ctx, &mut challenge, &timing)?;
    }

    match commit_challenge(ctx, &mut challenge, &mut timing).await {
        Ok(()) => {
            if let Err(e) = record_file_stats(ctx, &challenge) {
                error!(
                    "Failed to update file stats for challenge {}: {}",
                    challenge.challenge_id, e
                );
            }
            finish(ctx, challenge, timing);
            Ok(())
        }
        Err(e) => {
            save(ctx, &mut challenge, &timing)?;
            Err(e)
        }
    }
}

fn save(ctx: &BlobberContext, challenge: &mut Challenge, timing: &ChallengeTiming) -> Result<()> {
    let mut tx = ctx.db.begin();
    challenge.save(&mut tx)?;
    timing.save(&mut tx)?;
    tx.commit()
}

fn finish(ctx: &BlobberContext, challenge: Challenge, mut timing: ChallengeTiming) {
    timing.close();
    ctx.persist.enqueue(PersistJob { challenge, timing });
}
