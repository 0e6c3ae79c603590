use log::{error, info, warn};
use serde_json::json;
use std::time::Duration;

use crate::chain::{ChainClient, COMMIT_CONNECTION};
use crate::db::Database;
use crate::error::Result;
use crate::writemarker::entity::{WriteMarkerEntity, WriteMarkerStatus};

/// Redeems one write marker on chain.
///
/// A transaction recorded by an earlier attempt is verified first, so a redemption that
/// already landed is never submitted twice. Otherwise a `commit_connection` transaction
/// is submitted, its hash is written to `db` at once, and it is given `sleep_before_verify`
/// to land before being verified. The entity's status, message and retry count are
/// updated in place; the caller persists them.
///
/// # Errors
///
/// * `BlobberError::TransactionSubmission` / `BlobberError::TransactionVerification` -
///   If the marker could not be redeemed. The entity is left `Failed`.
pub async fn redeem_marker(
    chain: &dyn ChainClient,
    db: &Database,
    entity: &mut WriteMarkerEntity,
    sleep_before_verify: Duration,
) -> Result<()> {
    if !entity.close_txn_id.is_empty() {
        match chain.verify_transaction(&entity.close_txn_id).await {
            Ok(txn) => {
                info!(
                    "Write marker {} already redeemed in {}",
                    entity.wm.allocation_root, entity.close_txn_id
                );
                entity.status = WriteMarkerStatus::Committed;
                entity.status_message = txn.transaction_output;
                return Ok(());
            }
            Err(e) => warn!(
                "Earlier redemption {} of {} did not land: {}",
                entity.close_txn_id, entity.wm.allocation_root, e
            ),
        }
    }

    let input = json!({
        "allocation_id": entity.wm.allocation_id,
        "allocation_root": entity.wm.allocation_root,
        "prev_allocation_root": entity.wm.prev_allocation_root,
        "write_marker": entity.wm,
    });
    let outcome = match chain.submit_transaction(COMMIT_CONNECTION, input).await {
        Ok(txn_hash) => {
            entity.close_txn_id = txn_hash.clone();
            match record_submission(db, entity) {
                Ok(()) => {
                    tokio::time::sleep(sleep_before_verify).await;
                    chain.verify_transaction(&txn_hash).await
                }
                Err(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    };

    match outcome {
        Ok(txn) => {
            entity.status = WriteMarkerStatus::Committed;
            entity.status_message = txn.transaction_output;
            info!(
                "Redeemed write marker {} for allocation {} in {}",
                entity.wm.allocation_root, entity.wm.allocation_id, entity.close_txn_id
            );
            Ok(())
        }
        Err(e) => {
            entity.status = WriteMarkerStatus::Failed;
            entity.status_message = e.status_message();
            entity.redeem_retries += 1;
            error!(
                "Failed to redeem write marker {} for allocation {}: {}",
                entity.wm.allocation_root, entity.wm.allocation_id, e
            );
            Err(e)
        }
    }
}

/// Saves the close transaction before anything else can go wrong, so a restarted pass
/// verifies it instead of submitting again.
fn record_submission(db: &Database, entity: &mut WriteMarkerEntity) -> Result<()> {
    let mut tx = db.begin();
    entity.save(&mut tx)?;
    tx.commit()
}
