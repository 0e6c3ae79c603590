use log::{debug, error, info, trace};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::allocation::Allocation;
use crate::chain::ChainClient;
use crate::config::WriteMarkerConfig;
use crate::db::{Database, Transaction};
use crate::error::{BlobberError, Result};
use crate::lock::LockRegistry;
use crate::writemarker::entity::{WriteMarkerEntity, WriteMarkerStatus};
use crate::writemarker::protocol::redeem_marker;

pub const ALLOCATION_LOCK_TABLE: &str = "allocation";

/// Periodically redeems accepted write markers, one allocation per pool slot.
pub struct RedemptionWorker {
    db: Arc<Database>,
    locks: Arc<LockRegistry>,
    chain: Arc<dyn ChainClient>,
    config: WriteMarkerConfig,
    sleep_before_verify: Duration,
}

impl RedemptionWorker {
    pub fn new(
        db: Arc<Database>,
        locks: Arc<LockRegistry>,
        chain: Arc<dyn ChainClient>,
        config: WriteMarkerConfig,
        sleep_before_verify: Duration,
    ) -> Self {
        Self {
            db,
            locks,
            chain,
            config,
            sleep_before_verify,
        }
    }

    /// Runs a redemption pass every `redeem_interval_secs` until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.redeem_interval_secs));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Write marker redemption stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match self.clone().redeem_pending().await {
                        Ok(0) => trace!("No allocations waiting for redemption"),
                        Ok(count) => debug!("Redemption pass covered {} allocations", count),
                        Err(e) => error!("Redemption pass failed: {}", e),
                    }
                }
            }
        }
    }

    /// Redeems every allocation flagged for redemption, at most
    /// `max_concurrent_redemptions` at a time. Returns how many allocations were visited.
    pub async fn redeem_pending(self: Arc<Self>) -> Result<usize> {
        let pending = Allocation::pending_redemption(&self.db.begin())?;
        let pool = Arc::new(Semaphore::new(self.config.max_concurrent_redemptions));
        let mut handles = Vec::with_capacity(pending.len());
        for allocation in pending {
            let permit = pool
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| BlobberError::Internal(format!("redemption pool closed: {}", e)))?;
            let worker = self.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = worker.redeem_allocation(&allocation.id).await {
                    error!("Redemption of allocation {} failed: {}", allocation.id, e);
                }
            }));
        }
        let count = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Redemption task panicked: {}", e);
            }
        }
        Ok(count)
    }

    /// Walks the allocation's ledger in sequence order and redeems every marker after the
    /// latest redeemed one, stopping at the first failure.
    ///
    /// Each marker's outcome and the allocation's redeemed pointer are committed together
    /// before the next marker starts.
    pub async fn redeem_allocation(&self, allocation_id: &str) -> Result<()> {
        let _guard = self.locks.lock(ALLOCATION_LOCK_TABLE, allocation_id).await;
        let (mut latest, markers) = {
            let tx = self.db.begin();
            let allocation = Allocation::get(&tx, allocation_id)?;
            let markers = WriteMarkerEntity::list(&tx, allocation_id)?;
            (allocation.latest_redeemed_wm, markers)
        };

        let mut started = latest.is_empty();
        for mut entity in markers {
            if !started {
                if entity.wm.prev_allocation_root == latest {
                    started = true;
                } else {
                    continue;
                }
            }
            if entity.status == WriteMarkerStatus::Committed {
                latest = entity.wm.allocation_root.clone();
                continue;
            }

            let result = redeem_marker(
                self.chain.as_ref(),
                &self.db,
                &mut entity,
                self.sleep_before_verify,
            )
            .await;
            let mut tx = self.db.begin();
            entity.save(&mut tx)?;
            if result.is_ok() {
                latest = entity.wm.allocation_root.clone();
                self.advance(&mut tx, allocation_id, &latest)?;
            }
            tx.commit()?;
            if result.is_err() {
                break;
            }
        }

        let mut tx = self.db.begin();
        self.advance(&mut tx, allocation_id, &latest)?;
        tx.commit()
    }

    /// Moves the allocation's redeemed pointer to `latest`, clearing the redemption flag
    /// once it reaches the current root.
    fn advance(&self, tx: &mut Transaction<'_>, allocation_id: &str, latest: &str) -> Result<()> {
        let mut allocation = Allocation::get(tx, allocation_id)?;
        allocation.latest_redeemed_wm = latest.to_string();
        if allocation.latest_redeemed_wm == allocation.allocation_root {
            allocation.is_redeem_required = false;
            debug!("Allocation {} fully redeemed", allocation_id);
        }
        allocation.save(tx)
    }
}
