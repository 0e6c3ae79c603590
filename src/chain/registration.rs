use log::{error, info};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::chain::{ADD_BLOBBER, BLOBBER_HEALTH_CHECK};
use crate::context::BlobberContext;
use crate::error::Result;

/// Registration record sent with `add_blobber`.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct StorageNode {
    pub id: String,
    pub url: String,
    pub public_key: String,
    pub capacity: u64,
}

/// Registers this node with the storage contract and waits for the transaction to land.
pub async fn register_blobber(ctx: &BlobberContext) -> Result<String> {
    let node = StorageNode {
        id: ctx.blobber_id().to_string(),
        url: ctx.config.node.url.clone(),
        public_key: ctx.identity.public_key().to_string(),
        capacity: ctx.config.node.capacity,
    };
    let txn_hash = ctx
        .chain
        .submit_transaction(ADD_BLOBBER, serde_json::to_value(&node)?)
        .await?;
    tokio::time::sleep(ctx.config.chain.sleep_before_verify()).await;
    ctx.chain.verify_transaction(&txn_hash).await?;
    info!("Registered blobber {} at {} in {}", node.id, node.url, txn_hash);
    Ok(txn_hash)
}

/// Sends one `blobber_health_check` transaction.
pub async fn send_health_check(ctx: &BlobberContext) -> Result<String> {
    let txn_hash = ctx
        .chain
        .submit_transaction(BLOBBER_HEALTH_CHECK, serde_json::json!({}))
        .await?;
    tokio::time::sleep(ctx.config.chain.sleep_before_verify()).await;
    ctx.chain.verify_transaction(&txn_hash).await?;
    Ok(txn_hash)
}

/// Sends a health check every `health_check_interval_secs` until cancelled. Failures are
/// logged and retried on the next tick.
pub async fn health_check_loop(ctx: Arc<BlobberContext>, cancel: CancellationToken) -> Result<()> {
    let mut ticker =
        tokio::time::interval(Duration::from_secs(ctx.config.health_check_interval_secs));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Health check loop stopped");
                return Ok(());
            }
            _ = ticker.tick() => match send_health_check(&ctx).await {
                Ok(txn_hash) => info!("Health check confirmed in {}", txn_hash),
                Err(e) => error!("Health check failed: {}", e),
            }
        }
    }
}
