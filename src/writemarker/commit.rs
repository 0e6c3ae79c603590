use log::info;

use crate::allocation::Allocation;
use crate::db::Transaction;
use crate::error::{BlobberError, Result};
use crate::writemarker::entity::{WriteMarker, WriteMarkerEntity};
use crate::writemarker::verify::{verify_marker, verify_rollback_marker, MarkerContext};

/// Verifies `wm` and appends it to the allocation's ledger.
///
/// The allocation moves to the marker's root and is flagged for redemption. Callers hold
/// the allocation's lock for the duration of the transaction.
///
/// # Arguments
///
/// * `tx` - Unit of work the ledger row and allocation update are written to.
/// * `allocation` - Allocation the marker extends; updated in place.
/// * `wm` - Client-signed marker.
/// * `ctx` - Connection the marker arrived on.
///
/// # Errors
///
/// * `BlobberError::WriteMarkerValidation` - If verification fails. Nothing is written.
pub fn accept_write_marker(
    tx: &mut Transaction<'_>,
    allocation: &mut Allocation,
    wm: WriteMarker,
    ctx: &MarkerContext,
) -> Result<WriteMarkerEntity> {
    verify_marker(&wm, allocation, ctx)?;
    let size = wm.size;
    record(tx, allocation, wm, ctx, size)
}

/// Verifies a rollback of the allocation's latest marker and appends it to the ledger.
///
/// # Errors
///
/// * `BlobberError::WriteMarkerValidation` - If the allocation has no marker to roll back
///   or verification fails.
pub fn accept_rollback_marker(
    tx: &mut Transaction<'_>,
    allocation: &mut Allocation,
    wm: WriteMarker,
    ctx: &MarkerContext,
) -> Result<WriteMarkerEntity> {
    let latest = WriteMarkerEntity::latest(tx, &allocation.id)?.ok_or_else(|| {
        BlobberError::WriteMarkerValidation(format!(
            "allocation {} has no write marker to roll back",
            allocation.id
        ))
    })?;
    verify_rollback_marker(&wm, allocation, &latest, ctx)?;
    // Undoing the latest write releases the space it used.
    let size = -latest.wm.size;
    record(tx, allocation, wm, ctx, size)
}

fn record(
    tx: &mut Transaction<'_>,
    allocation: &mut Allocation,
    wm: WriteMarker,
    ctx: &MarkerContext,
    size_delta: i64,
) -> Result<WriteMarkerEntity> {
    let mut entity = WriteMarkerEntity::new(wm, &ctx.connection_id, &ctx.client_public_key);
    entity.save(tx)?;
    allocation.allocation_root = entity.wm.allocation_root.clone();
    allocation.blobber_size_used += size_delta;
    allocation.is_redeem_required = true;
    allocation.save(tx)?;
    info!(
        "Accepted write marker {} (sequence {}) for allocation {}",
        entity.wm.allocation_root, entity.sequence, allocation.id
    );
    Ok(entity)
}
