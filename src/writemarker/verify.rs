use log::debug;

use crate::allocation::Allocation;
use crate::error::{BlobberError, Result};
use crate::node::{verify_signature, SIGNATURE_HEX_LEN};
use crate::utils::now;
use crate::writemarker::entity::{WriteMarker, WriteMarkerEntity};

/// Ceiling for every hash and ID field of a marker.
pub const MAX_FIELD_LEN: usize = 64;
/// How far a marker's timestamp may run ahead of this node's clock.
pub const MAX_TIMESTAMP_SKEW_SECS: i64 = 60;

/// What the node knows about the connection a marker arrives on.
#[derive(Debug, Clone)]
pub struct MarkerContext {
    pub blobber_id: String,
    pub client_id: String,
    pub client_public_key: String,
    pub connection_id: String,
    /// Bytes the connection actually uploaded.
    pub connection_size: i64,
}

fn invalid(message: impl Into<String>) -> BlobberError {
    BlobberError::WriteMarkerValidation(message.into())
}

fn check_fields(wm: &WriteMarker) -> Result<()> {
    let fields = [
        ("allocation_root", &wm.allocation_root),
        ("prev_allocation_root", &wm.prev_allocation_root),
        ("allocation_id", &wm.allocation_id),
        ("blobber_id", &wm.blobber_id),
        ("client_id", &wm.client_id),
    ];
    for (name, value) in fields {
        if value.len() > MAX_FIELD_LEN {
            return Err(invalid(format!(
                "{} is {} characters, limit {}",
                name,
                value.len(),
                MAX_FIELD_LEN
            )));
        }
    }
    if wm.signature.len() != SIGNATURE_HEX_LEN {
        return Err(invalid(format!(
            "signature is {} characters, expected {}",
            wm.signature.len(),
            SIGNATURE_HEX_LEN
        )));
    }
    Ok(())
}

fn check_identity(wm: &WriteMarker, allocation: &Allocation, ctx: &MarkerContext) -> Result<()> {
    if wm.allocation_id != allocation.id {
        return Err(invalid(format!(
            "marker is for allocation {}, expected {}",
            wm.allocation_id, allocation.id
        )));
    }
    if wm.blobber_id != ctx.blobber_id {
        return Err(invalid(format!("marker is for blobber {}", wm.blobber_id)));
    }
    if wm.client_id != ctx.client_id {
        return Err(invalid(format!("marker signed by client {}", wm.client_id)));
    }
    Ok(())
}

fn check_timestamp_and_signature(wm: &WriteMarker, ctx: &MarkerContext) -> Result<()> {
    let current = now();
    if wm.timestamp > current + MAX_TIMESTAMP_SKEW_SECS {
        return Err(invalid(format!(
            "timestamp {} is ahead of node time {}",
            wm.timestamp, current
        )));
    }
    if !verify_signature(&ctx.client_public_key, &wm.signature, &wm.hash()) {
        return Err(invalid("signature verification failed"));
    }
    Ok(())
}

/// Checks a marker against the allocation it extends.
///
/// # Errors
///
/// * `BlobberError::WriteMarkerValidation` - On an oversized field, a signature of the
///   wrong length, a broken root chain, an identity or size mismatch, a timestamp too
///   far in the future, or a bad signature. Cheap checks run first, so malformed markers
///   never reach signature verification.
pub fn verify_marker(wm: &WriteMarker, allocation: &Allocation, ctx: &MarkerContext) -> Result<()> {
    check_fields(wm)?;
    if wm.prev_allocation_root != allocation.allocation_root {
        return Err(invalid(format!(
            "previous root {} does not match allocation root {}",
            wm.prev_allocation_root, allocation.allocation_root
        )));
    }
    check_identity(wm, allocation, ctx)?;
    if wm.size != ctx.connection_size {
        return Err(invalid(format!(
            "marker size {} does not match uploaded size {}",
            wm.size, ctx.connection_size
        )));
    }
    check_timestamp_and_signature(wm, ctx)?;
    debug!(
        "Verified write marker {} for allocation {}",
        wm.allocation_root, wm.allocation_id
    );
    Ok(())
}

/// Checks a rollback marker undoing `latest`, the allocation's most recent marker.
///
/// A rollback carries no data, starts from the current root and lands on the root
/// `latest` started from.
pub fn verify_rollback_marker(
    wm: &WriteMarker,
    allocation: &Allocation,
    latest: &WriteMarkerEntity,
    ctx: &MarkerContext,
) -> Result<()> {
    check_fields(wm)?;
    if wm.size != 0 {
        return Err(invalid(format!("rollback marker has size {}", wm.size)));
    }
    if wm.prev_allocation_root != allocation.allocation_root {
        return Err(invalid(format!(
            "rollback starts at {}, allocation is at {}",
            wm.prev_allocation_root, allocation.allocation_root
        )));
    }
    if wm.allocation_root != latest.wm.prev_allocation_root {
        return Err(invalid(format!(
            "rollback lands on {}, expected {}",
            wm.allocation_root, latest.wm.prev_allocation_root
        )));
    }
    check_identity(wm, allocation, ctx)?;
    check_timestamp_and_signature(wm, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{client_id_for, NodeIdentity};

    struct Fixture {
        client: NodeIdentity,
        allocation: Allocation,
        ctx: MarkerContext,
    }

    fn fixture() -> Fixture {
        let client = NodeIdentity::generate();
        let ctx = MarkerContext {
            blobber_id: "b1".into(),
            client_id: client_id_for(client.public_key()).unwrap(),
            client_public_key: client.public_key().to_string(),
            connection_id: "conn".into(),
            connection_size: 10,
        };
        let allocation = Allocation {
            id: "a1".into(),
            allocation_root: "r1".into(),
            ..Default::default()
        };
        Fixture {
            client,
            allocation,
            ctx,
        }
    }

    fn signed(f: &Fixture, prev: &str, root: &str, size: i64) -> WriteMarker {
        let mut wm = WriteMarker {
            allocation_root: root.into(),
            prev_allocation_root: prev.into(),
            allocation_id: "a1".into(),
            size,
            blobber_id: "b1".into(),
            timestamp: now(),
            client_id: f.ctx.client_id.clone(),
            signature: String::new(),
        };
        wm.signature = f.client.sign(&wm.hash());
        wm
    }

    #[test]
    fn test_valid_marker() {
        let f = fixture();
        let wm = signed(&f, "r1", "r2", 10);
        assert!(verify_marker(&wm, &f.allocation, &f.ctx).is_ok());
    }

    #[test]
    fn test_rejections() {
        let f = fixture();

        let broken_chain = signed(&f, "r0", "r2", 10);
        let wrong_size = signed(&f, "r1", "r2", 11);
        let mut future = signed(&f, "r1", "r2", 10);
        future.timestamp = now() + MAX_TIMESTAMP_SKEW_SECS + 30;
        future.signature = f.client.sign(&future.hash());
        let mut tampered = signed(&f, "r1", "r2", 10);
        tampered.allocation_root = "r3".into();
        let mut oversized = signed(&f, "r1", "r2", 10);
        oversized.allocation_root = "x".repeat(MAX_FIELD_LEN + 1);

        for wm in [broken_chain, wrong_size, future, tampered, oversized] {
            let err = verify_marker(&wm, &f.allocation, &f.ctx).unwrap_err();
            assert_eq!(err.code(), "write_marker_validation_failed");
        }
    }

    #[test]
    fn test_signature_length_checked_before_verification() {
        let f = fixture();
        let mut wm = signed(&f, "r1", "r2", 10);
        wm.signature.truncate(65);
        let err = verify_marker(&wm, &f.allocation, &f.ctx).unwrap_err();
        assert_eq!(err.code(), "write_marker_validation_failed");
        assert!(err.to_string().contains("signature is 65 characters"));
    }

    #[test]
    fn test_rollback_marker() {
        let mut f = fixture();
        f.allocation.allocation_root = "r2".into();
        f.ctx.connection_size = 0;
        let latest = WriteMarkerEntity::new(signed(&f, "r1", "r2", 10), "conn", "key");

        let rollback = signed(&f, "r2", "r1", 0);
        assert!(verify_rollback_marker(&rollback, &f.allocation, &latest, &f.ctx).is_ok());

        let with_size = signed(&f, "r2", "r1", 5);
        assert!(verify_rollback_marker(&with_size, &f.allocation, &latest, &f.ctx).is_err());

        let wrong_target = signed(&f, "r2", "r0", 0);
        assert!(verify_rollback_marker(&wrong_target, &f.allocation, &latest, &f.ctx).is_err());
    }
}
