//! Write-marker ledger: verification and acceptance of client-signed markers, the
//! per-allocation advisory lock, and redemption of accepted markers on chain.

pub mod commit;
pub mod entity;
pub mod mutex;
pub mod protocol;
pub mod verify;
pub mod worker;

pub use commit::{accept_rollback_marker, accept_write_marker};
pub use entity::{get_write_markers_in_range, WriteMarker, WriteMarkerEntity, WriteMarkerStatus};
pub use mutex::{LockResult, LockStatus, WriteLock, WriteMarkerMutex};
pub use protocol::redeem_marker;
pub use verify::{verify_marker, verify_rollback_marker, MarkerContext};
pub use worker::{RedemptionWorker, ALLOCATION_LOCK_TABLE};
