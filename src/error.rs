/// This module defines the crate-wide error type `BlobberError` for the storage node's
/// challenge, write-marker and disk-balancer engines. Every variant carries a stable code
/// string so that failures can be persisted as status messages and compared across
/// restarts. It integrates with Actix-web for the operational HTTP surface and provides
/// conversions from the lower-level error types (RocksDB, serde, reqwest).
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use rocksdb::Error as RocksDBError;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = BlobberError> = std::result::Result<T, E>;

/// Error type for the blobber core.
///
/// Variants map onto the failure taxonomy of the node: transient failures against the
/// chain or validators (retryable), consensus failures, malformed input that must never be
/// retried, and fatal infrastructure failures.
#[derive(Error, Debug)]
pub enum BlobberError {
    /// Error from RocksDB database operations.
    #[error("Database error: {0}")]
    Database(#[from] RocksDBError),

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Record not found in the datastore.
    #[error("{0} not found")]
    NotFound(String),

    /// Transport failure talking to the chain or a validator.
    #[error("Network error: {0}")]
    Network(String),

    /// A smart-contract transaction could not be submitted to any miner.
    #[error("Transaction submission failed: {0}")]
    TransactionSubmission(String),

    /// A transaction could not be confirmed on chain.
    #[error("Transaction verification failed: {0}")]
    TransactionVerification(String),

    /// Write marker rejected before or during signature verification.
    #[error("Write marker validation failed: {0}")]
    WriteMarkerValidation(String),

    /// Object path for a challenged block could not be resolved.
    #[error("Invalid object path: {0}")]
    InvalidObjectPath(String),

    /// Allocation record is missing or inconsistent.
    #[error("Invalid allocation: {0}")]
    InvalidAllocation(String),

    /// A challenge was assigned no validators.
    #[error("No validators assigned to the challenge")]
    NoValidators,

    /// No write markers cover the challenged allocation root range.
    #[error("No write markers found for the allocation root range")]
    NoWriteMarkers,

    /// Validators have not reached a decisive quorum.
    #[error("Validators could not reach consensus: {success} success, {failure} failure of {total}")]
    NoConsensus {
        success: usize,
        failure: usize,
        total: usize,
    },

    /// The challenge completion window elapsed.
    #[error("expired challenge")]
    ExpiredChallenge,

    /// Committing a challenge verdict to chain failed.
    #[error("Challenge commit failed: {0}")]
    ChallengeCommit(String),

    /// A status transition would move backwards.
    #[error("Invalid status transition: {0}")]
    InvalidTransition(String),

    /// Volume is unusable (missing, not writable, below the minimum size).
    #[error("Invalid volume: {0}")]
    InvalidVolume(String),

    /// No volume has enough free space for the requested size.
    #[error("Insufficient space: requested {requested} bytes, best volume has {available}")]
    InsufficientSpace { requested: u64, available: u64 },

    /// Filesystem failure during migration or block reads.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error for miscellaneous issues (e.g. key decoding, timestamps).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BlobberError {
    /// Returns the stable code string persisted alongside failed records.
    pub fn code(&self) -> &'static str {
        match self {
            BlobberError::Database(_) => "database_error",
            BlobberError::Serialization(_) => "serialization_error",
            BlobberError::NotFound(_) => "not_found",
            BlobberError::Network(_) => "network_error",
            BlobberError::TransactionSubmission(_) => "transaction_submission_failed",
            BlobberError::TransactionVerification(_) => "transaction_verification_failed",
            BlobberError::WriteMarkerValidation(_) => "write_marker_validation_failed",
            BlobberError::InvalidObjectPath(_) => "invalid_object_path",
            BlobberError::InvalidAllocation(_) => "invalid_allocation",
            BlobberError::NoValidators => "no_validators",
            BlobberError::NoWriteMarkers => "no_write_markers",
            BlobberError::NoConsensus { .. } => "no_consensus_challenge",
            BlobberError::ExpiredChallenge => "expired_challenge",
            BlobberError::ChallengeCommit(_) => "challenge_commit_failed",
            BlobberError::InvalidTransition(_) => "invalid_status_transition",
            BlobberError::InvalidVolume(_) => "invalid_volume",
            BlobberError::InsufficientSpace { .. } => "insufficient_space",
            BlobberError::Io(_) => "io_error",
            BlobberError::Config(_) => "config_error",
            BlobberError::Internal(_) => "internal_error",
        }
    }

    /// Whether a later pass may succeed where this attempt failed.
    ///
    /// Malformed input (bad signatures, oversized fields, missing validators) is never
    /// retryable because retrying cannot repair it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BlobberError::Network(_)
                | BlobberError::TransactionSubmission(_)
                | BlobberError::TransactionVerification(_)
                | BlobberError::ChallengeCommit(_)
                | BlobberError::NoConsensus { .. }
                | BlobberError::Database(_)
        )
    }

    /// Whether the challenge input itself is malformed, so no later pass can finish it.
    ///
    /// Everything else, disk and database failures included, leaves the challenge open.
    pub fn cancels_challenge(&self) -> bool {
        matches!(
            self,
            BlobberError::NoValidators
                | BlobberError::NoWriteMarkers
                | BlobberError::InvalidObjectPath(_)
                | BlobberError::InvalidAllocation(_)
                | BlobberError::WriteMarkerValidation(_)
        )
    }

    /// Formats the error as `code: message`, the shape stored in status messages.
    pub fn status_message(&self) -> String {
        format!("{}: {}", self.code(), self)
    }
}

impl From<reqwest::Error> for BlobberError {
    fn from(err: reqwest::Error) -> Self {
        BlobberError::Network(err.to_string())
    }
}

impl From<config::ConfigError> for BlobberError {
    fn from(err: config::ConfigError) -> Self {
        BlobberError::Config(err.to_string())
    }
}

impl From<validator::ValidationErrors> for BlobberError {
    fn from(err: validator::ValidationErrors) -> Self {
        BlobberError::Config(err.to_string())
    }
}

/// Implements Actix-web's `ResponseError` trait for `BlobberError`.
///
/// - `NotFound`: 404 Not Found
/// - `WriteMarkerValidation`, `InvalidObjectPath`, `InvalidAllocation`: 400 Bad Request
/// - `InsufficientSpace`: 507 Insufficient Storage
/// - everything else: 500 Internal Server Error
impl ResponseError for BlobberError {
    fn status_code(&self) -> StatusCode {
        match self {
            BlobberError::NotFound(_) => StatusCode::NOT_FOUND,
            BlobberError::WriteMarkerValidation(_)
            | BlobberError::InvalidObjectPath(_)
            | BlobberError::InvalidAllocation(_)
            | BlobberError::Config(_) => StatusCode::BAD_REQUEST,
            BlobberError::InsufficientSpace { .. } => StatusCode::INSUFFICIENT_STORAGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(serde_json::json!({
            "code": self.code(),
            "error": self.to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(
            BlobberError::WriteMarkerValidation("x".into()).code(),
            "write_marker_validation_failed"
        );
        assert_eq!(
            BlobberError::NoConsensus {
                success: 2,
                failure: 1,
                total: 4
            }
            .code(),
            "no_consensus_challenge"
        );
        assert_eq!(
            BlobberError::InvalidObjectPath("x".into()).code(),
            "invalid_object_path"
        );
    }

    #[test]
    fn test_malformed_input_is_not_retryable() {
        assert!(!BlobberError::WriteMarkerValidation("bad".into()).is_retryable());
        assert!(!BlobberError::NoValidators.is_retryable());
        assert!(!BlobberError::NoWriteMarkers.is_retryable());
        assert!(BlobberError::Network("timeout".into()).is_retryable());
        assert!(BlobberError::TransactionVerification("pending".into()).is_retryable());
    }

    #[test]
    fn test_only_malformed_input_cancels_challenges() {
        assert!(BlobberError::NoValidators.cancels_challenge());
        assert!(BlobberError::InvalidAllocation("gone".into()).cancels_challenge());
        assert!(BlobberError::InvalidObjectPath("block 9".into()).cancels_challenge());
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk offline");
        assert!(!BlobberError::Io(io).cancels_challenge());
        assert!(!BlobberError::NotFound("allocation on disk".into()).cancels_challenge());
        assert!(!BlobberError::Internal("root mismatch".into()).cancels_challenge());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            BlobberError::NotFound("challenge".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            BlobberError::InsufficientSpace {
                requested: 10,
                available: 1
            }
            .status_code(),
            StatusCode::INSUFFICIENT_STORAGE
        );
    }
}
