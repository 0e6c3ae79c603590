/// This module defines the request and response bodies of the node's operational HTTP
/// surface, with validation rules applied before a request reaches the write-marker
/// mutex or the datastore.
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Payload for taking or releasing an allocation's write lock.
///
/// Both fields follow the same length ceiling as write-marker IDs.
#[derive(Serialize, Deserialize, Validate, Debug, Clone)]
pub struct LockRequest {
    /// The allocation to lock.
    ///
    /// Must be a non-empty string of at most 64 characters.
    #[validate(length(min = 1, max = 64, message = "allocation_id must be 1-64 characters"))]
    pub allocation_id: String,

    /// The upload connection asking for the lock.
    ///
    /// Must be a non-empty string of at most 64 characters.
    #[validate(length(min = 1, max = 64, message = "connection_id must be 1-64 characters"))]
    pub connection_id: String,
}

/// Query parameters for the recent challenge timings listing.
#[derive(Deserialize, Validate, Debug)]
pub struct TimingsQuery {
    #[validate(range(min = 1, max = 500, message = "limit must be between 1 and 500"))]
    pub limit: Option<usize>,
}

impl TimingsQuery {
    pub const DEFAULT_LIMIT: usize = 50;

    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT)
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct HealthResponse {
    pub blobber_id: String,
    pub volumes: usize,
    pub challenges_in_flight: usize,
}
