//! Blockchain collaborator: the REST/RPC contract the blobber consumes from sharders and
//! miners, expressed as the `ChainClient` trait so the engines can be driven by an
//! in-process fake in tests.

pub mod http;
pub mod nonce;
pub mod registration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use http::HttpChainClient;

/// Smart-contract function names on the storage contract.
pub const CHALLENGE_RESPONSE: &str = "challenge_response";
pub const COMMIT_CONNECTION: &str = "commit_connection";
pub const READ_REDEEM: &str = "read_redeem";
pub const ADD_BLOBBER: &str = "add_blobber";
pub const BLOBBER_HEALTH_CHECK: &str = "blobber_health_check";
pub const FINALIZE_ALLOCATION: &str = "finalize_allocation";

/// Transaction type used for smart-contract calls.
pub const TXN_TYPE_SMART_CONTRACT: i32 = 1000;
/// `transaction_status` of a transaction that executed successfully.
pub const TXN_STATUS_SUCCESS: i32 = 1;

/// A chain transaction as submitted to miners and returned by sharders.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    pub hash: String,
    #[serde(default)]
    pub version: String,
    pub client_id: String,
    pub public_key: String,
    pub to_client_id: String,
    pub transaction_data: String,
    #[serde(default)]
    pub transaction_value: i64,
    pub signature: String,
    pub creation_date: i64,
    #[serde(default)]
    pub transaction_fee: i64,
    pub transaction_type: i32,
    #[serde(default)]
    pub transaction_output: String,
    #[serde(default)]
    pub transaction_status: i32,
    #[serde(default)]
    pub transaction_nonce: i64,
}

/// Payload of a smart-contract transaction: the function to run and its JSON input.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SmartContractTxnData {
    pub name: String,
    pub input: serde_json::Value,
}

/// A validator as the chain assigns it to a challenge.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ValidationNode {
    pub id: String,
    pub url: String,
}

/// One open challenge as returned by the `openchallenges` endpoint.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OpenChallenge {
    pub id: String,
    #[serde(default)]
    pub prev_id: String,
    pub created: i64,
    pub random_number: i64,
    pub allocation_id: String,
    #[serde(default)]
    pub allocation_root: String,
    #[serde(default)]
    pub blobber_id: String,
    #[serde(default)]
    pub validators: Vec<ValidationNode>,
}

/// Response body of the `openchallenges` endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct BlobberChallenges {
    pub blobber_id: String,
    #[serde(default)]
    pub challenges: Vec<OpenChallenge>,
}

/// Blockchain RPC seam used by the challenge and write-marker engines.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Fetches up to `limit` open challenges for `blobber_id` created after `from`.
    async fn get_open_challenges(
        &self,
        blobber_id: &str,
        from: i64,
        limit: usize,
    ) -> Result<BlobberChallenges>;

    /// Signs and submits a storage smart-contract call, returning the transaction hash.
    async fn submit_transaction(&self, function: &str, input: serde_json::Value)
        -> Result<String>;

    /// Polls sharders until the transaction is confirmed or the retry budget runs out.
    async fn verify_transaction(&self, hash: &str) -> Result<Transaction>;
}
