/// This module provides the HTTP client the blobber uses to talk to the chain. Sharders
/// serve smart-contract REST state and transaction confirmations; miners accept new
/// transactions. Every call is bounded by the configured request timeout and retried a
/// fixed number of times with a fixed sleep in between.
use async_trait::async_trait;
use log::{debug, error, info, trace, warn};
use serde::Deserialize;
use std::sync::Arc;

use crate::chain::nonce::NonceMonitor;
use crate::chain::{
    BlobberChallenges, ChainClient, SmartContractTxnData, Transaction, TXN_STATUS_SUCCESS,
    TXN_TYPE_SMART_CONTRACT,
};
use crate::config::ChainConfig;
use crate::error::{BlobberError, Result};
use crate::node::NodeIdentity;
use crate::utils::{hash, now};

const OPEN_CHALLENGES_PATH: &str = "openchallenges";
const TXN_PUT_PATH: &str = "/v1/transaction/put";
const TXN_CONFIRMATION_PATH: &str = "/v1/transaction/get/confirmation";
const CLIENT_BALANCE_PATH: &str = "/v1/client/get/balance";

#[derive(Deserialize)]
struct Confirmation {
    #[serde(default)]
    txn: Option<Transaction>,
}

#[derive(Deserialize)]
struct ClientBalance {
    #[serde(default)]
    nonce: i64,
}

/// `ChainClient` backed by sharder and miner HTTP endpoints.
pub struct HttpChainClient {
    client: reqwest::Client, // HTTP client with the configured request timeout
    config: ChainConfig,     // Sharders, miners, contract address and retry policy
    identity: Arc<NodeIdentity>,
    nonce: NonceMonitor,
}

impl HttpChainClient {
    /// Creates a new `HttpChainClient`.
    ///
    /// # Arguments
    ///
    /// * `config` - Chain endpoints, storage contract address and retry policy.
    /// * `identity` - Node identity used to sign submitted transactions.
    ///
    /// # Errors
    ///
    /// * `BlobberError::Network` - If the underlying HTTP client cannot be built.
    pub fn new(config: ChainConfig, identity: Arc<NodeIdentity>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            config,
            identity,
            nonce: NonceMonitor::new(),
        })
    }

    /// Builds and signs a smart-contract transaction for the storage contract.
    ///
    /// The transaction hash covers
    /// `creation_date:nonce:client_id:to_client_id:value:hash(transaction_data)`.
    pub fn build_transaction(
        &self,
        function: &str,
        input: serde_json::Value,
        nonce: i64,
    ) -> Result<Transaction> {
        let data = serde_json::to_string(&SmartContractTxnData {
            name: function.to_string(),
            input,
        })?;
        let creation_date = now();
        let value = 0i64;
        let hash_data = format!(
            "{}:{}:{}:{}:{}:{}",
            creation_date,
            nonce,
            self.identity.id(),
            self.config.storage_contract_address,
            value,
            hash(&data)
        );
        let txn_hash = hash(&hash_data);
        Ok(Transaction {
            signature: self.identity.sign(&txn_hash),
            hash: txn_hash,
            version: "1.0".to_string(),
            client_id: self.identity.id().to_string(),
            public_key: self.identity.public_key().to_string(),
            to_client_id: self.config.storage_contract_address.clone(),
            transaction_data: data,
            transaction_value: value,
            creation_date,
            transaction_fee: 0,
            transaction_type: TXN_TYPE_SMART_CONTRACT,
            transaction_output: String::new(),
            transaction_status: 0,
            transaction_nonce: nonce,
        })
    }

    async fn ensure_nonce(&self) {
        if self.nonce.is_initialized() {
            return;
        }
        for sharder in &self.config.sharders {
            let url = format!("{}{}", sharder.trim_end_matches('/'), CLIENT_BALANCE_PATH);
            let response = self
                .client
                .get(&url)
                .query(&[("client_id", self.identity.id())])
                .send()
                .await;
            match response {
                Ok(resp) if resp.status().is_success() => {
                    if let Ok(balance) = resp.json::<ClientBalance>().await {
                        self.nonce.initialize(balance.nonce);
                        return;
                    }
                }
                Ok(resp) => trace!("Sharder {} has no balance record: {}", sharder, resp.status()),
                Err(e) => debug!("Failed to fetch nonce from {}: {}", sharder, e),
            }
        }
        // Unknown client: start counting from zero.
        self.nonce.initialize(0);
    }

    async fn post_to_miners(&self, txn: &Transaction) -> Result<()> {
        let mut last_error = String::from("no miners configured");
        for attempt in 1..=self.config.retry_count {
            for miner in &self.config.miners {
                let url = format!("{}{}", miner.trim_end_matches('/'), TXN_PUT_PATH);
                match self.client.post(&url).json(txn).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        debug!("Transaction {} accepted by {}", txn.hash, miner);
                        return Ok(());
                    }
                    Ok(resp) => {
                        let status = resp.status();
                        let body = resp.text().await.unwrap_or_default();
                        last_error = format!("{} returned {}: {}", miner, status, body);
                        warn!("Miner rejected transaction {}: {}", txn.hash, last_error);
                    }
                    Err(e) => {
                        last_error = format!("{}: {}", miner, e);
                        warn!("Failed to reach miner for transaction {}: {}", txn.hash, e);
                    }
                }
            }
            if attempt < self.config.retry_count {
                tokio::time::sleep(self.config.retry_sleep()).await;
            }
        }
        Err(BlobberError::TransactionSubmission(last_error))
    }

    async fn fetch_confirmation(&self, txn_hash: &str) -> Option<Transaction> {
        for sharder in &self.config.sharders {
            let url = format!("{}{}", sharder.trim_end_matches('/'), TXN_CONFIRMATION_PATH);
            let response = self
                .client
                .get(&url)
                .query(&[("hash", txn_hash)])
                .send()
                .await;
            match response {
                Ok(resp) if resp.status().is_success() => match resp.json::<Confirmation>().await {
                    Ok(Confirmation { txn: Some(txn) }) => return Some(txn),
                    Ok(Confirmation { txn: None }) => {
                        trace!("Sharder {} has no transaction body for {}", sharder, txn_hash)
                    }
                    Err(e) => debug!("Undecodable confirmation from {}: {}", sharder, e),
                },
                Ok(resp) => trace!("Transaction {} not on {}: {}", txn_hash, sharder, resp.status()),
                Err(e) => debug!("Failed to query {} for {}: {}", sharder, txn_hash, e),
            }
        }
        None
    }
}

#[async_trait]
impl ChainClient for HttpChainClient {
    /// Fetches open challenges from the storage contract.
    ///
    /// Calls `GET /v1/screst/{contract}/openchallenges?blobber=&limit=&from=&sort=desc` on
    /// each sharder in turn.
    ///
    /// # Errors
    ///
    /// * `BlobberError::Network` - If no sharder answered successfully.
    /// * `BlobberError::Serialization` - If a sharder answered with an undecodable body.
    async fn get_open_challenges(
        &self,
        blobber_id: &str,
        from: i64,
        limit: usize,
    ) -> Result<BlobberChallenges> {
        let mut last_error = BlobberError::Network("no sharders configured".into());
        for attempt in 1..=self.config.retry_count {
            for sharder in &self.config.sharders {
                let url = format!(
                    "{}/v1/screst/{}/{}",
                    sharder.trim_end_matches('/'),
                    self.config.storage_contract_address,
                    OPEN_CHALLENGES_PATH
                );
                let response = self
                    .client
                    .get(&url)
                    .query(&[
                        ("blobber", blobber_id.to_string()),
                        ("limit", limit.to_string()),
                        ("from", from.to_string()),
                        ("sort", "desc".to_string()),
                    ])
                    .send()
                    .await;
                match response {
                    Ok(resp) if resp.status().is_success() => {
                        let body = resp.text().await?;
                        let challenges: BlobberChallenges = serde_json::from_str(&body)?;
                        trace!(
                            "Sharder {} returned {} open challenges",
                            sharder,
                            challenges.challenges.len()
                        );
                        return Ok(challenges);
                    }
                    Ok(resp) => {
                        last_error = BlobberError::Network(format!(
                            "{} returned {}",
                            sharder,
                            resp.status()
                        ));
                    }
                    Err(e) => last_error = e.into(),
                }
            }
            if attempt < self.config.retry_count {
                tokio::time::sleep(self.config.retry_sleep()).await;
            }
        }
        error!("Failed to fetch open challenges: {}", last_error);
        Err(last_error)
    }

    async fn submit_transaction(
        &self,
        function: &str,
        input: serde_json::Value,
    ) -> Result<String> {
        self.ensure_nonce().await;
        let nonce = self.nonce.next();
        let txn = self.build_transaction(function, input, nonce)?;
        match self.post_to_miners(&txn).await {
            Ok(()) => {
                info!("Submitted {} transaction {}", function, txn.hash);
                Ok(txn.hash)
            }
            Err(e) => {
                self.nonce.release(nonce);
                Err(e)
            }
        }
    }

    /// Polls sharders for the transaction's confirmation.
    ///
    /// A transaction found with a non-success status fails immediately; a transaction not
    /// yet found is retried up to `max_confirmation_retries` times.
    async fn verify_transaction(&self, txn_hash: &str) -> Result<Transaction> {
        for attempt in 1..=self.config.max_confirmation_retries {
            if let Some(txn) = self.fetch_confirmation(txn_hash).await {
                if txn.transaction_status == TXN_STATUS_SUCCESS {
                    debug!("Transaction {} confirmed", txn_hash);
                    return Ok(txn);
                }
                return Err(BlobberError::TransactionVerification(format!(
                    "transaction {} failed: {}",
                    txn_hash, txn.transaction_output
                )));
            }
            trace!(
                "Transaction {} not confirmed yet (attempt {}/{})",
                txn_hash,
                attempt,
                self.config.max_confirmation_retries
            );
            if attempt < self.config.max_confirmation_retries {
                tokio::time::sleep(self.config.retry_sleep()).await;
            }
        }
        Err(BlobberError::TransactionVerification(format!(
            "transaction {} not confirmed",
            txn_hash
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BlobberConfig;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(server: &MockServer) -> ChainConfig {
        let mut config = BlobberConfig::from_defaults().unwrap().chain;
        config.sharders = vec![server.uri()];
        config.miners = vec![server.uri()];
        config.retry_sleep_ms = 5;
        config.retry_count = 2;
        config.max_confirmation_retries = 2;
        config
    }

    #[tokio::test]
    async fn test_get_open_challenges_decodes() {
        let server = MockServer::start().await;
        let config = test_config(&server);
        let route = format!(
            "/v1/screst/{}/openchallenges",
            config.storage_contract_address
        );
        Mock::given(method("GET"))
            .and(path(route))
            .and(query_param("blobber", "b1"))
            .and(query_param("from", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"blobber_id":"b1","challenges":[{"id":"c1","created":120,"random_number":7,
                "allocation_id":"a1","allocation_root":"r1","validators":[{"id":"v1","url":"http://v1"}]}]}"#,
            ))
            .mount(&server)
            .await;

        let client = HttpChainClient::new(config, Arc::new(NodeIdentity::generate())).unwrap();
        let result = client.get_open_challenges("b1", 100, 50).await.unwrap();
        assert_eq!(result.challenges.len(), 1);
        assert_eq!(result.challenges[0].id, "c1");
        assert_eq!(result.challenges[0].validators[0].url, "http://v1");
    }

    #[tokio::test]
    async fn test_get_open_challenges_decode_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;
        let client =
            HttpChainClient::new(test_config(&server), Arc::new(NodeIdentity::generate())).unwrap();
        let err = client.get_open_challenges("b1", 0, 50).await.unwrap_err();
        assert_eq!(err.code(), "serialization_error");
    }

    #[tokio::test]
    async fn test_submit_and_verify() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(CLIENT_BALANCE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"nonce":5}"#))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(TXN_PUT_PATH))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(TXN_CONFIRMATION_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"txn":{"hash":"h","client_id":"c","public_key":"p","to_client_id":"t",
                "transaction_data":"{}","signature":"s","creation_date":1,"transaction_type":1000,
                "transaction_output":"ok","transaction_status":1}}"#,
            ))
            .mount(&server)
            .await;

        let client =
            HttpChainClient::new(test_config(&server), Arc::new(NodeIdentity::generate())).unwrap();
        let txn_hash = client
            .submit_transaction(crate::chain::CHALLENGE_RESPONSE, serde_json::json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(txn_hash.len(), 64);
        assert_eq!(client.nonce.next(), 7);

        let txn = client.verify_transaction("h").await.unwrap();
        assert_eq!(txn.transaction_output, "ok");
    }

    #[tokio::test]
    async fn test_verify_failed_transaction() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(TXN_CONFIRMATION_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"txn":{"hash":"h","client_id":"c","public_key":"p","to_client_id":"t",
                "transaction_data":"{}","signature":"s","creation_date":1,"transaction_type":1000,
                "transaction_output":"challenge expired","transaction_status":2}}"#,
            ))
            .mount(&server)
            .await;
        let client =
            HttpChainClient::new(test_config(&server), Arc::new(NodeIdentity::generate())).unwrap();
        let err = client.verify_transaction("h").await.unwrap_err();
        assert_eq!(err.code(), "transaction_verification_failed");
        assert!(err.to_string().contains("challenge expired"));
    }

    #[tokio::test]
    async fn test_unconfirmed_transaction_exhausts_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(TXN_CONFIRMATION_PATH))
            .respond_with(ResponseTemplate::new(400))
            .expect(2)
            .mount(&server)
            .await;
        let client =
            HttpChainClient::new(test_config(&server), Arc::new(NodeIdentity::generate())).unwrap();
        assert!(client.verify_transaction("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_submit_releases_nonce_on_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let client =
            HttpChainClient::new(test_config(&server), Arc::new(NodeIdentity::generate())).unwrap();
        let err = client
            .submit_transaction(crate::chain::COMMIT_CONNECTION, serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "transaction_submission_failed");
        assert_eq!(client.nonce.next(), 1);
    }
}
