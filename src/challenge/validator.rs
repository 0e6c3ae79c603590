/// Client side of the validator wire contract.
///
/// Validators receive the proof material for a challenge at
/// `POST {url}/v1/storage/challenge/new` and answer with a signed `ValidationTicket`.
use async_trait::async_trait;
use base64::Engine;
use log::{debug, warn};
use serde::{Deserialize, Serialize, Serializer};

use crate::challenge::entity::ValidationTicket;
use crate::chain::ValidationNode;
use crate::config::ChainConfig;
use crate::error::{BlobberError, Result};
use crate::merkle::MerklePath;
use crate::reference::ObjectPath;
use crate::writemarker::WriteMarker;

const CHALLENGE_SUBMIT_PATH: &str = "/v1/storage/challenge/new";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WriteMarkerWithKey {
    pub write_marker: WriteMarker,
    pub client_key: String,
}

/// Proof material for one challenge, as posted to every validator.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ChallengeRequest {
    pub challenge_id: String,
    pub object_path: Option<ObjectPath>,
    pub write_markers: Vec<WriteMarkerWithKey>,
    /// Challenged leaf bytes, base64 on the wire.
    #[serde(serialize_with = "as_base64")]
    pub data: Vec<u8>,
    pub merkle_path: Option<MerklePath>,
}

fn as_base64<S: Serializer>(data: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(data))
}

#[async_trait]
pub trait ValidatorClient: Send + Sync {
    /// Posts `request` to `validator` and returns its ticket, unverified.
    async fn submit_challenge(
        &self,
        validator: &ValidationNode,
        request: &ChallengeRequest,
    ) -> Result<ValidationTicket>;
}

pub struct HttpValidatorClient {
    client: reqwest::Client,
    retry_count: u32,
    retry_sleep: std::time::Duration,
}

impl HttpValidatorClient {
    pub fn new(config: &ChainConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            retry_count: config.retry_count,
            retry_sleep: config.retry_sleep(),
        })
    }
}

#[async_trait]
impl ValidatorClient for HttpValidatorClient {
    async fn submit_challenge(
        &self,
        validator: &ValidationNode,
        request: &ChallengeRequest,
    ) -> Result<ValidationTicket> {
        let url = format!("{}{}", validator.url.trim_end_matches('/'), CHALLENGE_SUBMIT_PATH);
        let mut last_error = BlobberError::Network(format!("validator {} not tried", validator.id));
        for attempt in 1..=self.retry_count {
            match self.client.post(&url).json(request).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let body = resp.text().await?;
                    let ticket: ValidationTicket = serde_json::from_str(&body)?;
                    debug!(
                        "Validator {} answered challenge {}: {}",
                        validator.id, request.challenge_id, ticket.result
                    );
                    return Ok(ticket);
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    last_error = BlobberError::Network(format!(
                        "validator {} returned {}: {}",
                        validator.id, status, body
                    ));
                }
                Err(e) => last_error = e.into(),
            }
            warn!(
                "Challenge {} to validator {} failed (attempt {}/{}): {}",
                request.challenge_id, validator.id, attempt, self.retry_count, last_error
            );
            if attempt < self.retry_count {
                tokio::time::sleep(self.retry_sleep).await;
            }
        }
        Err(last_error)
    }
}
