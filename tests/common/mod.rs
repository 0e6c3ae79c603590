#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use blobber::allocation::Allocation;
use blobber::chain::{BlobberChallenges, ChainClient, OpenChallenge, Transaction, ValidationNode};
use blobber::challenge::{ChallengeRequest, ValidationTicket, ValidatorClient};
use blobber::config::BlobberConfig;
use blobber::context::{BlobberContext, Services};
use blobber::db::Database;
use blobber::disk::DiskBalancer;
use blobber::error::{BlobberError, Result};
use blobber::filestore::LocalFileStore;
use blobber::node::NodeIdentity;
use blobber::reference::{add_file, Ref};
use blobber::utils::now;
use blobber::writemarker::{accept_write_marker, MarkerContext, WriteMarker};

/// In-memory chain. Submissions confirm unless their 1-based position is in `failing`.
#[derive(Default)]
pub struct FakeChain {
    pub submissions: Mutex<Vec<(String, serde_json::Value)>>,
    pub confirmed: Mutex<HashSet<String>>,
    pub failing: Mutex<HashSet<usize>>,
    pub open: Mutex<Vec<OpenChallenge>>,
}

impl FakeChain {
    pub fn submitted(&self, function: &str) -> Vec<serde_json::Value> {
        self.submissions
            .lock()
            .iter()
            .filter(|(name, _)| name == function)
            .map(|(_, input)| input.clone())
            .collect()
    }

    pub fn confirm(&self, hash: &str) {
        self.confirmed.lock().insert(hash.to_string());
    }

    pub fn fail_submission(&self, position: usize) {
        self.failing.lock().insert(position);
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn get_open_challenges(
        &self,
        blobber_id: &str,
        from: i64,
        limit: usize,
    ) -> Result<BlobberChallenges> {
        let challenges = self
            .open
            .lock()
            .iter()
            .filter(|c| c.created > from)
            .take(limit)
            .cloned()
            .collect();
        Ok(BlobberChallenges {
            blobber_id: blobber_id.to_string(),
            challenges,
        })
    }

    async fn submit_transaction(
        &self,
        function: &str,
        input: serde_json::Value,
    ) -> Result<String> {
        let position = {
            let mut submissions = self.submissions.lock();
            submissions.push((function.to_string(), input));
            submissions.len()
        };
        if self.failing.lock().contains(&position) {
            return Err(BlobberError::TransactionSubmission(format!(
                "miners rejected submission {}",
                position
            )));
        }
        let hash = format!("txn-{}", position);
        self.confirm(&hash);
        Ok(hash)
    }

    async fn verify_transaction(&self, hash: &str) -> Result<Transaction> {
        if !self.confirmed.lock().contains(hash) {
            return Err(BlobberError::TransactionVerification(format!(
                "{} not found on any sharder",
                hash
            )));
        }
        Ok(Transaction {
            hash: hash.to_string(),
            transaction_output: format!("confirmed {}", hash),
            transaction_status: 1,
            ..Default::default()
        })
    }
}

/// Validators answering with a fixed verdict each. `None` never answers.
pub struct FakeValidators {
    pub blobber_id: String,
    pub nodes: Vec<(NodeIdentity, Option<bool>)>,
    pub calls: AtomicUsize,
    pub requests: Mutex<Vec<ChallengeRequest>>,
}

impl FakeValidators {
    pub fn validation_nodes(&self) -> Vec<ValidationNode> {
        self.nodes
            .iter()
            .map(|(identity, _)| ValidationNode {
                id: identity.id().to_string(),
                url: format!("http://validator-{}", &identity.id()[..8]),
            })
            .collect()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<ChallengeRequest> {
        self.requests.lock().last().cloned()
    }
}

#[async_trait]
impl ValidatorClient for FakeValidators {
    async fn submit_challenge(
        &self,
        validator: &ValidationNode,
        request: &ChallengeRequest,
    ) -> Result<ValidationTicket> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        let (identity, answer) = self
            .nodes
            .iter()
            .find(|(identity, _)| identity.id() == validator.id)
            .ok_or_else(|| BlobberError::NotFound(format!("validator {}", validator.id)))?;
        match answer {
            Some(result) => Ok(ValidationTicket::signed(
                identity,
                &request.challenge_id,
                &self.blobber_id,
                *result,
                "",
            )),
            None => Err(BlobberError::Network(format!(
                "validator {} timed out",
                validator.id
            ))),
        }
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub ctx: Arc<BlobberContext>,
    pub chain: Arc<FakeChain>,
    pub validators: Arc<FakeValidators>,
    pub store: Arc<LocalFileStore>,
    pub client: NodeIdentity,
}

/// Builds a context over a temp directory. Must run inside a tokio runtime.
pub fn harness(answers: &[Option<bool>]) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = BlobberConfig::from_defaults().unwrap();
    config.node.db_path = dir.path().join("db").to_string_lossy().into_owned();
    config.disk.mount_point = dir.path().join("volumes").to_string_lossy().into_owned();
    config.chain.sleep_before_verify_secs = 0;

    let identity = Arc::new(NodeIdentity::generate());
    let db = Arc::new(Database::new(&config.node.db_path).unwrap());
    let balancer = Arc::new(DiskBalancer::new(config.disk.clone()).unwrap());
    let store = Arc::new(LocalFileStore::new(balancer.clone()));
    let chain = Arc::new(FakeChain::default());
    let validators = Arc::new(FakeValidators {
        blobber_id: identity.id().to_string(),
        nodes: answers
            .iter()
            .map(|answer| (NodeIdentity::generate(), *answer))
            .collect(),
        calls: AtomicUsize::new(0),
        requests: Mutex::new(Vec::new()),
    });

    let ctx = Arc::new(BlobberContext::new(
        config,
        Services {
            db,
            identity,
            chain: chain.clone(),
            validators: validators.clone(),
            files: store.clone(),
            balancer,
        },
    ));
    Harness {
        dir,
        ctx,
        chain,
        validators,
        store,
        client: NodeIdentity::generate(),
    }
}

impl Harness {
    pub fn marker(&self, allocation: &Allocation, root: &str, size: i64) -> WriteMarker {
        let mut wm = WriteMarker {
            allocation_root: root.to_string(),
            prev_allocation_root: allocation.allocation_root.clone(),
            allocation_id: allocation.id.clone(),
            size,
            blobber_id: self.ctx.blobber_id().to_string(),
            timestamp: now(),
            client_id: self.client.id().to_string(),
            signature: String::new(),
        };
        wm.signature = self.client.sign(&wm.hash());
        wm
    }

    pub fn marker_context(&self, connection_id: &str, size: i64) -> MarkerContext {
        MarkerContext {
            blobber_id: self.ctx.blobber_id().to_string(),
            client_id: self.client.id().to_string(),
            client_public_key: self.client.public_key().to_string(),
            connection_id: connection_id.to_string(),
            connection_size: size,
        }
    }

    fn allocation(&self, tx: &blobber::db::Transaction<'_>, allocation_id: &str) -> Allocation {
        Allocation::get(tx, allocation_id).unwrap_or_else(|_| Allocation {
            id: allocation_id.to_string(),
            owner_id: self.client.id().to_string(),
            owner_public_key: self.client.public_key().to_string(),
            expiration: now() + 3600,
            ..Default::default()
        })
    }

    /// Accepts one signed marker per root, in order.
    pub fn accept_markers(&self, allocation_id: &str, roots: &[&str]) -> Allocation {
        let mut tx = self.ctx.db.begin();
        let mut allocation = self.allocation(&tx, allocation_id);
        for (i, root) in roots.iter().enumerate() {
            let wm = self.marker(&allocation, root, 1);
            accept_write_marker(
                &mut tx,
                &mut allocation,
                wm,
                &self.marker_context(&format!("conn-{}", i), 1),
            )
            .unwrap();
        }
        tx.commit().unwrap();
        allocation
    }

    /// Stores `content` at `path` and commits it with a write marker onto the new root.
    pub async fn upload(&self, allocation_id: &str, path: &str, content: &[u8]) -> Ref {
        let stored = self.store.write_file(allocation_id, content).await.unwrap();
        let mut tx = self.ctx.db.begin();
        let file = add_file(
            &mut tx,
            Ref::new_file(
                allocation_id,
                path,
                stored.size,
                &stored.content_hash,
                &stored.merkle_root,
                stored.num_blocks,
            ),
        )
        .unwrap();
        let root = Ref::root(&tx, allocation_id).unwrap().unwrap();
        let mut allocation = self.allocation(&tx, allocation_id);
        let wm = self.marker(&allocation, &root.hash, stored.size);
        accept_write_marker(
            &mut tx,
            &mut allocation,
            wm,
            &self.marker_context("upload", stored.size),
        )
        .unwrap();
        tx.commit().unwrap();
        file
    }

    pub fn open_challenge(&self, id: &str, allocation_id: &str, created: i64) -> OpenChallenge {
        OpenChallenge {
            id: id.to_string(),
            prev_id: String::new(),
            created,
            random_number: 7,
            allocation_id: allocation_id.to_string(),
            allocation_root: String::new(),
            blobber_id: self.ctx.blobber_id().to_string(),
            validators: self.validators.validation_nodes(),
        }
    }
}
