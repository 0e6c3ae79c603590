/// Process-wide services shared by the background workers and the HTTP handlers.
///
/// Built once at startup and handed out as `Arc<BlobberContext>`. Tests build it with
/// in-process fakes for the chain, validator and file-store seams.
use log::{error, info};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::chain::ChainClient;
use crate::challenge::persist::PersistQueue;
use crate::challenge::status_map::ChallengeStatusMap;
use crate::challenge::validator::ValidatorClient;
use crate::config::BlobberConfig;
use crate::db::Database;
use crate::disk::DiskBalancer;
use crate::error::Result;
use crate::filestore::FileStore;
use crate::lock::LockRegistry;
use crate::node::NodeIdentity;
use crate::writemarker::WriteMarkerMutex;

pub struct BlobberContext {
    pub config: BlobberConfig,
    pub db: Arc<Database>,
    pub locks: Arc<LockRegistry>,
    pub identity: Arc<NodeIdentity>,
    pub chain: Arc<dyn ChainClient>,
    pub validators: Arc<dyn ValidatorClient>,
    pub files: Arc<dyn FileStore>,
    pub balancer: Arc<DiskBalancer>,
    pub challenge_status: ChallengeStatusMap,
    pub write_lock: WriteMarkerMutex,
    pub persist: PersistQueue,
}

/// The collaborators a context is assembled from.
pub struct Services {
    pub db: Arc<Database>,
    pub identity: Arc<NodeIdentity>,
    pub chain: Arc<dyn ChainClient>,
    pub validators: Arc<dyn ValidatorClient>,
    pub files: Arc<dyn FileStore>,
    pub balancer: Arc<DiskBalancer>,
}

impl BlobberContext {
    /// Assembles the context. Must run inside a tokio runtime: the persistence queue
    /// spawns its drain task here.
    pub fn new(config: BlobberConfig, services: Services) -> Self {
        let locks = Arc::new(LockRegistry::new());
        let write_lock = WriteMarkerMutex::new(
            services.db.clone(),
            locks.clone(),
            config.write_marker.lock_timeout_secs,
        );
        let persist = PersistQueue::start(services.db.clone());
        Self {
            config,
            db: services.db,
            locks,
            identity: services.identity,
            chain: services.chain,
            validators: services.validators,
            files: services.files,
            balancer: services.balancer,
            challenge_status: ChallengeStatusMap::new(),
            write_lock,
            persist,
        }
    }

    pub fn blobber_id(&self) -> &str {
        self.identity.id()
    }
}

/// Spawns a named background task and logs how it ends.
///
/// A task that returns an error or panics is not restarted.
pub fn spawn_supervised<F>(name: &'static str, task: F) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let inner = tokio::spawn(task);
    tokio::spawn(async move {
        match inner.await {
            Ok(Ok(())) => info!("Background task {} stopped", name),
            Ok(Err(e)) => error!("Background task {} exited with error: {}", name, e),
            Err(e) if e.is_panic() => error!("Background task {} panicked: {}", name, e),
            Err(e) => error!("Background task {} was aborted: {}", name, e),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BlobberError;

    #[tokio::test]
    async fn test_supervisor_survives_failures() {
        spawn_supervised("ok", async { Ok::<(), BlobberError>(()) })
            .await
            .unwrap();
        spawn_supervised("err", async {
            Err::<(), _>(BlobberError::Internal("boom".into()))
        })
        .await
        .unwrap();
        spawn_supervised("panic", async {
            let items: Vec<u8> = Vec::new();
            if items.is_empty() {
                panic!("boom");
            }
            Ok::<(), BlobberError>(())
        })
        .await
        .unwrap();
    }
}
