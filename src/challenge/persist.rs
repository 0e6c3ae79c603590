/// Background persistence of terminal challenge state.
///
/// The processor hands the final challenge and timing records to this queue instead of
/// writing them inline. Delivery is at least once: a job is written by the drain task, or,
/// once the queue is closed, by the caller directly. `flush` closes the queue and waits
/// until every queued job has been written, and is called on shutdown.
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::challenge::entity::Challenge;
use crate::challenge::timing::ChallengeTiming;
use crate::db::Database;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct PersistJob {
    pub challenge: Challenge,
    pub timing: ChallengeTiming,
}

pub struct PersistQueue {
    db: Arc<Database>,
    sender: Mutex<Option<UnboundedSender<PersistJob>>>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl PersistQueue {
    /// Creates the queue and spawns its drain task on the current runtime.
    pub fn start(db: Arc<Database>) -> Self {
        let (sender, receiver) = unbounded_channel();
        let drain = tokio::spawn(drain(db.clone(), receiver));
        Self {
            db,
            sender: Mutex::new(Some(sender)),
            drain: Mutex::new(Some(drain)),
        }
    }

    pub fn enqueue(&self, job: PersistJob) {
        let rejected = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(job).err().map(|e| e.0),
            None => Some(job),
        };
        if let Some(job) = rejected {
            warn!(
                "Persistence queue closed, writing challenge {} inline",
                job.challenge.challenge_id
            );
            if let Err(e) = write(&self.db, job) {
                error!("Failed to persist challenge: {}", e);
            }
        }
    }

    /// Stops accepting jobs and waits for the queued ones to be written.
    pub async fn flush(&self) {
        self.sender.lock().take();
        let drain = self.drain.lock().take();
        if let Some(drain) = drain {
            if let Err(e) = drain.await {
                error!("Persistence drain task failed: {}", e);
            }
        }
        info!("Challenge persistence queue flushed");
    }
}

async fn drain(db: Arc<Database>, mut receiver: UnboundedReceiver<PersistJob>) {
    while let Some(job) = receiver.recv().await {
        let challenge_id = job.challenge.challenge_id.clone();
        match write(&db, job) {
            Ok(()) => debug!("Persisted challenge {}", challenge_id),
            Err(e) => error!("Failed to persist challenge {}: {}", challenge_id, e),
        }
    }
}

fn write(db: &Database, mut job: PersistJob) -> Result<()> {
    let mut tx = db.begin();
    job.challenge.save(&mut tx)?;
    job.timing.save(&mut tx)?;
    tx.commit()
}
