/// Per-allocation advisory write lock.
///
/// A connection takes the lock before committing a write marker. The lock row is a lease:
/// its holder refreshes it by locking again, and any other connection may take it over
/// once it is older than the configured timeout. The registry mutex around each
/// check-then-act keeps two lock attempts for one allocation from interleaving.
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::Database;
use crate::error::Result;
use crate::lock::LockRegistry;
use crate::utils::now;

const WRITE_LOCK_PREFIX: &str = "write_lock:";
const WRITE_LOCK_TABLE: &str = "write_lock";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    Ok,
    /// Another connection holds a live lease; retry later.
    Pending,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LockResult {
    pub status: LockStatus,
    pub created_at: i64,
}

/// Lock row, keyed by allocation ID.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WriteLock {
    pub allocation_id: String,
    pub connection_id: String,
    pub created_at: i64,
}

impl WriteLock {
    pub fn key(allocation_id: &str) -> String {
        format!("{}{}", WRITE_LOCK_PREFIX, allocation_id)
    }
}

pub struct WriteMarkerMutex {
    db: Arc<Database>,
    locks: Arc<LockRegistry>,
    timeout_secs: i64,
}

impl WriteMarkerMutex {
    pub fn new(db: Arc<Database>, locks: Arc<LockRegistry>, timeout_secs: i64) -> Self {
        Self {
            db,
            locks,
            timeout_secs,
        }
    }

    /// Takes, refreshes or steals the write lock of `allocation_id` for `connection_id`.
    ///
    /// # Returns
    ///
    /// `LockStatus::Ok` with the lease start when the connection now holds the lock, or
    /// `LockStatus::Pending` with the current holder's lease start.
    pub async fn lock(&self, allocation_id: &str, connection_id: &str) -> Result<LockResult> {
        let _guard = self.locks.lock(WRITE_LOCK_TABLE, allocation_id).await;
        let mut tx = self.db.begin();
        let key = WriteLock::key(allocation_id);
        let current = now();

        if let Some(existing) = tx.get::<WriteLock>(&key)? {
            let age = current - existing.created_at;
            if existing.connection_id != connection_id && age <= self.timeout_secs {
                debug!(
                    "Allocation {} is locked by {} ({}s old)",
                    allocation_id, existing.connection_id, age
                );
                return Ok(LockResult {
                    status: LockStatus::Pending,
                    created_at: existing.created_at,
                });
            }
            if existing.connection_id != connection_id {
                info!(
                    "Connection {} took over expired lock on {} from {}",
                    connection_id, allocation_id, existing.connection_id
                );
            }
        }

        let lock = WriteLock {
            allocation_id: allocation_id.to_string(),
            connection_id: connection_id.to_string(),
            created_at: current,
        };
        tx.put(&key, &lock)?;
        tx.commit()?;
        Ok(LockResult {
            status: LockStatus::Ok,
            created_at: current,
        })
    }

    /// Releases the lock if `connection_id` holds it; otherwise does nothing.
    pub async fn unlock(&self, allocation_id: &str, connection_id: &str) -> Result<()> {
        let _guard = self.locks.lock(WRITE_LOCK_TABLE, allocation_id).await;
        let mut tx = self.db.begin();
        let key = WriteLock::key(allocation_id);
        match tx.get::<WriteLock>(&key)? {
            Some(existing) if existing.connection_id == connection_id => {
                tx.delete(&key);
                tx.commit()?;
                debug!("Connection {} unlocked {}", connection_id, allocation_id);
            }
            _ => tx.rollback(),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_database;

    fn mutex(db: Database) -> (Arc<Database>, WriteMarkerMutex) {
        let db = Arc::new(db);
        let mutex = WriteMarkerMutex::new(db.clone(), Arc::new(LockRegistry::new()), 30);
        (db, mutex)
    }

    #[tokio::test]
    async fn test_relock_and_pending() {
        let (_dir, db) = test_database();
        let (_db, mutex) = mutex(db);
        assert_eq!(mutex.lock("a1", "c1").await.unwrap().status, LockStatus::Ok);
        assert_eq!(mutex.lock("a1", "c1").await.unwrap().status, LockStatus::Ok);
        assert_eq!(mutex.lock("a1", "c2").await.unwrap().status, LockStatus::Pending);
    }

    #[tokio::test]
    async fn test_expired_lock_is_stolen() {
        let (_dir, db) = test_database();
        let (db, mutex) = mutex(db);
        let mut tx = db.begin();
        tx.put(
            &WriteLock::key("a1"),
            &WriteLock {
                allocation_id: "a1".into(),
                connection_id: "c1".into(),
                created_at: now() - 31,
            },
        )
        .unwrap();
        tx.commit().unwrap();

        assert_eq!(mutex.lock("a1", "c2").await.unwrap().status, LockStatus::Ok);
        let row: WriteLock = db.begin().get(&WriteLock::key("a1")).unwrap().unwrap();
        assert_eq!(row.connection_id, "c2");
    }

    #[tokio::test]
    async fn test_unlock_only_by_holder() {
        let (_dir, db) = test_database();
        let (db, mutex) = mutex(db);
        mutex.lock("a1", "c1").await.unwrap();
        mutex.unlock("a1", "c2").await.unwrap();
        assert!(db.begin().exists(&WriteLock::key("a1")).unwrap());
        mutex.unlock("a1", "c1").await.unwrap();
        assert!(!db.begin().exists(&WriteLock::key("a1")).unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_lockers_exactly_one_wins() {
        let (_dir, db) = test_database();
        let (_db, mutex) = mutex(db);
        let mutex = Arc::new(mutex);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let mutex = mutex.clone();
                tokio::spawn(async move { mutex.lock("a1", &format!("c{}", i)).await.unwrap() })
            })
            .collect();
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().status == LockStatus::Ok {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
