//! InMemoryLockManager - lease 付きのタスクロック
//!
//! One `tokio::sync::Mutex` over a map keyed by task id, so acquire and
//! renew are linearizable per task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{HolderId, TaskId};
use crate::ports::{add_std, Clock, Lock, LockError, LockManager};

#[derive(Default)]
struct LockTable {
    live: HashMap<TaskId, Lock>,
    /// Last generation handed out per task. Kept after release so a
    /// reacquire never reuses a generation; dropped by `forget`.
    generations: HashMap<TaskId, u64>,
}

pub struct InMemoryLockManager {
    table: Mutex<LockTable>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLockManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            clock,
        }
    }

    /// Number of unexpired locks.
    pub async fn live_count(&self) -> usize {
        let now = self.clock.now();
        let table = self.table.lock().await;
        table.live.values().filter(|l| !l.is_expired(now)).count()
    }

    /// Number of tasks with a remembered generation.
    pub async fn tracked_count(&self) -> usize {
        self.table.lock().await.generations.len()
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn acquire(
        &self,
        task_id: TaskId,
        holder: &HolderId,
        lease: Duration,
    ) -> Result<Lock, LockError> {
        let mut table = self.table.lock().await;
        let now = self.clock.now();

        if let Some(current) = table.live.get(&task_id)
            && !current.is_expired(now)
        {
            return Err(LockError::Busy {
                task_id,
                holder: current.holder.clone(),
                expires_at: current.expires_at,
            });
        }
        if let Some(stale) = table.live.get(&task_id) {
            tracing::info!(
                task_id = %task_id,
                stale_holder = %stale.holder,
                holder = %holder,
                "reclaiming expired lock"
            );
        }

        let generation = table.generations.get(&task_id).copied().unwrap_or(0) + 1;
        table.generations.insert(task_id, generation);

        let lock = Lock {
            task_id,
            holder: holder.clone(),
            acquired_at: now,
            expires_at: add_std(now, lease),
            generation,
            lease,
        };
        table.live.insert(task_id, lock.clone());
        Ok(lock)
    }

    async fn renew(&self, lock: &Lock) -> Result<Lock, LockError> {
        let mut table = self.table.lock().await;
        let now = self.clock.now();

        match table.live.get_mut(&lock.task_id) {
            Some(current)
                if current.generation == lock.generation && !current.is_expired(now) =>
            {
                current.expires_at = add_std(now, current.lease);
                Ok(current.clone())
            }
            _ => {
                tracing::warn!(task_id = %lock.task_id, holder = %lock.holder, "lease lost before renewal");
                Err(LockError::Expired(lock.task_id))
            }
        }
    }

    async fn release(&self, lock: &Lock) {
        let mut table = self.table.lock().await;
        let ours = table
            .live
            .get(&lock.task_id)
            .is_some_and(|current| current.generation == lock.generation);
        if ours {
            table.live.remove(&lock.task_id);
        } else {
            tracing::debug!(task_id = %lock.task_id, generation = lock.generation, "release of a lock we no longer hold");
        }
    }

    async fn live(&self, task_id: TaskId) -> Option<Lock> {
        let table = self.table.lock().await;
        let now = self.clock.now();
        table
            .live
            .get(&task_id)
            .filter(|l| !l.is_expired(now))
            .cloned()
    }

    async fn forget(&self, task_id: TaskId) {
        let mut table = self.table.lock().await;
        if let Some(stale) = table.live.remove(&task_id) {
            tracing::debug!(task_id = %task_id, holder = %stale.holder, "dropping lock on a finished task");
        }
        table.generations.remove(&task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::ManualClock;
    use chrono::{TimeZone, Utc};
    use ulid::Ulid;

    const LEASE: Duration = Duration::from_secs(30);

    fn setup() -> (Arc<InMemoryLockManager>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap(),
        ));
        (Arc::new(InMemoryLockManager::new(clock.clone())), clock)
    }

    fn task() -> TaskId {
        TaskId::from_ulid(Ulid::new())
    }

    #[tokio::test]
    async fn second_holder_is_busy_until_release() {
        let (locks, _) = setup();
        let t1 = task();
        let a = HolderId::worker(0);
        let b = HolderId::worker(1);

        let lock = locks.acquire(t1, &a, LEASE).await.unwrap();
        let err = locks.acquire(t1, &b, LEASE).await.unwrap_err();
        assert!(matches!(err, LockError::Busy { holder, .. } if holder == a));

        locks.release(&lock).await;
        assert!(locks.acquire(t1, &b, LEASE).await.is_ok());
    }

    #[tokio::test]
    async fn expired_lock_is_reclaimable_and_fenced() {
        let (locks, clock) = setup();
        let t1 = task();
        let stale = locks.acquire(t1, &HolderId::worker(0), LEASE).await.unwrap();

        clock.advance(LEASE);
        assert!(locks.live(t1).await.is_none());

        let fresh = locks.acquire(t1, &HolderId::worker(1), LEASE).await.unwrap();
        assert_eq!(fresh.generation, stale.generation + 1);

        // the old holder can neither renew nor release the new lock
        assert_eq!(locks.renew(&stale).await, Err(LockError::Expired(t1)));
        locks.release(&stale).await;
        assert_eq!(locks.live(t1).await, Some(fresh));
    }

    #[tokio::test]
    async fn renew_extends_the_lease() {
        let (locks, clock) = setup();
        let t1 = task();
        let lock = locks.acquire(t1, &HolderId::worker(0), LEASE).await.unwrap();

        clock.advance(Duration::from_secs(20));
        let renewed = locks.renew(&lock).await.unwrap();
        assert_eq!(renewed.expires_at, clock.now() + chrono::Duration::seconds(30));

        clock.advance(Duration::from_secs(20));
        assert!(locks.live(t1).await.is_some());
        assert!(locks.renew(&renewed).await.is_ok());
    }

    #[tokio::test]
    async fn renew_after_expiry_fails() {
        let (locks, clock) = setup();
        let t1 = task();
        let lock = locks.acquire(t1, &HolderId::worker(0), LEASE).await.unwrap();
        clock.advance(Duration::from_secs(31));
        assert_eq!(locks.renew(&lock).await, Err(LockError::Expired(t1)));
    }

    #[tokio::test]
    async fn forget_drops_the_generation_record() {
        let (locks, _) = setup();
        let (t1, t2) = (task(), task());
        let a = locks.acquire(t1, &HolderId::worker(0), LEASE).await.unwrap();
        let b = locks.acquire(t2, &HolderId::worker(0), LEASE).await.unwrap();
        locks.release(&a).await;
        locks.release(&b).await;
        assert_eq!(locks.tracked_count().await, 2);

        locks.forget(t1).await;
        assert_eq!(locks.tracked_count().await, 1);
        assert!(locks.live(t1).await.is_none());

        // forgetting a task that still has a lock drops the lock too
        let held = locks.acquire(t2, &HolderId::worker(1), LEASE).await.unwrap();
        assert_eq!(held.generation, 2);
        locks.forget(t2).await;
        assert!(locks.live(t2).await.is_none());
        assert_eq!(locks.tracked_count().await, 0);
        assert_eq!(locks.live_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_acquirers_get_exactly_one_lock() {
        let (locks, _) = setup();
        let t1 = task();

        let mut joins = Vec::new();
        for w in 0..32 {
            let locks = locks.clone();
            joins.push(tokio::spawn(async move {
                locks.acquire(t1, &HolderId::worker(w), LEASE).await
            }));
        }
        let mut granted = 0;
        let mut busy = 0;
        for j in joins {
            match j.await.unwrap() {
                Ok(_) => granted += 1,
                Err(LockError::Busy { .. }) => busy += 1,
                Err(other) => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(granted, 1);
        assert_eq!(busy, 31);
        assert_eq!(locks.live_count().await, 1);
    }
}
