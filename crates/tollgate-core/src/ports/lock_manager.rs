//! LockManager port - leased mutual exclusion over single tasks.
//!
//! The in-memory implementation is a map; the same contract fits a row
//! lock or a distributed lock service.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{GatewayError, HolderId, TaskId};

/// A live claim on one task.
///
/// `generation` increases on every successful acquire of the same task id,
/// so a holder whose lease expired and was reclaimed cannot renew or
/// release the new holder's lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lock {
    pub task_id: TaskId,
    pub holder: HolderId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub generation: u64,
    pub lease: Duration,
}

impl Lock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    /// A live lock is held by someone else.
    #[error("task {task_id} is locked by {holder} until {expires_at}")]
    Busy {
        task_id: TaskId,
        holder: HolderId,
        expires_at: DateTime<Utc>,
    },

    /// The lease lapsed (or was reclaimed) before renewal.
    #[error("lock on task {0} expired")]
    Expired(TaskId),
}

impl From<LockError> for GatewayError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Busy {
                task_id, holder, ..
            } => GatewayError::Busy {
                task_id,
                holder: holder.to_string(),
            },
            LockError::Expired(task_id) => GatewayError::LeaseExpired(task_id),
        }
    }
}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Exactly one of several racing callers gets the lock; the rest get
    /// `Busy`. An expired lock is reclaimable.
    async fn acquire(
        &self,
        task_id: TaskId,
        holder: &HolderId,
        lease: Duration,
    ) -> Result<Lock, LockError>;

    /// Extend the lease by its original duration.
    async fn renew(&self, lock: &Lock) -> Result<Lock, LockError>;

    /// Drop the lock. Releasing a lock that was already reclaimed is a no-op.
    async fn release(&self, lock: &Lock);

    /// The live lock on `task_id`, if any.
    async fn live(&self, task_id: TaskId) -> Option<Lock>;

    /// The task is DONE or FAILED and will never be locked again; drop
    /// whatever is still tracked for it.
    async fn forget(&self, task_id: TaskId);
}
