//! TaskStore port - the canonical record of every task.
//!
//! Every mutation is a compare-and-set against the current state, which is
//! what keeps concurrent workers from losing each other's updates. Every
//! applied mutation is written to the audit sink before it becomes visible.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{GatewayError, HolderId, Role, TaskId, TaskResult, TaskSubmission};
use crate::queue::{QueueCounts, TaskRecord, TaskState};

/// Result of a transition that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// The task already sat in the requested terminal state; nothing changed.
    AlreadyInState,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Validate and queue a submission as PENDING.
    async fn enqueue(&self, submission: TaskSubmission) -> Result<TaskId, GatewayError>;

    /// Atomically move the oldest eligible PENDING task to CLAIMED for
    /// `holder`. `None` when nothing is eligible.
    async fn claim_next(
        &self,
        holder: &HolderId,
        role_filter: Option<Role>,
    ) -> Result<Option<TaskRecord>, GatewayError>;

    /// Compare-and-set state change.
    ///
    /// Fails with `InvalidTransition` when the current state is not `from`,
    /// except that re-entering the terminal state a task already holds is a
    /// no-op (`AlreadyInState`).
    async fn transition(
        &self,
        id: TaskId,
        from: TaskState,
        to: TaskState,
    ) -> Result<TransitionOutcome, GatewayError>;

    /// `from -> FAILED` recording a human-readable reason.
    async fn fail(
        &self,
        id: TaskId,
        from: TaskState,
        reason: String,
    ) -> Result<TransitionOutcome, GatewayError>;

    /// `RUNNING -> DONE` recording the execution result.
    async fn complete(
        &self,
        id: TaskId,
        result: TaskResult,
    ) -> Result<TransitionOutcome, GatewayError>;

    /// CLAIMED/RUNNING -> PENDING with `retries + 1`.
    ///
    /// Only applies while `holder` still owns the claim, so a late reaper
    /// cannot requeue a claim some other worker has since taken.
    async fn requeue(
        &self,
        id: TaskId,
        holder: &HolderId,
        not_before: Option<DateTime<Utc>>,
        reason: String,
    ) -> Result<(), GatewayError>;

    async fn get(&self, id: TaskId) -> Result<TaskRecord, GatewayError>;

    /// All tasks, optionally restricted to one state, oldest first.
    async fn list(&self, state: Option<TaskState>) -> Result<Vec<TaskRecord>, GatewayError>;

    /// CLAIMED/RUNNING tasks whose claim was taken before `cutoff`.
    async fn claimed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<TaskRecord>, GatewayError>;

    async fn counts_by_state(&self) -> Result<QueueCounts, GatewayError>;
}
