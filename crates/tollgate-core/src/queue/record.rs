//! Task record: the canonical copy of a task inside the store.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::TaskState;
use crate::domain::{HolderId, Role, TaskId, TaskResult, TaskSubmission};

/// Single source of truth for one task.
///
/// Only the task store mutates records, and only through its transition
/// API. Workers get clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub description: String,
    pub role: Role,
    pub principal: String,
    pub min_spend: Decimal,
    pub max_spend: Decimal,
    pub priority: u8,
    pub state: TaskState,

    /// Number of CLAIMED -> RUNNING transitions so far.
    pub attempts: u32,

    /// Number of requeues so far.
    pub retries: u32,

    pub max_attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<HolderId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,

    /// Backoff gate: not claimable before this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,

    /// Human-readable reason for the last failure (terminal or not).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(id: TaskId, submission: TaskSubmission, max_attempts: u32, now: DateTime<Utc>) -> Self {
        let principal = submission.principal();
        Self {
            id,
            description: submission.description,
            role: submission.role,
            principal,
            min_spend: submission.min_spend,
            max_spend: submission.max_spend,
            priority: submission.priority,
            state: TaskState::Pending,
            attempts: 0,
            retries: 0,
            max_attempts,
            claimed_by: None,
            claimed_at: None,
            not_before: None,
            last_error: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Claimable right now by a worker serving `role_filter`?
    pub fn is_eligible(&self, role_filter: Option<Role>, now: DateTime<Utc>) -> bool {
        self.state == TaskState::Pending
            && role_filter.is_none_or(|role| role == self.role)
            && self.not_before.is_none_or(|at| at <= now)
    }

    pub(crate) fn mark_claimed(&mut self, holder: HolderId, now: DateTime<Utc>) {
        self.state = TaskState::Claimed;
        self.claimed_by = Some(holder);
        self.claimed_at = Some(now);
        self.updated_at = now;
    }

    pub(crate) fn start_attempt(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::Running;
        self.attempts += 1;
        self.updated_at = now;
    }

    pub(crate) fn mark_done(&mut self, result: Option<TaskResult>, now: DateTime<Utc>) {
        self.state = TaskState::Done;
        if result.is_some() {
            self.result = result;
        }
        self.updated_at = now;
    }

    pub(crate) fn mark_failed(&mut self, reason: Option<String>, now: DateTime<Utc>) {
        self.state = TaskState::Failed;
        if reason.is_some() {
            self.last_error = reason;
        }
        self.updated_at = now;
    }

    pub(crate) fn requeue(&mut self, not_before: Option<DateTime<Utc>>, reason: Option<String>, now: DateTime<Utc>) {
        self.state = TaskState::Pending;
        self.retries += 1;
        self.claimed_by = None;
        self.claimed_at = None;
        self.not_before = not_before;
        if reason.is_some() {
            self.last_error = reason;
        }
        self.updated_at = now;
    }
}
