//! In-memory task store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{QueueCounts, TaskRecord, TaskState};
use crate::domain::{
    AuditEvent, AuditEventKind, GatewayError, HolderId, Role, TaskId, TaskResult, TaskSubmission,
};
use crate::ports::{AuditSink, Clock, IdGenerator, TaskStore, TransitionOutcome};

/// What a transition attaches to the record besides the new state.
enum Change {
    Plain,
    Fail(String),
    Complete(TaskResult),
}

struct StoreState {
    /// Single source of truth for tasks.
    records: HashMap<TaskId, TaskRecord>,

    /// PENDING tasks keyed by arrival order (oldest first).
    pending: BTreeMap<u64, TaskId>,

    /// Arrival ordinal per task; survives requeue so a retried task keeps
    /// its place in line.
    arrival: HashMap<TaskId, u64>,

    next_arrival: u64,
}

impl StoreState {
    fn new() -> Self {
        Self {
            records: HashMap::new(),
            pending: BTreeMap::new(),
            arrival: HashMap::new(),
            next_arrival: 0,
        }
    }

    fn record(&self, id: TaskId) -> Result<&TaskRecord, GatewayError> {
        self.records.get(&id).ok_or(GatewayError::NotFound(id))
    }

    fn record_mut(&mut self, id: TaskId) -> Result<&mut TaskRecord, GatewayError> {
        self.records.get_mut(&id).ok_or(GatewayError::NotFound(id))
    }

    fn mark_pending(&mut self, id: TaskId) {
        if let Some(&ordinal) = self.arrival.get(&id) {
            self.pending.insert(ordinal, id);
        }
    }

    fn unmark_pending(&mut self, id: TaskId) {
        if let Some(ordinal) = self.arrival.get(&id) {
            self.pending.remove(ordinal);
        }
    }

    fn oldest_eligible(&self, role_filter: Option<Role>, now: DateTime<Utc>) -> Option<TaskId> {
        self.pending
            .values()
            .copied()
            .find(|id| {
                self.records
                    .get(id)
                    .is_some_and(|r| r.is_eligible(role_filter, now))
            })
    }
}

/// Task store backed by a single async mutex.
///
/// The audit record for a mutation is appended while the lock is held and
/// before the record changes, so if the audit sink fails the task is left
/// untouched.
pub struct InMemoryTaskStore {
    state: Mutex<StoreState>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    max_attempts: u32,
}

impl InMemoryTaskStore {
    pub fn new(
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        max_attempts: u32,
    ) -> Self {
        Self {
            state: Mutex::new(StoreState::new()),
            audit,
            clock,
            ids,
            max_attempts: max_attempts.max(1),
        }
    }

    async fn apply(
        &self,
        id: TaskId,
        from: TaskState,
        to: TaskState,
        change: Change,
    ) -> Result<TransitionOutcome, GatewayError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();

        let record = state.record(id)?;
        let actual = record.state;
        if actual == to && to.is_terminal() {
            tracing::debug!(task_id = %id, state = ?to, "transition is a no-op");
            return Ok(TransitionOutcome::AlreadyInState);
        }
        if actual != from || !from.can_transition(to) {
            tracing::error!(task_id = %id, expected = ?from, actual = ?actual, to = ?to, "invalid transition");
            return Err(GatewayError::InvalidTransition {
                task_id: id,
                expected: from,
                actual,
                to,
            });
        }

        let mut payload = serde_json::json!({
            "from": from,
            "to": to,
            "attempts": record.attempts,
            "holder": record.claimed_by,
        });
        match &change {
            Change::Fail(reason) => payload["reason"] = serde_json::json!(reason),
            Change::Complete(result) => {
                payload["cost"] = serde_json::json!(result.cost);
                payload["model"] = serde_json::json!(result.model);
            }
            Change::Plain => {}
        }
        let event = AuditEvent::new(now, AuditEventKind::TaskTransition, record.principal.clone(), payload)
            .for_task(id);
        self.audit.append(event).await?;

        let record = state.record_mut(id)?;
        match (to, change) {
            (TaskState::Running, _) => record.start_attempt(now),
            (TaskState::Done, Change::Complete(result)) => record.mark_done(Some(result), now),
            (TaskState::Done, _) => record.mark_done(None, now),
            (TaskState::Failed, Change::Fail(reason)) => record.mark_failed(Some(reason), now),
            (TaskState::Failed, _) => record.mark_failed(None, now),
            // PENDING and CLAIMED are only entered through requeue/claim_next
            (TaskState::Pending | TaskState::Claimed, _) => {}
        }
        Ok(TransitionOutcome::Applied)
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn enqueue(&self, submission: TaskSubmission) -> Result<TaskId, GatewayError> {
        submission.validate()?;

        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let id = self.ids.task_id();
        let record = TaskRecord::new(id, submission, self.max_attempts, now);

        let event = AuditEvent::new(
            now,
            AuditEventKind::TaskSubmitted,
            record.principal.clone(),
            serde_json::json!({
                "role": record.role,
                "min_spend": record.min_spend,
                "max_spend": record.max_spend,
                "priority": record.priority,
                "description": record.description,
            }),
        )
        .for_task(id);
        self.audit.append(event).await?;

        let ordinal = state.next_arrival;
        state.next_arrival += 1;
        state.arrival.insert(id, ordinal);
        state.records.insert(id, record);
        state.mark_pending(id);

        tracing::debug!(task_id = %id, "task enqueued");
        Ok(id)
    }

    async fn claim_next(
        &self,
        holder: &HolderId,
        role_filter: Option<Role>,
    ) -> Result<Option<TaskRecord>, GatewayError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();

        let Some(id) = state.oldest_eligible(role_filter, now) else {
            return Ok(None);
        };

        let principal = state.record(id)?.principal.clone();
        let event = AuditEvent::new(
            now,
            AuditEventKind::TaskTransition,
            principal,
            serde_json::json!({
                "from": TaskState::Pending,
                "to": TaskState::Claimed,
                "holder": holder,
            }),
        )
        .for_task(id);
        self.audit.append(event).await?;

        state.unmark_pending(id);
        let record = state.record_mut(id)?;
        record.mark_claimed(holder.clone(), now);
        Ok(Some(record.clone()))
    }

    async fn transition(
        &self,
        id: TaskId,
        from: TaskState,
        to: TaskState,
    ) -> Result<TransitionOutcome, GatewayError> {
        self.apply(id, from, to, Change::Plain).await
    }

    async fn fail(
        &self,
        id: TaskId,
        from: TaskState,
        reason: String,
    ) -> Result<TransitionOutcome, GatewayError> {
        self.apply(id, from, TaskState::Failed, Change::Fail(reason))
            .await
    }

    async fn complete(
        &self,
        id: TaskId,
        result: TaskResult,
    ) -> Result<TransitionOutcome, GatewayError> {
        self.apply(id, TaskState::Running, TaskState::Done, Change::Complete(result))
            .await
    }

    async fn requeue(
        &self,
        id: TaskId,
        holder: &HolderId,
        not_before: Option<DateTime<Utc>>,
        reason: String,
    ) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();

        let record = state.record(id)?;
        if !record.state.is_claimed() {
            return Err(GatewayError::InvalidTransition {
                task_id: id,
                expected: TaskState::Claimed,
                actual: record.state,
                to: TaskState::Pending,
            });
        }
        match &record.claimed_by {
            Some(current) if current == holder => {}
            other => {
                return Err(GatewayError::Busy {
                    task_id: id,
                    holder: other
                        .as_ref()
                        .map(|h| h.to_string())
                        .unwrap_or_else(|| "nobody".to_string()),
                });
            }
        }

        let event = AuditEvent::new(
            now,
            AuditEventKind::TaskRequeued,
            record.principal.clone(),
            serde_json::json!({
                "from": record.state,
                "holder": holder,
                "retries": record.retries + 1,
                "attempts": record.attempts,
                "not_before": not_before,
                "reason": reason,
            }),
        )
        .for_task(id);
        self.audit.append(event).await?;

        state.record_mut(id)?.requeue(not_before, Some(reason), now);
        state.mark_pending(id);
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<TaskRecord, GatewayError> {
        let state = self.state.lock().await;
        state.record(id).cloned()
    }

    async fn list(&self, filter: Option<TaskState>) -> Result<Vec<TaskRecord>, GatewayError> {
        let state = self.state.lock().await;
        let mut out: Vec<(u64, TaskRecord)> = state
            .records
            .values()
            .filter(|r| filter.is_none_or(|s| r.state == s))
            .map(|r| (state.arrival.get(&r.id).copied().unwrap_or(u64::MAX), r.clone()))
            .collect();
        out.sort_by_key(|(ordinal, _)| *ordinal);
        Ok(out.into_iter().map(|(_, r)| r).collect())
    }

    async fn claimed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<TaskRecord>, GatewayError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .values()
            .filter(|r| r.state.is_claimed() && r.claimed_at.is_some_and(|at| at <= cutoff))
            .cloned()
            .collect())
    }

    async fn counts_by_state(&self) -> Result<QueueCounts, GatewayError> {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for record in state.records.values() {
            counts.add(record.state);
        }
        Ok(counts)
    }
}
