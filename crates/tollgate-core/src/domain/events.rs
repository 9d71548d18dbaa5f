//! Audit events.
//!
//! Components describe what happened as an `AuditEvent`; an `AuditSink`
//! seals it into an `AuditRecord` by assigning the next sequence number.
//! Records are never mutated after that.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;

/// What kind of decision or outcome a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    TaskSubmitted,
    TaskTransition,
    TaskRequeued,
    AdmissionDecision,
    BudgetReserved,
    BudgetCommitted,
    BudgetReleased,
    BudgetDenied,
    BudgetAllocated,
    ExecutionOutcome,
    BreakerTripped,
    BreakerHalfOpen,
    BreakerClosed,
    OrchestratorDrain,
}

impl AuditEventKind {
    /// Coarse family, handy for filtering when tailing the log.
    pub fn family(self) -> &'static str {
        match self {
            AuditEventKind::TaskSubmitted
            | AuditEventKind::TaskTransition
            | AuditEventKind::TaskRequeued => "task",
            AuditEventKind::AdmissionDecision => "admission",
            AuditEventKind::BudgetReserved
            | AuditEventKind::BudgetCommitted
            | AuditEventKind::BudgetReleased
            | AuditEventKind::BudgetDenied
            | AuditEventKind::BudgetAllocated => "budget",
            AuditEventKind::ExecutionOutcome => "execution",
            AuditEventKind::BreakerTripped
            | AuditEventKind::BreakerHalfOpen
            | AuditEventKind::BreakerClosed => "breaker",
            AuditEventKind::OrchestratorDrain => "orchestrator",
        }
    }
}

/// An audit entry before it has been sequenced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_kind: AuditEventKind,
    pub principal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub payload: serde_json::Value,
}

impl AuditEvent {
    pub fn new(
        timestamp: DateTime<Utc>,
        event_kind: AuditEventKind,
        principal: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            timestamp,
            event_kind,
            principal: principal.into(),
            task_id: None,
            payload,
        }
    }

    pub fn for_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }
}

/// A sequenced, immutable audit record. One JSON line in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    #[serde(flatten)]
    pub event: AuditEvent,
}

impl AuditRecord {
    pub fn kind(&self) -> AuditEventKind {
        self.event.event_kind
    }

    pub fn task_id(&self) -> Option<TaskId> {
        self.event.task_id
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.event.payload
    }
}

/// Principal used for records that are not attributable to a requester.
pub const SYSTEM_PRINCIPAL: &str = "system";
