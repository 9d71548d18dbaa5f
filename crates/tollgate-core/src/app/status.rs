//! Status - 読み取り専用のステータス
//!
//! Snapshot types served to dashboards, plus the phase board workers write
//! their current state machine phase to.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::breaker::BreakerSnapshot;
use crate::domain::{HolderId, TaskId};
use crate::ledger::LedgerRow;
use crate::queue::QueueCounts;

/// Worker state machine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerPhase {
    Idle,
    Claiming,
    Admitting,
    Reserving,
    Executing,
    Finalizing,
    Stopped,
}

impl WorkerPhase {
    /// Phases in which a task is held. The kill switch waits these out.
    pub fn is_busy(self) -> bool {
        !matches!(self, WorkerPhase::Idle | WorkerPhase::Stopped)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub worker: HolderId,
    pub phase: WorkerPhase,
    pub task_id: Option<TaskId>,
    pub since: DateTime<Utc>,
    pub completed: u64,
    pub failed: u64,
}

/// Shared per-worker phase table.
#[derive(Clone)]
pub struct PhaseBoard {
    slots: Arc<Mutex<Vec<WorkerStatus>>>,
}

impl PhaseBoard {
    pub fn new(holders: Vec<HolderId>, now: DateTime<Utc>) -> Self {
        let slots = holders
            .into_iter()
            .map(|worker| WorkerStatus {
                worker,
                phase: WorkerPhase::Idle,
                task_id: None,
                since: now,
                completed: 0,
                failed: 0,
            })
            .collect();
        Self {
            slots: Arc::new(Mutex::new(slots)),
        }
    }

    pub fn set(&self, index: usize, phase: WorkerPhase, task_id: Option<TaskId>, now: DateTime<Utc>) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get_mut(index) {
            if slot.phase != phase {
                slot.since = now;
            }
            slot.phase = phase;
            slot.task_id = task_id;
        }
    }

    pub fn count(&self, index: usize, succeeded: bool) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get_mut(index) {
            if succeeded {
                slot.completed += 1;
            } else {
                slot.failed += 1;
            }
        }
    }

    pub fn snapshot(&self) -> Vec<WorkerStatus> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn busy(&self) -> usize {
        self.snapshot().iter().filter(|w| w.phase.is_busy()).count()
    }
}

/// What the orchestrator is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrchestratorMode {
    NotStarted,
    Running,
    /// Breaker OPEN: workers park in IDLE.
    Paused,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub at: DateTime<Utc>,
    pub mode: OrchestratorMode,
    pub kill_switch: bool,
    pub queue_depth: usize,
    pub tasks: QueueCounts,
    pub workers: Vec<WorkerStatus>,
    pub breaker: BreakerSnapshot,
    pub ledger: Vec<LedgerRow>,
}
