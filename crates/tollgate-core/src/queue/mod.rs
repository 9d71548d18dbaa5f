//! Task queue: lifecycle state, records, retry backoff and the in-memory
//! task store.

mod memory;
mod record;
mod retry;
mod state;

pub use memory::InMemoryTaskStore;
pub use record::TaskRecord;
pub use retry::RetryPolicy;
pub use state::TaskState;

use serde::{Deserialize, Serialize};

/// Number of tasks per lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub claimed: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
}

impl QueueCounts {
    pub fn add(&mut self, state: TaskState) {
        match state {
            TaskState::Pending => self.pending += 1,
            TaskState::Claimed => self.claimed += 1,
            TaskState::Running => self.running += 1,
            TaskState::Done => self.done += 1,
            TaskState::Failed => self.failed += 1,
        }
    }

    /// Tasks still waiting for a worker.
    pub fn queue_depth(&self) -> usize {
        self.pending
    }

    /// Tasks not yet in a terminal state.
    pub fn outstanding(&self) -> usize {
        self.pending + self.claimed + self.running
    }

    pub fn total(&self) -> usize {
        self.pending + self.claimed + self.running + self.done + self.failed
    }
}
