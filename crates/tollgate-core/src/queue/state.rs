//! Task lifecycle state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a task.
///
/// Forward edges only:
/// - PENDING -> CLAIMED -> RUNNING -> DONE | FAILED
/// - CLAIMED -> FAILED (admission or budget denial before execution)
///
/// The single way back is `requeue` (CLAIMED/RUNNING -> PENDING), which
/// bumps the task's retry counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Claimed,
    Running,
    Done,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed)
    }

    /// Held by a worker (CLAIMED or RUNNING).
    pub fn is_claimed(self) -> bool {
        matches!(self, TaskState::Claimed | TaskState::Running)
    }

    /// Is `self -> to` a legal forward edge?
    pub fn can_transition(self, to: TaskState) -> bool {
        matches!(
            (self, to),
            (TaskState::Pending, TaskState::Claimed)
                | (TaskState::Claimed, TaskState::Running)
                | (TaskState::Claimed, TaskState::Failed)
                | (TaskState::Running, TaskState::Done)
                | (TaskState::Running, TaskState::Failed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const ALL: [TaskState; 5] = [
        TaskState::Pending,
        TaskState::Claimed,
        TaskState::Running,
        TaskState::Done,
        TaskState::Failed,
    ];

    #[rstest]
    #[case(TaskState::Pending, TaskState::Claimed)]
    #[case(TaskState::Claimed, TaskState::Running)]
    #[case(TaskState::Claimed, TaskState::Failed)]
    #[case(TaskState::Running, TaskState::Done)]
    #[case(TaskState::Running, TaskState::Failed)]
    fn forward_edges_are_legal(#[case] from: TaskState, #[case] to: TaskState) {
        assert!(from.can_transition(to));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in [TaskState::Done, TaskState::Failed] {
            for to in ALL {
                assert!(!from.can_transition(to), "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn nothing_goes_back_to_pending() {
        for from in ALL {
            assert!(!from.can_transition(TaskState::Pending));
        }
    }

    #[test]
    fn serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&TaskState::Claimed).unwrap(),
            "\"CLAIMED\""
        );
    }
}
