//! Decision model: what happens to a task after a failed attempt.
//!
//! The Decider is a pure function. The worker and the reaper execute its
//! answer against the task store.

use std::time::Duration;

use super::Outcome;
use crate::queue::{RetryPolicy, TaskRecord};

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Put the task back in the queue, eligible again after `delay`.
    Retry { delay: Duration, reason: String },

    /// Give up: the task becomes FAILED with `reason`.
    MarkDead { reason: String },
}

pub trait Decider: Send + Sync {
    fn decide(&self, task: &TaskRecord, outcome: &Outcome) -> Decision;
}

/// Attempt-bounded retry with exponential backoff.
///
/// - non-retryable outcome: mark dead
/// - attempts >= max_attempts: mark dead, keeping the last failure as reason
/// - otherwise: retry after `RetryPolicy::next_delay(attempts)`
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }
}

impl Default for DefaultDecider {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, task: &TaskRecord, outcome: &Outcome) -> Decision {
        let last = outcome
            .code
            .clone()
            .unwrap_or_else(|| "unknown_failure".to_string());

        if !outcome.retryable {
            let reason = match &outcome.reason {
                Some(reason) => format!("{last}: {reason}"),
                None => last,
            };
            return Decision::MarkDead { reason };
        }

        if task.attempts >= task.max_attempts {
            Decision::MarkDead {
                reason: format!(
                    "{last}: max attempts reached ({}/{})",
                    task.attempts, task.max_attempts
                ),
            }
        } else {
            let delay = self.retry_policy.next_delay(task.attempts);
            Decision::Retry {
                delay,
                reason: format!(
                    "{last}: retry {}/{} after {:?}",
                    task.attempts + 1,
                    task.max_attempts,
                    delay
                ),
            }
        }
    }
}
