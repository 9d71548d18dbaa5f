//! Outcome model: the common result shape of one pass through the worker.
//!
//! Outcomes are what the worker reports to the Decider and what it writes
//! into the `execution_outcome` audit record.

use serde::{Deserialize, Serialize};

use super::errors::GatewayError;
use super::task::TaskResult;

/// Serialized as SUCCESS / FAILURE / BLOCKED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    /// The backend answered; the task is DONE.
    Success,
    /// Execution failed. `retryable` says whether another attempt may help.
    Failure,
    /// The task never reached the backend (admission or budget denial).
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub kind: OutcomeKind,

    /// Short machine code, e.g. `backend_timeout`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default)]
    pub retryable: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
}

impl Outcome {
    pub fn success(result: TaskResult) -> Self {
        Self {
            kind: OutcomeKind::Success,
            code: None,
            reason: None,
            retryable: false,
            result: Some(result),
        }
    }

    pub fn failure(err: &GatewayError) -> Self {
        Self {
            kind: OutcomeKind::Failure,
            code: Some(err.code().to_string()),
            reason: Some(err.to_string()),
            retryable: err.is_retryable(),
            result: None,
        }
    }

    pub fn blocked(err: &GatewayError) -> Self {
        Self {
            kind: OutcomeKind::Blocked,
            code: Some(err.code().to_string()),
            reason: Some(err.to_string()),
            retryable: false,
            result: None,
        }
    }

    /// Failure signature the circuit breaker groups on.
    pub fn signature(&self, backend: &str) -> String {
        format!("{}:{}", self.code.as_deref().unwrap_or("unknown"), backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_screaming() {
        assert_eq!(
            serde_json::to_string(&OutcomeKind::Success).unwrap(),
            "\"SUCCESS\""
        );
        assert_eq!(
            serde_json::to_string(&OutcomeKind::Blocked).unwrap(),
            "\"BLOCKED\""
        );
    }

    #[test]
    fn failure_carries_code_and_retryability() {
        let err = GatewayError::BackendTimeout {
            backend: "offline".into(),
            timeout_ms: 50,
        };
        let o = Outcome::failure(&err);
        assert_eq!(o.kind, OutcomeKind::Failure);
        assert_eq!(o.code.as_deref(), Some("backend_timeout"));
        assert!(o.retryable);
        assert_eq!(o.signature("offline"), "backend_timeout:offline");
    }

    #[test]
    fn blocked_is_never_retryable() {
        let err = GatewayError::AdmissionDenied {
            reason: "workspace_boundary".into(),
        };
        let o = Outcome::blocked(&err);
        assert!(!o.retryable);
        let v = serde_json::to_value(&o).unwrap();
        assert!(v.get("result").is_none());
    }
}
