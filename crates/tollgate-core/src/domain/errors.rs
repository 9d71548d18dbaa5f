//! Error taxonomy for the gateway.
//!
//! Every failure a caller can observe is a `GatewayError`. `ErrorKind`
//! groups them by what the caller should do next.

use rust_decimal::Decimal;

use super::ids::TaskId;
use crate::queue::TaskState;

/// Operational classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Worth retrying (backend timeout, backend unavailable, lost claim race).
    Transient,
    /// Retrying cannot help (validation, admission, budget, invariant guard).
    Permanent,
    /// A collaborator of the control plane failed (audit sink, config).
    Infrastructure,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Malformed submission, rejected before it is queued.
    #[error("validation error: {0}")]
    Validation(String),

    /// Another holder has a live claim on this task.
    #[error("task {task_id} is busy (claimed by {holder})")]
    Busy { task_id: TaskId, holder: String },

    /// The Safety Gateway failed at least one check.
    #[error("admission denied: {reason}")]
    AdmissionDenied { reason: String },

    #[error("budget exceeded for '{principal}': remaining {remaining}, requested {requested}")]
    BudgetExceeded {
        principal: String,
        remaining: Decimal,
        requested: Decimal,
    },

    #[error("backend '{backend}' timed out after {timeout_ms}ms")]
    BackendTimeout { backend: String, timeout_ms: u64 },

    /// Transient backend failure (unavailable, 5xx, malformed response).
    #[error("backend '{backend}' error: {message}")]
    BackendError { backend: String, message: String },

    /// The backend refused the request; retrying will not change the answer.
    #[error("backend '{backend}' rejected the request: {message}")]
    BackendRejected { backend: String, message: String },

    /// Compare-and-set guard on task state. Always a bug or race signal.
    #[error("invalid transition for {task_id}: expected {expected:?}, found {actual:?} (wanted {to:?})")]
    InvalidTransition {
        task_id: TaskId,
        expected: TaskState,
        actual: TaskState,
        to: TaskState,
    },

    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("lease on task {0} expired")]
    LeaseExpired(TaskId),

    /// The audit sink refused a record. State is left unchanged.
    #[error("audit log unavailable: {0}")]
    Audit(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Busy { .. }
            | GatewayError::BackendTimeout { .. }
            | GatewayError::BackendError { .. }
            | GatewayError::LeaseExpired(_) => ErrorKind::Transient,
            GatewayError::Audit(_) | GatewayError::Config(_) => ErrorKind::Infrastructure,
            GatewayError::Validation(_)
            | GatewayError::AdmissionDenied { .. }
            | GatewayError::BudgetExceeded { .. }
            | GatewayError::BackendRejected { .. }
            | GatewayError::InvalidTransition { .. }
            | GatewayError::NotFound(_) => ErrorKind::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Stable short code used in audit payloads and failure signatures.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "validation_error",
            GatewayError::Busy { .. } => "busy",
            GatewayError::AdmissionDenied { .. } => "admission_denied",
            GatewayError::BudgetExceeded { .. } => "budget_exceeded",
            GatewayError::BackendTimeout { .. } => "backend_timeout",
            GatewayError::BackendError { .. } => "backend_error",
            GatewayError::BackendRejected { .. } => "backend_rejected",
            GatewayError::InvalidTransition { .. } => "invalid_transition",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::LeaseExpired(_) => "lease_expired",
            GatewayError::Audit(_) => "audit_unavailable",
            GatewayError::Config(_) => "config_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use rust_decimal_macros::dec;

    #[rstest]
    #[case(GatewayError::BackendTimeout { backend: "b".into(), timeout_ms: 10 }, true)]
    #[case(GatewayError::BackendError { backend: "b".into(), message: "503".into() }, true)]
    #[case(GatewayError::BackendRejected { backend: "b".into(), message: "no".into() }, false)]
    #[case(GatewayError::Validation("x".into()), false)]
    #[case(GatewayError::AdmissionDenied { reason: "x".into() }, false)]
    #[case(GatewayError::Audit("disk full".into()), false)]
    fn retryability(#[case] err: GatewayError, #[case] retryable: bool) {
        assert_eq!(err.is_retryable(), retryable);
    }

    #[test]
    fn budget_message_names_both_amounts() {
        let err = GatewayError::BudgetExceeded {
            principal: "guest".into(),
            remaining: dec!(0.02),
            requested: dec!(0.03),
        };
        let msg = err.to_string();
        assert!(msg.contains("0.02"));
        assert!(msg.contains("0.03"));
        assert_eq!(err.code(), "budget_exceeded");
    }
}
