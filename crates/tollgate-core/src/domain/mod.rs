//! Domain model: ids, roles, submissions, outcomes, decisions, errors and
//! audit events.

pub mod decision;
pub mod errors;
pub mod events;
pub mod ids;
pub mod outcome;
pub mod role;
pub mod task;

pub use decision::{Decider, Decision, DefaultDecider};
pub use errors::{ErrorKind, GatewayError};
pub use events::{AuditEvent, AuditEventKind, AuditRecord, SYSTEM_PRINCIPAL};
pub use ids::{AttemptId, HolderId, ReservationId, TaskId};
pub use outcome::{Outcome, OutcomeKind};
pub use role::Role;
pub use task::{TaskResult, TaskSubmission};
