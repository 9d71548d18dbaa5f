//! AuditSink port - append-only audit log.

use async_trait::async_trait;

use crate::domain::{AuditEvent, AuditRecord, GatewayError};

/// Append-only sink for audit events.
///
/// Implementations assign strictly increasing sequence numbers and never
/// rewrite what they have already written.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: AuditEvent) -> Result<AuditRecord, GatewayError>;
}
