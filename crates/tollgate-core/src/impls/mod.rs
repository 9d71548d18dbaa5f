//! Impls - ports の実装
//!
//! In-process implementations of the lock manager and audit log. The task
//! store's in-memory implementation lives next to its record types in
//! `queue`.

pub mod audit_log;
pub mod inmem_locks;

pub use self::audit_log::{FanoutAuditSink, InMemoryAuditLog, JsonlAuditLog};
pub use self::inmem_locks::InMemoryLockManager;
