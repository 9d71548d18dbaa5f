//! Ports - 抽象化レイヤー
//!
//! Every shared resource and outbound call of the gateway sits behind one
//! of these traits. In-memory implementations live in `impls` and `queue`;
//! a database row lock or a durable log can be slotted in without touching
//! the worker loop.

pub mod audit_sink;
pub mod backend;
pub mod clock;
pub mod id_generator;
pub mod lock_manager;
pub mod task_store;

pub use self::audit_sink::AuditSink;
pub use self::backend::{BackendFailure, BackendRequest, BackendResponse, InferenceBackend};
pub use self::clock::{add_std, Clock, ManualClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::lock_manager::{Lock, LockError, LockManager};
pub use self::task_store::{TaskStore, TransitionOutcome};
