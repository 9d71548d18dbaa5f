//! tollgate-core
//!
//! Control plane that decides whether, when and how an AI task may be
//! dispatched to an inference backend: who may run it, what it may spend,
//! and whether the system is healthy enough to run anything at all.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, role, task, outcome, decision, errors, events）
//! - **ports**: 抽象化レイヤー（TaskStore, LockManager, AuditSink, InferenceBackend, Clock, IdGenerator）
//! - **queue**: タスクの状態遷移、レコード、retry policy、InMemoryTaskStore
//! - **impls**: ports の実装（InMemoryLockManager, InMemoryAuditLog, JsonlAuditLog）
//! - **ledger**: principal ごとの予算（reserve → commit/release）
//! - **safety**: admission checks と Verdict
//! - **breaker**: CLOSED / OPEN / HALF_OPEN の circuit breaker
//! - **engine**: backend/model の選択と実行
//! - **app**: builder, worker_loop, reaper_loop, orchestrator, status
//! - **config**: 環境変数からの設定

pub mod app;
pub mod breaker;
pub mod config;
pub mod domain;
pub mod engine;
pub mod impls;
pub mod ledger;
pub mod ports;
pub mod queue;
pub mod safety;

pub use app::{App, AppBuilder, BuildError, KillSwitch, Orchestrator, RunMode};
pub use config::GatewayConfig;
pub use domain::{GatewayError, Role, TaskId, TaskSubmission};
