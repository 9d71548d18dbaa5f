//! App - アプリケーション層
//!
//! ports とコンポーネントを組み合わせて dispatch loop を実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: config と ports のワイヤリング（fail-fast 検証）
//! - **WorkerLoop**: IDLE→CLAIMING→ADMITTING→RESERVING→EXECUTING→FINALIZING
//! - **ReaperLoop**: Lease 期限切れの回収
//! - **Orchestrator**: worker pool、kill switch、breaker pause、drain
//! - **Status**: 読み取り専用のステータス

pub mod builder;
pub mod kill_switch;
pub mod orchestrator;
pub mod reaper_loop;
pub mod status;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{App, AppBuilder, BuildError, Services};
pub use self::kill_switch::KillSwitch;
pub use self::orchestrator::{DrainCause, DrainReport, Orchestrator, RunMode};
pub use self::reaper_loop::{ReapReport, ReaperLoop};
pub use self::status::{OrchestratorMode, OrchestratorStatus, PhaseBoard, WorkerPhase, WorkerStatus};
pub use self::worker_loop::{TickOutcome, WorkerLoop};
