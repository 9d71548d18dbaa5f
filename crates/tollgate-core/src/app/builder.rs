//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 開発体験の改善（明確なエラーメッセージ）

use std::sync::Arc;

use crate::breaker::CircuitBreaker;
use crate::config::{ConfigError, GatewayConfig};
use crate::domain::{Decider, DefaultDecider, GatewayError, HolderId, TaskId, TaskSubmission};
use crate::engine::{BackendRegistry, EngineRouter, RegistryError};
use crate::impls::{InMemoryAuditLog, InMemoryLockManager, JsonlAuditLog};
use crate::ledger::BudgetLedger;
use crate::ports::{
    AuditSink, Clock, IdGenerator, InferenceBackend, LockManager, SystemClock, TaskStore,
    UlidGenerator,
};
use crate::queue::{InMemoryTaskStore, TaskRecord};
use crate::safety::SafetyGateway;

use super::kill_switch::KillSwitch;
use super::orchestrator::Orchestrator;
use super::reaper_loop::ReaperLoop;
use super::status::PhaseBoard;
use super::worker_loop::WorkerLoop;

/// The shared components every worker, the reaper and the orchestrator
/// hold handles to. Cloning clones the handles, not the state.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn TaskStore>,
    pub locks: Arc<dyn LockManager>,
    pub ledger: Arc<BudgetLedger>,
    pub safety: Arc<SafetyGateway>,
    pub breaker: Arc<CircuitBreaker>,
    pub router: Arc<EngineRouter>,
    pub audit: Arc<dyn AuditSink>,
    pub decider: Arc<dyn Decider>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
}

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new(GatewayConfig::from_env()?)
///     .with_backend("offline", Arc::new(OfflineBackend::default()))?
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - build() 時に config を検証
/// - router が指す backend が登録済みかチェック
/// - 不足があれば BuildError を返す
pub struct AppBuilder {
    config: GatewayConfig,
    registry: BackendRegistry,
    clock: Option<Arc<dyn Clock>>,
    audit: Option<Arc<dyn AuditSink>>,
    decider: Option<Arc<dyn Decider>>,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("backend '{backend}' is routed to but not registered (registered: {registered:?})")]
    UnknownBackend {
        backend: String,
        registered: Vec<String>,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl From<BuildError> for GatewayError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::Gateway(inner) => inner,
            other => GatewayError::Config(other.to_string()),
        }
    }
}

impl AppBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            registry: BackendRegistry::new(),
            clock: None,
            audit: None,
            decider: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Defaults to an `InMemoryAuditLog`.
    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Audits to `config.audit.jsonl_path` when one is set; otherwise the
    /// sink is left as it is.
    pub async fn with_configured_audit(self) -> Result<Self, BuildError> {
        match self.config.audit.jsonl_path.clone() {
            Some(path) => {
                let log = JsonlAuditLog::open(&path).await?;
                Ok(self.with_audit_sink(Arc::new(log)))
            }
            None => Ok(self),
        }
    }

    pub fn with_decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn with_backend(
        mut self,
        name: impl Into<String>,
        backend: Arc<dyn InferenceBackend>,
    ) -> Result<Self, BuildError> {
        self.registry.register(name, backend)?;
        Ok(self)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// AppBuilder を構築して App を生成
    ///
    /// # 検証
    /// - GatewayConfig::validate()
    /// - router.backend が登録されているか
    pub fn build(self) -> Result<App, BuildError> {
        let AppBuilder {
            config,
            registry,
            clock,
            audit,
            decider,
        } = self;

        config.validate()?;
        if !registry.contains(&config.router.backend) {
            return Err(BuildError::UnknownBackend {
                backend: config.router.backend.clone(),
                registered: registry.names(),
            });
        }

        let clock: Arc<dyn Clock> = clock.unwrap_or_else(|| Arc::new(SystemClock));
        let audit: Arc<dyn AuditSink> = audit.unwrap_or_else(|| Arc::new(InMemoryAuditLog::new()));
        let decider: Arc<dyn Decider> = decider
            .unwrap_or_else(|| Arc::new(DefaultDecider::new(config.worker.retry.clone())));
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));

        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new(
            Arc::clone(&audit),
            Arc::clone(&clock),
            Arc::clone(&ids),
            config.worker.max_attempts,
        ));
        let locks: Arc<dyn LockManager> = Arc::new(InMemoryLockManager::new(Arc::clone(&clock)));
        let ledger = Arc::new(BudgetLedger::new(
            config.ledger.clone(),
            Arc::clone(&audit),
            Arc::clone(&clock),
            Arc::clone(&ids),
        ));
        let safety = Arc::new(SafetyGateway::new(&config.safety)?);
        let breaker = Arc::new(CircuitBreaker::new(
            config.breaker.clone(),
            Arc::clone(&audit),
            Arc::clone(&clock),
        ));
        let router = Arc::new(EngineRouter::new(config.router.clone(), registry)?);

        tracing::info!(
            workers = config.worker.pool_size,
            backend = %config.router.backend,
            checks = ?safety.check_names(),
            "gateway assembled"
        );

        Ok(App {
            services: Services {
                store,
                locks,
                ledger,
                safety,
                breaker,
                router,
                audit,
                decider,
                clock,
                ids,
            },
            config,
            kill_switch: KillSwitch::new(),
        })
    }
}

/// App は組み立て済みの gateway
pub struct App {
    pub services: Services,
    pub config: GatewayConfig,
    pub kill_switch: KillSwitch,
}

impl App {
    /// Task submission: validates and queues, returning the new id.
    pub async fn submit(&self, submission: TaskSubmission) -> Result<TaskId, GatewayError> {
        self.services.store.enqueue(submission).await
    }

    pub async fn task(&self, id: TaskId) -> Result<TaskRecord, GatewayError> {
        self.services.store.get(id).await
    }

    /// A standalone worker, for driving the state machine by hand.
    pub fn worker(&self, index: usize) -> WorkerLoop {
        let holders = (0..=index).map(HolderId::worker).collect();
        let board = PhaseBoard::new(holders, self.services.clock.now());
        WorkerLoop::new(index, self.services.clone(), self.config.worker.clone(), board)
    }

    pub fn reaper(&self) -> ReaperLoop {
        ReaperLoop::new(self.services.clone(), &self.config.worker)
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            self.services.clone(),
            self.config.worker.clone(),
            self.kill_switch.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::OfflineBackend;
    use crate::ports::ManualClock;
    use rust_decimal_macros::dec;

    fn offline() -> Arc<dyn InferenceBackend> {
        Arc::new(OfflineBackend::default())
    }

    #[test]
    fn test_build_success() {
        let app = AppBuilder::new(GatewayConfig::default())
            .with_backend("offline", offline())
            .unwrap()
            .build();
        assert!(app.is_ok());
    }

    #[test]
    fn test_build_missing_backend() {
        let app = AppBuilder::new(GatewayConfig::default())
            .with_backend("other", offline())
            .unwrap()
            .build();
        assert!(matches!(
            app,
            Err(BuildError::UnknownBackend { backend, registered })
                if backend == "offline" && registered == vec!["other".to_string()]
        ));
    }

    #[test]
    fn test_build_duplicate_backend() {
        let result = AppBuilder::new(GatewayConfig::default())
            .with_backend("offline", offline())
            .unwrap()
            .with_backend("offline", offline());
        assert!(matches!(
            result,
            Err(BuildError::Registry(RegistryError::AlreadyRegistered(_)))
        ));
    }

    #[test]
    fn test_build_invalid_config() {
        let mut config = GatewayConfig::default();
        config.worker.pool_size = 0;
        let app = AppBuilder::new(config)
            .with_backend("offline", offline())
            .unwrap()
            .build();
        assert!(matches!(app, Err(BuildError::Config(_))));
    }

    #[tokio::test]
    async fn submitted_task_is_pending_and_audited() {
        let audit = Arc::new(InMemoryAuditLog::new());
        let app = AppBuilder::new(GatewayConfig::default())
            .with_clock(Arc::new(ManualClock::default()))
            .with_audit_sink(audit.clone())
            .with_backend("offline", offline())
            .unwrap()
            .build()
            .unwrap();

        let id = app
            .submit(TaskSubmission::new(
                "summarise the notes",
                crate::domain::Role::Operator,
                dec!(0),
                dec!(0.01),
            ))
            .await
            .unwrap();
        let task = app.task(id).await.unwrap();
        assert_eq!(task.state, crate::queue::TaskState::Pending);
        assert_eq!(audit.for_task(id).await.len(), 1);
    }

    #[tokio::test]
    async fn configured_jsonl_path_is_the_only_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let mut config = GatewayConfig::default();
        config.audit.jsonl_path = Some(path.clone());

        let app = AppBuilder::new(config)
            .with_configured_audit()
            .await
            .unwrap()
            .with_backend("offline", offline())
            .unwrap()
            .build()
            .unwrap();
        let id = app
            .submit(TaskSubmission::new(
                "summarise the notes",
                crate::domain::Role::Operator,
                dec!(0),
                dec!(0.01),
            ))
            .await
            .unwrap();

        let records = JsonlAuditLog::read_all(&path).await.unwrap();
        assert_eq!(records.iter().filter(|r| r.task_id() == Some(id)).count(), 1);
    }

    #[tokio::test]
    async fn without_a_jsonl_path_the_given_sink_is_kept() {
        let audit = Arc::new(InMemoryAuditLog::new());
        let app = AppBuilder::new(GatewayConfig::default())
            .with_audit_sink(audit.clone())
            .with_configured_audit()
            .await
            .unwrap()
            .with_backend("offline", offline())
            .unwrap()
            .build()
            .unwrap();
        let id = app
            .submit(TaskSubmission::new(
                "summarise the notes",
                crate::domain::Role::Operator,
                dec!(0),
                dec!(0.01),
            ))
            .await
            .unwrap();
        assert_eq!(audit.for_task(id).await.len(), 1);
    }
}
