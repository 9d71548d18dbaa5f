//! End-to-end dispatch scenarios through the worker and orchestrator.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal_macros::dec;

use tollgate_core::app::{App, AppBuilder, RunMode, TickOutcome};
use tollgate_core::breaker::BreakerState;
use tollgate_core::config::GatewayConfig;
use tollgate_core::domain::{AuditEventKind, GatewayError, HolderId, Role, TaskSubmission};
use tollgate_core::engine::OfflineBackend;
use tollgate_core::impls::{FanoutAuditSink, InMemoryAuditLog, InMemoryLockManager, JsonlAuditLog};
use tollgate_core::ports::{
    AuditSink, BackendFailure, BackendRequest, BackendResponse, Clock, InferenceBackend,
    LockError, LockManager, ManualClock,
};
use tollgate_core::queue::{RetryPolicy, TaskState};

/// Never answers within any sane timeout.
struct Hanging {
    calls: AtomicUsize,
}

#[async_trait]
impl InferenceBackend for Hanging {
    async fn complete(&self, _: BackendRequest) -> Result<BackendResponse, BackendFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(BackendFailure::Unavailable("unreachable".into()))
    }
}

/// Fails with 503 until switched healthy.
struct Switchable {
    healthy: AtomicBool,
}

#[async_trait]
impl InferenceBackend for Switchable {
    async fn complete(&self, request: BackendRequest) -> Result<BackendResponse, BackendFailure> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(BackendFailure::Unavailable("503 service unavailable".into()));
        }
        Ok(BackendResponse {
            text: format!("done: {}", request.prompt),
            input_tokens: 4,
            output_tokens: 8,
            cost: dec!(0.001),
        })
    }
}

struct Harness {
    app: App,
    audit: Arc<InMemoryAuditLog>,
    clock: Arc<ManualClock>,
    _sandbox: tempfile::TempDir,
}

fn harness(backend: Arc<dyn InferenceBackend>, tweak: impl FnOnce(&mut GatewayConfig)) -> Harness {
    let sandbox = tempfile::tempdir().unwrap();
    let mut config = GatewayConfig::default();
    config.safety.sandbox_root = sandbox.path().to_path_buf();
    config.router.backend = "scripted".into();
    config.worker.retry = RetryPolicy::immediate();
    tweak(&mut config);

    let audit = Arc::new(InMemoryAuditLog::new());
    let clock = Arc::new(ManualClock::default());
    let app = AppBuilder::new(config)
        .with_clock(clock.clone())
        .with_audit_sink(audit.clone())
        .with_backend("scripted", backend)
        .unwrap()
        .build()
        .unwrap();
    Harness {
        app,
        audit,
        clock,
        _sandbox: sandbox,
    }
}

fn offline() -> Arc<dyn InferenceBackend> {
    Arc::new(OfflineBackend::default())
}

#[tokio::test]
async fn budget_shortfall_fails_the_task() {
    let h = harness(offline(), |c| {
        c.ledger.allocations.insert("operator".into(), dec!(0.02));
    });
    let id = h
        .app
        .submit(TaskSubmission::new("summarise the report", Role::Operator, dec!(0), dec!(0.03)))
        .await
        .unwrap();

    assert_eq!(h.app.worker(0).run_once().await.unwrap(), TickOutcome::Blocked(id));

    let task = h.app.task(id).await.unwrap();
    assert_eq!(task.state, TaskState::Failed);
    let reason = task.last_error.unwrap();
    assert!(reason.contains("remaining 0.02"), "{reason}");
    assert!(reason.contains("requested 0.03"), "{reason}");

    let denied = h.audit.by_kind(AuditEventKind::BudgetDenied).await;
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].payload()["remaining"], serde_json::json!("0.02"));
    assert_eq!(denied[0].payload()["requested"], serde_json::json!("0.03"));
    assert_eq!(h.app.services.ledger.remaining("operator").await, dec!(0.02));
}

#[tokio::test]
async fn filesystem_escape_is_blocked_with_all_checks_recorded() {
    let h = harness(offline(), |_| {});
    let id = h
        .app
        .submit(TaskSubmission::new(
            "read ../../etc/passwd and list the accounts",
            Role::Guest,
            dec!(0),
            dec!(0.05),
        ))
        .await
        .unwrap();

    assert_eq!(h.app.worker(0).run_once().await.unwrap(), TickOutcome::Blocked(id));
    let task = h.app.task(id).await.unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert!(task.last_error.unwrap().contains("workspace_boundary"));

    let decisions = h.audit.by_kind(AuditEventKind::AdmissionDecision).await;
    assert_eq!(decisions.len(), 1);
    let verdict = &decisions[0].payload()["verdict"];
    assert_eq!(verdict["passed"], false);
    let checks = verdict["checks"].as_array().unwrap();
    assert_eq!(checks.len(), 4);
    for check in checks {
        let expected = check["name"] != "workspace_boundary";
        assert_eq!(check["passed"], expected, "{check}");
    }
    assert!(h.audit.by_kind(AuditEventKind::BudgetReserved).await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simultaneous_acquire_has_one_winner() {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
    let locks = Arc::new(InMemoryLockManager::new(clock));
    let h = harness(offline(), |_| {});
    let task_id = h
        .app
        .submit(TaskSubmission::new("t1", Role::Operator, dec!(0), dec!(0.01)))
        .await
        .unwrap();

    let barrier = Arc::new(tokio::sync::Barrier::new(2));
    let racers: Vec<_> = (0..2)
        .map(|i| {
            let locks = Arc::clone(&locks);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                locks
                    .acquire(task_id, &HolderId::worker(i), Duration::from_secs(30))
                    .await
            })
        })
        .collect();

    let mut won = 0;
    let mut busy = 0;
    for racer in racers {
        match racer.await.unwrap() {
            Ok(_) => won += 1,
            Err(LockError::Busy { .. }) => busy += 1,
            Err(other) => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!((won, busy), (1, 1));
}

#[tokio::test]
async fn repeated_timeouts_exhaust_retries_and_refund() {
    let backend = Arc::new(Hanging {
        calls: AtomicUsize::new(0),
    });
    let h = harness(backend.clone(), |c| {
        c.router.timeout = Duration::from_millis(20);
        c.worker.max_attempts = 3;
    });
    let id = h
        .app
        .submit(TaskSubmission::new("summarise the report", Role::Operator, dec!(0), dec!(0.05)))
        .await
        .unwrap();
    let worker = h.app.worker(0);

    assert_eq!(worker.run_once().await.unwrap(), TickOutcome::Retrying(id));
    assert_eq!(worker.run_once().await.unwrap(), TickOutcome::Retrying(id));
    assert_eq!(worker.run_once().await.unwrap(), TickOutcome::Failed(id));
    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);

    let task = h.app.task(id).await.unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.attempts, 3);
    assert!(task.last_error.unwrap().contains("backend_timeout"));

    assert_eq!(h.audit.by_kind(AuditEventKind::BudgetReleased).await.len(), 3);
    assert!(h.audit.by_kind(AuditEventKind::BudgetCommitted).await.is_empty());
    assert_eq!(h.app.services.ledger.remaining("operator").await, dec!(1.00));
    assert_eq!(h.app.services.breaker.state().await.unwrap(), BreakerState::Closed);
}

#[tokio::test]
async fn backend_errors_trip_the_breaker_until_cooldown() {
    let backend = Arc::new(Switchable {
        healthy: AtomicBool::new(false),
    });
    let h = harness(backend.clone(), |c| c.worker.max_attempts = 1);
    let worker = h.app.worker(0);

    for n in 0..5 {
        let id = h
            .app
            .submit(TaskSubmission::new(format!("job {n}"), Role::Operator, dec!(0), dec!(0.01)))
            .await
            .unwrap();
        assert_eq!(worker.run_once().await.unwrap(), TickOutcome::Failed(id));
    }
    assert_eq!(h.app.services.breaker.state().await.unwrap(), BreakerState::Open);
    assert_eq!(h.audit.by_kind(AuditEventKind::BreakerTripped).await.len(), 1);

    let waiting = h
        .app
        .submit(TaskSubmission::new("job 5", Role::Operator, dec!(0), dec!(0.01)))
        .await
        .unwrap();
    assert_eq!(worker.run_once().await.unwrap(), TickOutcome::Parked);
    assert_eq!(h.app.task(waiting).await.unwrap().state, TaskState::Pending);

    h.clock.advance(Duration::from_secs(31));
    backend.healthy.store(true, Ordering::SeqCst);
    assert_eq!(worker.run_once().await.unwrap(), TickOutcome::Completed(waiting));
    assert_eq!(h.app.services.breaker.state().await.unwrap(), BreakerState::Closed);
    assert_eq!(h.audit.by_kind(AuditEventKind::BreakerClosed).await.len(), 1);
}

#[tokio::test]
async fn completing_twice_is_a_noop() {
    let h = harness(offline(), |_| {});
    let id = h
        .app
        .submit(TaskSubmission::new("summarise the report", Role::Operator, dec!(0), dec!(0.05)))
        .await
        .unwrap();
    assert_eq!(h.app.worker(0).run_once().await.unwrap(), TickOutcome::Completed(id));

    let again = h
        .app
        .services
        .store
        .transition(id, TaskState::Running, TaskState::Done)
        .await
        .unwrap();
    assert_eq!(again, tollgate_core::ports::TransitionOutcome::AlreadyInState);

    let err = h
        .app
        .services
        .store
        .transition(id, TaskState::Running, TaskState::Failed)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::InvalidTransition { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_drains_a_mixed_queue_into_a_tailable_log() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit").join("tollgate.jsonl");
    let jsonl = Arc::new(JsonlAuditLog::open(&path).await.unwrap());
    let memory = Arc::new(InMemoryAuditLog::new());
    let sinks: Vec<Arc<dyn AuditSink>> = vec![memory.clone(), jsonl];

    let mut config = GatewayConfig::default();
    config.safety.sandbox_root = dir.path().to_path_buf();
    config.worker.pool_size = 4;
    config.worker.tick = Duration::from_millis(10);
    config.worker.idle_poll = Duration::from_millis(5);
    let app = AppBuilder::new(config)
        .with_audit_sink(Arc::new(FanoutAuditSink::new(sinks)))
        .with_backend("offline", offline())
        .unwrap()
        .build()
        .unwrap();

    let mut ok = Vec::new();
    for n in 0..8 {
        ok.push(
            app.submit(TaskSubmission::new(format!("summarise section {n}"), Role::Operator, dec!(0), dec!(0.02)))
                .await
                .unwrap(),
        );
    }
    let blocked = app
        .submit(TaskSubmission::new("sudo cat the shadow file", Role::Guest, dec!(0), dec!(0.02)))
        .await
        .unwrap();
    assert!(matches!(
        app.submit(TaskSubmission::new("", Role::Guest, dec!(0), dec!(0.02))).await,
        Err(GatewayError::Validation(_))
    ));

    let orchestrator = app.orchestrator();
    let report = tokio::time::timeout(Duration::from_secs(10), orchestrator.run(RunMode::UntilIdle))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.tasks.done, 8);
    assert_eq!(report.tasks.failed, 1);
    for id in ok {
        assert_eq!(app.task(id).await.unwrap().state, TaskState::Done);
    }
    assert_eq!(app.task(blocked).await.unwrap().state, TaskState::Failed);

    // every line is a complete record, in sequence order
    let records = JsonlAuditLog::read_all(&path).await.unwrap();
    assert_eq!(records.len(), memory.len().await);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.seq, i as u64 + 1);
    }
    let status = orchestrator.status().await.unwrap();
    assert_eq!(status.queue_depth, 0);
    assert_eq!(status.breaker.state, BreakerState::Closed);
}
