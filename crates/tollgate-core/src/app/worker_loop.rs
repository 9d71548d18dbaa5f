//! WorkerLoop - タスク実行ループ
//!
//! One worker drives one task at a time through
//! IDLE → CLAIMING → ADMITTING → RESERVING → EXECUTING → FINALIZING → IDLE.
//!
//! # フロー
//! 1. CircuitBreaker::try_acquire() で dispatch permit 取得（OPEN なら park）
//! 2. TaskStore::claim_next() + LockManager::acquire() で claim
//! 3. SafetyGateway::evaluate() で admission
//! 4. BudgetLedger::reserve() で max_spend を確保
//! 5. EngineRouter::execute()（lease を renew しながら待つ）
//! 6. commit/release → Decider → complete/requeue/fail → lock 解放
//!
//! The shutdown signal is only looked at between ticks, never while a
//! task is held.

use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::watch;

use crate::config::WorkerConfig;
use crate::domain::{
    AttemptId, AuditEvent, AuditEventKind, Decision, GatewayError, HolderId, Outcome, TaskId,
    TaskResult,
};
use crate::engine::RouteSelection;
use crate::ledger::Reservation;
use crate::ports::{add_std, Lock};
use crate::queue::{TaskRecord, TaskState};

use super::builder::Services;
use super::status::{PhaseBoard, WorkerPhase};

/// What one pass through the state machine did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The breaker refused a dispatch permit.
    Parked,
    /// Nothing was eligible.
    Idle,
    /// Claimed, but another holder still had a live lock. Left for the reaper.
    Contended(TaskId),
    /// Admission or budget denial; the task is FAILED.
    Blocked(TaskId),
    Completed(TaskId),
    /// Execution failed and the task went back to PENDING.
    Retrying(TaskId),
    /// Execution failed for good; the task is FAILED.
    Failed(TaskId),
}

impl TickOutcome {
    /// The task ended DONE or FAILED in this tick.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TickOutcome::Completed(_) | TickOutcome::Blocked(_) | TickOutcome::Failed(_)
        )
    }

    fn found_work(self) -> bool {
        !matches!(
            self,
            TickOutcome::Parked | TickOutcome::Idle | TickOutcome::Contended(_)
        )
    }
}

/// Health signal the tick reports to the breaker.
enum Health {
    Success,
    Failure(String),
    /// Nothing about backend health was learned.
    Neutral,
}

pub struct WorkerLoop {
    index: usize,
    holder: HolderId,
    services: Services,
    config: WorkerConfig,
    board: PhaseBoard,
}

impl WorkerLoop {
    pub fn new(index: usize, services: Services, config: WorkerConfig, board: PhaseBoard) -> Self {
        Self {
            index,
            holder: HolderId::worker(index),
            services,
            config,
            board,
        }
    }

    pub fn holder(&self) -> &HolderId {
        &self.holder
    }

    /// Runs ticks until `shutdown` flips to true (or its sender goes away).
    /// While `pause` is true no claims are attempted.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>, mut pause: watch::Receiver<bool>) {
        tracing::info!(worker = %self.holder, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let found_work = if *pause.borrow() {
                false
            } else {
                match self.run_once().await {
                    Ok(outcome) => outcome.found_work(),
                    Err(err) => {
                        tracing::error!(worker = %self.holder, error = %err, "worker tick failed");
                        false
                    }
                }
            };
            if found_work {
                continue;
            }

            // idle: wait for work, a pause change or shutdown
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = pause.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.idle_poll) => {}
            }
        }
        self.phase(WorkerPhase::Stopped, None);
        tracing::info!(worker = %self.holder, "worker stopped");
    }

    /// One pass through the state machine.
    ///
    /// Errors mean the tick could not finish cleanly. The lock is released
    /// anyway and whatever state the task was left in is recovered by the
    /// reaper once the lease period has passed.
    pub async fn run_once(&self) -> Result<TickOutcome, GatewayError> {
        let Some(permit) = self.services.breaker.try_acquire().await? else {
            tracing::debug!(worker = %self.holder, "breaker open, parked");
            return Ok(TickOutcome::Parked);
        };

        // CLAIMING
        self.phase(WorkerPhase::Claiming, None);
        let task = match self
            .services
            .store
            .claim_next(&self.holder, self.config.role_filter)
            .await
        {
            Ok(Some(task)) => task,
            Ok(None) => {
                self.services.breaker.release(permit).await;
                self.phase(WorkerPhase::Idle, None);
                return Ok(TickOutcome::Idle);
            }
            Err(err) => {
                self.services.breaker.release(permit).await;
                self.phase(WorkerPhase::Idle, None);
                return Err(err);
            }
        };

        let lock = match self
            .services
            .locks
            .acquire(task.id, &self.holder, self.config.lease)
            .await
        {
            Ok(lock) => lock,
            Err(err) => {
                tracing::warn!(worker = %self.holder, task_id = %task.id, error = %err, "claimed task is still locked");
                self.services.breaker.release(permit).await;
                self.phase(WorkerPhase::Idle, None);
                return Ok(TickOutcome::Contended(task.id));
            }
        };
        tracing::debug!(worker = %self.holder, task_id = %task.id, generation = lock.generation, "task claimed");

        let mut health = Health::Neutral;
        let outcome = self.process(&task, &lock, &mut health).await;

        self.services.locks.release(&lock).await;
        if outcome.as_ref().is_ok_and(|o| o.is_terminal()) {
            self.services.locks.forget(task.id).await;
        }
        let signal = match health {
            Health::Success => self.services.breaker.record_success(permit).await,
            Health::Failure(signature) => {
                self.services.breaker.record_failure(permit, &signature).await
            }
            Health::Neutral => {
                self.services.breaker.release(permit).await;
                Ok(())
            }
        };
        if let Err(err) = signal {
            tracing::warn!(worker = %self.holder, error = %err, "breaker signal not recorded");
        }

        match &outcome {
            Ok(TickOutcome::Completed(_)) => self.board.count(self.index, true),
            Ok(TickOutcome::Blocked(_) | TickOutcome::Failed(_)) => {
                self.board.count(self.index, false)
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(worker = %self.holder, task_id = %task.id, error = %err, "task abandoned to the reaper");
            }
        }
        self.phase(WorkerPhase::Idle, None);
        outcome
    }

    async fn process(
        &self,
        task: &TaskRecord,
        lock: &Lock,
        health: &mut Health,
    ) -> Result<TickOutcome, GatewayError> {
        // ADMITTING
        self.phase(WorkerPhase::Admitting, Some(task.id));
        let verdict = self.services.safety.evaluate(&task.description, task.role);
        self.audit(
            AuditEvent::new(
                self.services.clock.now(),
                AuditEventKind::AdmissionDecision,
                task.principal.clone(),
                json!({
                    "role": task.role,
                    "worker": self.holder,
                    "verdict": verdict,
                }),
            )
            .for_task(task.id),
        )
        .await?;
        if let Some(err) = verdict.to_error() {
            tracing::warn!(task_id = %task.id, role = %task.role, error = %err, "admission denied");
            return self.block(task, err).await;
        }

        // RESERVING
        self.phase(WorkerPhase::Reserving, Some(task.id));
        let selection = self.services.router.select(task);
        let reservation = match self
            .services
            .ledger
            .reserve(&task.principal, task.max_spend, Some(task.id))
            .await
        {
            Ok(reservation) => reservation,
            Err(err @ GatewayError::BudgetExceeded { .. }) => return self.block(task, err).await,
            Err(err) => return Err(err),
        };

        if let Err(err) = self
            .services
            .store
            .transition(task.id, TaskState::Claimed, TaskState::Running)
            .await
        {
            self.release_quietly(reservation, "start_failed").await;
            return Err(err);
        }

        // EXECUTING
        self.phase(WorkerPhase::Executing, Some(task.id));
        let attempt_id = self.services.ids.attempt_id();
        tracing::info!(
            worker = %self.holder,
            task_id = %task.id,
            attempt = %attempt_id,
            backend = %selection.backend,
            model = %selection.model,
            tier = %selection.tier,
            "executing"
        );
        let prompt = self.services.router.prompt(task);
        let executed = self
            .execute_renewing(&selection, &prompt, reservation.amount(), lock)
            .await;

        // FINALIZING
        self.phase(WorkerPhase::Finalizing, Some(task.id));
        match executed {
            Ok(result) => {
                *health = Health::Success;
                self.finish_success(task, &selection, attempt_id, reservation, result)
                    .await
            }
            Err(err) => {
                let outcome = Outcome::failure(&err);
                *health = Health::Failure(outcome.signature(&selection.backend));
                self.finish_failure(task, &selection, attempt_id, reservation, err, outcome)
                    .await
            }
        }
    }

    /// Awaits the backend call, renewing the lease every `renew_interval`.
    async fn execute_renewing(
        &self,
        selection: &RouteSelection,
        prompt: &str,
        cap: Decimal,
        lock: &Lock,
    ) -> Result<TaskResult, GatewayError> {
        let router = &self.services.router;
        let call = router.execute(selection, prompt, router.timeout(), cap);
        tokio::pin!(call);

        let mut renew = tokio::time::interval(self.config.renew_interval);
        // the first tick completes immediately
        renew.tick().await;
        let mut lease_held = true;
        loop {
            tokio::select! {
                result = &mut call => return result,
                _ = renew.tick(), if lease_held => {
                    if let Err(err) = self.services.locks.renew(lock).await {
                        tracing::warn!(worker = %self.holder, task_id = %lock.task_id, error = %err, "lease lost while executing");
                        lease_held = false;
                    }
                }
            }
        }
    }

    async fn finish_success(
        &self,
        task: &TaskRecord,
        selection: &RouteSelection,
        attempt_id: AttemptId,
        reservation: Reservation,
        result: TaskResult,
    ) -> Result<TickOutcome, GatewayError> {
        let charged = self.services.ledger.commit(reservation, result.cost).await?;
        let outcome = Outcome::success(result.clone());
        self.record_outcome(task, selection, attempt_id, &outcome, Some(charged))
            .await?;
        self.services.store.complete(task.id, result).await?;
        tracing::info!(worker = %self.holder, task_id = %task.id, cost = %charged, "task done");
        Ok(TickOutcome::Completed(task.id))
    }

    async fn finish_failure(
        &self,
        task: &TaskRecord,
        selection: &RouteSelection,
        attempt_id: AttemptId,
        reservation: Reservation,
        err: GatewayError,
        outcome: Outcome,
    ) -> Result<TickOutcome, GatewayError> {
        tracing::warn!(worker = %self.holder, task_id = %task.id, error = %err, "execution failed");
        self.services.ledger.release(reservation, err.code()).await?;
        self.record_outcome(task, selection, attempt_id, &outcome, None)
            .await?;

        // decide on the current record so attempts includes this one
        let current = self.services.store.get(task.id).await?;
        match self.services.decider.decide(&current, &outcome) {
            Decision::Retry { delay, reason } => {
                let not_before = add_std(self.services.clock.now(), delay);
                self.services
                    .store
                    .requeue(task.id, &self.holder, Some(not_before), reason)
                    .await?;
                tracing::info!(task_id = %task.id, ?delay, attempts = current.attempts, "task requeued");
                Ok(TickOutcome::Retrying(task.id))
            }
            Decision::MarkDead { reason } => {
                self.services
                    .store
                    .fail(task.id, TaskState::Running, reason)
                    .await?;
                tracing::warn!(task_id = %task.id, attempts = current.attempts, "task failed");
                Ok(TickOutcome::Failed(task.id))
            }
        }
    }

    /// Admission or budget denial: CLAIMED → FAILED without touching the
    /// backend.
    async fn block(&self, task: &TaskRecord, err: GatewayError) -> Result<TickOutcome, GatewayError> {
        let outcome = Outcome::blocked(&err);
        self.audit(
            AuditEvent::new(
                self.services.clock.now(),
                AuditEventKind::ExecutionOutcome,
                task.principal.clone(),
                json!({
                    "worker": self.holder,
                    "outcome": outcome,
                }),
            )
            .for_task(task.id),
        )
        .await?;
        self.services
            .store
            .fail(task.id, TaskState::Claimed, err.to_string())
            .await?;
        Ok(TickOutcome::Blocked(task.id))
    }

    async fn record_outcome(
        &self,
        task: &TaskRecord,
        selection: &RouteSelection,
        attempt_id: AttemptId,
        outcome: &Outcome,
        charged: Option<Decimal>,
    ) -> Result<(), GatewayError> {
        self.audit(
            AuditEvent::new(
                self.services.clock.now(),
                AuditEventKind::ExecutionOutcome,
                task.principal.clone(),
                json!({
                    "worker": self.holder,
                    "attempt_id": attempt_id,
                    "backend": selection.backend,
                    "model": selection.model,
                    "tier": selection.tier,
                    "charged": charged,
                    "outcome": outcome,
                }),
            )
            .for_task(task.id),
        )
        .await
    }

    async fn release_quietly(&self, reservation: Reservation, reason: &str) {
        if let Err(err) = self.services.ledger.release(reservation, reason).await {
            tracing::error!(worker = %self.holder, error = %err, "reservation release failed");
        }
    }

    async fn audit(&self, event: AuditEvent) -> Result<(), GatewayError> {
        self.services.audit.append(event).await.map(|_| ())
    }

    fn phase(&self, phase: WorkerPhase, task_id: Option<TaskId>) {
        self.board
            .set(self.index, phase, task_id, self.services.clock.now());
    }
}
