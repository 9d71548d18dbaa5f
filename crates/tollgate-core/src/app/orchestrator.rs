//! Orchestrator - worker pool のライフサイクル管理
//!
//! - `pool_size` 個の WorkerLoop と ReaperLoop を spawn
//! - control loop は `tick` ごとに kill switch と breaker を見る
//! - breaker OPEN → pause（worker は IDLE で待機、kill はしない）
//! - kill switch → drain（新規 claim 停止、実行中は drain_timeout まで待つ）
//!
//! Nothing outside this module can change the mode; `status()` is read-only.

use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::breaker::BreakerState;
use crate::config::WorkerConfig;
use crate::domain::{AuditEvent, AuditEventKind, GatewayError, HolderId, SYSTEM_PRINCIPAL};
use crate::queue::QueueCounts;

use super::builder::Services;
use super::kill_switch::KillSwitch;
use super::reaper_loop::ReaperLoop;
use super::status::{OrchestratorMode, OrchestratorStatus, PhaseBoard};
use super::worker_loop::WorkerLoop;

/// When `run` returns of its own accord.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Only the kill switch ends the run.
    UntilKilled,
    /// Also stop once nothing is pending, claimed or running.
    UntilIdle,
}

/// Why the pool was drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainCause {
    KillSwitch,
    QueueIdle,
}

#[derive(Debug, Clone, Serialize)]
pub struct DrainReport {
    pub cause: DrainCause,
    /// Workers that reached IDLE and exited within the drain timeout.
    pub finished: Vec<HolderId>,
    /// Workers still busy at the deadline; their tasks were aborted and are
    /// left for the reaper.
    pub aborted: Vec<HolderId>,
    pub elapsed: Duration,
    pub tasks: QueueCounts,
}

pub struct Orchestrator {
    services: Services,
    config: WorkerConfig,
    kill_switch: KillSwitch,
    board: PhaseBoard,
    mode: watch::Sender<OrchestratorMode>,
}

impl Orchestrator {
    pub fn new(services: Services, config: WorkerConfig, kill_switch: KillSwitch) -> Self {
        let holders = (0..config.pool_size).map(HolderId::worker).collect();
        let board = PhaseBoard::new(holders, services.clock.now());
        let (mode, _) = watch::channel(OrchestratorMode::NotStarted);
        Self {
            services,
            config,
            kill_switch,
            board,
            mode,
        }
    }

    pub fn kill_switch(&self) -> KillSwitch {
        self.kill_switch.clone()
    }

    pub fn mode(&self) -> OrchestratorMode {
        *self.mode.borrow()
    }

    /// Watch mode changes (e.g. from a dashboard task).
    pub fn subscribe_mode(&self) -> watch::Receiver<OrchestratorMode> {
        self.mode.subscribe()
    }

    /// Starts the pool and drives the control loop until the kill switch
    /// fires (or, with `RunMode::UntilIdle`, the queue drains), then shuts
    /// the pool down.
    pub async fn run(&self, run_mode: RunMode) -> Result<DrainReport, GatewayError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (pause_tx, pause_rx) = watch::channel(false);

        let mut workers = Vec::with_capacity(self.config.pool_size);
        for index in 0..self.config.pool_size {
            let worker = WorkerLoop::new(
                index,
                self.services.clone(),
                self.config.clone(),
                self.board.clone(),
            );
            let holder = worker.holder().clone();
            let join = tokio::spawn(worker.run(shutdown_rx.clone(), pause_rx.clone()));
            workers.push((holder, join));
        }
        let reaper = ReaperLoop::new(self.services.clone(), &self.config);
        let reaper_join = tokio::spawn(reaper.run(shutdown_rx.clone()));

        self.mode.send_replace(OrchestratorMode::Running);
        tracing::info!(workers = self.config.pool_size, ?run_mode, "orchestrator running");

        let cause = self.control_loop(run_mode, &pause_tx).await;
        Ok(self.drain(cause, shutdown_tx, workers, reaper_join).await)
    }

    async fn control_loop(
        &self,
        run_mode: RunMode,
        pause_tx: &watch::Sender<bool>,
    ) -> DrainCause {
        let mut tick = tokio::time::interval(self.config.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.kill_switch.triggered() => {}
            }
            if self.kill_switch.is_triggered() {
                return DrainCause::KillSwitch;
            }

            match self.services.breaker.state().await {
                Ok(state) => {
                    let open = state == BreakerState::Open;
                    if open != *pause_tx.borrow() {
                        pause_tx.send_replace(open);
                        if open {
                            self.mode.send_replace(OrchestratorMode::Paused);
                            tracing::warn!("breaker open, claims paused");
                        } else {
                            self.mode.send_replace(OrchestratorMode::Running);
                            tracing::info!(?state, "breaker no longer open, claims resumed");
                        }
                    }
                }
                Err(err) => tracing::error!(error = %err, "breaker state unavailable"),
            }

            if run_mode == RunMode::UntilIdle {
                match self.services.store.counts_by_state().await {
                    Ok(counts) if counts.outstanding() == 0 => {
                        if self.board.busy() == 0 {
                            return DrainCause::QueueIdle;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => tracing::error!(error = %err, "queue counts unavailable"),
                }
            }
        }
    }

    async fn drain(
        &self,
        cause: DrainCause,
        shutdown_tx: watch::Sender<bool>,
        workers: Vec<(HolderId, JoinHandle<()>)>,
        mut reaper: JoinHandle<()>,
    ) -> DrainReport {
        self.mode.send_replace(OrchestratorMode::Draining);
        let started = tokio::time::Instant::now();
        let in_flight = self.board.busy();
        tracing::info!(?cause, in_flight, "draining worker pool");
        self.audit_drain(json!({
            "phase": "started",
            "cause": cause,
            "in_flight": in_flight,
            "timeout_ms": u64::try_from(self.config.drain_timeout.as_millis()).unwrap_or(u64::MAX),
        }))
        .await;

        shutdown_tx.send_replace(true);
        let deadline = started + self.config.drain_timeout;

        let mut finished = Vec::new();
        let mut aborted = Vec::new();
        for (holder, mut join) in workers {
            match tokio::time::timeout_at(deadline, &mut join).await {
                Ok(Ok(())) => finished.push(holder),
                Ok(Err(err)) => {
                    tracing::error!(worker = %holder, error = %err, "worker task panicked");
                    aborted.push(holder);
                }
                Err(_) => {
                    tracing::warn!(worker = %holder, "worker still busy at drain deadline, aborting");
                    join.abort();
                    aborted.push(holder);
                }
            }
        }
        if tokio::time::timeout_at(deadline, &mut reaper).await.is_err() {
            reaper.abort();
        }

        let tasks = match self.services.store.counts_by_state().await {
            Ok(counts) => counts,
            Err(err) => {
                tracing::error!(error = %err, "queue counts unavailable after drain");
                QueueCounts::default()
            }
        };
        let elapsed = started.elapsed();
        self.audit_drain(json!({
            "phase": "finished",
            "cause": cause,
            "finished": finished,
            "aborted": aborted,
            "elapsed_ms": u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "tasks": tasks,
        }))
        .await;
        self.mode.send_replace(OrchestratorMode::Stopped);
        tracing::info!(finished = finished.len(), aborted = aborted.len(), ?elapsed, "orchestrator stopped");

        DrainReport {
            cause,
            finished,
            aborted,
            elapsed,
            tasks,
        }
    }

    /// The drain proceeds even when the audit sink is down.
    async fn audit_drain(&self, payload: serde_json::Value) {
        let event = AuditEvent::new(
            self.services.clock.now(),
            AuditEventKind::OrchestratorDrain,
            SYSTEM_PRINCIPAL,
            payload,
        );
        if let Err(err) = self.services.audit.append(event).await {
            tracing::error!(error = %err, "drain audit record not written");
        }
    }

    /// Read-only status surface: queue depth, per-worker phase, breaker
    /// state and ledger remaining-by-principal.
    pub async fn status(&self) -> Result<OrchestratorStatus, GatewayError> {
        let tasks = self.services.store.counts_by_state().await?;
        Ok(OrchestratorStatus {
            at: self.services.clock.now(),
            mode: self.mode(),
            kill_switch: self.kill_switch.is_triggered(),
            queue_depth: tasks.queue_depth(),
            tasks,
            workers: self.board.snapshot(),
            breaker: self.services.breaker.snapshot().await,
            ledger: self.services.ledger.snapshot().await,
        })
    }
}
