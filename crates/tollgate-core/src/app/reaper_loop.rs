//! ReaperLoop - Lease 期限切れの回収
//!
//! # フロー
//! 1. TaskStore::claimed_before(now - lease) で古い claim を取得
//! 2. live lock があればスキップ（まだ誰かが実行中）
//! 3. Decider に LeaseExpired を渡して requeue か FAILED を決める
//!
//! Requeue is a compare-and-set on the holder recorded in the claim, so a
//! worker that re-claimed the task in the meantime is never disturbed.

use std::time::Duration;

use tokio::sync::watch;

use crate::config::WorkerConfig;
use crate::domain::{Decision, GatewayError, Outcome, TaskId};

use super::builder::Services;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub requeued: Vec<TaskId>,
    pub failed: Vec<TaskId>,
    /// Old claims still covered by a live lock.
    pub skipped: usize,
}

pub struct ReaperLoop {
    services: Services,
    lease: Duration,
    interval: Duration,
}

impl ReaperLoop {
    pub fn new(services: Services, config: &WorkerConfig) -> Self {
        Self {
            services,
            lease: config.lease,
            interval: config.reaper_interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(interval = ?self.interval, "reaper started");
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tick.tick() => {
                    match self.reap_once().await {
                        Ok(report) if !report.requeued.is_empty() || !report.failed.is_empty() => {
                            tracing::info!(
                                requeued = report.requeued.len(),
                                failed = report.failed.len(),
                                "reaped expired claims"
                            );
                        }
                        Ok(_) => {}
                        Err(err) => tracing::error!(error = %err, "reaper sweep failed"),
                    }
                }
            }
        }
        tracing::info!("reaper stopped");
    }

    pub async fn reap_once(&self) -> Result<ReapReport, GatewayError> {
        let now = self.services.clock.now();
        let lease = chrono::Duration::from_std(self.lease).unwrap_or(chrono::Duration::MAX);
        let cutoff = now
            .checked_sub_signed(lease)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);

        let mut report = ReapReport::default();
        for task in self.services.store.claimed_before(cutoff).await? {
            if self.services.locks.live(task.id).await.is_some() {
                report.skipped += 1;
                continue;
            }
            let Some(holder) = task.claimed_by.clone() else {
                continue;
            };

            let outcome = Outcome::failure(&GatewayError::LeaseExpired(task.id));
            let result = match self.services.decider.decide(&task, &outcome) {
                Decision::Retry { delay, reason } => {
                    let not_before = crate::ports::add_std(now, delay);
                    self.services
                        .store
                        .requeue(task.id, &holder, Some(not_before), reason)
                        .await
                        .map(|()| report.requeued.push(task.id))
                }
                Decision::MarkDead { reason } => {
                    match self.services.store.fail(task.id, task.state, reason).await {
                        Ok(_) => {
                            self.services.locks.forget(task.id).await;
                            report.failed.push(task.id);
                            Ok(())
                        }
                        Err(err) => Err(err),
                    }
                }
            };

            match result {
                Ok(()) => {
                    tracing::warn!(task_id = %task.id, holder = %holder, state = ?task.state, "lease expired");
                }
                // the holder finished or someone else reaped it first
                Err(err @ (GatewayError::InvalidTransition { .. } | GatewayError::Busy { .. })) => {
                    tracing::debug!(task_id = %task.id, error = %err, "reap lost a race");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(report)
    }
}
