//! Circuit breaker gating dispatch.
//!
//! ```text
//!            N identical failures in window / trip(cause)
//!   CLOSED ────────────────────────────────────────────► OPEN
//!     ▲                                                  │ cooldown elapsed
//!     │ trial succeeds                                   ▼
//!     └──────────────────────────────────────────── HALF_OPEN ──► OPEN (trial fails)
//! ```
//!
//! Work is dispatched only while holding a `DispatchPermit`. In HALF_OPEN at
//! most one (trial) permit exists system-wide.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::BreakerConfig;
use crate::domain::{AuditEvent, AuditEventKind, GatewayError, SYSTEM_PRINCIPAL};
use crate::ports::{add_std, AuditSink, Clock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Why and when the breaker opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripEvent {
    pub at: DateTime<Utc>,
    pub from: BreakerState,
    pub cause: String,
}

/// Licence to dispatch one task. Must be resolved with `record_success`,
/// `record_failure` or `release`.
#[derive(Debug)]
#[must_use = "a permit must be resolved, or a HALF_OPEN trial stays blocked until it times out"]
pub struct DispatchPermit {
    id: u64,
    trial: bool,
}

impl DispatchPermit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub open_until: Option<DateTime<Utc>>,
    pub trial_in_flight: bool,
    /// Failures per signature still inside the window.
    pub recent_failures: HashMap<String, usize>,
    pub history: Vec<TripEvent>,
}

enum Transition {
    Tripped { from: BreakerState, cause: String },
    HalfOpened,
    Closed,
}

struct Trial {
    permit: u64,
    started: DateTime<Utc>,
}

/// Synchronous state machine. Time comes in as an argument.
struct BreakerCore {
    config: BreakerConfig,
    state: BreakerState,
    failures: HashMap<String, VecDeque<DateTime<Utc>>>,
    opened_at: Option<DateTime<Utc>>,
    trial: Option<Trial>,
    history: VecDeque<TripEvent>,
    next_permit: u64,
}

impl BreakerCore {
    fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            failures: HashMap::new(),
            opened_at: None,
            trial: None,
            history: VecDeque::new(),
            next_permit: 0,
        }
    }

    fn open_until(&self) -> Option<DateTime<Utc>> {
        match self.state {
            BreakerState::Open => self.opened_at.map(|at| add_std(at, self.config.cooldown)),
            _ => None,
        }
    }

    /// Time-driven edges: OPEN → HALF_OPEN after cooldown, abandoned trials.
    fn refresh(&mut self, now: DateTime<Utc>, out: &mut Vec<Transition>) {
        if self.state == BreakerState::Open
            && self.open_until().is_some_and(|until| now >= until)
        {
            self.state = BreakerState::HalfOpen;
            self.trial = None;
            out.push(Transition::HalfOpened);
        }
        if let Some(trial) = &self.trial
            && now >= add_std(trial.started, self.config.trial_timeout)
        {
            tracing::warn!(permit = trial.permit, "half-open trial abandoned after timeout");
            self.trial = None;
        }
    }

    fn trip(&mut self, now: DateTime<Utc>, cause: String, out: &mut Vec<Transition>) {
        let from = self.state;
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.trial = None;
        self.failures.clear();
        if self.history.len() >= self.config.history_capacity.max(1) {
            self.history.pop_front();
        }
        self.history.push_back(TripEvent {
            at: now,
            from,
            cause: cause.clone(),
        });
        out.push(Transition::Tripped { from, cause });
    }

    fn try_acquire(&mut self, now: DateTime<Utc>, out: &mut Vec<Transition>) -> Option<DispatchPermit> {
        self.refresh(now, out);
        match self.state {
            BreakerState::Open => None,
            BreakerState::Closed => Some(self.permit(false)),
            BreakerState::HalfOpen if self.trial.is_some() => None,
            BreakerState::HalfOpen => {
                let permit = self.permit(true);
                self.trial = Some(Trial {
                    permit: permit.id,
                    started: now,
                });
                Some(permit)
            }
        }
    }

    fn permit(&mut self, trial: bool) -> DispatchPermit {
        self.next_permit += 1;
        DispatchPermit {
            id: self.next_permit,
            trial,
        }
    }

    /// Whether `permit` is the live HALF_OPEN trial.
    fn is_live_trial(&self, permit: &DispatchPermit) -> bool {
        permit.trial
            && self.state == BreakerState::HalfOpen
            && self.trial.as_ref().is_some_and(|t| t.permit == permit.id)
    }

    fn success(&mut self, now: DateTime<Utc>, permit: DispatchPermit, out: &mut Vec<Transition>) {
        self.refresh(now, out);
        if self.is_live_trial(&permit) {
            self.state = BreakerState::Closed;
            self.trial = None;
            self.opened_at = None;
            self.failures.clear();
            out.push(Transition::Closed);
        } else if self.state == BreakerState::Closed {
            self.failures.clear();
        }
    }

    fn failure(
        &mut self,
        now: DateTime<Utc>,
        permit: DispatchPermit,
        signature: &str,
        out: &mut Vec<Transition>,
    ) {
        self.refresh(now, out);
        if self.is_live_trial(&permit) {
            self.trip(now, format!("half-open trial failed: {signature}"), out);
            return;
        }
        if self.state != BreakerState::Closed {
            tracing::debug!(signature, state = ?self.state, "failure while not closed, not counted");
            return;
        }

        let window = chrono::Duration::from_std(self.config.window).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let hits = self.failures.entry(signature.to_string()).or_default();
        hits.push_back(now);
        while hits.front().is_some_and(|at| *at < cutoff) {
            hits.pop_front();
        }
        let count = hits.len();
        if count >= self.config.failure_threshold as usize {
            self.trip(
                now,
                format!("{count} x {signature} within {}s", self.config.window.as_secs()),
                out,
            );
        }
    }

    fn release(&mut self, now: DateTime<Utc>, permit: DispatchPermit, out: &mut Vec<Transition>) {
        self.refresh(now, out);
        if self.is_live_trial(&permit) {
            self.trial = None;
        }
    }

    fn snapshot(&self, now: DateTime<Utc>) -> BreakerSnapshot {
        let window = chrono::Duration::from_std(self.config.window).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);
        BreakerSnapshot {
            state: self.state,
            open_until: self.open_until(),
            trial_in_flight: self.trial.is_some(),
            recent_failures: self
                .failures
                .iter()
                .map(|(sig, hits)| (sig.clone(), hits.iter().filter(|at| **at >= cutoff).count()))
                .filter(|(_, n)| *n > 0)
                .collect(),
            history: self.history.iter().cloned().collect(),
        }
    }
}

/// Shared handle. One instance per gateway, passed to the orchestrator and
/// every worker.
pub struct CircuitBreaker {
    core: Mutex<BreakerCore>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, audit: Arc<dyn AuditSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            core: Mutex::new(BreakerCore::new(config)),
            audit,
            clock,
        }
    }

    /// Appends an audit record per transition. State has already changed;
    /// an audit failure is reported but never undoes a trip.
    async fn publish(&self, now: DateTime<Utc>, core: &BreakerCore, transitions: Vec<Transition>) -> Result<(), GatewayError> {
        let mut first_err = None;
        for transition in transitions {
            let (kind, payload) = match transition {
                Transition::Tripped { from, cause } => {
                    tracing::warn!(from = ?from, cause = %cause, "circuit breaker tripped");
                    (
                        AuditEventKind::BreakerTripped,
                        serde_json::json!({
                            "from": from,
                            "to": BreakerState::Open,
                            "cause": cause,
                            "open_until": core.open_until(),
                        }),
                    )
                }
                Transition::HalfOpened => {
                    tracing::info!("circuit breaker half-open, allowing one trial");
                    (
                        AuditEventKind::BreakerHalfOpen,
                        serde_json::json!({ "from": BreakerState::Open, "to": BreakerState::HalfOpen }),
                    )
                }
                Transition::Closed => {
                    tracing::info!("circuit breaker closed after successful trial");
                    (
                        AuditEventKind::BreakerClosed,
                        serde_json::json!({
                            "from": BreakerState::HalfOpen,
                            "to": BreakerState::Closed,
                            "cause": "half-open trial succeeded",
                        }),
                    )
                }
            };
            let event = AuditEvent::new(now, kind, SYSTEM_PRINCIPAL, payload);
            if let Err(e) = self.audit.append(event).await {
                tracing::error!(error = %e, "breaker audit append failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub async fn state(&self) -> Result<BreakerState, GatewayError> {
        let mut core = self.core.lock().await;
        let now = self.clock.now();
        let mut out = Vec::new();
        core.refresh(now, &mut out);
        let state = core.state;
        self.publish(now, &core, out).await?;
        Ok(state)
    }

    /// A permit when dispatch is allowed now: always in CLOSED, never in
    /// OPEN, and only if no trial is in flight in HALF_OPEN.
    pub async fn try_acquire(&self) -> Result<Option<DispatchPermit>, GatewayError> {
        let mut core = self.core.lock().await;
        let now = self.clock.now();
        let mut out = Vec::new();
        let permit = core.try_acquire(now, &mut out);
        self.publish(now, &core, out).await?;
        Ok(permit)
    }

    pub async fn record_success(&self, permit: DispatchPermit) -> Result<(), GatewayError> {
        let mut core = self.core.lock().await;
        let now = self.clock.now();
        let mut out = Vec::new();
        core.success(now, permit, &mut out);
        self.publish(now, &core, out).await
    }

    /// `signature` groups identical failures, e.g. `backend_error:offline`.
    pub async fn record_failure(&self, permit: DispatchPermit, signature: &str) -> Result<(), GatewayError> {
        let mut core = self.core.lock().await;
        let now = self.clock.now();
        let mut out = Vec::new();
        core.failure(now, permit, signature, &mut out);
        self.publish(now, &core, out).await
    }

    /// Gives a permit back without a health signal.
    pub async fn release(&self, permit: DispatchPermit) {
        let mut core = self.core.lock().await;
        let now = self.clock.now();
        let mut out = Vec::new();
        core.release(now, permit, &mut out);
        // only a HalfOpened edge can appear here
        let _ = self.publish(now, &core, out).await;
    }

    /// Opens the breaker for an externally detected condition.
    pub async fn trip(&self, cause: impl Into<String>) -> Result<(), GatewayError> {
        let mut core = self.core.lock().await;
        let now = self.clock.now();
        let mut out = Vec::new();
        core.trip(now, cause.into(), &mut out);
        self.publish(now, &core, out).await
    }

    pub async fn history(&self) -> Vec<TripEvent> {
        self.core.lock().await.history.iter().cloned().collect()
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        let mut core = self.core.lock().await;
        let now = self.clock.now();
        let mut out = Vec::new();
        core.refresh(now, &mut out);
        let _ = self.publish(now, &core, out).await;
        core.snapshot(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryAuditLog;
    use crate::ports::ManualClock;
    use chrono::TimeZone;
    use std::time::Duration;

    const SIG: &str = "backend_error:offline";

    struct Fixture {
        breaker: Arc<CircuitBreaker>,
        audit: Arc<InMemoryAuditLog>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap(),
        ));
        let audit = Arc::new(InMemoryAuditLog::new());
        let config = BreakerConfig {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            trial_timeout: Duration::from_secs(10),
            history_capacity: 3,
        };
        let breaker = Arc::new(CircuitBreaker::new(config, audit.clone(), clock.clone()));
        Fixture { breaker, audit, clock }
    }

    async fn fail_once(b: &CircuitBreaker, sig: &str) {
        let permit = b.try_acquire().await.unwrap().unwrap();
        b.record_failure(permit, sig).await.unwrap();
    }

    async fn trip_it(f: &Fixture) {
        for _ in 0..5 {
            fail_once(&f.breaker, SIG).await;
        }
    }

    #[tokio::test]
    async fn five_identical_failures_trip() {
        let f = fixture();
        for _ in 0..4 {
            fail_once(&f.breaker, SIG).await;
        }
        assert_eq!(f.breaker.state().await.unwrap(), BreakerState::Closed);

        fail_once(&f.breaker, SIG).await;
        assert_eq!(f.breaker.state().await.unwrap(), BreakerState::Open);
        assert!(f.breaker.try_acquire().await.unwrap().is_none());

        let trips = f.audit.by_kind(AuditEventKind::BreakerTripped).await;
        assert_eq!(trips.len(), 1);
        assert!(trips[0].payload()["cause"].as_str().unwrap().contains(SIG));
    }

    #[tokio::test]
    async fn different_signatures_do_not_add_up() {
        let f = fixture();
        for i in 0..8 {
            fail_once(&f.breaker, &format!("backend_error:b{}", i % 2)).await;
        }
        assert_eq!(f.breaker.state().await.unwrap(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn failures_outside_the_window_expire() {
        let f = fixture();
        for _ in 0..4 {
            fail_once(&f.breaker, SIG).await;
        }
        f.clock.advance(Duration::from_secs(61));
        fail_once(&f.breaker, SIG).await;
        assert_eq!(f.breaker.state().await.unwrap(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn success_in_closed_clears_the_window() {
        let f = fixture();
        for _ in 0..4 {
            fail_once(&f.breaker, SIG).await;
        }
        let p = f.breaker.try_acquire().await.unwrap().unwrap();
        f.breaker.record_success(p).await.unwrap();
        fail_once(&f.breaker, SIG).await;
        assert_eq!(f.breaker.state().await.unwrap(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn cooldown_then_single_trial_then_close() {
        let f = fixture();
        trip_it(&f).await;

        f.clock.advance(Duration::from_secs(29));
        assert_eq!(f.breaker.state().await.unwrap(), BreakerState::Open);
        f.clock.advance(Duration::from_secs(1));
        assert_eq!(f.breaker.state().await.unwrap(), BreakerState::HalfOpen);

        let trial = f.breaker.try_acquire().await.unwrap().unwrap();
        assert!(trial.is_trial());
        assert!(f.breaker.try_acquire().await.unwrap().is_none());

        f.breaker.record_success(trial).await.unwrap();
        assert_eq!(f.breaker.state().await.unwrap(), BreakerState::Closed);
        assert_eq!(f.audit.by_kind(AuditEventKind::BreakerHalfOpen).await.len(), 1);
        assert_eq!(f.audit.by_kind(AuditEventKind::BreakerClosed).await.len(), 1);
    }

    #[tokio::test]
    async fn failed_trial_reopens_and_restarts_cooldown() {
        let f = fixture();
        trip_it(&f).await;
        f.clock.advance(Duration::from_secs(30));

        let trial = f.breaker.try_acquire().await.unwrap().unwrap();
        f.breaker.record_failure(trial, SIG).await.unwrap();
        assert_eq!(f.breaker.state().await.unwrap(), BreakerState::Open);

        f.clock.advance(Duration::from_secs(29));
        assert_eq!(f.breaker.state().await.unwrap(), BreakerState::Open);
        f.clock.advance(Duration::from_secs(1));
        assert_eq!(f.breaker.state().await.unwrap(), BreakerState::HalfOpen);

        let history = f.breaker.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].from, BreakerState::HalfOpen);
    }

    #[tokio::test]
    async fn released_trial_frees_the_slot_without_closing() {
        let f = fixture();
        trip_it(&f).await;
        f.clock.advance(Duration::from_secs(30));

        let trial = f.breaker.try_acquire().await.unwrap().unwrap();
        f.breaker.release(trial).await;
        assert_eq!(f.breaker.state().await.unwrap(), BreakerState::HalfOpen);
        assert!(f.breaker.try_acquire().await.unwrap().unwrap().is_trial());
    }

    #[tokio::test]
    async fn abandoned_trial_times_out() {
        let f = fixture();
        trip_it(&f).await;
        f.clock.advance(Duration::from_secs(30));

        let stale = f.breaker.try_acquire().await.unwrap().unwrap();
        f.clock.advance(Duration::from_secs(10));
        let fresh = f.breaker.try_acquire().await.unwrap().unwrap();

        // the stale permit no longer decides anything
        f.breaker.record_success(stale).await.unwrap();
        assert_eq!(f.breaker.state().await.unwrap(), BreakerState::HalfOpen);
        f.breaker.record_success(fresh).await.unwrap();
        assert_eq!(f.breaker.state().await.unwrap(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn late_results_from_before_the_trip_are_ignored() {
        let f = fixture();
        let early = f.breaker.try_acquire().await.unwrap().unwrap();
        trip_it(&f).await;
        f.breaker.record_success(early).await.unwrap();
        assert_eq!(f.breaker.state().await.unwrap(), BreakerState::Open);
    }

    #[tokio::test]
    async fn manual_trip_and_bounded_history() {
        let f = fixture();
        for i in 0..5 {
            f.breaker.trip(format!("disk full #{i}")).await.unwrap();
        }
        let history = f.breaker.history().await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].cause, "disk full #2");
        assert_eq!(history[2].cause, "disk full #4");

        let snap = f.breaker.snapshot().await;
        assert_eq!(snap.state, BreakerState::Open);
        assert!(snap.open_until.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn half_open_admits_exactly_one_concurrent_trial() {
        let f = fixture();
        trip_it(&f).await;
        f.clock.advance(Duration::from_secs(30));

        let mut joins = Vec::new();
        for _ in 0..16 {
            let b = f.breaker.clone();
            joins.push(tokio::spawn(async move { b.try_acquire().await.unwrap() }));
        }
        let mut permits = Vec::new();
        for j in joins {
            if let Some(p) = j.await.unwrap() {
                permits.push(p);
            }
        }
        assert_eq!(permits.len(), 1);
        assert!(permits[0].is_trial());
    }
}
