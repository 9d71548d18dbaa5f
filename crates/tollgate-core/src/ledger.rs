//! Budget ledger: per-principal spend accounting with a reserve → commit /
//! release protocol.
//!
//! A reservation holds the task's maximum spend until the real cost is
//! known. `remaining = allocated - committed - reserved` never goes below
//! zero because the check and the decrement happen under one lock.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::LedgerConfig;
use crate::domain::{AuditEvent, AuditEventKind, GatewayError, ReservationId, TaskId};
use crate::ports::{AuditSink, Clock, IdGenerator};

/// A provisional hold on budget. Consumed by `commit` or `release`.
#[derive(Debug)]
#[must_use = "a reservation holds budget until it is committed or released"]
pub struct Reservation {
    id: ReservationId,
    principal: String,
    amount: Decimal,
    task_id: Option<TaskId>,
}

impl Reservation {
    pub fn id(&self) -> ReservationId {
        self.id
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }
}

/// One row of `BudgetLedger::snapshot`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerRow {
    pub principal: String,
    pub period: NaiveDate,
    pub allocated: Decimal,
    pub committed: Decimal,
    pub reserved: Decimal,
    pub remaining: Decimal,
}

struct Entry {
    period: NaiveDate,
    allocated: Decimal,
    committed: Decimal,
    reserved: Decimal,
    /// Allocation a new period starts with.
    base: Decimal,
    warned: bool,
}

impl Entry {
    fn remaining(&self) -> Decimal {
        (self.allocated - self.committed - self.reserved).max(Decimal::ZERO)
    }

    /// Starts a new accounting period. Outstanding holds carry over so a
    /// reservation taken before midnight can still be settled after it.
    fn roll(&mut self, today: NaiveDate, principal: &str) {
        if self.period == today {
            return;
        }
        tracing::info!(principal, period = %today, "ledger period reset");
        self.period = today;
        self.committed = Decimal::ZERO;
        self.allocated = self.base.max(self.reserved);
        self.warned = false;
    }

    fn row(&self, principal: &str) -> LedgerRow {
        LedgerRow {
            principal: principal.to_string(),
            period: self.period,
            allocated: self.allocated,
            committed: self.committed,
            reserved: self.reserved,
            remaining: self.remaining(),
        }
    }
}

pub struct BudgetLedger {
    config: LedgerConfig,
    entries: Mutex<HashMap<String, Entry>>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl BudgetLedger {
    pub fn new(
        config: LedgerConfig,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            audit,
            clock,
            ids,
        }
    }

    fn entry<'a>(
        &self,
        entries: &'a mut HashMap<String, Entry>,
        principal: &str,
        today: NaiveDate,
    ) -> &'a mut Entry {
        let entry = entries.entry(principal.to_string()).or_insert_with(|| {
            let base = self.config.allocation_for(principal);
            Entry {
                period: today,
                allocated: base,
                committed: Decimal::ZERO,
                reserved: Decimal::ZERO,
                base,
                warned: false,
            }
        });
        entry.roll(today, principal);
        entry
    }

    /// Holds `amount` against `principal` if it fits in what remains.
    ///
    /// On `BudgetExceeded` nothing changes except the denial record.
    pub async fn reserve(
        &self,
        principal: &str,
        amount: Decimal,
        task_id: Option<TaskId>,
    ) -> Result<Reservation, GatewayError> {
        if amount.is_sign_negative() {
            return Err(GatewayError::Validation(format!(
                "reservation amount must not be negative, got {amount}"
            )));
        }

        let mut entries = self.entries.lock().await;
        let now = self.clock.now();
        let entry = self.entry(&mut entries, principal, now.date_naive());
        let remaining = entry.remaining();

        if remaining < amount {
            let event = with_task(
                AuditEvent::new(
                    now,
                    AuditEventKind::BudgetDenied,
                    principal,
                    serde_json::json!({
                        "requested": amount,
                        "remaining": remaining,
                        "allocated": entry.allocated,
                        "committed": entry.committed,
                        "reserved": entry.reserved,
                    }),
                ),
                task_id,
            );
            self.audit.append(event).await?;
            tracing::warn!(principal, %remaining, requested = %amount, "budget exceeded");
            return Err(GatewayError::BudgetExceeded {
                principal: principal.to_string(),
                remaining,
                requested: amount,
            });
        }

        let id = self.ids.reservation_id();
        let event = with_task(
            AuditEvent::new(
                now,
                AuditEventKind::BudgetReserved,
                principal,
                serde_json::json!({
                    "reservation_id": id,
                    "amount": amount,
                    "remaining_after": remaining - amount,
                }),
            ),
            task_id,
        );
        self.audit.append(event).await?;

        entry.reserved += amount;
        tracing::debug!(principal, %amount, reservation = %id, "budget reserved");
        Ok(Reservation {
            id,
            principal: principal.to_string(),
            amount,
            task_id,
        })
    }

    /// Settles a reservation at `actual` and refunds the difference.
    ///
    /// `actual` is clamped to `[0, reservation.amount]`; the charged amount
    /// is returned. The refund is applied even if the audit append fails.
    pub async fn commit(
        &self,
        reservation: Reservation,
        actual: Decimal,
    ) -> Result<Decimal, GatewayError> {
        let charged = actual.max(Decimal::ZERO).min(reservation.amount);
        if charged != actual {
            tracing::warn!(
                principal = %reservation.principal,
                reported = %actual,
                charged = %charged,
                "reported cost outside reservation, clamped"
            );
        }

        let mut entries = self.entries.lock().await;
        let now = self.clock.now();
        let entry = self.entry(&mut entries, &reservation.principal, now.date_naive());

        let event = with_task(
            AuditEvent::new(
                now,
                AuditEventKind::BudgetCommitted,
                reservation.principal.as_str(),
                serde_json::json!({
                    "reservation_id": reservation.id,
                    "reserved": reservation.amount,
                    "reported": actual,
                    "charged": charged,
                    "refunded": reservation.amount - charged,
                }),
            ),
            reservation.task_id,
        );
        let audited = self.audit.append(event).await;

        entry.reserved = (entry.reserved - reservation.amount).max(Decimal::ZERO);
        entry.committed += charged;

        let threshold = entry.allocated * self.config.warn_ratio;
        if !entry.warned && entry.allocated > Decimal::ZERO && entry.committed >= threshold {
            entry.warned = true;
            tracing::warn!(
                principal = %reservation.principal,
                committed = %entry.committed,
                allocated = %entry.allocated,
                "approaching budget limit"
            );
        }

        audited?;
        Ok(charged)
    }

    /// Full refund. Used when the task failed before any cost was incurred.
    pub async fn release(&self, reservation: Reservation, reason: &str) -> Result<(), GatewayError> {
        let mut entries = self.entries.lock().await;
        let now = self.clock.now();
        let entry = self.entry(&mut entries, &reservation.principal, now.date_naive());

        let event = with_task(
            AuditEvent::new(
                now,
                AuditEventKind::BudgetReleased,
                reservation.principal.as_str(),
                serde_json::json!({
                    "reservation_id": reservation.id,
                    "amount": reservation.amount,
                    "reason": reason,
                }),
            ),
            reservation.task_id,
        );
        let audited = self.audit.append(event).await;

        entry.reserved = (entry.reserved - reservation.amount).max(Decimal::ZERO);
        tracing::debug!(principal = %reservation.principal, amount = %reservation.amount, "budget released");
        audited.map(|_| ())
    }

    /// Sets `principal`'s allocation for this and following periods.
    ///
    /// Fails when the new amount is below what is already committed or held.
    pub async fn allocate(&self, principal: &str, amount: Decimal) -> Result<(), GatewayError> {
        let mut entries = self.entries.lock().await;
        let now = self.clock.now();
        let entry = self.entry(&mut entries, principal, now.date_naive());

        if amount.is_sign_negative() || amount < entry.committed + entry.reserved {
            return Err(GatewayError::Validation(format!(
                "allocation {amount} for '{principal}' is below committed {} + reserved {}",
                entry.committed, entry.reserved
            )));
        }

        let event = AuditEvent::new(
            now,
            AuditEventKind::BudgetAllocated,
            principal,
            serde_json::json!({ "op": "allocate", "amount": amount, "previous": entry.allocated }),
        );
        self.audit.append(event).await?;

        entry.allocated = amount;
        entry.base = amount;
        entry.warned = entry.committed >= amount * self.config.warn_ratio && amount > Decimal::ZERO;
        Ok(())
    }

    /// Adds `amount` to the current period's allocation.
    pub async fn replenish(&self, principal: &str, amount: Decimal) -> Result<(), GatewayError> {
        if amount <= Decimal::ZERO {
            return Err(GatewayError::Validation(format!(
                "replenish amount must be positive, got {amount}"
            )));
        }

        let mut entries = self.entries.lock().await;
        let now = self.clock.now();
        let entry = self.entry(&mut entries, principal, now.date_naive());

        let event = AuditEvent::new(
            now,
            AuditEventKind::BudgetAllocated,
            principal,
            serde_json::json!({ "op": "replenish", "amount": amount, "previous": entry.allocated }),
        );
        self.audit.append(event).await?;

        entry.allocated += amount;
        tracing::info!(principal, %amount, allocated = %entry.allocated, "budget replenished");
        Ok(())
    }

    pub async fn remaining(&self, principal: &str) -> Decimal {
        let mut entries = self.entries.lock().await;
        let today = self.clock.now().date_naive();
        self.entry(&mut entries, principal, today).remaining()
    }

    /// Current-period rows for every principal seen so far plus every
    /// principal with a configured allocation, sorted by principal.
    pub async fn snapshot(&self) -> Vec<LedgerRow> {
        let mut entries = self.entries.lock().await;
        let today = self.clock.now().date_naive();
        for principal in self.config.allocations.keys() {
            self.entry(&mut entries, principal, today);
        }
        let mut rows: Vec<LedgerRow> = entries
            .iter_mut()
            .map(|(principal, entry)| {
                entry.roll(today, principal);
                entry.row(principal)
            })
            .collect();
        rows.sort_by(|a, b| a.principal.cmp(&b.principal));
        rows
    }
}

fn with_task(event: AuditEvent, task_id: Option<TaskId>) -> AuditEvent {
    match task_id {
        Some(id) => event.for_task(id),
        None => event,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryAuditLog;
    use crate::ports::{ManualClock, UlidGenerator};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct Fixture {
        ledger: Arc<BudgetLedger>,
        audit: Arc<InMemoryAuditLog>,
        clock: Arc<ManualClock>,
    }

    fn fixture(default_allocation: Decimal) -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 1, 23, 0, 0).unwrap(),
        ));
        let audit = Arc::new(InMemoryAuditLog::new());
        let ids = Arc::new(UlidGenerator::new(clock.clone()));
        let config = LedgerConfig {
            default_allocation,
            ..LedgerConfig::default()
        };
        let ledger = Arc::new(BudgetLedger::new(config, audit.clone(), clock.clone(), ids));
        Fixture { ledger, audit, clock }
    }

    #[tokio::test]
    async fn reserve_more_than_remaining_is_denied_without_mutation() {
        let f = fixture(dec!(0.02));

        let err = f.ledger.reserve("guest", dec!(0.03), None).await.unwrap_err();
        match err {
            GatewayError::BudgetExceeded {
                remaining,
                requested,
                ..
            } => {
                assert_eq!(remaining, dec!(0.02));
                assert_eq!(requested, dec!(0.03));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(f.ledger.remaining("guest").await, dec!(0.02));
        assert_eq!(f.audit.by_kind(AuditEventKind::BudgetDenied).await.len(), 1);
    }

    #[tokio::test]
    async fn commit_refunds_the_difference() {
        let f = fixture(dec!(1.00));
        let r = f.ledger.reserve("alice", dec!(0.10), None).await.unwrap();
        assert_eq!(f.ledger.remaining("alice").await, dec!(0.90));

        let charged = f.ledger.commit(r, dec!(0.04)).await.unwrap();
        assert_eq!(charged, dec!(0.04));
        assert_eq!(f.ledger.remaining("alice").await, dec!(0.96));

        let rows = f.ledger.snapshot().await;
        assert_eq!(rows[0].committed, dec!(0.04));
        assert_eq!(rows[0].reserved, dec!(0));
    }

    #[tokio::test]
    async fn commit_caps_cost_at_reservation() {
        let f = fixture(dec!(1.00));
        let r = f.ledger.reserve("alice", dec!(0.10), None).await.unwrap();
        let charged = f.ledger.commit(r, dec!(5.00)).await.unwrap();
        assert_eq!(charged, dec!(0.10));
        assert_eq!(f.ledger.remaining("alice").await, dec!(0.90));
    }

    #[tokio::test]
    async fn release_is_a_full_refund() {
        let f = fixture(dec!(0.50));
        let r = f.ledger.reserve("bob", dec!(0.50), None).await.unwrap();
        assert_eq!(f.ledger.remaining("bob").await, dec!(0));
        f.ledger.release(r, "backend_timeout").await.unwrap();
        assert_eq!(f.ledger.remaining("bob").await, dec!(0.50));
        assert_eq!(f.audit.by_kind(AuditEventKind::BudgetReleased).await.len(), 1);
    }

    #[tokio::test]
    async fn negative_amount_is_rejected() {
        let f = fixture(dec!(1));
        let err = f.ledger.reserve("bob", dec!(-0.01), None).await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[tokio::test]
    async fn new_day_starts_a_fresh_period() {
        let f = fixture(dec!(0.10));
        let r = f.ledger.reserve("carol", dec!(0.10), None).await.unwrap();
        f.ledger.commit(r, dec!(0.10)).await.unwrap();
        assert_eq!(f.ledger.remaining("carol").await, dec!(0));

        f.clock.advance(Duration::from_secs(2 * 60 * 60));
        assert_eq!(f.ledger.remaining("carol").await, dec!(0.10));
        let rows = f.ledger.snapshot().await;
        assert_eq!(rows[0].period, NaiveDate::from_ymd_opt(2026, 5, 2).unwrap());
    }

    #[tokio::test]
    async fn hold_taken_before_midnight_settles_after() {
        let f = fixture(dec!(0.10));
        let r = f.ledger.reserve("carol", dec!(0.08), None).await.unwrap();
        f.clock.advance(Duration::from_secs(2 * 60 * 60));

        // still held in the new period
        assert_eq!(f.ledger.remaining("carol").await, dec!(0.02));
        f.ledger.commit(r, dec!(0.05)).await.unwrap();
        assert_eq!(f.ledger.remaining("carol").await, dec!(0.05));
    }

    #[tokio::test]
    async fn allocate_and_replenish() {
        let f = fixture(dec!(0.10));
        let r = f.ledger.reserve("dave", dec!(0.06), None).await.unwrap();

        let err = f.ledger.allocate("dave", dec!(0.05)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));

        f.ledger.allocate("dave", dec!(0.20)).await.unwrap();
        assert_eq!(f.ledger.remaining("dave").await, dec!(0.14));

        f.ledger.replenish("dave", dec!(0.01)).await.unwrap();
        assert_eq!(f.ledger.remaining("dave").await, dec!(0.15));
        f.ledger.release(r, "test").await.unwrap();
        assert_eq!(f.audit.by_kind(AuditEventKind::BudgetAllocated).await.len(), 2);
    }

    #[tokio::test]
    async fn configured_principals_show_up_in_snapshot() {
        let clock = Arc::new(ManualClock::default());
        let audit = Arc::new(InMemoryAuditLog::new());
        let ids = Arc::new(UlidGenerator::new(clock.clone()));
        let mut config = LedgerConfig::default();
        config.allocations.insert("ops".into(), dec!(3));
        let ledger = BudgetLedger::new(config, audit, clock, ids);

        let rows = ledger.snapshot().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].principal, "ops");
        assert_eq!(rows[0].remaining, dec!(3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservations_never_overspend() {
        let f = fixture(dec!(0.25));

        let mut joins = Vec::new();
        for _ in 0..50 {
            let ledger = f.ledger.clone();
            joins.push(tokio::spawn(async move {
                ledger.reserve("shared", dec!(0.01), None).await
            }));
        }

        let mut held = Vec::new();
        let mut denied = 0;
        for j in joins {
            match j.await.unwrap() {
                Ok(r) => held.push(r),
                Err(GatewayError::BudgetExceeded { .. }) => denied += 1,
                Err(other) => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(held.len(), 25);
        assert_eq!(denied, 25);
        let outstanding: Decimal = held.iter().map(Reservation::amount).sum();
        assert_eq!(outstanding, dec!(0.25));
        assert_eq!(f.ledger.remaining("shared").await, dec!(0));

        for r in held {
            f.ledger.commit(r, dec!(0.005)).await.unwrap();
        }
        assert_eq!(f.ledger.remaining("shared").await, dec!(0.125));
    }
}
