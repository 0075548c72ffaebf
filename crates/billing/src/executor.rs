//! Recurring billing executor
//!
//! Stateless batch job, invoked once per day by the worker: find the
//! merchant-managed subscriptions due today, charge each one, advance the
//! schedule on success, count the failure on decline, and suspend once the
//! failure budget is spent. `next_payment_date` only moves after a successful
//! charge and always lands strictly past the stored date, so a row that was
//! current is no longer due on a same-day re-run. A row left stale by an
//! outage may still be due after advancing; it catches up one grid point per
//! run, never more than one charge per run.

use chrono::{NaiveDate, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::email::MerchantEmailService;
use crate::error::BillingResult;
use crate::gateway::{ChargeError, ChargeGateway, ChargeOutcome, ChargeRequest};
use crate::schedule::{next_scheduled_date, BillingPeriod};
use crate::store::{BillingCycle, SubscriptionRecord, SubscriptionStore};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Consecutive failures tolerated before a subscription is suspended.
    pub failure_threshold: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

impl ExecutorConfig {
    /// `BILLING_FAILURE_THRESHOLD` overrides the default; anything
    /// unparseable or below 1 keeps it.
    pub fn from_env() -> Self {
        let failure_threshold = std::env::var("BILLING_FAILURE_THRESHOLD")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|t| *t >= 1)
            .unwrap_or(DEFAULT_FAILURE_THRESHOLD);
        Self { failure_threshold }
    }
}

/// What a successful charge does to the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleAdvance {
    pub next_payment_date: NaiveDate,
    /// Cycle budget reached with this charge; the row becomes terminal.
    pub completed: bool,
}

/// What a failed charge does to the failure budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailurePenalty {
    pub failure_count: i32,
    pub suspend: bool,
}

/// Advance the schedule from the *current* `next_payment_date` (not today),
/// so the grid is preserved across missed runs.
pub fn after_success(
    record: &SubscriptionRecord,
    period: BillingPeriod,
    frequency: u32,
) -> CycleAdvance {
    let next_payment_date = next_scheduled_date(
        record.date_added,
        record.next_payment_date,
        period,
        frequency,
    );
    let cycles = record.cycles_completed.saturating_add(1);
    let completed = record.total_billing_cycles > 0 && cycles >= record.total_billing_cycles;
    CycleAdvance {
        next_payment_date,
        completed,
    }
}

/// Count one more consecutive failure; past the threshold the subscription is
/// suspended.
pub fn after_failure(previous_failures: i32, threshold: u32) -> FailurePenalty {
    let failure_count = previous_failures.max(0).saturating_add(1);
    FailurePenalty {
        failure_count,
        suspend: failure_count > threshold as i32,
    }
}

/// Summary of one executor run, logged and returned to the caller.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub examined: usize,
    pub charged: usize,
    pub completed: usize,
    pub retried: usize,
    pub suspended: usize,
    pub skipped: usize,
}

impl RunSummary {
    fn new(run_date: NaiveDate) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            run_date,
            examined: 0,
            charged: 0,
            completed: 0,
            retried: 0,
            suspended: 0,
            skipped: 0,
        }
    }
}

pub struct RecurringBillingExecutor<G: ChargeGateway> {
    store: SubscriptionStore,
    gateway: G,
    email: MerchantEmailService,
    config: ExecutorConfig,
}

impl<G: ChargeGateway> RecurringBillingExecutor<G> {
    pub fn new(
        store: SubscriptionStore,
        gateway: G,
        email: MerchantEmailService,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            email,
            config,
        }
    }

    /// One batch run relative to the invocation instant.
    pub async fn run(&self) -> BillingResult<RunSummary> {
        self.run_for_date(Utc::now().date_naive()).await
    }

    /// One batch run relative to an explicit date.
    pub async fn run_for_date(&self, today: NaiveDate) -> BillingResult<RunSummary> {
        let mut summary = RunSummary::new(today);
        let due = self.store.due_subscription_ids(today).await?;
        info!(
            run_id = %summary.run_id,
            run_date = %today,
            due = due.len(),
            "recurring billing run started"
        );

        for subscription_id in due {
            summary.examined += 1;
            // Claimed rows are re-checked under lock; anything no longer due
            // (or claimed by an overlapping run) is skipped.
            let Some(cycle) = self.store.begin_cycle(&subscription_id, today).await? else {
                summary.skipped += 1;
                continue;
            };
            self.bill_one(cycle, &mut summary).await?;
        }

        info!(
            run_id = %summary.run_id,
            examined = summary.examined,
            charged = summary.charged,
            completed = summary.completed,
            retried = summary.retried,
            suspended = summary.suspended,
            skipped = summary.skipped,
            "recurring billing run complete"
        );
        Ok(summary)
    }

    async fn bill_one(&self, cycle: BillingCycle, summary: &mut RunSummary) -> BillingResult<()> {
        let record = cycle.record().clone();

        let Some(period) = BillingPeriod::parse(&record.billing_period) else {
            warn!(
                subscription_id = %record.subscription_id,
                billing_period = %record.billing_period,
                "unknown billing period; subscription skipped"
            );
            cycle.release().await?;
            summary.skipped += 1;
            return Ok(());
        };
        if record.billing_frequency < 1 {
            warn!(
                subscription_id = %record.subscription_id,
                billing_frequency = record.billing_frequency,
                "non-positive billing frequency; subscription skipped"
            );
            cycle.release().await?;
            summary.skipped += 1;
            return Ok(());
        }
        let Some(vault_id) = record.vault_id.as_deref() else {
            cycle.release().await?;
            summary.skipped += 1;
            return Ok(());
        };

        let request = ChargeRequest {
            subscription_id: &record.subscription_id,
            vault_id,
            amount_cents: record.amount_cents,
            currency_code: &record.currency_code,
            due_date: record.next_payment_date,
        };

        match self.gateway.charge(&request).await {
            Ok(ChargeOutcome::Captured { provider_ref }) => {
                let advance = after_success(&record, period, record.billing_frequency as u32);
                cycle
                    .complete_success(advance.next_payment_date, advance.completed)
                    .await?;
                info!(
                    subscription_id = %record.subscription_id,
                    provider_ref = %provider_ref,
                    next_payment_date = %advance.next_payment_date,
                    completed = advance.completed,
                    "subscription charged"
                );
                summary.charged += 1;
                if advance.completed {
                    summary.completed += 1;
                }
                debug_assert!(advance.next_payment_date > record.next_payment_date);
            }
            Ok(ChargeOutcome::Declined { reason }) => {
                warn!(
                    subscription_id = %record.subscription_id,
                    reason = %reason,
                    "charge declined"
                );
                self.penalize(cycle, &record, summary).await?;
            }
            Err(err) => {
                // Timeouts and ambiguous provider responses resolve to
                // "failure, retry next run", same as a decline.
                warn!(
                    subscription_id = %record.subscription_id,
                    error = %err,
                    "charge attempt errored"
                );
                if let ChargeError::Auth(_) = err {
                    // Broken merchant credentials affect every row; no charge
                    // was attempted, so the failure budget stays untouched.
                    cycle.release().await?;
                    summary.skipped += 1;
                    return Ok(());
                }
                self.penalize(cycle, &record, summary).await?;
            }
        }
        Ok(())
    }

    async fn penalize(
        &self,
        cycle: BillingCycle,
        record: &SubscriptionRecord,
        summary: &mut RunSummary,
    ) -> BillingResult<()> {
        let penalty = after_failure(record.failure_count, self.config.failure_threshold);
        cycle
            .complete_failure(penalty.failure_count, penalty.suspend)
            .await?;
        if penalty.suspend {
            summary.suspended += 1;
            info!(
                subscription_id = %record.subscription_id,
                failures = penalty.failure_count,
                "subscription suspended after repeated charge failures"
            );
            let email = self.email.clone();
            let subscription_id = record.subscription_id.clone();
            let orders_id = record.orders_id;
            let failures = penalty.failure_count;
            tokio::spawn(async move {
                email
                    .send_subscription_suspended(&subscription_id, orders_id, failures)
                    .await;
            });
        } else {
            summary.retried += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::SubscriptionStatus;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(cycles_completed: i32, total: i32, failures: i32) -> SubscriptionRecord {
        SubscriptionRecord {
            subscription_id: "legacy-100".to_string(),
            customers_id: 12,
            orders_id: 3400,
            orders_products_id: None,
            status: SubscriptionStatus::Active,
            billing_period: "week".to_string(),
            billing_frequency: 1,
            total_billing_cycles: total,
            cycles_completed,
            next_payment_date: date(2026, 2, 7),
            date_added: Some(date(2026, 1, 31)),
            amount_cents: 1999,
            currency_code: "USD".to_string(),
            vault_id: Some("8kk8451t".to_string()),
            plan_id: None,
            failure_count: failures,
            card_brand: None,
            card_last_digits: None,
            card_expiry: None,
            last_modified: None,
        }
    }

    #[test]
    fn success_advances_from_stored_date_not_today() {
        let advance = after_success(&record(0, 0, 0), BillingPeriod::Week, 1);
        // One week past the stored next_payment_date, on the anchor grid.
        assert_eq!(advance.next_payment_date, date(2026, 2, 14));
        assert!(!advance.completed);
    }

    #[test]
    fn cycle_cap_marks_completed_on_final_charge() {
        // total_billing_cycles = 3: the third successful charge is the last.
        let advance = after_success(&record(2, 3, 0), BillingPeriod::Week, 1);
        assert!(advance.completed);
        // One cycle earlier is not terminal.
        let advance = after_success(&record(1, 3, 0), BillingPeriod::Week, 1);
        assert!(!advance.completed);
    }

    #[test]
    fn stale_rows_advance_past_stored_date_not_past_today() {
        // A row left behind by an outage (stored date months old) advances
        // exactly one grid point: past the stored date, but possibly still
        // before today. It catches up on subsequent runs, one charge each.
        let mut stale = record(0, 0, 0);
        stale.date_added = Some(date(2025, 11, 3));
        stale.next_payment_date = date(2025, 12, 1);
        let today = date(2026, 2, 1);
        let advance = after_success(&stale, BillingPeriod::Week, 1);
        assert_eq!(advance.next_payment_date, date(2025, 12, 8));
        assert!(advance.next_payment_date > stale.next_payment_date);
        assert!(advance.next_payment_date <= today, "still due, by design");
    }

    #[test]
    fn unlimited_cycles_never_complete() {
        let advance = after_success(&record(10_000, 0, 0), BillingPeriod::Week, 1);
        assert!(!advance.completed);
    }

    #[test]
    fn failures_suspend_only_past_threshold() {
        let threshold = 3;
        assert_eq!(
            after_failure(0, threshold),
            FailurePenalty {
                failure_count: 1,
                suspend: false
            }
        );
        assert_eq!(
            after_failure(2, threshold),
            FailurePenalty {
                failure_count: 3,
                suspend: false
            }
        );
        // Failure N+1 crosses the budget.
        assert_eq!(
            after_failure(3, threshold),
            FailurePenalty {
                failure_count: 4,
                suspend: true
            }
        );
    }

    #[test]
    fn negative_legacy_failure_counts_are_clamped() {
        assert_eq!(
            after_failure(-7, 3),
            FailurePenalty {
                failure_count: 1,
                suspend: false
            }
        );
    }

    #[test]
    fn default_config_uses_standard_threshold() {
        let config = ExecutorConfig::default();
        assert_eq!(config.failure_threshold, DEFAULT_FAILURE_THRESHOLD);
    }
}
