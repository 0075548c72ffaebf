//! Subscription record store
//!
//! Persistence over the legacy `recurring_subscriptions` table. Deployments
//! differ in which home-grown extension columns exist, so the store probes
//! `information_schema` once per process, caches the result, and builds its
//! SQL around the columns that are actually there. Missing optional columns
//! are read as typed NULL substitutes, so one row struct serves every
//! deployment vintage.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::OnceCell;
use tracing::warn;

use crate::error::BillingResult;
use crate::status::SubscriptionStatus;

pub const TABLE: &str = "recurring_subscriptions";

/// Columns every vintage of the legacy table carries.
const CORE_COLUMNS: &[&str] = &[
    "subscription_id",
    "customers_id",
    "orders_id",
    "orders_products_id",
    "status",
    "billing_period",
    "billing_frequency",
    "total_billing_cycles",
    "cycles_completed",
    "next_payment_date",
    "date_added",
    "amount_cents",
    "currency_code",
];

/// Extension columns layered onto the legacy schema over time, paired with
/// the typed substitute selected when the column is absent.
const OPTIONAL_COLUMNS: &[(&str, &str)] = &[
    ("vault_id", "NULL::text"),
    ("plan_id", "NULL::text"),
    ("failure_count", "0"),
    ("card_brand", "NULL::text"),
    ("card_last_digits", "NULL::text"),
    ("card_expiry", "NULL::text"),
    ("last_modified", "NULL::timestamptz"),
];

/// Which columns the deployed table actually has. Probed once per process.
#[derive(Debug, Clone)]
pub struct SchemaCaps {
    columns: HashSet<String>,
}

impl SchemaCaps {
    pub fn has(&self, column: &str) -> bool {
        self.columns.contains(column)
    }

    #[cfg(test)]
    pub(crate) fn fixed<I: IntoIterator<Item = &'static str>>(columns: I) -> Self {
        Self {
            columns: columns.into_iter().map(str::to_string).collect(),
        }
    }
}

/// SELECT list producing the full [`SubscriptionRecord`] column set, with
/// typed substitutes standing in for absent optional columns.
fn select_list(caps: &SchemaCaps) -> String {
    let mut cols: Vec<String> = CORE_COLUMNS.iter().map(|c| (*c).to_string()).collect();
    for (name, substitute) in OPTIONAL_COLUMNS {
        if !caps.has(name) {
            cols.push(format!("{substitute} AS {name}"));
        } else if *name == "failure_count" {
            // The column predates its DEFAULT; old rows hold NULL.
            cols.push("COALESCE(failure_count, 0) AS failure_count".to_string());
        } else {
            cols.push((*name).to_string());
        }
    }
    cols.join(", ")
}

/// Activation UPDATE for a vault event. Matches on the exact customer and
/// order in a pre-activation status; there is deliberately no broader
/// fallback predicate, so an unmatched event activates nothing.
fn activation_update_sql(caps: &SchemaCaps) -> String {
    let mut sets = vec!["vault_id = $3".to_string(), "status = 'active'".to_string()];
    let mut placeholder = 4;
    for column in ["card_brand", "card_last_digits", "card_expiry"] {
        if caps.has(column) {
            sets.push(format!("{column} = ${placeholder}"));
            placeholder += 1;
        }
    }
    if caps.has("last_modified") {
        sets.push("last_modified = NOW()".to_string());
    }
    format!(
        "UPDATE {TABLE} SET {} WHERE customers_id = $1 AND orders_id = $2 \
         AND status IN ('pending', 'awaiting_vault')",
        sets.join(", ")
    )
}

/// Due-row selection for the billing executor. Blank plan ids are trimmed so
/// the predicate agrees with [`crate::router::classify`]: only a non-empty
/// plan id routes a row away from merchant-managed billing.
fn due_selection_sql(caps: &SchemaCaps) -> String {
    let mut sql = format!(
        "SELECT subscription_id FROM {TABLE} \
         WHERE status = 'active' AND next_payment_date <= $1 AND vault_id IS NOT NULL"
    );
    if caps.has("plan_id") {
        // Provider-managed rows are PayPal's to bill, never ours.
        sql.push_str(" AND (plan_id IS NULL OR TRIM(plan_id) = '')");
    }
    sql.push_str(" ORDER BY next_payment_date, subscription_id");
    sql
}

/// A subscription row, status decoded into the closed enum.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriptionRecord {
    pub subscription_id: String,
    pub customers_id: i32,
    pub orders_id: i32,
    pub orders_products_id: Option<i32>,
    #[sqlx(try_from = "String")]
    pub status: SubscriptionStatus,
    pub billing_period: String,
    pub billing_frequency: i32,
    pub total_billing_cycles: i32,
    pub cycles_completed: i32,
    pub next_payment_date: NaiveDate,
    pub date_added: Option<NaiveDate>,
    pub amount_cents: i64,
    pub currency_code: String,
    pub vault_id: Option<String>,
    pub plan_id: Option<String>,
    pub failure_count: i32,
    pub card_brand: Option<String>,
    pub card_last_digits: Option<String>,
    pub card_expiry: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Fields accepted for an upsert. The natural key is the externally assigned
/// legacy subscription id, stable across re-imports.
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub subscription_id: String,
    pub customers_id: i32,
    pub orders_id: i32,
    pub orders_products_id: Option<i32>,
    pub billing_period: String,
    pub billing_frequency: i32,
    pub total_billing_cycles: i32,
    pub next_payment_date: NaiveDate,
    pub date_added: Option<NaiveDate>,
    pub amount_cents: i64,
    pub currency_code: String,
    pub vault_id: Option<String>,
    pub plan_id: Option<String>,
}

impl NewSubscription {
    /// Status a fresh row starts in: `pending` when the payment method is
    /// already known, `awaiting_vault` otherwise.
    pub fn initial_status(&self) -> SubscriptionStatus {
        if self.vault_id.is_some() {
            SubscriptionStatus::Pending
        } else {
            SubscriptionStatus::AwaitingVault
        }
    }
}

/// Legacy line-item references use `0` as "unset". The column shares a
/// uniqueness constraint with real line items, so the sentinel must become
/// NULL before it reaches the database.
pub fn normalize_line_item(raw: i32) -> Option<i32> {
    (raw > 0).then_some(raw)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Card metadata carried by a vault event, written when the columns exist.
#[derive(Debug, Clone, Default)]
pub struct CardMetadata {
    pub brand: Option<String>,
    pub last_digits: Option<String>,
    pub expiry: Option<String>,
}

#[derive(Clone)]
pub struct SubscriptionStore {
    pool: PgPool,
    caps: Arc<OnceCell<SchemaCaps>>,
}

impl SubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            caps: Arc::new(OnceCell::new()),
        }
    }

    /// Probe the deployed schema, once; clones share the cached result.
    pub async fn caps(&self) -> BillingResult<&SchemaCaps> {
        self.caps
            .get_or_try_init(|| async {
                let columns: Vec<String> = sqlx::query_scalar(
                    "SELECT column_name FROM information_schema.columns WHERE table_name = $1",
                )
                .bind(TABLE)
                .fetch_all(&self.pool)
                .await?;
                Ok(SchemaCaps {
                    columns: columns.into_iter().collect(),
                })
            })
            .await
    }

    /// Insert or update by natural key. Safe to call repeatedly with the same
    /// id (migration/import replays): descriptive fields are refreshed, while
    /// status, cycle and failure counters stay owned by the listener and the
    /// executor and are never clobbered by a re-import.
    pub async fn upsert(&self, sub: &NewSubscription) -> BillingResult<UpsertOutcome> {
        let caps = self.caps().await?.clone();

        let mut columns = vec![
            "subscription_id",
            "customers_id",
            "orders_id",
            "orders_products_id",
            "status",
            "billing_period",
            "billing_frequency",
            "total_billing_cycles",
            "cycles_completed",
            "next_payment_date",
            "date_added",
            "amount_cents",
            "currency_code",
        ];
        for column in ["vault_id", "plan_id", "failure_count"] {
            if caps.has(column) {
                columns.push(column);
            }
        }

        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| {
                !matches!(
                    **c,
                    "subscription_id" | "status" | "cycles_completed" | "failure_count"
                )
            })
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect();

        let sql = format!(
            "INSERT INTO {TABLE} ({}) VALUES ({}) \
             ON CONFLICT (subscription_id) DO UPDATE SET {} \
             RETURNING (xmax = 0) AS inserted",
            columns.join(", "),
            placeholders.join(", "),
            updates.join(", ")
        );

        let mut query = sqlx::query_scalar::<_, bool>(&sql)
            .bind(&sub.subscription_id)
            .bind(sub.customers_id)
            .bind(sub.orders_id)
            .bind(sub.orders_products_id)
            .bind(sub.initial_status().as_str())
            .bind(&sub.billing_period)
            .bind(sub.billing_frequency)
            .bind(sub.total_billing_cycles)
            .bind(0_i32)
            .bind(sub.next_payment_date)
            .bind(sub.date_added)
            .bind(sub.amount_cents)
            .bind(&sub.currency_code);
        if caps.has("vault_id") {
            query = query.bind(sub.vault_id.as_deref());
        }
        if caps.has("plan_id") {
            query = query.bind(sub.plan_id.as_deref());
        }
        if caps.has("failure_count") {
            query = query.bind(0_i32);
        }

        let inserted = query.fetch_one(&self.pool).await?;
        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    pub async fn fetch(&self, subscription_id: &str) -> BillingResult<Option<SubscriptionRecord>> {
        let caps = self.caps().await?;
        let sql = format!(
            "SELECT {} FROM {TABLE} WHERE subscription_id = $1",
            select_list(caps)
        );
        let record = sqlx::query_as::<_, SubscriptionRecord>(&sql)
            .bind(subscription_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    /// Ids of merchant-managed subscriptions due on or before `today`.
    pub async fn due_subscription_ids(&self, today: NaiveDate) -> BillingResult<Vec<String>> {
        let caps = self.caps().await?;
        if !caps.has("vault_id") {
            warn!("schema has no vault_id column; no subscriptions can be billed");
            return Ok(Vec::new());
        }
        let sql = due_selection_sql(caps);
        let ids = sqlx::query_scalar(&sql)
            .bind(today)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    /// Claim a due subscription for one billing cycle.
    ///
    /// Re-selects the row `FOR UPDATE SKIP LOCKED` inside a fresh transaction
    /// and re-checks the due predicate, so an overlapping executor run skips
    /// rows another run is already charging. `None` means the row is locked
    /// elsewhere or no longer due.
    pub async fn begin_cycle(
        &self,
        subscription_id: &str,
        today: NaiveDate,
    ) -> BillingResult<Option<BillingCycle>> {
        let caps = self.caps().await?.clone();
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "SELECT {} FROM {TABLE} \
             WHERE subscription_id = $1 AND status = 'active' AND next_payment_date <= $2 \
             FOR UPDATE SKIP LOCKED",
            select_list(&caps)
        );
        let record = sqlx::query_as::<_, SubscriptionRecord>(&sql)
            .bind(subscription_id)
            .bind(today)
            .fetch_optional(&mut *tx)
            .await?;
        match record {
            Some(record) => Ok(Some(BillingCycle { tx, record, caps })),
            None => {
                tx.rollback().await?;
                Ok(None)
            }
        }
    }

    /// Activate pending subscriptions for the exact customer/order pair.
    /// One atomic statement; returns the number of rows activated. A second
    /// delivery of the same event matches zero rows because the status is no
    /// longer pre-activation.
    pub async fn activate_for_order(
        &self,
        customers_id: i32,
        orders_id: i32,
        vault_id: &str,
        card: &CardMetadata,
    ) -> BillingResult<u64> {
        let caps = self.caps().await?;
        if !caps.has("vault_id") {
            warn!(
                customers_id,
                orders_id, "schema has no vault_id column; cannot activate subscriptions"
            );
            return Ok(0);
        }
        let sql = activation_update_sql(caps);
        let mut query = sqlx::query(&sql)
            .bind(customers_id)
            .bind(orders_id)
            .bind(vault_id);
        if caps.has("card_brand") {
            query = query.bind(card.brand.as_deref());
        }
        if caps.has("card_last_digits") {
            query = query.bind(card.last_digits.as_deref());
        }
        if caps.has("card_expiry") {
            query = query.bind(card.expiry.as_deref());
        }
        Ok(query.execute(&self.pool).await?.rows_affected())
    }
}

/// An in-flight billing cycle holding the row lock. Consumed by exactly one
/// of [`complete_success`], [`complete_failure`] or [`release`].
///
/// [`complete_success`]: BillingCycle::complete_success
/// [`complete_failure`]: BillingCycle::complete_failure
/// [`release`]: BillingCycle::release
pub struct BillingCycle {
    tx: Transaction<'static, Postgres>,
    record: SubscriptionRecord,
    caps: SchemaCaps,
}

impl BillingCycle {
    pub fn record(&self) -> &SubscriptionRecord {
        &self.record
    }

    /// Advance the schedule after a successful charge: bump the cycle count,
    /// reset the failure counter, and mark the row `completed` when the cycle
    /// budget is reached.
    pub async fn complete_success(
        mut self,
        next_payment_date: NaiveDate,
        completed: bool,
    ) -> BillingResult<()> {
        let mut sets = vec![
            "next_payment_date = $2".to_string(),
            "cycles_completed = cycles_completed + 1".to_string(),
        ];
        if self.caps.has("failure_count") {
            sets.push("failure_count = 0".to_string());
        }
        if completed {
            sets.push(format!("status = '{}'", SubscriptionStatus::Completed));
        }
        if self.caps.has("last_modified") {
            sets.push("last_modified = NOW()".to_string());
        }
        let sql = format!(
            "UPDATE {TABLE} SET {} WHERE subscription_id = $1",
            sets.join(", ")
        );
        sqlx::query(&sql)
            .bind(&self.record.subscription_id)
            .bind(next_payment_date)
            .execute(&mut *self.tx)
            .await?;
        self.tx.commit().await?;
        Ok(())
    }

    /// Record a failed charge. `next_payment_date` is left untouched so the
    /// row stays selectable for a retry on the next run; `suspend` makes the
    /// failure terminal.
    pub async fn complete_failure(mut self, failure_count: i32, suspend: bool) -> BillingResult<()> {
        let mut sets = Vec::new();
        let mut bind_failures = false;
        if self.caps.has("failure_count") {
            sets.push("failure_count = $2".to_string());
            bind_failures = true;
        } else {
            warn!(
                subscription_id = %self.record.subscription_id,
                "schema has no failure_count column; consecutive failures are not tracked"
            );
        }
        if suspend {
            sets.push(format!("status = '{}'", SubscriptionStatus::Suspended));
        }
        if self.caps.has("last_modified") {
            sets.push("last_modified = NOW()".to_string());
        }
        if sets.is_empty() {
            self.tx.rollback().await?;
            return Ok(());
        }
        let sql = format!(
            "UPDATE {TABLE} SET {} WHERE subscription_id = $1",
            sets.join(", ")
        );
        let mut query = sqlx::query(&sql).bind(&self.record.subscription_id);
        if bind_failures {
            query = query.bind(failure_count);
        }
        query.execute(&mut *self.tx).await?;
        self.tx.commit().await?;
        Ok(())
    }

    /// Abandon the cycle without touching the row.
    pub async fn release(self) -> BillingResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
