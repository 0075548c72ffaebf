// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! PayVault Recurring Billing
//!
//! Merchant-side recurring subscription billing for a PayPal-vaulted
//! storefront.
//!
//! ## Features
//!
//! - **Anchor Scheduler**: next billing date re-derived from the immutable
//!   anchor, immune to drift from manual edits
//! - **Routing**: provider-managed (PayPal plan) vs merchant-managed
//!   (vaulted method, billed here) decided once at creation
//! - **Vault Activation**: asynchronous "payment method stored" events
//!   activate exactly the matching order's subscriptions, idempotently
//! - **Billing Executor**: daily batch charging due subscriptions, with
//!   failure budget, suspension, and merchant alerts
//! - **Record Store**: upsert-by-natural-key over the legacy table, with
//!   schema capability probing for optional columns

pub mod email;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod router;
pub mod schedule;
pub mod status;
pub mod store;
pub mod vault;

#[cfg(test)]
mod edge_case_tests;

// Email
pub use email::MerchantEmailService;

// Error
pub use error::{BillingError, BillingResult};

// Executor
pub use executor::{
    after_failure, after_success, CycleAdvance, ExecutorConfig, FailurePenalty,
    RecurringBillingExecutor, RunSummary, DEFAULT_FAILURE_THRESHOLD,
};

// Gateway
pub use gateway::{
    ChargeError, ChargeGateway, ChargeOutcome, ChargeRequest, PayPalConfig, PayPalGateway,
};

// Router
pub use router::{classify, SubscriptionKind};

// Schedule
pub use schedule::{next_scheduled_date, BillingPeriod, MAX_SCHEDULE_STEPS};

// Status
pub use status::SubscriptionStatus;

// Store
pub use store::{
    normalize_line_item, BillingCycle, CardMetadata, NewSubscription, SchemaCaps,
    SubscriptionRecord, SubscriptionStore, UpsertOutcome,
};

// Vault
pub use vault::{ActivationNotice, VaultActivationListener, VaultEvent};

use sqlx::PgPool;

/// Main service combining the recurring billing subsystem
pub struct RecurringBillingService {
    pub store: SubscriptionStore,
    pub vault: VaultActivationListener,
    pub executor: RecurringBillingExecutor<PayPalGateway>,
    pub email: MerchantEmailService,
}

impl RecurringBillingService {
    /// Create the service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let gateway = PayPalGateway::from_env()?;
        let email = MerchantEmailService::from_env();
        let store = SubscriptionStore::new(pool);

        Ok(Self {
            vault: VaultActivationListener::new(store.clone()),
            executor: RecurringBillingExecutor::new(
                store.clone(),
                gateway,
                email.clone(),
                ExecutorConfig::from_env(),
            ),
            store,
            email,
        })
    }
}
