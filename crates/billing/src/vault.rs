//! Vault activation listener
//!
//! PayPal notifies us asynchronously once a payment method has been stored in
//! the vault. The matching subscription(s) for that exact order flip from
//! `pending`/`awaiting_vault` to `active` in a single statement, which also
//! makes redelivery harmless: the second pass matches zero rows.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::BillingResult;
use crate::store::{CardMetadata, SubscriptionStore};

/// Inbound "payment method stored" event. Delivered at-least-once by the
/// upstream notifier; optional fields describe the stored card.
#[derive(Debug, Clone, Deserialize)]
pub struct VaultEvent {
    pub customers_id: i32,
    pub orders_id: i32,
    pub vault_id: String,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub last_digits: Option<String>,
    #[serde(default)]
    pub card_type: Option<String>,
    #[serde(default)]
    pub expiry: Option<String>,
}

impl VaultEvent {
    /// Malformed events are ignored, not errored; they come from an
    /// untrusted notification path.
    pub fn is_valid(&self) -> bool {
        self.customers_id > 0 && self.orders_id > 0 && !self.vault_id.trim().is_empty()
    }

    fn card_metadata(&self) -> CardMetadata {
        CardMetadata {
            // Older notifier versions sent the brand under card_type.
            brand: self.brand.clone().or_else(|| self.card_type.clone()),
            last_digits: self.last_digits.clone(),
            expiry: self.expiry.clone(),
        }
    }
}

/// Outbound notification for downstream observers (UI refresh etc.).
#[derive(Debug, Clone, Serialize)]
pub struct ActivationNotice {
    pub customers_id: i32,
    pub orders_id: i32,
    pub vault_id: String,
    pub activated_count: u64,
}

pub struct VaultActivationListener {
    store: SubscriptionStore,
    notices: broadcast::Sender<ActivationNotice>,
}

impl VaultActivationListener {
    pub fn new(store: SubscriptionStore) -> Self {
        let (notices, _) = broadcast::channel(16);
        Self { store, notices }
    }

    /// Subscribe to activation notices.
    pub fn subscribe(&self) -> broadcast::Receiver<ActivationNotice> {
        self.notices.subscribe()
    }

    /// Handle one vault event. Returns the notice when anything was
    /// activated, `None` for invalid or unmatched events. Database errors
    /// propagate; everything else is a local no-op.
    pub async fn handle(&self, event: &VaultEvent) -> BillingResult<Option<ActivationNotice>> {
        if !event.is_valid() {
            debug!(
                customers_id = event.customers_id,
                orders_id = event.orders_id,
                "ignoring malformed vault event"
            );
            return Ok(None);
        }

        let activated = self
            .store
            .activate_for_order(
                event.customers_id,
                event.orders_id,
                event.vault_id.trim(),
                &event.card_metadata(),
            )
            .await?;

        if activated == 0 {
            debug!(
                customers_id = event.customers_id,
                orders_id = event.orders_id,
                "vault event matched no pending subscriptions"
            );
            return Ok(None);
        }

        let notice = ActivationNotice {
            customers_id: event.customers_id,
            orders_id: event.orders_id,
            vault_id: event.vault_id.trim().to_string(),
            activated_count: activated,
        };
        info!(
            customers_id = notice.customers_id,
            orders_id = notice.orders_id,
            activated = notice.activated_count,
            "subscriptions activated"
        );
        // No receivers is fine; the notice is advisory.
        let _ = self.notices.send(notice.clone());
        Ok(Some(notice))
    }
}
