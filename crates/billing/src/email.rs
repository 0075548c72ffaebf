//! Merchant alert email
//!
//! One email matters in this subsystem: a subscription crossing its failure
//! budget and getting suspended. Sent through a Resend-style relay; when the
//! relay is unconfigured the service logs and stays quiet instead of failing
//! the batch.

use tracing::{error, info, warn};

#[derive(Clone)]
pub struct MerchantEmailService {
    http: reqwest::Client,
    api_key: Option<String>,
    from: String,
    merchant_to: String,
}

impl MerchantEmailService {
    /// Reads `ALERT_EMAIL_API_KEY`, `ALERT_EMAIL_FROM` and
    /// `MERCHANT_ALERT_EMAIL`. A missing API key disables sending.
    pub fn from_env() -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: std::env::var("ALERT_EMAIL_API_KEY").ok(),
            from: std::env::var("ALERT_EMAIL_FROM")
                .unwrap_or_else(|_| "billing@localhost".to_string()),
            merchant_to: std::env::var("MERCHANT_ALERT_EMAIL").unwrap_or_default(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some() && !self.merchant_to.is_empty()
    }

    /// Alert the merchant that a subscription was suspended after repeated
    /// charge failures. Errors are logged, never propagated; the suspension
    /// itself is already committed.
    pub async fn send_subscription_suspended(
        &self,
        subscription_id: &str,
        orders_id: i32,
        failure_count: i32,
    ) {
        let Some(api_key) = self.api_key.as_deref() else {
            warn!(
                subscription_id,
                "suspension alert skipped; email relay not configured"
            );
            return;
        };
        if self.merchant_to.is_empty() {
            warn!(
                subscription_id,
                "suspension alert skipped; MERCHANT_ALERT_EMAIL not set"
            );
            return;
        }

        let subject = format!("Recurring billing suspended for subscription {subscription_id}");
        let body = format!(
            "Subscription {subscription_id} (order {orders_id}) was suspended after \
             {failure_count} consecutive failed charges. No further charges will be \
             attempted until it is reviewed and reactivated."
        );
        let payload = serde_json::json!({
            "from": self.from,
            "to": [self.merchant_to],
            "subject": subject,
            "text": body,
        });

        let result = self
            .http
            .post("https://api.resend.com/emails")
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await
            .and_then(|r| r.error_for_status());

        match result {
            Ok(_) => info!(subscription_id, "suspension alert sent"),
            Err(e) => error!(subscription_id, error = %e, "failed to send suspension alert"),
        }
    }
}
