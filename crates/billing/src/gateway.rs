//! Charge gateway
//!
//! The executor decides what to charge and when; this module is the how. The
//! [`ChargeGateway`] trait is the seam, with [`PayPalGateway`] charging a
//! vaulted payment method through the PayPal v2 Orders API. A declined charge
//! is data ([`ChargeOutcome::Declined`]), not an error; transport and auth
//! problems are [`ChargeError`] and the executor treats them the same as a
//! decline.

use std::future::Future;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{debug, warn};

use crate::error::{BillingError, BillingResult};

/// One charge attempt against a vaulted payment method.
#[derive(Debug, Clone)]
pub struct ChargeRequest<'a> {
    pub subscription_id: &'a str,
    pub vault_id: &'a str,
    pub amount_cents: i64,
    pub currency_code: &'a str,
    /// The schedule point being billed; part of the idempotency key so an
    /// at-least-once re-run cannot double-charge the same cycle.
    pub due_date: NaiveDate,
}

#[derive(Debug, Clone)]
pub enum ChargeOutcome {
    /// Funds captured; `provider_ref` is the PayPal order id.
    Captured { provider_ref: String },
    /// The provider refused the charge.
    Declined { reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ChargeError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("provider error: {0}")]
    Provider(String),
}

pub trait ChargeGateway: Send + Sync {
    fn charge(
        &self,
        request: &ChargeRequest<'_>,
    ) -> impl Future<Output = Result<ChargeOutcome, ChargeError>> + Send;
}

/// PayPal REST configuration from environment variables.
#[derive(Debug, Clone)]
pub struct PayPalConfig {
    pub client_id: String,
    pub client_secret: String,
    pub base_url: String,
}

impl PayPalConfig {
    /// Reads `PAYPAL_CLIENT_ID`, `PAYPAL_CLIENT_SECRET` and `PAYPAL_ENV`
    /// (`sandbox` unless set to `live`).
    pub fn from_env() -> BillingResult<Self> {
        let client_id = std::env::var("PAYPAL_CLIENT_ID")
            .map_err(|_| BillingError::Config("PAYPAL_CLIENT_ID not set".to_string()))?;
        let client_secret = std::env::var("PAYPAL_CLIENT_SECRET")
            .map_err(|_| BillingError::Config("PAYPAL_CLIENT_SECRET not set".to_string()))?;
        let base_url = match std::env::var("PAYPAL_ENV").as_deref() {
            Ok("live") => "https://api-m.paypal.com".to_string(),
            _ => "https://api-m.sandbox.paypal.com".to_string(),
        };
        Ok(Self {
            client_id,
            client_secret,
            base_url,
        })
    }
}

struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
    status: String,
}

pub struct PayPalGateway {
    http: reqwest::Client,
    config: PayPalConfig,
    token: Mutex<Option<CachedToken>>,
}

impl PayPalGateway {
    pub fn new(config: PayPalConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            token: Mutex::new(None),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(PayPalConfig::from_env()?))
    }

    /// Deterministic idempotency key for one cycle of one subscription.
    pub fn request_id(subscription_id: &str, due_date: NaiveDate) -> String {
        format!("{subscription_id}:{due_date}")
    }

    /// Cents to the provider's decimal string without going through floats.
    fn format_amount(cents: i64) -> String {
        format!("{}.{:02}", cents / 100, (cents % 100).abs())
    }

    /// Client-credentials token, cached until shortly before expiry. The
    /// fetch itself retries with exponential backoff.
    async fn access_token(&self) -> Result<String, ChargeError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Utc::now() + Duration::seconds(60) {
                return Ok(token.access_token.clone());
            }
        }

        let strategy = ExponentialBackoff::from_millis(200).map(jitter).take(3);
        let response = Retry::spawn(strategy, || async {
            self.http
                .post(format!("{}/v1/oauth2/token", self.config.base_url))
                .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
                .form(&[("grant_type", "client_credentials")])
                .send()
                .await?
                .error_for_status()
        })
        .await
        .map_err(|e| ChargeError::Auth(e.to_string()))?;

        let token: TokenResponse = response.json().await?;
        let access_token = token.access_token.clone();
        *cached = Some(CachedToken {
            access_token: token.access_token,
            expires_at: Utc::now() + Duration::seconds(token.expires_in),
        });
        debug!("refreshed paypal access token");
        Ok(access_token)
    }
}

impl ChargeGateway for PayPalGateway {
    async fn charge(&self, request: &ChargeRequest<'_>) -> Result<ChargeOutcome, ChargeError> {
        let token = self.access_token().await?;
        let body = serde_json::json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": request.subscription_id,
                "amount": {
                    "currency_code": request.currency_code,
                    "value": Self::format_amount(request.amount_cents),
                },
            }],
            "payment_source": {
                "token": {
                    "id": request.vault_id,
                    "type": "PAYMENT_METHOD_TOKEN",
                },
            },
        });

        let response = self
            .http
            .post(format!("{}/v2/checkout/orders", self.config.base_url))
            .bearer_auth(&token)
            .header(
                "PayPal-Request-Id",
                Self::request_id(request.subscription_id, request.due_date),
            )
            .header("Prefer", "return=representation")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let order: OrderResponse = response.json().await?;
            if order.status == "COMPLETED" {
                return Ok(ChargeOutcome::Captured {
                    provider_ref: order.id,
                });
            }
            // Created but not captured (e.g. payer action required) is a
            // decline for a merchant-initiated charge.
            return Ok(ChargeOutcome::Declined {
                reason: format!("order {} in status {}", order.id, order.status),
            });
        }

        let detail = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ChargeError::Auth(format!("{status}: {detail}")));
        }
        if status.is_client_error() {
            warn!(subscription_id = request.subscription_id, %status, "charge declined");
            return Ok(ChargeOutcome::Declined {
                reason: format!("{status}: {detail}"),
            });
        }
        Err(ChargeError::Provider(format!("{status}: {detail}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_is_deterministic_per_cycle() {
        let due = NaiveDate::from_ymd_opt(2026, 2, 7).unwrap();
        let a = PayPalGateway::request_id("legacy-100", due);
        let b = PayPalGateway::request_id("legacy-100", due);
        assert_eq!(a, b);
        assert_eq!(a, "legacy-100:2026-02-07");
        // A different cycle gets a different key.
        let next = NaiveDate::from_ymd_opt(2026, 2, 14).unwrap();
        assert_ne!(a, PayPalGateway::request_id("legacy-100", next));
    }

    #[test]
    fn amount_formatting_avoids_floats() {
        assert_eq!(PayPalGateway::format_amount(1999), "19.99");
        assert_eq!(PayPalGateway::format_amount(100), "1.00");
        assert_eq!(PayPalGateway::format_amount(5), "0.05");
        assert_eq!(PayPalGateway::format_amount(120000), "1200.00");
    }
}
