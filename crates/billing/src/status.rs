//! Subscription status state machine
//!
//! `pending`/`awaiting_vault` → `active` → `completed` | `suspended`.
//! `cancelled` is set by an external operation and only read here.

use serde::{Deserialize, Serialize};

/// Closed set of subscription states.
///
/// The legacy schema stores these as free text; decoding goes through
/// [`SubscriptionStatus::parse`] so an unknown string is a decode error
/// rather than a silently invented state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Created with a known payment method, waiting for activation.
    Pending,
    /// Created before the payment method was vaulted.
    AwaitingVault,
    /// Billable; selected by the recurring executor.
    Active,
    /// Failure budget exhausted; requires operator intervention.
    Suspended,
    /// Cancelled externally.
    Cancelled,
    /// Cycle budget reached; terminal.
    Completed,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::AwaitingVault => "awaiting_vault",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Suspended => "suspended",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(SubscriptionStatus::Pending),
            "awaiting_vault" => Some(SubscriptionStatus::AwaitingVault),
            "active" => Some(SubscriptionStatus::Active),
            "suspended" => Some(SubscriptionStatus::Suspended),
            "cancelled" | "canceled" => Some(SubscriptionStatus::Cancelled),
            "completed" => Some(SubscriptionStatus::Completed),
            _ => None,
        }
    }

    /// States a vault activation event is allowed to transition out of.
    pub fn is_awaiting_activation(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Pending | SubscriptionStatus::AwaitingVault
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<String> for SubscriptionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        SubscriptionStatus::parse(&value)
            .ok_or_else(|| format!("unknown subscription status '{value}'"))
    }
}
