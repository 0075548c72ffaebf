//! Subscription routing
//!
//! A subscription either carries a provider plan id (PayPal owns the billing
//! cadence) or it doesn't (this core schedules and charges a vaulted payment
//! method). The split is decided once, at creation, and never revisited.

/// Which side of the system owns a subscription's billing cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionKind {
    /// Billed by the payment provider against a provider plan; recorded here
    /// but never scheduled or charged by this core.
    ProviderManaged,
    /// Scheduled and charged by this core against a vaulted payment method.
    MerchantManaged,
}

/// Classify a subscription by its plan identifier. Pure; no other field
/// participates in the decision.
pub fn classify(plan_id: Option<&str>) -> SubscriptionKind {
    match plan_id {
        Some(id) if !id.trim().is_empty() => SubscriptionKind::ProviderManaged,
        _ => SubscriptionKind::MerchantManaged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_id_routes_to_provider() {
        assert_eq!(
            classify(Some("P-5ML4271244454362WXNWU5NQ")),
            SubscriptionKind::ProviderManaged
        );
    }

    #[test]
    fn missing_or_blank_plan_id_routes_to_merchant() {
        assert_eq!(classify(None), SubscriptionKind::MerchantManaged);
        assert_eq!(classify(Some("")), SubscriptionKind::MerchantManaged);
        assert_eq!(classify(Some("   ")), SubscriptionKind::MerchantManaged);
    }
}
