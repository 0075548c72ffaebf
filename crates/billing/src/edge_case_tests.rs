// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Recurring Billing
//!
//! Scenario tests for the boundary conditions in:
//! - Schedule drift correction (SUB-S01 to SUB-S05)
//! - Failure budget and suspension (SUB-F01 to SUB-F03)
//! - Cycle caps (SUB-C01 to SUB-C02)
//! - Activation events (SUB-A01 to SUB-A03)

#[cfg(test)]
mod schedule_scenarios {
    use crate::schedule::{next_scheduled_date, BillingPeriod};
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    // =========================================================================
    // SUB-S01: Manual edit between grid points snaps forward to the grid
    // =========================================================================
    #[test]
    fn manual_edit_snaps_to_next_grid_point() {
        let anchor = date(2026, 1, 7); // Wednesday
        for (edited, expected) in [
            (date(2026, 1, 8), date(2026, 1, 14)),
            (date(2026, 1, 31), date(2026, 2, 4)),
            (date(2026, 2, 1), date(2026, 2, 4)),
            (date(2026, 2, 3), date(2026, 2, 4)),
        ] {
            let next = next_scheduled_date(Some(anchor), edited, BillingPeriod::Week, 1);
            assert_eq!(next, expected, "edit to {edited} should snap to {expected}");
        }
    }

    // =========================================================================
    // SUB-S02: Backdated edit returns to the original schedule point
    // =========================================================================
    #[test]
    fn backdated_edit_recovers_original_schedule() {
        // Weekly from 2026-01-31; next was 2026-02-07, edited back to 02-01.
        let anchor = date(2026, 1, 31);
        let next = next_scheduled_date(Some(anchor), date(2026, 2, 1), BillingPeriod::Week, 1);
        assert_eq!(next, date(2026, 2, 7));
        assert_ne!(next, date(2026, 2, 14), "must not shift a full week");
    }

    // =========================================================================
    // SUB-S03: Edit landing exactly on a grid point moves one step past it
    // =========================================================================
    #[test]
    fn edit_on_grid_point_yields_following_point() {
        let anchor = date(2026, 1, 7);
        let next = next_scheduled_date(Some(anchor), date(2026, 1, 28), BillingPeriod::Week, 1);
        assert_eq!(next, date(2026, 2, 4));
    }

    // =========================================================================
    // SUB-S04: Missed cycles collapse into a single forward step
    // =========================================================================
    #[test]
    fn long_outage_yields_single_next_date() {
        // Executor down for two months; the next date is the first grid
        // point after the stale stored date, not a backlog of charges.
        let anchor = date(2025, 11, 3);
        let stale = date(2025, 12, 1);
        let next = next_scheduled_date(Some(anchor), stale, BillingPeriod::Week, 1);
        assert_eq!(next, date(2025, 12, 8));
    }

    // =========================================================================
    // SUB-S05: Month-end anchors keep their day-of-month where it exists
    // =========================================================================
    #[test]
    fn month_end_anchor_walks_calendar_correctly() {
        let anchor = date(2026, 1, 31);
        let mut current = anchor;
        let expected = [
            date(2026, 2, 28),
            date(2026, 3, 31),
            date(2026, 4, 30),
            date(2026, 5, 31),
        ];
        for want in expected {
            current = next_scheduled_date(Some(anchor), current, BillingPeriod::Month, 1);
            assert_eq!(current, want);
        }
    }
}

#[cfg(test)]
mod failure_budget_scenarios {
    use crate::executor::{after_failure, DEFAULT_FAILURE_THRESHOLD};

    // =========================================================================
    // SUB-F01: N failures retry, failure N+1 suspends
    // =========================================================================
    #[test]
    fn suspension_exactly_at_budget_exhaustion() {
        let threshold = DEFAULT_FAILURE_THRESHOLD;
        let mut failures = 0;
        for attempt in 1..=threshold {
            let penalty = after_failure(failures, threshold);
            assert!(!penalty.suspend, "attempt {attempt} should still retry");
            failures = penalty.failure_count;
        }
        let penalty = after_failure(failures, threshold);
        assert!(penalty.suspend, "attempt past the budget must suspend");
        assert_eq!(penalty.failure_count, threshold as i32 + 1);
    }

    // =========================================================================
    // SUB-F02: A success resets the budget (counter restarts from zero)
    // =========================================================================
    #[test]
    fn counter_reset_gives_full_budget_again() {
        let threshold = DEFAULT_FAILURE_THRESHOLD;
        // Two failures, then a success resets failure_count to 0 (the store
        // writes failure_count = 0 on complete_success). The next failure is
        // counted as the first of a fresh streak.
        let penalty = after_failure(0, threshold);
        assert_eq!(penalty.failure_count, 1);
        assert!(!penalty.suspend);
    }

    // =========================================================================
    // SUB-F03: Threshold of 1 suspends on the second consecutive failure
    // =========================================================================
    #[test]
    fn minimal_threshold() {
        assert!(!after_failure(0, 1).suspend);
        assert!(after_failure(1, 1).suspend);
    }
}

#[cfg(test)]
mod cycle_cap_scenarios {
    use crate::executor::after_success;
    use crate::schedule::BillingPeriod;
    use crate::status::SubscriptionStatus;
    use crate::store::SubscriptionRecord;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn capped(cycles_completed: i32, total: i32) -> SubscriptionRecord {
        SubscriptionRecord {
            subscription_id: "legacy-77".to_string(),
            customers_id: 5,
            orders_id: 610,
            orders_products_id: Some(9),
            status: SubscriptionStatus::Active,
            billing_period: "month".to_string(),
            billing_frequency: 1,
            total_billing_cycles: total,
            cycles_completed,
            next_payment_date: date(2026, 4, 1),
            date_added: Some(date(2026, 1, 1)),
            amount_cents: 4500,
            currency_code: "EUR".to_string(),
            vault_id: Some("9xx0012p".to_string()),
            plan_id: None,
            failure_count: 0,
            card_brand: None,
            card_last_digits: None,
            card_expiry: None,
            last_modified: None,
        }
    }

    // =========================================================================
    // SUB-C01: total_billing_cycles = 3 never produces a fourth charge
    // =========================================================================
    #[test]
    fn three_cycle_budget_ends_on_third_success() {
        let mut record = capped(0, 3);
        for cycle in 1..=3 {
            let advance = after_success(&record, BillingPeriod::Month, 1);
            record.cycles_completed += 1;
            record.next_payment_date = advance.next_payment_date;
            if cycle < 3 {
                assert!(!advance.completed, "cycle {cycle} is within budget");
            } else {
                // The third success is terminal; the row leaves the active
                // selection and is never charged again.
                assert!(advance.completed);
            }
        }
        assert_eq!(record.cycles_completed, 3);
    }

    // =========================================================================
    // SUB-C02: over-counted legacy rows complete immediately
    // =========================================================================
    #[test]
    fn overshoot_counts_are_terminal() {
        let record = capped(5, 3);
        let advance = after_success(&record, BillingPeriod::Month, 1);
        assert!(advance.completed);
    }
}

#[cfg(test)]
mod activation_scenarios {
    use crate::vault::VaultEvent;

    fn event(customers_id: i32, orders_id: i32, vault_id: &str) -> VaultEvent {
        VaultEvent {
            customers_id,
            orders_id,
            vault_id: vault_id.to_string(),
            brand: None,
            last_digits: None,
            card_type: None,
            expiry: None,
        }
    }

    // =========================================================================
    // SUB-A01: malformed events are ignored at the boundary
    // =========================================================================
    #[test]
    fn malformed_events_are_no_ops() {
        for bad in [
            event(0, 3400, "8kk8451t"),
            event(12, -1, "8kk8451t"),
            event(12, 3400, ""),
        ] {
            assert!(!bad.is_valid());
        }
    }

    // =========================================================================
    // SUB-A02: full notification payload parses, extra fields preserved
    // =========================================================================
    #[test]
    fn full_event_payload_parses() {
        let e: VaultEvent = serde_json::from_str(
            r#"{
                "customers_id": 12,
                "orders_id": 3400,
                "vault_id": "8kk8451t",
                "brand": "VISA",
                "last_digits": "1111",
                "card_type": "CREDIT",
                "expiry": "2028-04"
            }"#,
        )
        .unwrap();
        assert!(e.is_valid());
        assert_eq!(e.brand.as_deref(), Some("VISA"));
        assert_eq!(e.expiry.as_deref(), Some("2028-04"));
    }

    // =========================================================================
    // SUB-A03: routing never depends on anything but the plan id
    // =========================================================================
    #[test]
    fn routing_ignores_all_other_fields() {
        use crate::router::{classify, SubscriptionKind};
        // The same attribute set flips classification on plan_id alone.
        assert_eq!(classify(None), SubscriptionKind::MerchantManaged);
        assert_eq!(
            classify(Some("P-0AB12345CD678901E")),
            SubscriptionKind::ProviderManaged
        );
    }
}
