//! Anchor-based billing date scheduler
//!
//! The next billing date is always re-derived from the immutable anchor
//! (`date_added`), so the schedule lives on the grid `anchor + k * period`.
//! A manual edit to the stored `next_payment_date` self-corrects on the next
//! cycle instead of permanently shifting the cadence.

use chrono::{Days, Months, NaiveDate};

/// Upper bound on grid walking. Past this the inputs are pathological
/// (zero-width steps, anchor centuries in the past) and we fall back to the
/// simple one-period-forward result.
pub const MAX_SCHEDULE_STEPS: u32 = 30_000;

/// Billing period unit, parsed from the legacy free-text column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingPeriod {
    Day,
    Week,
    /// Half-month approximated as 15 days. Intentionally not calendar-exact;
    /// the legacy system billed "semimonthly" on a flat 15-day stride.
    SemiMonth,
    Month,
    Year,
}

impl BillingPeriod {
    /// Parse a legacy period string. Accepts the unit table spellings plus
    /// natural-language "+N units" forms ("+3 weeks", "2 months"); the
    /// trailing token is the unit. Unknown units are `None` — a boundary
    /// validation failure, handled by the caller as a no-op.
    pub fn parse(raw: &str) -> Option<Self> {
        let lowered = raw.trim().trim_start_matches('+').to_ascii_lowercase();
        let unit = lowered.split_whitespace().last().unwrap_or(&lowered);
        match unit {
            "day" | "daily" | "days" => Some(BillingPeriod::Day),
            "week" | "weekly" | "weeks" => Some(BillingPeriod::Week),
            "semimonth" | "semi-month" | "semi_month" | "biweekly" | "bi-weekly"
            | "bi_weekly" => Some(BillingPeriod::SemiMonth),
            "month" | "monthly" | "months" => Some(BillingPeriod::Month),
            "year" | "yearly" | "years" | "annual" | "annually" => Some(BillingPeriod::Year),
            _ => None,
        }
    }

    /// `start + steps * (frequency x unit)`, computed from `start` in one
    /// jump so month-end clamping never compounds across steps.
    ///
    /// `None` on calendar overflow or when the inputs collapse to a
    /// zero-width step.
    pub fn advance_from(&self, start: NaiveDate, steps: u32, frequency: u32) -> Option<NaiveDate> {
        let total = u64::from(steps) * u64::from(frequency);
        match self {
            BillingPeriod::Day => start.checked_add_days(Days::new(total)),
            BillingPeriod::Week => start.checked_add_days(Days::new(total * 7)),
            BillingPeriod::SemiMonth => {
                let stride = (15u64 * u64::from(frequency)).max(1);
                start.checked_add_days(Days::new(stride.checked_mul(u64::from(steps))?))
            }
            BillingPeriod::Month => {
                let months = u32::try_from(total).ok()?;
                start.checked_add_months(Months::new(months))
            }
            BillingPeriod::Year => {
                let months = u32::try_from(total.checked_mul(12)?).ok()?;
                start.checked_add_months(Months::new(months))
            }
        }
    }

    /// One period-step forward from `from`.
    pub fn advance(&self, from: NaiveDate, frequency: u32) -> Option<NaiveDate> {
        self.advance_from(from, 1, frequency)
    }
}

/// Compute the next billing date strictly after `current_next`.
///
/// With an anchor, the result lies on the grid `anchor + k * period`. Without
/// one (legacy record with no stored creation date) this degrades to
/// `current_next + one period` — best effort, not an error.
///
/// Bounded by [`MAX_SCHEDULE_STEPS`]; when the cap is hit or a step fails to
/// advance, the degraded one-period-forward result is returned so the
/// function terminates for any input.
pub fn next_scheduled_date(
    anchor: Option<NaiveDate>,
    current_next: NaiveDate,
    period: BillingPeriod,
    frequency: u32,
) -> NaiveDate {
    let fallback = period.advance(current_next, frequency).unwrap_or(current_next);
    let Some(anchor) = anchor else {
        return fallback;
    };
    if anchor > current_next {
        // The grid has not started yet; the anchor itself is the next point.
        return anchor;
    }
    let mut previous = anchor;
    for step in 1..=MAX_SCHEDULE_STEPS {
        match period.advance_from(anchor, step, frequency) {
            Some(candidate) if candidate > current_next => return candidate,
            Some(candidate) if candidate > previous => previous = candidate,
            // Zero-width step or calendar overflow: the grid is unusable.
            _ => break,
        }
    }
    fallback
}
