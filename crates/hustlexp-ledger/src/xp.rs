//! XP computation.
//!
//! Deterministic given `(price_cents, total_xp_before, streak_days)`. All
//! ratio math is decimal with truncate-toward-zero rounding; money and XP
//! never touch binary floats.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, MathematicalOps, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Combined multiplier ceiling once category bonuses stack on streaks.
const MULTIPLIER_CAP: Decimal = dec!(2.00);

/// Grace window: activity before 02:00 UTC counts toward the previous day.
const STREAK_GRACE_HOURS: i64 = 2;

/// The full breakdown persisted on every XP ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XpBreakdown {
    pub base_xp: i64,
    pub decay_factor: Decimal,
    pub effective_xp: i64,
    pub streak_multiplier: Decimal,
    pub final_xp: i64,
}

/// Streak multiplier by bucket: {0–2, 3–6, 7–13, 14–29, 30+}.
pub fn streak_multiplier(streak_days: u32) -> Decimal {
    match streak_days {
        0..=2 => dec!(1.00),
        3..=6 => dec!(1.10),
        7..=13 => dec!(1.20),
        14..=29 => dec!(1.30),
        _ => dec!(1.50),
    }
}

/// `base_xp = max(10, floor(price_cents / 100))`.
pub fn base_xp(price_cents: i64) -> i64 {
    (price_cents / 100).max(10)
}

/// `decay_factor = 1 / (1 + log10(1 + total_xp / 1000))`, truncated to four
/// decimals. Dimensionless diminishing-returns curve over lifetime XP.
pub fn decay_factor(total_xp_before: i64) -> Decimal {
    let total = Decimal::from(total_xp_before.max(0));
    let argument = dec!(1) + total / dec!(1000);
    // log10 via the natural log so the only transcendental is `ln`.
    let log10 = argument.ln() / Decimal::TEN.ln();
    (dec!(1) / (dec!(1) + log10)).round_dp_with_strategy(4, RoundingStrategy::ToZero)
}

/// Compute the full XP breakdown for one task completion.
pub fn compute_xp(
    price_cents: i64,
    total_xp_before: i64,
    streak_days: u32,
    category_bonus: Option<Decimal>,
) -> XpBreakdown {
    let base = base_xp(price_cents);
    let decay = decay_factor(total_xp_before);
    let effective = (Decimal::from(base) * decay)
        .floor()
        .to_i64()
        .unwrap_or(0)
        .max(0);

    let streak = streak_multiplier(streak_days);
    let combined = match category_bonus {
        Some(bonus) => (streak * bonus).min(MULTIPLIER_CAP),
        None => streak,
    };
    let final_xp = (Decimal::from(effective) * combined)
        .floor()
        .to_i64()
        .unwrap_or(0)
        .max(0);

    XpBreakdown {
        base_xp: base,
        decay_factor: decay,
        effective_xp: effective,
        streak_multiplier: streak,
        final_xp,
    }
}

/// The UTC calendar day an activity counts toward, with the grace window.
pub fn streak_day(at: DateTime<Utc>) -> NaiveDate {
    (at - Duration::hours(STREAK_GRACE_HOURS)).date_naive()
}

/// Streak length after an activity at `now`, given the previous streak and
/// last-active timestamp.
pub fn next_streak_days(
    current_streak: u32,
    last_active_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> u32 {
    let Some(last) = last_active_at else {
        return 1;
    };
    let last_day = streak_day(last);
    let today = streak_day(now);
    if today == last_day {
        current_streak.max(1)
    } else if today == last_day + Duration::days(1) {
        current_streak + 1
    } else {
        1
    }
}
