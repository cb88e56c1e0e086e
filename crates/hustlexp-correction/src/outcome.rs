//! Causal outcome analysis.
//!
//! Every applied correction is measured over a window against a matched
//! control group (same category, same zone, overlapping time) that was not
//! subject to it. Net lift is the difference of post-minus-baseline deltas
//! between treated and control.

use chrono::Duration;
use hustlexp_storage::MetricSet;
use hustlexp_types::Verdict;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Minimum observation window before a verdict is meaningful.
pub const MIN_WINDOW: Duration = Duration::hours(6);

/// Net-lift must show on at least this many core metrics for causality.
pub const MIN_LIFTED_METRICS: usize = 2;

#[derive(Debug, Clone)]
pub struct Judgement {
    pub net_lift: MetricSet,
    pub verdict: Verdict,
    pub confidence: Decimal,
}

/// Judge one correction's measurements.
///
/// - net lift on ≥ `MIN_LIFTED_METRICS` metrics, control not improving
///   similarly ⇒ `Causal`;
/// - treated improved somewhere but the control matched or beat it
///   everywhere ⇒ `NonCausal`;
/// - anything else ⇒ `Inconclusive`.
pub fn judge(
    treated_baseline: &MetricSet,
    treated_post: &MetricSet,
    control_baseline: &MetricSet,
    control_post: &MetricSet,
) -> Judgement {
    let mut net_lift = MetricSet::new();
    let mut lifted = 0usize;
    let mut treated_improved = 0usize;
    let mut control_matched = 0usize;

    for (metric, baseline) in treated_baseline {
        let Some(post) = treated_post.get(metric) else {
            continue;
        };
        let treated_delta = post - baseline;
        let control_delta = match (control_baseline.get(metric), control_post.get(metric)) {
            (Some(before), Some(after)) => after - before,
            _ => Decimal::ZERO,
        };
        let lift = treated_delta - control_delta;
        net_lift.insert(metric.clone(), lift);

        if treated_delta > Decimal::ZERO {
            treated_improved += 1;
            if lift > Decimal::ZERO {
                lifted += 1;
            } else {
                control_matched += 1;
            }
        }
    }

    let total = net_lift.len().max(1);
    let verdict = if lifted >= MIN_LIFTED_METRICS {
        Verdict::Causal
    } else if treated_improved > 0 && control_matched == treated_improved {
        Verdict::NonCausal
    } else {
        Verdict::Inconclusive
    };

    let confidence = match verdict {
        Verdict::Causal => ratio(lifted, total),
        Verdict::NonCausal => ratio(control_matched, total),
        Verdict::Inconclusive => dec!(0.25),
    };

    Judgement {
        net_lift,
        verdict,
        confidence,
    }
}

fn ratio(numerator: usize, denominator: usize) -> Decimal {
    (Decimal::from(numerator as u64) / Decimal::from(denominator.max(1) as u64))
        .round_dp(4)
        .min(dec!(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(pairs: &[(&str, Decimal)]) -> MetricSet {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), *value))
            .collect()
    }

    #[test]
    fn lift_on_two_metrics_with_flat_control_is_causal() {
        let judgement = judge(
            &metrics(&[("fill_rate", dec!(0.50)), ("time_to_claim", dec!(0.40))]),
            &metrics(&[("fill_rate", dec!(0.65)), ("time_to_claim", dec!(0.55))]),
            &metrics(&[("fill_rate", dec!(0.52)), ("time_to_claim", dec!(0.41))]),
            &metrics(&[("fill_rate", dec!(0.53)), ("time_to_claim", dec!(0.42))]),
        );
        assert_eq!(judgement.verdict, Verdict::Causal);
        assert!(judgement.confidence > dec!(0.9));
    }

    #[test]
    fn control_improving_as_much_is_non_causal() {
        let judgement = judge(
            &metrics(&[("fill_rate", dec!(0.50)), ("time_to_claim", dec!(0.40))]),
            &metrics(&[("fill_rate", dec!(0.60)), ("time_to_claim", dec!(0.50))]),
            &metrics(&[("fill_rate", dec!(0.50)), ("time_to_claim", dec!(0.40))]),
            &metrics(&[("fill_rate", dec!(0.62)), ("time_to_claim", dec!(0.52))]),
        );
        assert_eq!(judgement.verdict, Verdict::NonCausal);
    }

    #[test]
    fn single_metric_lift_is_inconclusive() {
        let judgement = judge(
            &metrics(&[("fill_rate", dec!(0.50)), ("time_to_claim", dec!(0.40))]),
            &metrics(&[("fill_rate", dec!(0.65)), ("time_to_claim", dec!(0.40))]),
            &metrics(&[("fill_rate", dec!(0.50)), ("time_to_claim", dec!(0.40))]),
            &metrics(&[("fill_rate", dec!(0.50)), ("time_to_claim", dec!(0.40))]),
        );
        assert_eq!(judgement.verdict, Verdict::Inconclusive);
    }

    #[test]
    fn flat_everything_is_inconclusive() {
        let flat = metrics(&[("fill_rate", dec!(0.50))]);
        let judgement = judge(&flat, &flat, &flat, &flat);
        assert_eq!(judgement.verdict, Verdict::Inconclusive);
    }

    #[test]
    fn net_lift_is_delta_of_deltas() {
        let judgement = judge(
            &metrics(&[("fill_rate", dec!(0.50))]),
            &metrics(&[("fill_rate", dec!(0.70))]),
            &metrics(&[("fill_rate", dec!(0.50))]),
            &metrics(&[("fill_rate", dec!(0.55))]),
        );
        assert_eq!(judgement.net_lift["fill_rate"], dec!(0.15));
    }
}
