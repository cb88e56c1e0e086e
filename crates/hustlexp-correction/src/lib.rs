//! Advisory correction engine.
//!
//! Accepts proposals of enumerated non-financial types with bounded
//! magnitudes, enforces per-scope budgets atomically, measures every applied
//! correction against a matched control group, and latches SafeMode when the
//! loop stops demonstrating causal impact. The kernel tables are out of
//! reach by construction: the forbidden-target screen, the audit sweep, and
//! the test suite each enforce it independently.

#![deny(unsafe_code)]

mod engine;
mod outcome;

pub use engine::{
    ApplyOutcome, BlockReason, CorrectionEngine, CorrectionError, CorrectionProposal,
};
pub use outcome::{judge, Judgement, MIN_LIFTED_METRICS, MIN_WINDOW};

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use hustlexp_storage::memory::InMemoryHustleStore;
    use hustlexp_storage::{
        CorrectionStore, FlagStore, LedgerStore, MetricSet, QueryWindow, FLAG_SAFE_MODE,
    };
    use hustlexp_types::{CorrectionStatus, CorrectionType, Scope, Verdict};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn proposal(target: &str, scope: Scope) -> CorrectionProposal {
        CorrectionProposal {
            correction_type: CorrectionType::TaskRouting,
            target_entity: target.to_string(),
            target_id: "zone-78701".to_string(),
            scope,
            adjustment: "visibility_boost".to_string(),
            magnitude: dec!(0.4),
            reason_code: "low_fill_rate".to_string(),
            ttl: Duration::hours(12),
            proposed_by: "advisor".to_string(),
        }
    }

    fn metrics(pairs: &[(&str, rust_decimal::Decimal)]) -> MetricSet {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), *value))
            .collect()
    }

    #[tokio::test]
    async fn applies_within_budget_and_bounds() {
        let store = Arc::new(InMemoryHustleStore::new());
        let engine = CorrectionEngine::new(store.clone());
        let outcome = engine
            .apply(proposal("task_routing", Scope::Zone("78701".into())), Utc::now())
            .await
            .unwrap();
        let ApplyOutcome::Applied(record) = outcome else {
            panic!("expected applied");
        };
        assert_eq!(record.status, CorrectionStatus::Applied);
        assert!(record.expires_at > record.created_at);
    }

    #[tokio::test]
    async fn forbidden_target_is_blocked_audited_and_logged() {
        let store = Arc::new(InMemoryHustleStore::new());
        let engine = CorrectionEngine::new(store.clone());
        let outcome = engine
            .apply(proposal("LedgerService", Scope::Global), Utc::now())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ApplyOutcome::Blocked(BlockReason::ForbiddenTarget)
        ));

        // Rejected row in the correction log.
        let applied = store.applied_corrections(Utc::now()).await.unwrap();
        assert!(applied.is_empty());

        // Audit row exists.
        let audit = store.admin_audit(QueryWindow::default()).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, "correction_blocked");

        // SafeMode is unaffected by the blocked attempt.
        assert!(!engine.safe_mode_active());
    }

    #[tokio::test]
    async fn magnitude_bounds_are_enforced_per_type() {
        let store = Arc::new(InMemoryHustleStore::new());
        let engine = CorrectionEngine::new(store.clone());
        let mut out_of_bounds = proposal("task_routing", Scope::Global);
        out_of_bounds.magnitude = dec!(1.2);
        let outcome = engine.apply(out_of_bounds, Utc::now()).await.unwrap();
        assert!(matches!(
            outcome,
            ApplyOutcome::Blocked(BlockReason::MagnitudeOutOfBounds)
        ));

        let mut pricing = proposal("pricing_banner", Scope::Global);
        pricing.correction_type = CorrectionType::PricingGuidance;
        pricing.magnitude = dec!(1.4);
        assert!(matches!(
            engine.apply(pricing, Utc::now()).await.unwrap(),
            ApplyOutcome::Applied(_)
        ));
    }

    #[tokio::test]
    async fn zone_budget_refuses_the_eleventh() {
        let store = Arc::new(InMemoryHustleStore::new());
        let engine = CorrectionEngine::new(store.clone());
        let scope = Scope::Zone("78701".into());
        for _ in 0..10 {
            assert!(matches!(
                engine
                    .apply(proposal("task_routing", scope.clone()), Utc::now())
                    .await
                    .unwrap(),
                ApplyOutcome::Applied(_)
            ));
        }
        assert!(matches!(
            engine
                .apply(proposal("task_routing", scope), Utc::now())
                .await
                .unwrap(),
            ApplyOutcome::Blocked(BlockReason::OverBudget)
        ));
    }

    #[tokio::test]
    async fn reversal_frees_budget() {
        let store = Arc::new(InMemoryHustleStore::new());
        let engine = CorrectionEngine::new(store.clone());
        let scope = Scope::Zone("78701".into());
        let mut ids = Vec::new();
        for _ in 0..10 {
            let ApplyOutcome::Applied(record) = engine
                .apply(proposal("task_routing", scope.clone()), Utc::now())
                .await
                .unwrap()
            else {
                panic!("expected applied");
            };
            ids.push(record.id);
        }
        engine.reverse(ids[0], Utc::now()).await.unwrap();
        assert!(matches!(
            engine
                .apply(proposal("task_routing", scope), Utc::now())
                .await
                .unwrap(),
            ApplyOutcome::Applied(_)
        ));
    }

    #[tokio::test]
    async fn expiry_is_automatic_via_the_sweep() {
        let store = Arc::new(InMemoryHustleStore::new());
        let engine = CorrectionEngine::new(store.clone());
        let now = Utc::now();
        let ApplyOutcome::Applied(record) = engine
            .apply(proposal("task_routing", Scope::Global), now)
            .await
            .unwrap()
        else {
            panic!("expected applied");
        };

        let expired = engine.expire_due(now + Duration::hours(13)).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, record.id);
        assert_eq!(
            store
                .active_in_scope("global", now + Duration::hours(13))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn non_causal_rate_latches_safe_mode() {
        let store = Arc::new(InMemoryHustleStore::new());
        let engine = CorrectionEngine::new(store.clone());
        let now = Utc::now();

        // Ten corrections applied up front; their outcomes land four
        // non-causal verdicts: 40 % > 30 % with ≥ 5 samples.
        let mut applied = Vec::new();
        for _ in 0..10 {
            let ApplyOutcome::Applied(record) = engine
                .apply(proposal("task_routing", Scope::Global), now)
                .await
                .unwrap()
            else {
                panic!("expected applied");
            };
            applied.push(record);
        }

        for (index, record) in applied.iter().enumerate() {
            let non_causal = index >= 6;
            let (treated_post, control_post) = if non_causal {
                // Control rises as much as treated.
                (
                    metrics(&[("fill_rate", dec!(0.60)), ("time_to_claim", dec!(0.50))]),
                    metrics(&[("fill_rate", dec!(0.62)), ("time_to_claim", dec!(0.52))]),
                )
            } else {
                (
                    metrics(&[("fill_rate", dec!(0.65)), ("time_to_claim", dec!(0.55))]),
                    metrics(&[("fill_rate", dec!(0.50)), ("time_to_claim", dec!(0.40))]),
                )
            };
            let verdict = engine
                .measure_outcome(
                    record.id,
                    metrics(&[("fill_rate", dec!(0.50)), ("time_to_claim", dec!(0.40))]),
                    treated_post,
                    metrics(&[("fill_rate", dec!(0.50)), ("time_to_claim", dec!(0.40))]),
                    control_post,
                    Duration::hours(6),
                    now + Duration::hours(6) + Duration::minutes(index as i64),
                )
                .await
                .unwrap();
            if non_causal {
                assert_eq!(verdict, Verdict::NonCausal);
            } else {
                assert_eq!(verdict, Verdict::Causal);
            }
        }

        assert!(engine.safe_mode_active());

        // All further proposals are refused until an operator resets.
        assert!(matches!(
            engine
                .apply(proposal("task_routing", Scope::Global), now)
                .await
                .unwrap(),
            ApplyOutcome::Blocked(BlockReason::SafeModeActive)
        ));

        engine.reset_safe_mode("oncall").await.unwrap();
        assert!(!engine.safe_mode_active());
    }

    #[tokio::test]
    async fn safe_mode_persists_across_cold_start() {
        let store = Arc::new(InMemoryHustleStore::new());
        store
            .set_flag(FLAG_SAFE_MODE, true, Some("previous incident".into()))
            .await
            .unwrap();

        let engine = CorrectionEngine::new(store.clone());
        assert!(!engine.safe_mode_active());
        engine.hydrate().await.unwrap();
        assert!(engine.safe_mode_active());
    }

    #[tokio::test]
    async fn short_windows_are_refused() {
        let store = Arc::new(InMemoryHustleStore::new());
        let engine = CorrectionEngine::new(store.clone());
        let ApplyOutcome::Applied(record) = engine
            .apply(proposal("task_routing", Scope::Global), Utc::now())
            .await
            .unwrap()
        else {
            panic!("expected applied");
        };
        let err = engine
            .measure_outcome(
                record.id,
                MetricSet::new(),
                MetricSet::new(),
                MetricSet::new(),
                MetricSet::new(),
                Duration::hours(2),
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CorrectionError::Validation(_)));
    }

    #[tokio::test]
    async fn audit_sweep_reverses_bypassed_forbidden_corrections() {
        let store = Arc::new(InMemoryHustleStore::new());
        let engine = CorrectionEngine::new(store.clone());
        let now = Utc::now();

        // Plant an applied forbidden correction directly in the store,
        // simulating a bypassed screen.
        let planted = hustlexp_storage::CorrectionRecord {
            id: hustlexp_types::CorrectionId::generate(),
            correction_type: CorrectionType::TaskRouting,
            target_entity: "escrow_router".to_string(),
            target_id: "x".to_string(),
            scope_key: "global".to_string(),
            adjustment: "boost".to_string(),
            magnitude: dec!(0.1),
            reason_code: "planted".to_string(),
            status: CorrectionStatus::Applied,
            expires_at: now + Duration::hours(12),
            applied_by: "rogue".to_string(),
            reversed_at: None,
            created_at: now,
        };
        store.apply_correction(planted, 100, now).await.unwrap();

        let found = engine.audit_sweep(now).await.unwrap();
        assert_eq!(found, 1);
        assert!(engine.safe_mode_active());
        assert!(store.applied_corrections(now).await.unwrap().is_empty());
    }
}
